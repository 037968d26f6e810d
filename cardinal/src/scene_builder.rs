//! Stands in for the out-of-scope glTF/GLB importer (spec §1): builds one
//! textureless cube so the frame loop has something to draw. A real
//! importer would hand the renderer the same `SceneItem` shape from
//! parsed mesh/material data.

use cardinal_renderer::pipeline::Vertex;
use cardinal_renderer::renderer::SceneItem;
use cardinal_renderer::scene::Transform;

use cardinal_renderer::materials::MaterialDescription;

fn cube_vertices() -> (Vec<Vertex>, Vec<u32>) {
    // Six faces, four vertices each, sharing one flat normal per face so
    // the PBR pipeline's lighting term is visibly non-degenerate.
    const FACES: [([f32; 3], [[f32; 3]; 4]); 6] = [
        ([0.0, 0.0, 1.0], [[-0.5, -0.5, 0.5], [0.5, -0.5, 0.5], [0.5, 0.5, 0.5], [-0.5, 0.5, 0.5]]),
        ([0.0, 0.0, -1.0], [[0.5, -0.5, -0.5], [-0.5, -0.5, -0.5], [-0.5, 0.5, -0.5], [0.5, 0.5, -0.5]]),
        ([1.0, 0.0, 0.0], [[0.5, -0.5, 0.5], [0.5, -0.5, -0.5], [0.5, 0.5, -0.5], [0.5, 0.5, 0.5]]),
        ([-1.0, 0.0, 0.0], [[-0.5, -0.5, -0.5], [-0.5, -0.5, 0.5], [-0.5, 0.5, 0.5], [-0.5, 0.5, -0.5]]),
        ([0.0, 1.0, 0.0], [[-0.5, 0.5, 0.5], [0.5, 0.5, 0.5], [0.5, 0.5, -0.5], [-0.5, 0.5, -0.5]]),
        ([0.0, -1.0, 0.0], [[-0.5, -0.5, -0.5], [0.5, -0.5, -0.5], [0.5, -0.5, 0.5], [-0.5, -0.5, 0.5]]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, corners) in FACES {
        let base = vertices.len() as u32;
        let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        for (position, uv) in corners.into_iter().zip(uvs) {
            vertices.push(Vertex {
                position,
                normal,
                tangent: [1.0, 0.0, 0.0, 1.0],
                uv,
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

pub fn synthetic_scene() -> Vec<SceneItem> {
    let (vertices, indices) = cube_vertices();
    let material = MaterialDescription {
        identifier: "cardinal.synthetic.default".to_string(),
        base_color_factor: [0.8, 0.8, 0.8, 1.0],
        metallic_factor: 0.1,
        roughness_factor: 0.6,
        textures: Vec::new(),
    };

    vec![SceneItem {
        identifier: "cardinal.synthetic.cube".to_string(),
        vertices,
        indices,
        material,
        transform: Transform::default(),
    }]
}
