//! C12 — scene graph: nodes with TRS transforms, mesh/material bindings,
//! and a flattened draw list for the frame driver.
//!
//! Full skeletal animation is out of scope (spec non-goals); only the
//! static transform hierarchy from `original_source/`'s node graph is
//! kept, supplemented with the world-matrix cache a renderer needs.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use glam::{Mat4, Quat, Vec3};

use crate::allocator::AllocatedBuffer;
use crate::registry::RefKey;

/// Translation/rotation/scale transform (spec §4.12 "Transform"). Kept as
/// the lowest common denominator of the original's transform representation;
/// skinning matrices and morph targets are not modeled.
#[derive(Copy, Clone, Debug)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Transform {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

/// A GPU-resident mesh: one vertex buffer and one index buffer (spec
/// §4.12 "Mesh upload").
pub struct GpuMesh {
    pub vertex_buffer: AllocatedBuffer,
    pub index_buffer: AllocatedBuffer,
    pub index_count: u32,
}

slotmap::new_key_type! {
    pub struct NodeKey;
}

struct Node {
    transform: Transform,
    parent: Option<NodeKey>,
    children: Vec<NodeKey>,
    mesh: Option<RefKey>,
    material: Option<RefKey>,
    world_matrix: Mat4,
    dirty: bool,
}

/// A flattened hierarchy of transform nodes. World matrices are recomputed
/// lazily on [`Scene::update_world_matrices`] rather than on every
/// transform write, since a frame typically mutates several nodes before
/// drawing once (spec §4.12 "Scene update").
pub struct Scene {
    nodes: slotmap::SlotMap<NodeKey, Node>,
    roots: Vec<NodeKey>,
    version: AtomicU64,
}

/// One entry in the flattened draw list the frame driver consumes.
pub struct DrawItem {
    pub mesh: RefKey,
    pub material: RefKey,
    pub world_matrix: Mat4,
}

impl Scene {
    pub fn new() -> Scene {
        Scene {
            nodes: slotmap::SlotMap::with_key(),
            roots: Vec::new(),
            version: AtomicU64::new(0),
        }
    }

    pub fn add_node(
        &mut self,
        parent: Option<NodeKey>,
        transform: Transform,
        mesh: Option<RefKey>,
        material: Option<RefKey>,
    ) -> NodeKey {
        let key = self.nodes.insert(Node {
            transform,
            parent,
            children: Vec::new(),
            mesh,
            material,
            world_matrix: Mat4::IDENTITY,
            dirty: true,
        });
        match parent {
            Some(parent_key) => self.nodes[parent_key].children.push(key),
            None => self.roots.push(key),
        }
        self.version.fetch_add(1, Ordering::Relaxed);
        key
    }

    pub fn set_transform(&mut self, node: NodeKey, transform: Transform) {
        if let Some(n) = self.nodes.get_mut(node) {
            n.transform = transform;
            n.dirty = true;
            self.version.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn remove_node(&mut self, node: NodeKey) {
        let Some(removed) = self.nodes.remove(node) else { return };
        match removed.parent {
            Some(parent) => {
                if let Some(p) = self.nodes.get_mut(parent) {
                    p.children.retain(|&c| c != node);
                }
            }
            None => self.roots.retain(|&r| r != node),
        }
        for child in removed.children {
            self.remove_node(child);
        }
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Recomputes world matrices depth-first from every root, propagating
    /// `dirty` down the hierarchy (a dirty parent forces its children to
    /// recompute even if their own local transform didn't change).
    pub fn update_world_matrices(&mut self) {
        let roots = self.roots.clone();
        for root in roots {
            self.update_subtree(root, Mat4::IDENTITY, false);
        }
    }

    fn update_subtree(&mut self, node: NodeKey, parent_world: Mat4, mut force: bool) {
        let Some(n) = self.nodes.get_mut(node) else { return };
        force |= n.dirty;
        if force {
            n.world_matrix = parent_world * n.transform.to_matrix();
            n.dirty = false;
        }
        let world = n.world_matrix;
        let children = self.nodes[node].children.clone();
        for child in children {
            self.update_subtree(child, world, force);
        }
    }

    /// Flattens every node with both a mesh and a material bound into a
    /// draw list, in depth-first order (spec §4.12 "Draw list").
    pub fn draw_list(&self) -> Vec<DrawItem> {
        let mut items = Vec::new();
        for node in self.nodes.values() {
            if let (Some(mesh), Some(material)) = (node.mesh, node.material) {
                items.push(DrawItem {
                    mesh,
                    material,
                    world_matrix: node.world_matrix,
                });
            }
        }
        items
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for Scene {
    fn default() -> Self {
        Scene::new()
    }
}

/// # Safety
/// `device`/`allocator` must belong to the same device; `vertices`/
/// `indices` must not be empty (spec §4.12 "a zero-vertex mesh is an
/// error, not an empty draw").
pub unsafe fn upload_mesh(
    device: &ash::Device,
    allocator: &crate::allocator::DeviceAllocator,
    vertices: &[crate::pipeline::Vertex],
    indices: &[u32],
) -> Result<GpuMesh, crate::error::RendererError> {
    use bytemuck::cast_slice;
    use gpu_allocator::MemoryLocation;

    if vertices.is_empty() || indices.is_empty() {
        return Err(crate::error::RendererError::EmptyMesh);
    }

    let vertex_bytes = cast_slice(vertices);
    let vb_info = vk::BufferCreateInfo::default()
        .size(vertex_bytes.len() as u64)
        .usage(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let mut vertex_buffer = allocator
        .create_buffer(device, &vb_info, MemoryLocation::CpuToGpu, "mesh-vertices")
        .map_err(crate::error::RendererError::Allocator)?;

    let index_bytes = cast_slice(indices);
    let ib_info = vk::BufferCreateInfo::default()
        .size(index_bytes.len() as u64)
        .usage(vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let mut index_buffer = match allocator.create_buffer(device, &ib_info, MemoryLocation::CpuToGpu, "mesh-indices") {
        Ok(b) => b,
        Err(e) => {
            allocator.free_buffer(device, vertex_buffer);
            return Err(crate::error::RendererError::Allocator(e));
        }
    };

    if let Some(mapped) = vertex_buffer.allocation.mapped_slice_mut() {
        mapped[..vertex_bytes.len()].copy_from_slice(vertex_bytes);
    }
    if let Some(mapped) = index_buffer.allocation.mapped_slice_mut() {
        mapped[..index_bytes.len()].copy_from_slice(index_bytes);
    }

    Ok(GpuMesh {
        vertex_buffer,
        index_buffer,
        index_count: indices.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_matrix_propagates_from_parent() {
        let mut scene = Scene::new();
        let parent = scene.add_node(
            None,
            Transform { translation: Vec3::new(1.0, 0.0, 0.0), ..Default::default() },
            None,
            None,
        );
        let child = scene.add_node(Some(parent), Transform::default(), None, None);
        scene.update_world_matrices();
        let expected = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(scene.nodes[child].world_matrix, expected);
    }

    #[test]
    fn draw_list_skips_nodes_without_both_bindings() {
        let mut scene = Scene::new();
        scene.add_node(None, Transform::default(), None, None);
        assert!(scene.draw_list().is_empty());
    }

    #[test]
    fn remove_node_drops_children() {
        let mut scene = Scene::new();
        let parent = scene.add_node(None, Transform::default(), None, None);
        let _child = scene.add_node(Some(parent), Transform::default(), None, None);
        assert_eq!(scene.node_count(), 2);
        scene.remove_node(parent);
        assert_eq!(scene.node_count(), 0);
    }
}
