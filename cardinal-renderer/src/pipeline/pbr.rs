//! Metallic-roughness PBR pipeline (spec §4.11) plus the debug render
//! modes (UV visualization, wireframe) that share its vertex layout.

use std::path::Path;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::config::RenderMode;
use crate::error::RendererError;

use super::descriptor::{DescriptorLayouts, FRAME_SET_INDEX, MATERIAL_SET_INDEX};
use super::render_pass::AttachmentLayout;

/// Interleaved vertex layout every mesh in the scene uses (spec §4.12).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub uv: [f32; 2],
}

impl Vertex {
    fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        [
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32B32A32_SFLOAT)
                .offset(24),
            vk::VertexInputAttributeDescription::default()
                .location(3)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(40),
        ]
    }
}

/// Model matrix plus the material's base-color factor, pushed per draw
/// call rather than round-tripped through a descriptor (spec §4.11).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct PushConstants {
    pub model: [[f32; 4]; 4],
    pub base_color_factor: [f32; 4],
}

/// A compiled graphics pipeline plus the layout it was built against.
pub struct MaterialPipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub mode: RenderMode,
}

unsafe fn load_shader_module(
    device: &ash::Device,
    path: &Path,
) -> Result<vk::ShaderModule, RendererError> {
    let bytes = std::fs::read(path)
        .map_err(|_| RendererError::ShaderNotFound(path.display().to_string()))?;
    if bytes.len() % 4 != 0 {
        return Err(RendererError::ShaderNotFound(path.display().to_string()));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
    device
        .create_shader_module(&create_info, None)
        .map_err(|e| RendererError::Device(crate::error::DeviceError::Vulkan(e)))
}

/// Resolves `{shaders_dir}/{name}.vert.spv` and `.frag.spv` and builds a
/// graphics pipeline for `mode` (spec §4.11 "render modes share shader
/// inputs, differ in fragment shader and rasterization state").
///
/// # Safety
/// `device` must be a valid logical device; `layouts` must have been
/// created against the same device.
pub unsafe fn create_material_pipeline(
    device: &ash::Device,
    shaders_dir: &Path,
    name: &str,
    mode: RenderMode,
    layouts: &DescriptorLayouts,
    attachments: AttachmentLayout,
) -> Result<MaterialPipeline, RendererError> {
    let vert_path = shaders_dir.join(format!("{name}.vert.spv"));
    let frag_path = shaders_dir.join(format!("{name}.frag.spv"));
    let vert_module = load_shader_module(device, &vert_path)?;
    let frag_module = match load_shader_module(device, &frag_path) {
        Ok(m) => m,
        Err(e) => {
            device.destroy_shader_module(vert_module, None);
            return Err(e);
        }
    };

    let entry_point = c"main";
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(entry_point),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(entry_point),
    ];

    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let topology = match mode {
        RenderMode::Wireframe => vk::PrimitiveTopology::LINE_LIST,
        _ => vk::PrimitiveTopology::TRIANGLE_LIST,
    };
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(topology);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let polygon_mode = match mode {
        RenderMode::Wireframe => vk::PolygonMode::LINE,
        _ => vk::PolygonMode::FILL,
    };
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(polygon_mode)
        .cull_mode(if mode == RenderMode::Wireframe {
            vk::CullModeFlags::NONE
        } else {
            vk::CullModeFlags::BACK
        })
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(mode != RenderMode::Wireframe)
        .depth_compare_op(vk::CompareOp::LESS);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false);
    let attachments_blend = [color_blend_attachment];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments_blend);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let push_constant_ranges = [vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .offset(0)
        .size(std::mem::size_of::<PushConstants>() as u32)];
    let set_layouts = [layouts.frame_layout, layouts.material_layout];
    debug_assert_eq!(FRAME_SET_INDEX, 0);
    debug_assert_eq!(MATERIAL_SET_INDEX, 1);
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constant_ranges);
    let layout = match device.create_pipeline_layout(&layout_info, None) {
        Ok(l) => l,
        Err(e) => {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
            return Err(RendererError::Device(crate::error::DeviceError::Vulkan(e)));
        }
    };

    let rendering_storage = attachments.rendering_create_info();
    let mut rendering_info = rendering_storage.as_create_info();

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = device
        .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_, e)| RendererError::Device(crate::error::DeviceError::Vulkan(e)));

    device.destroy_shader_module(vert_module, None);
    device.destroy_shader_module(frag_module, None);

    let pipeline = match pipelines {
        Ok(mut p) => p.remove(0),
        Err(e) => {
            device.destroy_pipeline_layout(layout, None);
            return Err(e);
        }
    };

    Ok(MaterialPipeline { layout, pipeline, mode })
}

impl MaterialPipeline {
    /// # Safety
    /// `device` must own these objects and they must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}
