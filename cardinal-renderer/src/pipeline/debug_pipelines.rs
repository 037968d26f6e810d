//! Selects shader names per render mode and demotes unsupported modes
//! (spec §4.11 "mesh-shader mode demotes to normal when the device lacks
//! `VK_EXT_mesh_shader`").

use std::collections::HashMap;
use std::path::Path;

use ash::vk;

use crate::config::RenderMode;
use crate::error::RendererError;
use crate::instance::DeviceCapabilities;

use super::descriptor::DescriptorLayouts;
use super::pbr::{create_material_pipeline, MaterialPipeline};
use super::render_pass::AttachmentLayout;

fn shader_name_for_mode(mode: RenderMode) -> &'static str {
    match mode {
        RenderMode::Normal => "pbr",
        RenderMode::Uv => "uv_debug",
        RenderMode::Wireframe => "wireframe",
        RenderMode::MeshShader => "mesh_shader",
    }
}

/// Demotes `mode` to [`RenderMode::Normal`] if the device lacks the
/// capability it needs.
pub fn effective_mode(mode: RenderMode, capabilities: &DeviceCapabilities) -> RenderMode {
    match mode {
        RenderMode::MeshShader if !capabilities.mesh_shader => RenderMode::Normal,
        other => other,
    }
}

/// Every compiled pipeline, one per render mode actually reachable on this
/// device (mesh-shader omitted if unsupported).
pub struct PipelineSet {
    pipelines: HashMap<RenderMode, MaterialPipeline>,
}

impl PipelineSet {
    /// # Safety
    /// `device` must be a valid logical device, and `layouts` must be
    /// built against it.
    pub unsafe fn create(
        device: &ash::Device,
        shaders_dir: &Path,
        capabilities: &DeviceCapabilities,
        layouts: &DescriptorLayouts,
        attachments: AttachmentLayout,
    ) -> Result<PipelineSet, RendererError> {
        let mut modes = vec![RenderMode::Normal, RenderMode::Uv, RenderMode::Wireframe];
        if capabilities.mesh_shader {
            modes.push(RenderMode::MeshShader);
        }

        let mut pipelines = HashMap::new();
        for mode in modes {
            let name = shader_name_for_mode(mode);
            match create_material_pipeline(device, shaders_dir, name, mode, layouts, attachments) {
                Ok(pipeline) => {
                    pipelines.insert(mode, pipeline);
                }
                Err(e) => {
                    for p in pipelines.values() {
                        p.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        Ok(PipelineSet { pipelines })
    }

    pub fn get(&self, mode: RenderMode) -> Option<&MaterialPipeline> {
        self.pipelines.get(&mode)
    }

    pub fn handle(&self, mode: RenderMode) -> Option<vk::Pipeline> {
        self.pipelines.get(&mode).map(|p| p.pipeline)
    }

    /// # Safety
    /// `device` must own these pipelines and they must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for pipeline in self.pipelines.values() {
            pipeline.destroy(device);
        }
    }
}
