//! [`Renderer`] assembles C1–C14 behind a single entry point: bring up the
//! device (C6), the swapchain (C7), the sync/frame driver (C8/C9), the
//! pipeline set (C10), the material cache (C11), scene upload (C12), the
//! multi-thread command subsystem (C13), and the recovery controller
//! (C14). Hosts construct one `Renderer` per window (or none, for
//! headless) and drive it with [`Renderer::draw_frame`] once per tick.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{info, warn};

use crate::config::{RenderMode, RendererConfig};
use crate::device::DeviceContext;
use crate::error::{ErrorClass, FrameError, RendererError, SwapchainError};
use crate::frame::FrameDriver;
use crate::materials::{self, GpuMaterial, MaterialDescription, MaterialRegistry};
use crate::memory::MemorySystem;
use crate::mt::MtSubsystem;
use crate::pipeline::descriptor::DescriptorLayouts;
use crate::pipeline::pbr::{PushConstants, Vertex};
use crate::pipeline::render_pass::{self, AttachmentLayout};
use crate::pipeline::PipelineSet;
use crate::recovery::RecoveryController;
use crate::registry::RefRegistry;
use crate::resource_state::StateRegistry;
use crate::scene::{self, GpuMesh, Scene, Transform};
use crate::swapchain::{Swapchain, SwapchainPreferences};

/// Clear color for the color attachment: a dim neutral gray rather than
/// black, so a frame with nothing drawn is visibly distinguishable from a
/// window that never rendered at all.
const CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.03, 1.0];

/// Upper bound on distinct materials a descriptor pool is sized for (spec
/// §4.10 "descriptor pool sizing is proportional to ... the maximum
/// textures allowed").
const MAX_MATERIALS: u32 = 256;

pub type MeshRegistry = RefRegistry<GpuMesh>;

/// One CPU-side mesh + material pair the host wants drawn, as handed to
/// [`Renderer::upload_scene`]. Kept around (cloned) so the recovery
/// controller can replay the upload after a device-loss rebuild (spec
/// §4.14 step 4 "if a scene was loaded, re-upload it").
#[derive(Clone)]
pub struct SceneItem {
    pub identifier: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material: MaterialDescription,
    pub transform: Transform,
}

/// Runs `f` with `command_buffer` transitioned from `old_layout` to
/// `new_layout` via a synchronization2 image barrier scoped to the color
/// aspect, all pipeline stages (conservative but simple — the frame driver
/// is not yet latency-sensitive enough to warrant per-stage masks).
///
/// # Safety
/// `command_buffer` must be recording; `image` must be a valid color
/// image whose current layout matches `old_layout` (or `old_layout` is
/// `UNDEFINED`, which discards contents instead of asserting on them).
unsafe fn transition_color_image(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    let barriers = [barrier];
    let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    device.cmd_pipeline_barrier2(command_buffer, &dependency_info);
}

/// The renderer's complete device-dependent state: everything that must be
/// torn down and rebuilt together on device loss (spec §4.14), minus the
/// `DeviceContext` itself which [`Renderer::run_recovery`] rebuilds
/// separately since it owns the instance/surface too.
struct DeviceDependentState {
    swapchain: Option<Swapchain>,
    descriptor_layouts: DescriptorLayouts,
    pipelines: PipelineSet,
    frame: FrameDriver,
    mt: Option<MtSubsystem>,
}

/// Assembles every renderer subsystem behind one entry point (spec §2
/// "control flow per frame").
pub struct Renderer {
    config: RendererConfig,
    device: Arc<DeviceContext>,
    window: Option<(RawDisplayHandle, RawWindowHandle)>,
    state: DeviceDependentState,
    meshes: MeshRegistry,
    materials: MaterialRegistry,
    memory: MemorySystem,
    states: StateRegistry,
    recovery: RecoveryController,
    scene: Scene,
    render_mode: RenderMode,
    window_extent: (u32, u32),
    cached_scene: Option<Vec<SceneItem>>,
}

impl Renderer {
    /// Brings up the whole renderer: instance/device (C6), swapchain (C7)
    /// unless `config.headless` or `window` is `None`, descriptor layouts
    /// and pipelines (C10), the frame driver (C8/C9), and the
    /// multi-thread command subsystem (C13).
    ///
    /// # Safety
    /// If `window` is `Some`, the referenced window must outlive the
    /// returned `Renderer` (mirrors [`DeviceContext::new`]'s contract,
    /// since this call stores the handles for later swapchain/device
    /// recreation on resize and recovery).
    pub unsafe fn new(
        config: RendererConfig,
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
        window_extent: (u32, u32),
    ) -> Result<Renderer, RendererError> {
        let headless = config.headless || window.is_none();
        let max_recovery_attempts = config.max_recovery_attempts;
        let device = Arc::new(DeviceContext::new(window)?);
        let state = Self::bring_up_device_dependent(&config, &device, headless, window_extent)?;

        Ok(Renderer {
            config,
            device,
            window,
            state,
            meshes: RefRegistry::default(),
            materials: RefRegistry::default(),
            memory: MemorySystem::new(crate::config::DEFAULT_BUMP_ALLOCATOR_CAPACITY),
            states: StateRegistry::new(1009),
            recovery: RecoveryController::new(max_recovery_attempts),
            scene: Scene::new(),
            render_mode: RenderMode::default(),
            window_extent,
            cached_scene: None,
        })
    }

    /// Builds every subsystem that depends on the logical device but not
    /// on the renderer's own fields, so it can be called both from
    /// [`Renderer::new`] and from [`Renderer::run_recovery`]'s rebuild
    /// step.
    unsafe fn bring_up_device_dependent(
        config: &RendererConfig,
        device: &Arc<DeviceContext>,
        headless: bool,
        window_extent: (u32, u32),
    ) -> Result<DeviceDependentState, RendererError> {
        let swapchain = if headless {
            None
        } else {
            let surface = device
                .surface
                .expect("windowed mode requires DeviceContext to own a surface");
            let preferences = SwapchainPreferences {
                format: config.preferred_surface_format,
                present_mode: config.preferred_present_mode,
                image_count: 0,
            };
            Some(Swapchain::create(
                device,
                surface,
                window_extent,
                preferences,
                vk::SwapchainKHR::null(),
            )?)
        };

        let attachments = AttachmentLayout {
            color_format: swapchain
                .as_ref()
                .map(|s| s.format)
                .unwrap_or(vk::Format::B8G8R8A8_UNORM),
            depth_format: swapchain.as_ref().and_then(|s| s.depth_format()),
        };

        let descriptor_layouts = DescriptorLayouts::create(&device.device, MAX_MATERIALS)
            .map_err(RendererError::Allocator)?;

        let pipelines = match PipelineSet::create(
            &device.device,
            &config.shaders_dir,
            &device.capabilities,
            &descriptor_layouts,
            attachments,
        ) {
            Ok(p) => p,
            Err(e) => {
                descriptor_layouts.destroy(&device.device);
                return Err(e);
            }
        };

        let frame = match FrameDriver::new(device, config.frames_in_flight, headless) {
            Ok(f) => f,
            Err(e) => {
                pipelines.destroy(&device.device);
                descriptor_layouts.destroy(&device.device);
                return Err(RendererError::Frame(e));
            }
        };

        let mt = if !headless && config.worker_thread_count > 0 {
            let shared_device = Arc::new(device.device.clone());
            match MtSubsystem::spawn(shared_device, device.graphics_queue_family, config.worker_thread_count) {
                Ok(mt) => Some(mt),
                Err(e) => {
                    frame.destroy(device);
                    pipelines.destroy(&device.device);
                    descriptor_layouts.destroy(&device.device);
                    return Err(RendererError::Frame(e));
                }
            }
        } else {
            None
        };

        Ok(DeviceDependentState { swapchain, descriptor_layouts, pipelines, frame, mt })
    }

    /// # Safety
    /// No in-flight command may reference these objects; the caller must
    /// have waited device-idle first.
    unsafe fn teardown_device_dependent(&mut self) {
        if let Some(mt) = self.state.mt.take() {
            mt.shutdown(&self.device.device);
        }
        self.state.frame.destroy(&self.device);
        self.state.pipelines.destroy(&self.device.device);
        self.state.descriptor_layouts.destroy(&self.device.device);
        if let Some(sc) = &mut self.state.swapchain {
            sc.destroy(&self.device);
        }
        self.state.swapchain = None;

        for mesh in self.meshes.drain() {
            self.device.allocator.free_buffer(&self.device.device, mesh.vertex_buffer);
            self.device.allocator.free_buffer(&self.device.device, mesh.index_buffer);
        }
        for material in self.materials.drain() {
            materials::destroy_material(&self.device.device, &self.device.allocator, material);
        }
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    /// Sets the active render mode, demoting to [`RenderMode::Normal`] if
    /// the device doesn't support it (spec §6 "rendering modes exposed to
    /// the host").
    pub fn set_render_mode(&mut self, mode: RenderMode) {
        self.render_mode = crate::pipeline::effective_mode(mode, &self.device.capabilities);
    }

    pub fn current_frame_value(&self) -> u64 {
        self.state.frame.current_frame_value()
    }

    /// Registers the host's device-loss notification hook (spec §4.14
    /// step 2), invoked once per newly-detected loss before teardown.
    pub fn set_device_loss_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.recovery.set_loss_callback(callback);
    }

    /// Registers the host's recovery-complete hook (spec §4.14 step 5),
    /// invoked with `true` on a successful rebuild and `false` both when a
    /// rebuild attempt fails and when `max_recovery_attempts` is exhausted.
    pub fn set_recovery_complete_callback(&self, callback: impl FnMut(bool) + Send + 'static) {
        self.recovery.set_complete_callback(callback);
    }

    pub fn is_headless(&self) -> bool {
        self.config.headless || self.window.is_none()
    }

    fn swapchain_preferences(&self) -> SwapchainPreferences {
        SwapchainPreferences {
            format: self.config.preferred_surface_format,
            present_mode: self.config.preferred_present_mode,
            image_count: 0,
        }
    }

    /// Uploads a batch of CPU meshes/materials as flat scene nodes (no
    /// parent hierarchy; the glTF node graph itself is out of scope, spec
    /// §1), staging each mesh and material onto the device (C12/C11) and
    /// caching the CPU description for device-loss replay (spec §4.14).
    pub fn upload_scene(&mut self, items: Vec<SceneItem>) -> Result<(), RendererError> {
        self.clear_scene()?;
        self.upload_scene_items(&items)?;
        self.cached_scene = Some(items);
        Ok(())
    }

    fn upload_scene_items(&mut self, items: &[SceneItem]) -> Result<(), RendererError> {
        let max_anisotropy = self.device.max_sampler_anisotropy();
        for item in items {
            if item.vertices.is_empty() || item.indices.is_empty() {
                warn!(identifier = %item.identifier, "refusing to upload a zero-vertex mesh");
                return Err(RendererError::EmptyMesh);
            }

            let gpu_mesh = unsafe {
                scene::upload_mesh(&self.device.device, &self.device.allocator, &item.vertices, &item.indices)?
            };
            let mesh_key = self.meshes.create(&item.identifier, gpu_mesh);

            let material_identifier = item.material.content_hash();
            let material_key = if let Some(key) = self.materials.acquire(&material_identifier) {
                key
            } else {
                let gpu_material = unsafe {
                    materials::upload_material(
                        &self.device.device,
                        &self.device.allocator,
                        &self.state.descriptor_layouts,
                        &item.material,
                        max_anisotropy,
                    )?
                };
                self.materials.create(&material_identifier, gpu_material)
            };

            self.scene
                .add_node(None, item.transform, Some(mesh_key), Some(material_key));
        }
        self.scene.update_world_matrices();
        info!(mesh_count = items.len(), "uploaded scene");
        Ok(())
    }

    /// Waits device-idle, then destroys every `GpuMesh`/`GpuMaterial` and
    /// resets the scene graph (spec §4.12 "clear_scene").
    pub fn clear_scene(&mut self) -> Result<(), RendererError> {
        unsafe {
            self.device
                .device
                .device_wait_idle()
                .map_err(crate::error::DeviceError::Vulkan)?;
        }
        for mesh in self.meshes.drain() {
            unsafe {
                self.device.allocator.free_buffer(&self.device.device, mesh.vertex_buffer);
                self.device.allocator.free_buffer(&self.device.device, mesh.index_buffer);
            }
        }
        for material in self.materials.drain() {
            unsafe { materials::destroy_material(&self.device.device, &self.device.allocator, material) };
        }
        self.scene = Scene::new();
        self.cached_scene = None;
        Ok(())
    }

    /// Runs one full frame (spec §4.9 control flow): skips if `extent` is
    /// zero, recreates the swapchain if pending, records draws for the
    /// current scene, submits and presents, and routes swapchain/device
    /// errors to recreation or recovery instead of propagating them.
    pub fn draw_frame(
        &mut self,
        extent: (u32, u32),
        ui_callback: Option<&dyn Fn(vk::CommandBuffer)>,
    ) -> Result<(), RendererError> {
        self.window_extent = extent;

        if self.recovery.is_device_lost() {
            return self.run_recovery();
        }

        if extent.0 == 0 || extent.1 == 0 {
            if let Some(sc) = &mut self.state.swapchain {
                sc.mark_recreation_pending();
            }
            return Ok(());
        }

        if let Some(sc) = &mut self.state.swapchain {
            if sc.recreation_pending {
                let preferences = self.swapchain_preferences();
                let result = unsafe { sc.recreate(&self.device, extent, preferences) };
                if let Err(e) = result {
                    if matches!(e, SwapchainError::DeviceLost) {
                        self.recovery.mark_device_lost();
                        return self.run_recovery();
                    }
                    warn!(error = %e, "swapchain recreation failed, retrying next frame");
                    return Ok(());
                }
            }
        }

        match self.record_and_submit(ui_callback) {
            Ok(()) => Ok(()),
            Err(frame_err) => self.handle_frame_error(frame_err),
        }
    }

    fn record_and_submit(&mut self, ui_callback: Option<&dyn Fn(vk::CommandBuffer)>) -> Result<(), FrameError> {
        let (color_images, color_views, depth_view, extent) = match &self.state.swapchain {
            Some(sc) => {
                let n = sc.image_count();
                let images = (0..n).map(|i| sc.image(i)).collect::<Vec<_>>();
                let views = (0..n).map(|i| sc.image_view(i)).collect::<Vec<_>>();
                (images, views, sc.depth_view(), sc.extent)
            }
            None => (Vec::new(), Vec::new(), None, vk::Extent2D::default()),
        };

        let pipelines = &self.state.pipelines;
        let meshes = &self.meshes;
        let materials = &self.materials;
        let render_mode = self.render_mode;
        let draw_list = self.scene.draw_list();
        let device = &self.device;
        let swapchain_arg = self.state.swapchain.as_mut();

        unsafe {
            self.state.frame.draw_frame(device, swapchain_arg, |vk_device, ctx| unsafe {
                if color_images.is_empty() {
                    if let Some(cb) = ui_callback {
                        cb(ctx.command_buffer);
                    }
                    return;
                }

                let index = ctx.image_index as usize;
                let image = color_images[index];
                let view = color_views[index];

                transition_color_image(
                    vk_device,
                    ctx.command_buffer,
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                );

                render_pass::begin_rendering(
                    vk_device,
                    ctx.command_buffer,
                    view,
                    depth_view,
                    extent,
                    CLEAR_COLOR,
                    || unsafe {
                        let Some(pipeline) = pipelines.get(render_mode) else { return };
                        vk_device.cmd_bind_pipeline(
                            ctx.command_buffer,
                            vk::PipelineBindPoint::GRAPHICS,
                            pipeline.pipeline,
                        );
                        let viewport = vk::Viewport {
                            x: 0.0,
                            y: 0.0,
                            width: extent.width as f32,
                            height: extent.height as f32,
                            min_depth: 0.0,
                            max_depth: 1.0,
                        };
                        vk_device.cmd_set_viewport(ctx.command_buffer, 0, std::slice::from_ref(&viewport));
                        let scissor = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };
                        vk_device.cmd_set_scissor(ctx.command_buffer, 0, std::slice::from_ref(&scissor));

                        for item in &draw_list {
                            let bound = meshes.with_payload(item.mesh, |mesh| unsafe {
                                vk_device.cmd_bind_vertex_buffers(
                                    ctx.command_buffer,
                                    0,
                                    &[mesh.vertex_buffer.handle],
                                    &[0],
                                );
                                vk_device.cmd_bind_index_buffer(
                                    ctx.command_buffer,
                                    mesh.index_buffer.handle,
                                    0,
                                    vk::IndexType::UINT32,
                                );
                                mesh.index_count
                            });
                            let Some(index_count) = bound else { continue };

                            let material_info =
                                materials.with_payload(item.material, |m| (m.descriptor_set, m.base_color_factor));
                            let Some((descriptor_set, base_color_factor)) = material_info else { continue };

                            vk_device.cmd_bind_descriptor_sets(
                                ctx.command_buffer,
                                vk::PipelineBindPoint::GRAPHICS,
                                pipeline.layout,
                                1,
                                &[descriptor_set],
                                &[],
                            );
                            let push = PushConstants {
                                model: item.world_matrix.to_cols_array_2d(),
                                base_color_factor,
                            };
                            vk_device.cmd_push_constants(
                                ctx.command_buffer,
                                pipeline.layout,
                                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                                0,
                                bytemuck::bytes_of(&push),
                            );
                            vk_device.cmd_draw_indexed(ctx.command_buffer, index_count, 1, 0, 0, 0);
                        }

                        if let Some(cb) = ui_callback {
                            cb(ctx.command_buffer);
                        }
                    },
                );

                transition_color_image(
                    vk_device,
                    ctx.command_buffer,
                    image,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                );
            })
        }
    }

    fn handle_frame_error(&mut self, err: FrameError) -> Result<(), RendererError> {
        match err.class() {
            ErrorClass::RecoverableSurface => {
                if let Some(sc) = &mut self.state.swapchain {
                    sc.mark_recreation_pending();
                }
                Ok(())
            }
            ErrorClass::RecoverableDevice => {
                self.recovery.mark_device_lost();
                self.run_recovery()
            }
            ErrorClass::Transient => Ok(()),
            _ => Err(RendererError::Frame(err)),
        }
    }

    /// Runs one device-loss recovery pass (spec §4.14): tears down every
    /// device-dependent subsystem and the device itself in reverse
    /// bring-up order, then recreates them forward, re-uploading the
    /// cached scene if one was loaded.
    ///
    /// The controller's `teardown`/`rebuild` closures are each a single
    /// `FnOnce`, but both steps need `&mut` access to `self.device` and
    /// `self.state` — two closures can't each hold that simultaneously, so
    /// the whole sequence runs inside `rebuild` and `teardown` is a no-op.
    fn run_recovery(&mut self) -> Result<(), RendererError> {
        let config = self.config.clone();
        let window = self.window;
        let window_extent = self.window_extent;
        let headless = self.is_headless();
        let cached_scene = self.cached_scene.take();

        let device_slot = &mut self.device;
        let state_slot = &mut self.state;
        let meshes = &self.meshes;
        let materials = &self.materials;

        let result = self.recovery.recover(
            || {},
            move || -> Result<(), RendererError> {
                unsafe {
                    let _ = device_slot.device.device_wait_idle();

                    // spec §4.14 step 3: "scene buffers → command/sync →
                    // PBR pipeline → simple pipelines → render pass →
                    // swapchain → device objects" — scene buffers go first.
                    for mesh in meshes.drain() {
                        device_slot.allocator.free_buffer(&device_slot.device, mesh.vertex_buffer);
                        device_slot.allocator.free_buffer(&device_slot.device, mesh.index_buffer);
                    }
                    for material in materials.drain() {
                        materials::destroy_material(&device_slot.device, &device_slot.allocator, material);
                    }

                    if let Some(mt) = state_slot.mt.take() {
                        mt.shutdown(&device_slot.device);
                    }
                    state_slot.frame.destroy(device_slot);
                    state_slot.pipelines.destroy(&device_slot.device);
                    state_slot.descriptor_layouts.destroy(&device_slot.device);
                    if let Some(sc) = &mut state_slot.swapchain {
                        sc.destroy(device_slot);
                    }
                    state_slot.swapchain = None;

                    *device_slot = Arc::new(DeviceContext::new(window)?);
                    *state_slot =
                        Renderer::bring_up_device_dependent(&config, device_slot, headless, window_extent)?;
                }
                Ok(())
            },
        );

        match result {
            Ok(()) => {}
            Err(e) => return Err(RendererError::Recovery(e)),
        }

        if let Some(items) = &cached_scene {
            self.upload_scene_items(items)?;
        }
        self.cached_scene = cached_scene;

        info!("device-loss recovery completed");
        Ok(())
    }

    /// Destroys every renderer-owned object. Waits device-idle first so no
    /// in-flight command references anything being destroyed.
    ///
    /// # Safety
    /// Must be the last call made against this `Renderer`; nothing may
    /// reference its Vulkan objects afterward.
    pub unsafe fn shutdown(&mut self) {
        let _ = self.device.device.device_wait_idle();
        self.teardown_device_dependent();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        unsafe {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_item_clone_preserves_identifier() {
        let item = SceneItem {
            identifier: "tri".into(),
            vertices: vec![Vertex { position: [0.0; 3], normal: [0.0, 1.0, 0.0], tangent: [1.0, 0.0, 0.0, 1.0], uv: [0.0; 2] }],
            indices: vec![0, 0, 0],
            material: MaterialDescription {
                identifier: "mat".into(),
                base_color_factor: [1.0; 4],
                metallic_factor: 0.0,
                roughness_factor: 1.0,
                textures: Vec::new(),
            },
            transform: Transform::default(),
        };
        let cloned = item.clone();
        assert_eq!(cloned.identifier, item.identifier);
    }
}
