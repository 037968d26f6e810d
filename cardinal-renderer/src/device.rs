//! C6 (part 2) — logical device, queues, and the debug messenger.
//!
//! [`DeviceContext`] is the non-owning reference every other component
//! holds: exactly one exists per renderer (spec §3 invariant).

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::info;

use crate::allocator::{DeviceAllocator, RequirementsQueryMode};
use crate::error::DeviceError;
use crate::instance::{self, DeviceCapabilities, PhysicalDeviceCandidate};
use crate::handle::UniqueHandle;

unsafe extern "system" fn debug_utils_message_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        "<no message>".to_string()
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy().into_owned()
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => tracing::trace!(target: "vulkan", "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => tracing::info!(target: "vulkan", "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => tracing::warn!(target: "vulkan", "{message}"),
        _ => tracing::error!(target: "vulkan", "{message}"),
    }
    vk::FALSE
}

/// The logical device, its queues, loaded extension dispatch tables, and
/// the physical-device properties/feature flags it was created with.
///
/// All other Vulkan-owning components (swapchain, sync engine, pipelines,
/// allocator) hold a non-owning `&DeviceContext` / `Arc<DeviceContext>`.
pub struct DeviceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub capabilities: DeviceCapabilities,

    pub graphics_queue_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue_family: u32,
    pub present_queue: vk::Queue,
    pub transfer_queue: Option<(u32, vk::Queue)>,

    pub surface_loader: Option<ash::khr::surface::Instance>,
    /// The presentation surface created from the window handles passed to
    /// [`DeviceContext::new`], or `None` in headless mode. Owned here
    /// rather than by [`crate::swapchain::Swapchain`] because physical-
    /// device selection (spec §4.6 "presentation support against the
    /// surface") needs it before any swapchain exists.
    pub surface: Option<vk::SurfaceKHR>,
    pub swapchain_loader: ash::khr::swapchain::Device,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: UniqueHandle<vk::DebugUtilsMessengerEXT>,

    pub allocator: DeviceAllocator,
}

const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

impl DeviceContext {
    /// Brings up instance, physical device, logical device, queues, and
    /// the debug messenger. `window` is the display/window handle pair to
    /// create a presentation surface from; `None` selects headless mode.
    ///
    /// Surface creation must happen after instance creation but before
    /// physical-device selection (the selection needs to query
    /// presentation support against the surface), so this constructor
    /// owns the whole bring-up sequence end to end rather than accepting a
    /// pre-built surface — a surface can only be created against an
    /// instance that already exists, and only this function creates one.
    ///
    /// # Safety
    /// Requires a correctly loaded Vulkan entry (the caller links against
    /// the Vulkan loader for the current platform). If `window` is
    /// `Some`, the referenced window must remain alive for the duration
    /// of this call.
    pub unsafe fn new(
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
    ) -> Result<DeviceContext, DeviceError> {
        let entry = ash::Entry::linked();
        let enable_validation = instance::want_validation();

        let required_window_extensions: Vec<*const i8> = match window {
            Some((display_handle, _)) => {
                ash_window::enumerate_required_extensions(display_handle)
                    .map_err(DeviceError::Vulkan)?
                    .to_vec()
            }
            None => Vec::new(),
        };

        let vk_instance =
            instance::create_instance(&entry, &required_window_extensions, enable_validation)?;

        let debug_utils_loader = if enable_validation {
            Some(ash::ext::debug_utils::Instance::new(&entry, &vk_instance))
        } else {
            None
        };
        let debug_messenger = if let Some(loader) = &debug_utils_loader {
            let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_utils_message_callback));
            UniqueHandle::new(
                loader
                    .create_debug_utils_messenger(&create_info, None)
                    .map_err(DeviceError::Vulkan)?,
            )
        } else {
            UniqueHandle::null()
        };

        let surface_loader = if window.is_some() {
            Some(ash::khr::surface::Instance::new(&entry, &vk_instance))
        } else {
            None
        };
        let surface = match (window, &surface_loader) {
            (Some((display_handle, window_handle)), Some(_)) => Some(
                ash_window::create_surface(&entry, &vk_instance, display_handle, window_handle, None)
                    .map_err(DeviceError::Vulkan)?,
            ),
            _ => None,
        };

        let candidate: PhysicalDeviceCandidate = instance::select_physical_device(
            &vk_instance,
            surface_loader.as_ref(),
            surface,
        )?;

        let name = CStr::from_ptr(candidate.properties.device_name.as_ptr());
        info!(?name, "selected physical device");

        let present_queue_family = candidate.graphics_queue_family;

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(candidate.graphics_queue_family)
            .queue_priorities(&queue_priorities)];

        let device_extensions: Vec<*const i8> =
            REQUIRED_DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();

        let mut timeline_features =
            vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true);
        let mut sync2_features =
            vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
        let mut maintenance4_features = vk::PhysicalDeviceMaintenance4Features::default()
            .maintenance4(candidate.capabilities.maintenance4);
        let mut dynamic_rendering_features = vk::PhysicalDeviceDynamicRenderingFeatures::default()
            .dynamic_rendering(candidate.capabilities.dynamic_rendering);
        let enabled_features =
            vk::PhysicalDeviceFeatures::default().sampler_anisotropy(candidate.capabilities.sampler_anisotropy);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions)
            .enabled_features(&enabled_features)
            .push_next(&mut timeline_features)
            .push_next(&mut sync2_features)
            .push_next(&mut maintenance4_features)
            .push_next(&mut dynamic_rendering_features);

        let device = vk_instance
            .create_device(candidate.physical_device, &device_create_info, None)
            .map_err(DeviceError::DeviceCreation)?;

        let graphics_queue = device.get_device_queue(candidate.graphics_queue_family, 0);
        let present_queue = graphics_queue;

        let memory_properties =
            vk_instance.get_physical_device_memory_properties(candidate.physical_device);

        let swapchain_loader = ash::khr::swapchain::Device::new(&vk_instance, &device);

        let allocator = DeviceAllocator::new(
            &vk_instance,
            &device,
            candidate.physical_device,
            RequirementsQueryMode {
                has_maintenance4: candidate.capabilities.maintenance4,
            },
        )
        .map_err(|_| DeviceError::NoSuitablePhysicalDevice)?;

        Ok(DeviceContext {
            entry,
            instance: vk_instance,
            physical_device: candidate.physical_device,
            device,
            properties: candidate.properties,
            memory_properties,
            capabilities: candidate.capabilities,
            graphics_queue_family: candidate.graphics_queue_family,
            graphics_queue,
            present_queue_family,
            present_queue,
            transfer_queue: None,
            surface_loader,
            surface,
            swapchain_loader,
            debug_utils_loader,
            debug_messenger,
            allocator,
        })
    }

    /// Finds a memory type satisfying `type_bits` and the required
    /// property flags, preferring one that also has the preferred flags
    /// (spec §4.5).
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let search = |flags: vk::MemoryPropertyFlags| {
            (0..self.memory_properties.memory_type_count).find(|&i| {
                let matches_bits = type_bits & (1 << i) != 0;
                let matches_flags = self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags);
                matches_bits && matches_flags
            })
        };
        search(required | preferred).or_else(|| search(required))
    }

    /// Records and submits a one-shot command buffer on the graphics
    /// queue, blocking until it completes, for uploads that must finish
    /// before any frame referencing their target resources can submit
    /// (spec §4.9/§4.12 "immediate_submit"). Not for per-frame use: it
    /// stalls the calling thread on a dedicated fence rather than pipelining
    /// through the frame driver's timeline.
    ///
    /// # Safety
    /// `record` must only emit commands valid outside a render pass and
    /// must not reference resources destroyed before this call returns.
    pub unsafe fn immediate_submit<F>(&self, record: F) -> Result<(), DeviceError>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.graphics_queue_family);
        let pool = self
            .device
            .create_command_pool(&pool_info, None)
            .map_err(DeviceError::Vulkan)?;

        let result = (|| {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(DeviceError::Vulkan)?[0];

            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(DeviceError::Vulkan)?;
            record(&self.device, command_buffer);
            self.device
                .end_command_buffer(command_buffer)
                .map_err(DeviceError::Vulkan)?;

            let fence_info = vk::FenceCreateInfo::default();
            let fence = self
                .device
                .create_fence(&fence_info, None)
                .map_err(DeviceError::Vulkan)?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            let submit_result = self
                .device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
                .map_err(DeviceError::Vulkan);
            let wait_result = submit_result.and_then(|()| {
                self.device
                    .wait_for_fences(&[fence], true, u64::MAX)
                    .map_err(DeviceError::Vulkan)
            });
            self.device.destroy_fence(fence, None);
            wait_result
        })();

        self.device.destroy_command_pool(pool, None);
        result
    }

    /// The anisotropy level to request from samplers, or `None` if the
    /// device doesn't support the feature (spec §4.11 "anisotropy when
    /// available").
    pub fn max_sampler_anisotropy(&self) -> Option<f32> {
        self.capabilities
            .sampler_anisotropy
            .then_some(self.properties.limits.max_sampler_anisotropy)
    }

    pub fn is_presentation_compatible(&self, surface: vk::SurfaceKHR) -> bool {
        match &self.surface_loader {
            Some(loader) => unsafe {
                loader
                    .get_physical_device_surface_support(
                        self.physical_device,
                        self.graphics_queue_family,
                        surface,
                    )
                    .unwrap_or(false)
            },
            None => false,
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            // Any leftover device-memory allocations must be freed by
            // their owners before this point; the allocator itself holds
            // no Vulkan handles that need explicit destruction here.
            if !self.debug_messenger.is_null() {
                if let Some(loader) = &self.debug_utils_loader {
                    loader.destroy_debug_utils_messenger(self.debug_messenger.take(), None);
                }
            }
            self.device.destroy_device(None);
            if let (Some(surface), Some(loader)) = (self.surface, &self.surface_loader) {
                loader.destroy_surface(surface, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// A device wrapped for sharing across threads/components that need to
/// outlive a single frame (the scene uploader, worker pools).
pub type SharedDevice = Arc<DeviceContext>;
