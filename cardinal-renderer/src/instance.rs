//! C6 (part 1) — instance creation and physical-device scoring.

use std::ffi::{CStr, CString};

use ash::vk;
use tracing::{info, warn};

use crate::error::DeviceError;

/// Name of the environment variable that forces validation layers on even
/// in release builds (spec §4.6 "or an environment override is set").
pub const FORCE_VALIDATION_ENV: &str = "CARDINAL_VALIDATION";

const VALIDATION_LAYER_NAME: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Whether validation layers should be requested: debug builds always ask,
/// release builds only if the environment override is set.
pub fn want_validation() -> bool {
    cfg!(debug_assertions) || std::env::var_os(FORCE_VALIDATION_ENV).is_some()
}

/// Creates the Vulkan instance with the fixed set of required extensions
/// (surface + platform surface, conditional debug-utils) and validation
/// layers when requested and available.
///
/// # Safety
/// `entry` must be a valid, loaded Vulkan entry point table.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    required_window_extensions: &[*const i8],
    enable_validation: bool,
) -> Result<ash::Instance, DeviceError> {
    let app_name = CString::new("Cardinal").unwrap();
    let engine_name = CString::new("Cardinal").unwrap();

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(0)
        .engine_name(&engine_name)
        .engine_version(0)
        .api_version(vk::API_VERSION_1_3);

    let mut extensions: Vec<*const i8> = required_window_extensions.to_vec();
    let debug_utils_name = ash::ext::debug_utils::NAME.as_ptr();
    let mut validation_enabled = false;
    if enable_validation {
        let available_layers = entry
            .enumerate_instance_layer_properties()
            .map_err(DeviceError::InstanceCreation)?;
        validation_enabled = available_layers.iter().any(|layer| {
            let name = CStr::from_ptr(layer.layer_name.as_ptr());
            name == VALIDATION_LAYER_NAME
        });
        if validation_enabled {
            extensions.push(debug_utils_name);
        } else {
            warn!("validation requested but VK_LAYER_KHRONOS_validation is not available");
        }
    }

    let layer_names = [VALIDATION_LAYER_NAME.as_ptr()];
    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions);
    if validation_enabled {
        create_info = create_info.enabled_layer_names(&layer_names);
    }

    let instance = entry
        .create_instance(&create_info, None)
        .map_err(DeviceError::InstanceCreation)?;
    info!(validation_enabled, "created vulkan instance");
    Ok(instance)
}

/// Feature capabilities a physical device may expose, tracked as booleans
/// (spec §3 "DeviceContext").
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceCapabilities {
    pub timeline_semaphores: bool,
    pub synchronization2: bool,
    pub maintenance4: bool,
    pub maintenance8: bool,
    pub dynamic_rendering: bool,
    pub mesh_shader: bool,
    pub descriptor_indexing: bool,
    pub sampler_anisotropy: bool,
}

pub struct PhysicalDeviceCandidate {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub capabilities: DeviceCapabilities,
    pub graphics_queue_family: u32,
    pub score: i64,
}

/// Scores a physical device by type (discrete > integrated > other) and by
/// required-feature support. Devices that lack a graphics queue,
/// presentation support, or timeline semaphores are filtered out (return
/// `None`).
///
/// # Safety
/// `instance` must be valid and `surface_loader`/`surface` (if given) must
/// come from the same instance.
pub unsafe fn score_physical_device(
    instance: &ash::Instance,
    surface_loader: Option<&ash::khr::surface::Instance>,
    surface: Option<vk::SurfaceKHR>,
    physical_device: vk::PhysicalDevice,
) -> Option<PhysicalDeviceCandidate> {
    let properties = instance.get_physical_device_properties(physical_device);
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics_queue_family = None;
    for (index, family) in queue_families.iter().enumerate() {
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        if let (Some(loader), Some(surface)) = (surface_loader, surface) {
            let supports_present = loader
                .get_physical_device_surface_support(physical_device, index as u32, surface)
                .unwrap_or(false);
            if !supports_present {
                continue;
            }
        }
        graphics_queue_family = Some(index as u32);
        break;
    }
    let graphics_queue_family = graphics_queue_family?;

    let mut timeline_features = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
    let mut sync2_features = vk::PhysicalDeviceSynchronization2Features::default();
    let mut maintenance4_features = vk::PhysicalDeviceMaintenance4Features::default();
    let mut dynamic_rendering_features = vk::PhysicalDeviceDynamicRenderingFeatures::default();
    let mut descriptor_indexing_features =
        vk::PhysicalDeviceDescriptorIndexingFeatures::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut timeline_features)
        .push_next(&mut sync2_features)
        .push_next(&mut maintenance4_features)
        .push_next(&mut dynamic_rendering_features)
        .push_next(&mut descriptor_indexing_features);
    instance.get_physical_device_features2(physical_device, &mut features2);
    let sampler_anisotropy = features2.features.sampler_anisotropy == vk::TRUE;

    let extensions = instance
        .enumerate_device_extension_properties(physical_device)
        .ok()?;
    let has_extension = |name: &CStr| {
        extensions
            .iter()
            .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == name)
    };

    let capabilities = DeviceCapabilities {
        timeline_semaphores: timeline_features.timeline_semaphore == vk::TRUE,
        synchronization2: sync2_features.synchronization2 == vk::TRUE,
        maintenance4: maintenance4_features.maintenance4 == vk::TRUE,
        maintenance8: has_extension(c"VK_KHR_maintenance8"),
        dynamic_rendering: dynamic_rendering_features.dynamic_rendering == vk::TRUE,
        mesh_shader: has_extension(c"VK_EXT_mesh_shader"),
        descriptor_indexing: descriptor_indexing_features
            .shader_sampled_image_array_non_uniform_indexing
            == vk::TRUE,
        sampler_anisotropy,
    };

    if !capabilities.timeline_semaphores {
        return None;
    }

    let mut score: i64 = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1_000,
        _ => 500,
    };
    if capabilities.dynamic_rendering {
        score += 50;
    }
    if capabilities.maintenance4 {
        score += 20;
    }
    if capabilities.maintenance8 {
        score += 10;
    }
    if capabilities.descriptor_indexing {
        score += 30;
    }

    Some(PhysicalDeviceCandidate {
        physical_device,
        properties,
        capabilities,
        graphics_queue_family,
        score,
    })
}

/// Enumerates physical devices and returns the highest-scoring candidate
/// that meets the hard requirements (spec §4.6).
///
/// # Safety
/// `instance` must be valid; `surface_loader`/`surface` must belong to it.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: Option<&ash::khr::surface::Instance>,
    surface: Option<vk::SurfaceKHR>,
) -> Result<PhysicalDeviceCandidate, DeviceError> {
    let physical_devices = instance
        .enumerate_physical_devices()
        .map_err(DeviceError::Vulkan)?;

    let mut best: Option<PhysicalDeviceCandidate> = None;
    for physical_device in physical_devices {
        if let Some(candidate) =
            score_physical_device(instance, surface_loader, surface, physical_device)
        {
            let name = CStr::from_ptr(candidate.properties.device_name.as_ptr());
            info!(?name, score = candidate.score, "scored physical device candidate");
            if best.as_ref().map(|b| candidate.score > b.score).unwrap_or(true) {
                best = Some(candidate);
            }
        }
    }

    best.ok_or(DeviceError::NoSuitablePhysicalDevice)
}
