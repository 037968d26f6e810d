//! C7 — format/mode/extent negotiation, image views, depth attachment,
//! recreation.

use std::time::Instant;

use ash::vk;
use tracing::{info, warn};

use crate::device::DeviceContext;
use crate::error::SwapchainError;

/// Depth formats tried in order until one is supported (spec §3).
const DEPTH_FORMAT_CANDIDATES: &[vk::Format] = &[
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// Preferred fallback color formats, in order, when the caller didn't ask
/// for a specific one and it isn't advertised (spec §4.7).
const FALLBACK_COLOR_FORMATS: &[(vk::Format, vk::ColorSpaceKHR)] = &[
    (vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
    (vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
    (vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
    (vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
];

/// Present modes tried in order when the caller has no preference,
/// advertised or not; FIFO is always present so the fold always succeeds.
const FALLBACK_PRESENT_MODES: &[vk::PresentModeKHR] = &[
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::IMMEDIATE,
    vk::PresentModeKHR::FIFO_RELAXED,
    vk::PresentModeKHR::FIFO,
];

fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: Option<vk::SurfaceFormatKHR>,
) -> vk::SurfaceFormatKHR {
    if let Some(pref) = preferred {
        if available.iter().any(|f| *f == pref) {
            return pref;
        }
    }
    for &(format, color_space) in FALLBACK_COLOR_FORMATS {
        if available
            .iter()
            .any(|f| f.format == format && f.color_space == color_space)
        {
            return vk::SurfaceFormatKHR { format, color_space };
        }
    }
    available[0]
}

fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    if let Some(pref) = preferred {
        if available.contains(&pref) {
            return pref;
        }
    }
    for &mode in FALLBACK_PRESENT_MODES {
        if available.contains(&mode) {
            return mode;
        }
    }
    vk::PresentModeKHR::FIFO
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.0.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.1.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, preferred: u32) -> u32 {
    let requested = if preferred == 0 {
        capabilities.min_image_count + 1
    } else {
        preferred
    };
    let clamped_max = if capabilities.max_image_count == 0 {
        u32::MAX
    } else {
        capabilities.max_image_count
    };
    requested.clamp(capabilities.min_image_count, clamped_max)
}

fn choose_depth_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<vk::Format, SwapchainError> {
    for &format in DEPTH_FORMAT_CANDIDATES {
        let props = unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        if props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return Ok(format);
        }
    }
    Err(SwapchainError::NoDepthFormat)
}

/// Preferences a caller can express; negotiated per §4.7.
#[derive(Copy, Clone, Debug, Default)]
pub struct SwapchainPreferences {
    pub format: Option<vk::SurfaceFormatKHR>,
    pub present_mode: Option<vk::PresentModeKHR>,
    pub image_count: u32,
}

struct SwapchainImages {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    layout_initialized: Vec<bool>,
}

struct DepthAttachment {
    image: crate::allocator::AllocatedImage,
    view: vk::ImageView,
    format: vk::Format,
}

/// The swapchain and its dependent state. Exactly one per surface; absent
/// entirely in headless mode (the renderer never constructs a `Swapchain`
/// when [`crate::config::RendererConfig::headless`] is set).
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub surface: vk::SurfaceKHR,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    images: SwapchainImages,
    depth: Option<DepthAttachment>,
    pub recreation_pending: bool,
    pub consecutive_recreation_failures: u32,
    pub recreation_count: u64,
    pub last_recreation: Option<Instant>,
}

impl Swapchain {
    /// Creates a new swapchain. `old_handle` allows the driver to pass a
    /// previous instance for efficient reuse (not required by Vulkan but
    /// idiomatic and cheaper on most drivers).
    ///
    /// # Safety
    /// `device` must own `surface`; `window_extent` must reflect the
    /// current framebuffer size.
    pub unsafe fn create(
        device: &DeviceContext,
        surface: vk::SurfaceKHR,
        window_extent: (u32, u32),
        preferences: SwapchainPreferences,
        old_handle: vk::SwapchainKHR,
    ) -> Result<Swapchain, SwapchainError> {
        let surface_loader = device
            .surface_loader
            .as_ref()
            .expect("swapchain creation requires a surface loader");

        let capabilities = surface_loader
            .get_physical_device_surface_capabilities(device.physical_device, surface)
            .map_err(SwapchainError::SurfaceQuery)?;
        let formats = surface_loader
            .get_physical_device_surface_formats(device.physical_device, surface)
            .map_err(SwapchainError::SurfaceQuery)?;
        let present_modes = surface_loader
            .get_physical_device_surface_present_modes(device.physical_device, surface)
            .map_err(SwapchainError::SurfaceQuery)?;

        let surface_format = choose_surface_format(&formats, preferences.format);
        let present_mode = choose_present_mode(&present_modes, preferences.present_mode);
        let extent = choose_extent(&capabilities, window_extent);
        let image_count = choose_image_count(&capabilities, preferences.image_count);

        if extent.width == 0 || extent.height == 0 {
            // Spec §4.7 / §8: (0,0) never creates a swapchain.
            return Ok(Swapchain {
                handle: vk::SwapchainKHR::null(),
                surface,
                format: surface_format.format,
                color_space: surface_format.color_space,
                present_mode,
                extent,
                images: SwapchainImages {
                    images: Vec::new(),
                    views: Vec::new(),
                    layout_initialized: Vec::new(),
                },
                depth: None,
                recreation_pending: true,
                consecutive_recreation_failures: 0,
                recreation_count: 0,
                last_recreation: None,
            });
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_handle);

        let handle = device
            .swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(SwapchainError::CreateFailed)?;

        let raw_images = device
            .swapchain_loader
            .get_swapchain_images(handle)
            .map_err(SwapchainError::CreateFailed)?;

        let mut views = Vec::with_capacity(raw_images.len());
        for &image in &raw_images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = device
                .device
                .create_image_view(&view_info, None)
                .map_err(SwapchainError::CreateFailed)?;
            views.push(view);
        }
        let layout_initialized = vec![false; raw_images.len()];

        let depth_format = choose_depth_format(&device.instance, device.physical_device)?;
        let depth = create_depth_attachment(device, depth_format, extent)?;

        info!(
            ?surface_format.format,
            present_mode = ?present_mode,
            width = extent.width,
            height = extent.height,
            image_count = raw_images.len(),
            "created swapchain"
        );

        Ok(Swapchain {
            handle,
            surface,
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode,
            extent,
            images: SwapchainImages {
                images: raw_images,
                views,
                layout_initialized,
            },
            depth: Some(depth),
            recreation_pending: false,
            consecutive_recreation_failures: 0,
            recreation_count: 0,
            last_recreation: Some(Instant::now()),
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.images.len()
    }

    pub fn image_view(&self, index: usize) -> vk::ImageView {
        self.images.views[index]
    }

    pub fn image(&self, index: usize) -> vk::Image {
        self.images.images[index]
    }

    pub fn is_layout_initialized(&self, index: usize) -> bool {
        self.images.layout_initialized[index]
    }

    pub fn mark_layout_initialized(&mut self, index: usize) {
        self.images.layout_initialized[index] = true;
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.as_ref().map(|d| d.view)
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth.as_ref().map(|d| d.format)
    }

    /// Destroys this swapchain's image views, depth attachment, and handle.
    /// Does not wait device-idle; the caller is responsible for ensuring
    /// no in-flight command references these resources.
    ///
    /// # Safety
    /// The device must still be valid and no command buffer may reference
    /// these resources.
    pub unsafe fn destroy(&mut self, device: &DeviceContext) {
        for &view in &self.images.views {
            device.device.destroy_image_view(view, None);
        }
        self.images.views.clear();
        self.images.images.clear();
        if let Some(depth) = self.depth.take() {
            device.device.destroy_image_view(depth.view, None);
            device.allocator.free_image(&device.device, depth.image);
        }
        if self.handle != vk::SwapchainKHR::null() {
            device.swapchain_loader.destroy_swapchain(self.handle, None);
            self.handle = vk::SwapchainKHR::null();
        }
    }

    /// Strictly destructive+creative recreation: waits device-idle, tries
    /// to build a new swapchain, and on success destroys the old one; on
    /// failure restores the old handles and bumps the failure counter
    /// (spec §4.7).
    ///
    /// # Safety
    /// No command buffer referencing the current swapchain may be
    /// in-flight when this is called.
    pub unsafe fn recreate(
        &mut self,
        device: &DeviceContext,
        window_extent: (u32, u32),
        preferences: SwapchainPreferences,
    ) -> Result<(), SwapchainError> {
        device
            .device
            .device_wait_idle()
            .map_err(|_| SwapchainError::DeviceLost)?;

        let old_handle = self.handle;
        let old_views = std::mem::take(&mut self.images.views);
        let old_images = std::mem::take(&mut self.images.images);
        let old_depth = self.depth.take();

        match Swapchain::create(device, self.surface, window_extent, preferences, old_handle) {
            Ok(new_swapchain) => {
                for view in old_views {
                    device.device.destroy_image_view(view, None);
                }
                let _ = old_images;
                if let Some(depth) = old_depth {
                    device.device.destroy_image_view(depth.view, None);
                    device.allocator.free_image(&device.device, depth.image);
                }
                if old_handle != vk::SwapchainKHR::null() {
                    device.swapchain_loader.destroy_swapchain(old_handle, None);
                }
                *self = new_swapchain;
                self.recreation_count += 1;
                self.last_recreation = Some(Instant::now());
                self.consecutive_recreation_failures = 0;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "swapchain recreation failed, restoring previous swapchain");
                self.images.views = old_views;
                self.images.images = old_images;
                self.depth = old_depth;
                self.handle = old_handle;
                self.consecutive_recreation_failures += 1;
                Err(e)
            }
        }
    }

    /// Marks the swapchain stale after `OUT_OF_DATE_KHR`/`SUBOPTIMAL_KHR`
    /// from acquire/present.
    pub fn mark_recreation_pending(&mut self) {
        self.recreation_pending = true;
    }
}

unsafe fn create_depth_attachment(
    device: &DeviceContext,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<DepthAttachment, SwapchainError> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = device
        .allocator
        .create_image(
            &device.device,
            &create_info,
            gpu_allocator::MemoryLocation::GpuOnly,
            "swapchain-depth",
        )
        .map_err(|_| SwapchainError::CreateFailed(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;

    let aspect = if format == vk::Format::D32_SFLOAT || format == vk::Format::D16_UNORM {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    };

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image.handle)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    let view = device
        .device
        .create_image_view(&view_info, None)
        .map_err(SwapchainError::CreateFailed)?;

    Ok(DepthAttachment { image, view, format })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&available, Some(vk::PresentModeKHR::MAILBOX)),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn present_mode_honors_preference_when_available() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, Some(vk::PresentModeKHR::MAILBOX)),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn image_count_clamps_to_bounds() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps, 0), 3);
        assert_eq!(choose_image_count(&caps, 10), 3);
        assert_eq!(choose_image_count(&caps, 2), 2);
    }

    #[test]
    fn extent_clamped_to_min_max_when_current_is_sentinel() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 100, height: 100 },
            max_image_extent: vk::Extent2D { width: 2000, height: 2000 },
            ..Default::default()
        };
        let extent = choose_extent(&caps, (50, 3000));
        assert_eq!(extent.width, 100);
        assert_eq!(extent.height, 2000);
    }
}
