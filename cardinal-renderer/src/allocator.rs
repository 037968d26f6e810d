//! C5 — typed device-memory allocation over images and buffers.
//!
//! Wraps `gpu-allocator`'s sub-allocator (teacher's `graal` crate uses the
//! same crate for device memory) rather than hand-rolling a buddy/pool
//! allocator: `gpu-allocator` already implements the "query requirements,
//! pick a memory type satisfying required properties, bind" algorithm this
//! component needs, and tracks free blocks internally. This module adds
//! the parts the spec calls out that `gpu-allocator` doesn't: explicit
//! buffer/image creation wiring, the maintenance4 vs. legacy requirements
//! query choice, and cumulative allocated/freed byte counters for leak
//! detection at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::AllocatorError;

/// A device buffer plus its backing allocation.
pub struct AllocatedBuffer {
    pub handle: vk::Buffer,
    pub allocation: Allocation,
    pub size: u64,
}

/// A device image plus its backing allocation.
pub struct AllocatedImage {
    pub handle: vk::Image,
    pub allocation: Allocation,
    pub size: u64,
}

/// Cumulative allocation byte counters, used to detect leaks at shutdown
/// (spec §3 "Device-memory stats").
#[derive(Default)]
pub struct DeviceMemoryStats {
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl DeviceMemoryStats {
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    /// Positive net at shutdown indicates a leak.
    pub fn net(&self) -> i64 {
        self.allocated() as i64 - self.freed() as i64
    }
}

/// Whether the device supports the maintenance4 unified memory-requirements
/// query, as opposed to the legacy per-object query path (spec §4.5).
#[derive(Copy, Clone, Debug)]
pub struct RequirementsQueryMode {
    pub has_maintenance4: bool,
}

pub struct DeviceAllocator {
    inner: Mutex<Allocator>,
    requirements_mode: RequirementsQueryMode,
    stats: DeviceMemoryStats,
}

impl DeviceAllocator {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        requirements_mode: RequirementsQueryMode,
    ) -> Result<DeviceAllocator, AllocatorError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|_| AllocatorError::AllocationFailed(vk::Result::ERROR_INITIALIZATION_FAILED))?;

        Ok(DeviceAllocator {
            inner: Mutex::new(allocator),
            requirements_mode,
            stats: DeviceMemoryStats::default(),
        })
    }

    pub fn stats(&self) -> &DeviceMemoryStats {
        &self.stats
    }

    /// Creates a buffer and binds freshly allocated device memory to it.
    /// On any failure, destroys whatever Vulkan object was already
    /// created before returning (spec §4.5 failure-path invariant).
    ///
    /// # Safety
    /// `device` must be the logical device this allocator was built for.
    pub unsafe fn create_buffer(
        &self,
        device: &ash::Device,
        create_info: &vk::BufferCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedBuffer, AllocatorError> {
        if create_info.size == 0 {
            return Err(AllocatorError::ZeroSize);
        }

        let handle = device
            .create_buffer(create_info, None)
            .map_err(AllocatorError::CreateFailed)?;

        let requirements = if self.requirements_mode.has_maintenance4 {
            let info = vk::DeviceBufferMemoryRequirements::default().create_info(create_info);
            device.get_device_buffer_memory_requirements(&info)
        } else {
            device.get_buffer_memory_requirements(handle)
        };

        if requirements.memory_type_bits == 0 {
            device.destroy_buffer(handle, None);
            return Err(AllocatorError::NoCompatibleMemoryType);
        }

        let allocation = self
            .inner
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|_| {
                AllocatorError::AllocationFailed(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            });
        let allocation = match allocation {
            Ok(a) => a,
            Err(e) => {
                device.destroy_buffer(handle, None);
                return Err(e);
            }
        };

        if let Err(e) = device.bind_buffer_memory(
            handle,
            allocation.memory(),
            allocation.offset(),
        ) {
            let _ = self.inner.lock().free(allocation);
            device.destroy_buffer(handle, None);
            return Err(AllocatorError::BindFailed(e));
        }

        let size = allocation.size();
        self.stats.allocated.fetch_add(size, Ordering::Relaxed);
        trace!(name, size, "allocated device buffer");

        Ok(AllocatedBuffer {
            handle,
            allocation,
            size,
        })
    }

    /// Creates an image and binds freshly allocated device memory to it.
    ///
    /// # Safety
    /// `device` must be the logical device this allocator was built for.
    pub unsafe fn create_image(
        &self,
        device: &ash::Device,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedImage, AllocatorError> {
        let handle = device
            .create_image(create_info, None)
            .map_err(AllocatorError::CreateFailed)?;

        let requirements = if self.requirements_mode.has_maintenance4 {
            let info = vk::DeviceImageMemoryRequirements::default().create_info(create_info);
            device.get_device_image_memory_requirements(&info)
        } else {
            device.get_image_memory_requirements(handle)
        };

        if requirements.memory_type_bits == 0 {
            device.destroy_image(handle, None);
            return Err(AllocatorError::NoCompatibleMemoryType);
        }

        let allocation = self
            .inner
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|_| {
                AllocatorError::AllocationFailed(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            });
        let allocation = match allocation {
            Ok(a) => a,
            Err(e) => {
                device.destroy_image(handle, None);
                return Err(e);
            }
        };

        if let Err(e) =
            device.bind_image_memory(handle, allocation.memory(), allocation.offset())
        {
            let _ = self.inner.lock().free(allocation);
            device.destroy_image(handle, None);
            return Err(AllocatorError::BindFailed(e));
        }

        let size = allocation.size();
        self.stats.allocated.fetch_add(size, Ordering::Relaxed);
        trace!(name, size, "allocated device image");

        Ok(AllocatedImage {
            handle,
            allocation,
            size,
        })
    }

    /// # Safety
    /// `device` must be the logical device this allocator was built for
    /// and `buffer` must not be referenced by any in-flight command.
    pub unsafe fn free_buffer(&self, device: &ash::Device, buffer: AllocatedBuffer) {
        device.destroy_buffer(buffer.handle, None);
        let _ = self.inner.lock().free(buffer.allocation);
        self.stats.freed.fetch_add(buffer.size, Ordering::Relaxed);
    }

    /// # Safety
    /// `device` must be the logical device this allocator was built for
    /// and `image` must not be referenced by any in-flight command.
    pub unsafe fn free_image(&self, device: &ash::Device, image: AllocatedImage) {
        device.destroy_image(image.handle, None);
        let _ = self.inner.lock().free(image.allocation);
        self.stats.freed.fetch_add(image.size, Ordering::Relaxed);
    }
}
