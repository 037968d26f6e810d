//! C9 — direct per-frame command recording and submission driver.
//!
//! Unlike the teacher's `graal::context` module (an automatic
//! dependency-tracking frame graph with batches/passes/transient
//! resources), this driver is a thin, explicit loop: acquire, record into
//! one primary command buffer per frame-in-flight slot, submit with a
//! timeline-semaphore signal, present. Callers do their own barrier
//! placement inside the recording callback.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use tracing::trace;

use crate::device::DeviceContext;
use crate::error::{FrameError, SyncError};
use crate::sync::FrameSync;

struct PerFrameData {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    sync: FrameSync,
    /// Timeline value this slot's work was last submitted with; recording
    /// into this slot again must wait for the timeline to reach it.
    target_timeline_value: u64,
}

/// Drives the acquire/record/submit/present loop across `frames_in_flight`
/// slots, tracking a single monotonically increasing timeline value shared
/// by every submission (spec §4.9 "one timeline semaphore per renderer").
pub struct FrameDriver {
    frames: Vec<PerFrameData>,
    current_frame_index: usize,
    timeline_semaphore: vk::Semaphore,
    current_frame_value: AtomicU64,
    headless: bool,
}

/// Context handed to the recording callback: the command buffer to record
/// into and the swapchain image index (meaningless, always 0, in headless
/// mode).
pub struct FrameContext<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    pub frame_value: u64,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl FrameDriver {
    /// # Safety
    /// `device` must be a valid logical device; `graphics_queue_family`
    /// must match the queue the driver will submit to.
    pub unsafe fn new(
        device: &DeviceContext,
        frames_in_flight: u32,
        headless: bool,
    ) -> Result<FrameDriver, FrameError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let timeline_semaphore = device
            .device
            .create_semaphore(&create_info, None)
            .map_err(|e| FrameError::Sync(SyncError::from_vk_result(e)))?;

        let mut frames = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(device.graphics_queue_family);
            let command_pool = device
                .device
                .create_command_pool(&pool_info, None)
                .map_err(|e| FrameError::Recording(e))?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = device
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| FrameError::Recording(e))?[0];

            let sync = FrameSync::create(&device.device)
                .map_err(FrameError::Sync)?;

            frames.push(PerFrameData {
                command_pool,
                command_buffer,
                sync,
                target_timeline_value: 0,
            });
        }

        Ok(FrameDriver {
            frames,
            current_frame_index: 0,
            timeline_semaphore,
            current_frame_value: AtomicU64::new(0),
            headless,
        })
    }

    pub fn current_frame_value(&self) -> u64 {
        self.current_frame_value.load(Ordering::Acquire)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Runs one full frame: waits for the slot's previous submission to
    /// retire, acquires a swapchain image (skipped in headless mode),
    /// records via `record`, submits signaling the shared timeline, and
    /// presents (skipped in headless mode). Always advances
    /// `current_frame_value` by one, even headless, so callers can drive
    /// the renderer without a window for smoke testing (spec §8).
    ///
    /// # Safety
    /// `device` must be the device this driver was built with; `swapchain`
    /// (when present) must belong to the same device and surface.
    pub unsafe fn draw_frame<F>(
        &mut self,
        device: &DeviceContext,
        swapchain: Option<&mut crate::swapchain::Swapchain>,
        record: F,
    ) -> Result<(), FrameError>
    where
        F: FnOnce(&ash::Device, &FrameContext),
    {
        let slot = self.current_frame_index;
        let target_value = self.frames[slot].target_timeline_value;
        if target_value > 0 {
            // The fence is the cheap CPU-side check (spec §4.9 step 3); the
            // timeline wait that follows is the authoritative one, since
            // the fence alone can't tell us the frame's *resources* (as
            // opposed to its command buffer) are safe to reuse.
            crate::sync::wait_for_frame(&device.device, self.frames[slot].sync.in_flight_fence, u64::MAX)
                .map_err(FrameError::Sync)?;
            crate::sync::wait_timeline(&device.device, self.timeline_semaphore, target_value, u64::MAX)
                .map_err(FrameError::Sync)?;
            crate::sync::reset_frame_fence(&device.device, self.frames[slot].sync.in_flight_fence)
                .map_err(FrameError::Sync)?;
        }

        let image_index = match (&swapchain, self.headless) {
            (Some(sc), false) => {
                let (index, suboptimal) = device
                    .swapchain_loader
                    .acquire_next_image(
                        sc.handle,
                        u64::MAX,
                        self.frames[slot].sync.image_available,
                        vk::Fence::null(),
                    )
                    .map_err(|e| match e {
                        vk::Result::ERROR_OUT_OF_DATE_KHR => {
                            FrameError::Swapchain(crate::error::SwapchainError::OutOfDate)
                        }
                        vk::Result::ERROR_SURFACE_LOST_KHR => {
                            FrameError::Swapchain(crate::error::SwapchainError::SurfaceLost)
                        }
                        other => FrameError::Submit(other),
                    })?;
                if suboptimal {
                    return Err(FrameError::Swapchain(crate::error::SwapchainError::Suboptimal));
                }
                index
            }
            _ => 0,
        };

        device
            .device
            .reset_command_buffer(self.frames[slot].command_buffer, vk::CommandBufferResetFlags::empty())
            .map_err(FrameError::Recording)?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .device
            .begin_command_buffer(self.frames[slot].command_buffer, &begin_info)
            .map_err(FrameError::Recording)?;

        let next_value = crate::sync::next_timeline_value(&self.current_frame_value);
        let ctx = FrameContext {
            command_buffer: self.frames[slot].command_buffer,
            image_index,
            frame_value: next_value,
            _marker: std::marker::PhantomData,
        };
        record(&device.device, &ctx);

        device
            .device
            .end_command_buffer(self.frames[slot].command_buffer)
            .map_err(FrameError::Recording)?;

        if self.headless || swapchain.is_none() {
            // No queue to submit to in headless mode; host-signal the
            // timeline directly so a later wait on this slot (and on
            // `current_frame_value`) observes real progress instead of
            // blocking forever waiting on a submission that never happens.
            crate::sync::signal_timeline(&device.device, self.timeline_semaphore, next_value)
                .map_err(FrameError::Sync)?;
            self.frames[slot].target_timeline_value = next_value;
            self.current_frame_index = (slot + 1) % self.frames.len();
            return Ok(());
        }

        let command_buffers = [self.frames[slot].command_buffer];
        let wait_semaphores = [self.frames[slot].sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.frames[slot].sync.render_finished, self.timeline_semaphore];
        let signal_values = [0u64, next_value];

        let mut timeline_submit = vk::TimelineSemaphoreSubmitInfo::default()
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_submit);

        device
            .device
            .queue_submit(device.graphics_queue, &[submit_info], self.frames[slot].sync.in_flight_fence)
            .map_err(FrameError::Submit)?;

        self.frames[slot].target_timeline_value = next_value;

        if let Some(sc) = swapchain {
            let swapchains = [sc.handle];
            let image_indices = [image_index];
            let wait = [self.frames[slot].sync.render_finished];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&wait)
                .swapchains(&swapchains)
                .image_indices(&image_indices);
            let present_result = device.swapchain_loader.queue_present(device.present_queue, &present_info);
            match present_result {
                Ok(false) => {}
                Ok(true) => {
                    sc.mark_recreation_pending();
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    sc.mark_recreation_pending();
                }
                Err(e) => return Err(FrameError::Present(e)),
            }
        }

        trace!(frame_value = next_value, slot, "submitted frame");
        self.current_frame_index = (slot + 1) % self.frames.len();
        Ok(())
    }

    /// # Safety
    /// Requires `device.device_wait_idle()` to have completed so no
    /// in-flight work references these objects.
    pub unsafe fn destroy(&mut self, device: &DeviceContext) {
        for frame in &self.frames {
            device.device.destroy_command_pool(frame.command_pool, None);
            frame.sync.destroy(&device.device);
        }
        self.frames.clear();
        device.device.destroy_semaphore(self.timeline_semaphore, None);
    }
}
