//! C8 — timeline semaphore pool and per-frame synchronization primitives.
//!
//! Grounded on `original_source/vulkan_timeline_pool.h`: a pool of
//! (semaphore, last_signaled_value) entries keyed by in-use/idle state,
//! with allocation/cache-hit/cache-miss counters and opportunistic
//! cleanup of semaphores idle past `max_idle_time_ns`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{ErrorClass, SyncError};

/// One pooled timeline semaphore.
struct TimelinePoolEntry {
    semaphore: vk::Semaphore,
    last_signaled_value: u64,
    in_use: bool,
    created_at: Instant,
    last_returned: Instant,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct TimelinePoolStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub live: u64,
}

struct PoolInner {
    entries: Vec<TimelinePoolEntry>,
    stats: TimelinePoolStats,
}

/// Pools timeline semaphores so frames don't pay Vulkan object-creation
/// cost every submission. An idle entry is reused (cache hit) before a new
/// semaphore is created (cache miss); entries idle past `max_idle_time`
/// are destroyed on the next `collect_idle` pass when `auto_cleanup` is
/// enabled.
pub struct TimelineSemaphorePool {
    inner: Mutex<PoolInner>,
    pub auto_cleanup_enabled: bool,
    pub max_idle_time: Duration,
}

/// A handle into the pool; returned to the pool (not destroyed) on drop
/// via [`TimelineSemaphorePool::release`] — callers must call `release`
/// explicitly since destruction needs the device.
pub struct PooledTimelineSemaphore {
    pub semaphore: vk::Semaphore,
    index: usize,
}

impl TimelineSemaphorePool {
    pub fn new(auto_cleanup_enabled: bool, max_idle_time: Duration) -> TimelineSemaphorePool {
        TimelineSemaphorePool {
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                stats: TimelinePoolStats::default(),
            }),
            auto_cleanup_enabled,
            max_idle_time,
        }
    }

    /// Acquires an idle semaphore from the pool, or creates a new one
    /// (starting at timeline value 0) on a miss.
    ///
    /// # Safety
    /// `device` must be the logical device this pool is used with.
    pub unsafe fn acquire(
        &self,
        device: &ash::Device,
    ) -> Result<PooledTimelineSemaphore, SyncError> {
        let mut guard = self.inner.lock();
        if let Some(index) = guard.entries.iter().position(|e| !e.in_use) {
            guard.entries[index].in_use = true;
            guard.stats.cache_hits += 1;
            guard.stats.allocations += 1;
            let semaphore = guard.entries[index].semaphore;
            trace!(index, "reused pooled timeline semaphore");
            return Ok(PooledTimelineSemaphore { semaphore, index });
        }

        let mut type_info =
            vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = device
            .create_semaphore(&create_info, None)
            .map_err(SyncError::from_vk_result)?;

        let now = Instant::now();
        guard.entries.push(TimelinePoolEntry {
            semaphore,
            last_signaled_value: 0,
            in_use: true,
            created_at: now,
            last_returned: now,
        });
        guard.stats.cache_misses += 1;
        guard.stats.allocations += 1;
        let index = guard.entries.len() - 1;
        debug!(index, "created new timeline semaphore");
        Ok(PooledTimelineSemaphore { semaphore, index })
    }

    /// Returns a semaphore to the idle pool, recording the value it was
    /// last signaled to.
    pub fn release(&self, handle: PooledTimelineSemaphore, last_signaled_value: u64) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.entries.get_mut(handle.index) {
            entry.in_use = false;
            entry.last_signaled_value = last_signaled_value;
            entry.last_returned = Instant::now();
        }
        guard.stats.deallocations += 1;
    }

    pub fn stats(&self) -> TimelinePoolStats {
        let guard = self.inner.lock();
        TimelinePoolStats {
            live: guard.entries.len() as u64,
            ..guard.stats
        }
    }

    /// Destroys idle entries that have exceeded `max_idle_time`. No-op
    /// when `auto_cleanup_enabled` is false.
    ///
    /// # Safety
    /// `device` must be the logical device this pool is used with, and no
    /// in-flight submission may reference a destroyed semaphore.
    pub unsafe fn collect_idle(&self, device: &ash::Device) {
        if !self.auto_cleanup_enabled {
            return;
        }
        let mut guard = self.inner.lock();
        let max_idle = self.max_idle_time;
        let mut removed = 0usize;
        guard.entries.retain(|entry| {
            let expired = !entry.in_use && entry.last_returned.elapsed() > max_idle;
            if expired {
                unsafe { device.destroy_semaphore(entry.semaphore, None) };
                removed += 1;
            }
            !expired
        });
        if removed > 0 {
            debug!(removed, "collected idle timeline semaphores");
        }
    }

    /// # Safety
    /// `device` must be the logical device this pool is used with; no
    /// in-flight submission may reference any pooled semaphore.
    pub unsafe fn destroy_all(&self, device: &ash::Device) {
        let mut guard = self.inner.lock();
        for entry in guard.entries.drain(..) {
            device.destroy_semaphore(entry.semaphore, None);
        }
    }
}

/// Waits for `semaphore` to reach `value`, translating Vulkan errors into
/// [`SyncError`] (spec §4.8).
///
/// # Safety
/// `device` must own `semaphore`.
pub unsafe fn wait_timeline(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
    timeout_ns: u64,
) -> Result<(), SyncError> {
    let semaphores = [semaphore];
    let values = [value];
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);
    match device.wait_semaphores(&wait_info, timeout_ns) {
        Ok(()) => Ok(()),
        Err(e) => Err(SyncError::from_vk_result(e)),
    }
}

/// # Safety
/// `device` must own `semaphore`.
pub unsafe fn query_timeline_value(
    device: &ash::Device,
    semaphore: vk::Semaphore,
) -> Result<u64, SyncError> {
    device
        .get_semaphore_counter_value(semaphore)
        .map_err(SyncError::from_vk_result)
}

/// Per-frame synchronization set: one binary semaphore pairs with swapchain
/// acquire/present (these cannot be timeline semaphores per the Vulkan
/// spec), an in-flight fence the CPU can poll without blocking on the
/// timeline wait, plus the shared timeline semaphore value this frame must
/// reach before its resources are safe to reuse (spec §4.8/§4.9).
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    pub timeline_value: u64,
}

impl FrameSync {
    /// # Safety
    /// `device` must be a valid logical device.
    pub unsafe fn create(device: &ash::Device) -> Result<FrameSync, SyncError> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let image_available = device
            .create_semaphore(&create_info, None)
            .map_err(SyncError::from_vk_result)?;
        let render_finished = match device.create_semaphore(&create_info, None) {
            Ok(s) => s,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                return Err(SyncError::from_vk_result(e));
            }
        };
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight_fence = match device.create_fence(&fence_info, None) {
            Ok(f) => f,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                device.destroy_semaphore(render_finished, None);
                return Err(SyncError::from_vk_result(e));
            }
        };
        Ok(FrameSync {
            image_available,
            render_finished,
            in_flight_fence,
            timeline_value: 0,
        })
    }

    /// # Safety
    /// `device` must own these semaphores and no in-flight submission may
    /// reference them.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight_fence, None);
    }
}

/// Blocks until `fence` is signaled, or `timeout_ns` elapses (spec §4.9
/// step 3).
///
/// # Safety
/// `device` must own `fence`.
pub unsafe fn wait_for_frame(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<(), SyncError> {
    device
        .wait_for_fences(&[fence], true, timeout_ns)
        .map_err(SyncError::from_vk_result)
}

/// Resets `fence` to unsignaled ahead of the next submission that will
/// signal it.
///
/// # Safety
/// `device` must own `fence`, and no submission still referencing it may
/// be in flight.
pub unsafe fn reset_frame_fence(device: &ash::Device, fence: vk::Fence) -> Result<(), SyncError> {
    device.reset_fences(&[fence]).map_err(SyncError::from_vk_result)
}

/// Atomically reserves the next value the shared timeline semaphore will
/// be signaled to (spec §4.8 "atomic fetch-and-add on a monotonic 64-bit
/// counter"; spec §8 "for all timeline signals ... the sequence is
/// contiguous per allocator"). [`crate::frame::FrameDriver`] calls this
/// once per submission instead of reimplementing the increment inline.
pub fn next_timeline_value(current: &AtomicU64) -> u64 {
    current.fetch_add(1, Ordering::AcqRel) + 1
}

/// Signals `semaphore` to `value` from the host, without a queue
/// submission (spec §4.8 "host signal", used by tests and by the recovery
/// controller to unstick waiters on a torn-down timeline).
///
/// # Safety
/// `device` must own `semaphore`.
pub unsafe fn signal_timeline(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
) -> Result<(), SyncError> {
    let signal_info = vk::SemaphoreSignalInfo::default().semaphore(semaphore).value(value);
    device.signal_semaphore(&signal_info).map_err(SyncError::from_vk_result)
}

/// Waits for several (semaphore, value) pairs at once, all-of semantics
/// (spec §4.8 "batch wait").
///
/// # Safety
/// `device` must own every semaphore in `waits`.
pub unsafe fn wait_timeline_batch(
    device: &ash::Device,
    waits: &[(vk::Semaphore, u64)],
    timeout_ns: u64,
) -> Result<(), SyncError> {
    let semaphores: Vec<vk::Semaphore> = waits.iter().map(|(s, _)| *s).collect();
    let values: Vec<u64> = waits.iter().map(|(_, v)| *v).collect();
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);
    device
        .wait_semaphores(&wait_info, timeout_ns)
        .map_err(SyncError::from_vk_result)
}

/// Returns whether `semaphore` has already reached `value`, without
/// blocking.
///
/// # Safety
/// `device` must own `semaphore`.
pub unsafe fn is_reached(device: &ash::Device, semaphore: vk::Semaphore, value: u64) -> Result<bool, SyncError> {
    let current = query_timeline_value(device, semaphore)?;
    Ok(current >= value)
}

/// Waits on `semaphore`, classifying the result into an [`ErrorClass`] so
/// callers can decide whether to retry, skip, or escalate to recovery,
/// instead of matching on [`SyncError`] themselves (spec §4.8 "wait_safe").
///
/// # Safety
/// `device` must own `semaphore`.
pub unsafe fn wait_safe(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
    timeout_ns: u64,
) -> Result<(), ErrorClass> {
    match wait_timeline(device, semaphore, value, timeout_ns) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(error = %e, "timeline wait failed");
            Err(e.class())
        }
    }
}

/// Signals `semaphore`, classifying failures the same way [`wait_safe`]
/// does.
///
/// # Safety
/// `device` must own `semaphore`.
pub unsafe fn signal_safe(device: &ash::Device, semaphore: vk::Semaphore, value: u64) -> Result<(), ErrorClass> {
    match signal_timeline(device, semaphore, value) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(error = %e, "timeline signal failed");
            Err(e.class())
        }
    }
}

/// Bounded ring of recently signaled timeline values, flagging any value
/// that arrives out of the monotonic order the engine relies on. Gated
/// behind [`crate::config::RendererConfig::enable_timeline_debug`];
/// logs only, never blocks (supplemented from `original_source/`'s debug
/// build instrumentation, which the distilled spec omitted).
pub struct TimelineDebugTrace {
    capacity: usize,
    history: Mutex<Vec<u64>>,
    out_of_order_count: AtomicU64,
}

impl TimelineDebugTrace {
    pub fn new(capacity: usize) -> TimelineDebugTrace {
        TimelineDebugTrace {
            capacity,
            history: Mutex::new(Vec::with_capacity(capacity)),
            out_of_order_count: AtomicU64::new(0),
        }
    }

    /// Records an observed signal value, warning if it is not greater than
    /// the previously recorded one.
    pub fn record(&self, value: u64) {
        let mut history = self.history.lock();
        if let Some(&last) = history.last() {
            if value <= last {
                self.out_of_order_count.fetch_add(1, Ordering::Relaxed);
                warn!(value, last, "timeline value observed out of order");
            }
        }
        if history.len() == self.capacity {
            history.remove(0);
        }
        history.push(value);
    }

    pub fn out_of_order_count(&self) -> u64 {
        self.out_of_order_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_start_at_zero() {
        let pool = TimelineSemaphorePool::new(true, Duration::from_secs(1));
        let stats = pool.stats();
        assert_eq!(stats.allocations, 0);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.cache_misses, 0);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn auto_cleanup_flag_is_stored() {
        let pool = TimelineSemaphorePool::new(false, Duration::from_millis(50));
        assert!(!pool.auto_cleanup_enabled);
        assert_eq!(pool.max_idle_time, Duration::from_millis(50));
    }

    #[test]
    fn next_timeline_value_is_current_plus_one() {
        let current = AtomicU64::new(4);
        assert_eq!(next_timeline_value(&current), 5);
        // the counter itself advanced, unlike a pure peek.
        assert_eq!(current.load(Ordering::Acquire), 5);
    }

    #[test]
    fn next_timeline_value_is_contiguous_across_calls() {
        let current = AtomicU64::new(0);
        let values: Vec<u64> = (0..5).map(|_| next_timeline_value(&current)).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn timeline_debug_trace_flags_out_of_order_values() {
        let trace = TimelineDebugTrace::new(8);
        trace.record(1);
        trace.record(2);
        assert_eq!(trace.out_of_order_count(), 0);
        trace.record(2);
        assert_eq!(trace.out_of_order_count(), 1);
    }

    #[test]
    fn timeline_debug_trace_evicts_oldest_past_capacity() {
        let trace = TimelineDebugTrace::new(2);
        trace.record(1);
        trace.record(2);
        trace.record(3);
        assert_eq!(trace.history.lock().as_slice(), &[2, 3]);
    }
}
