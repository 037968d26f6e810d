//! C13 — multi-threaded secondary command buffer recording.
//!
//! Grounded on `original_source/vulkan_mt.h`: a fixed pool of worker
//! threads, each owning its own command pool (command pools are not
//! thread-safe to allocate from concurrently), records secondary command
//! buffers for a task queue the main thread drains and executes via
//! `cmd_execute_commands` inside its own primary buffer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::FrameError;

/// Caps carried over from `original_source/vulkan_mt.h`'s fixed-size
/// arrays.
pub const MAX_WORKER_THREADS: usize = 8;
pub const MAX_SECONDARY_BUFFERS_PER_WORKER: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskType {
    TextureLoad,
    MeshLoad,
    MaterialLoad,
    CommandRecord,
}

/// One unit of work a worker thread executes: a closure that records into
/// the secondary command buffer it's handed, or (for non-recording load
/// tasks) ignores it.
pub struct Task {
    pub kind: TaskType,
    pub record: Box<dyn FnOnce(&ash::Device, vk::CommandBuffer) + Send>,
}

/// One worker's private command pool and its pre-allocated secondary
/// command buffers, recycled per frame.
struct ThreadCommandPool {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next_free: usize,
}

impl ThreadCommandPool {
    unsafe fn create(
        device: &ash::Device,
        queue_family: u32,
        count: usize,
    ) -> Result<ThreadCommandPool, FrameError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let pool = device.create_command_pool(&pool_info, None).map_err(FrameError::Recording)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::SECONDARY)
            .command_buffer_count(count as u32);
        let buffers = device
            .allocate_command_buffers(&alloc_info)
            .map_err(FrameError::Recording)?;

        Ok(ThreadCommandPool { pool, buffers, next_free: 0 })
    }

    /// Resets the pool and rewinds the free cursor, ready for the next
    /// frame's secondary buffers (spec §4.13 "per-frame secondary buffer
    /// lifecycle").
    unsafe fn reset(&mut self, device: &ash::Device) -> Result<(), FrameError> {
        device
            .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
            .map_err(FrameError::Recording)?;
        self.next_free = 0;
        Ok(())
    }

    fn next_buffer(&mut self) -> Option<vk::CommandBuffer> {
        let buffer = self.buffers.get(self.next_free).copied()?;
        self.next_free += 1;
        Some(buffer)
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

thread_local! {
    /// Set by a worker thread's closure to its own pool index, so ownership
    /// can be checked without needing a real `ThreadId` comparison table.
    static CURRENT_WORKER: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// Hands out the next free secondary buffer from `pools[pool_index]`,
/// refusing the request if the calling thread is not the worker that owns
/// that index (spec §4.13/§5 "a safety check aborts operations invoked
/// from a non-owning thread"). A thread that never ran inside
/// [`MtSubsystem::spawn`]'s worker closure (e.g. the main thread) is never
/// considered an owner of any pool.
fn checkout_buffer(
    pools: &Mutex<Vec<ThreadCommandPool>>,
    pool_index: usize,
) -> Result<vk::CommandBuffer, FrameError> {
    let caller = CURRENT_WORKER.with(|c| c.get());
    if caller != Some(pool_index) {
        return Err(FrameError::ForeignThreadPoolAccess { owner: pool_index, caller });
    }
    let mut guard = pools.lock();
    guard
        .get_mut(pool_index)
        .and_then(ThreadCommandPool::next_buffer)
        .ok_or(FrameError::Recording(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
}

struct TaskQueueInner {
    tasks: Vec<Task>,
    shutting_down: bool,
}

/// A blocking MPMC-ish queue: workers pop under the condvar, the main
/// thread pushes and notifies (spec §4.13 "task queue").
struct TaskQueue {
    inner: Mutex<TaskQueueInner>,
    available: Condvar,
}

impl TaskQueue {
    fn new() -> TaskQueue {
        TaskQueue {
            inner: Mutex::new(TaskQueueInner { tasks: Vec::new(), shutting_down: false }),
            available: Condvar::new(),
        }
    }

    fn push(&self, task: Task) {
        let mut guard = self.inner.lock();
        guard.tasks.push(task);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        let mut guard = self.inner.lock();
        loop {
            if let Some(task) = guard.tasks.pop() {
                return Some(task);
            }
            if guard.shutting_down {
                return None;
            }
            self.available.wait(&mut guard);
        }
    }

    fn shutdown(&self) {
        let mut guard = self.inner.lock();
        guard.shutting_down = true;
        self.available.notify_all();
    }
}

/// Pending secondary buffers recorded this frame, handed back to the main
/// thread for `cmd_execute_commands` (spec §4.13 "submission").
pub struct SecondaryCommandContext {
    pub buffers: Mutex<Vec<vk::CommandBuffer>>,
}

/// Owns the worker threads, their per-thread command pools, and the task
/// queue that feeds them. One instance per renderer (spec §3
/// `MTSubsystem`).
pub struct MtSubsystem {
    queue: Arc<TaskQueue>,
    pools: Arc<Mutex<Vec<ThreadCommandPool>>>,
    handles: Vec<std::thread::JoinHandle<()>>,
    completed_tasks: Arc<AtomicU64>,
    recording: Arc<AtomicBool>,
    pub secondary_commands: Arc<SecondaryCommandContext>,
}

impl MtSubsystem {
    /// Spawns `worker_count` (clamped to [`MAX_WORKER_THREADS`]) threads,
    /// each owning its own command pool with
    /// [`MAX_SECONDARY_BUFFERS_PER_WORKER`] pre-allocated secondary
    /// buffers.
    ///
    /// # Safety
    /// `device` must outlive the subsystem (the caller is responsible for
    /// calling [`MtSubsystem::shutdown`] before dropping the device).
    pub unsafe fn spawn(
        device: Arc<ash::Device>,
        queue_family: u32,
        worker_count: usize,
    ) -> Result<MtSubsystem, FrameError> {
        let worker_count = worker_count.clamp(1, MAX_WORKER_THREADS);
        let queue = Arc::new(TaskQueue::new());
        let completed_tasks = Arc::new(AtomicU64::new(0));
        let recording = Arc::new(AtomicBool::new(false));
        let secondary_commands = Arc::new(SecondaryCommandContext { buffers: Mutex::new(Vec::new()) });

        let mut pools = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            pools.push(ThreadCommandPool::create(
                &device,
                queue_family,
                MAX_SECONDARY_BUFFERS_PER_WORKER,
            )?);
        }
        let pools = Arc::new(Mutex::new(pools));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let device = Arc::clone(&device);
            let queue = Arc::clone(&queue);
            let pools = Arc::clone(&pools);
            let completed_tasks = Arc::clone(&completed_tasks);
            let secondary_commands = Arc::clone(&secondary_commands);
            let handle = std::thread::Builder::new()
                .name(format!("cardinal-mt-{worker_index}"))
                .spawn(move || {
                    CURRENT_WORKER.with(|c| c.set(Some(worker_index)));
                    while let Some(task) = queue.pop() {
                        let buffer = match checkout_buffer(&pools, worker_index) {
                            Ok(buffer) => buffer,
                            Err(FrameError::Recording(_)) => {
                                trace!(worker_index, "no free secondary buffer this frame, dropping task");
                                continue;
                            }
                            Err(e) => {
                                warn!(worker_index, error = %e, "refusing cross-worker pool access");
                                continue;
                            }
                        };
                        (task.record)(&device, buffer);
                        secondary_commands.buffers.lock().push(buffer);
                        completed_tasks.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .expect("failed to spawn cardinal-mt worker thread");
            handles.push(handle);
        }

        debug!(worker_count, "spawned multi-threaded command subsystem");
        Ok(MtSubsystem {
            queue,
            pools,
            handles,
            completed_tasks,
            recording,
            secondary_commands,
        })
    }

    pub fn submit(&self, task: Task) {
        self.queue.push(task);
    }

    pub fn completed_tasks(&self) -> u64 {
        self.completed_tasks.load(Ordering::Relaxed)
    }

    /// Resets every worker's command pool for the next frame. Must only be
    /// called once all workers have finished the previous frame's tasks
    /// (the caller drains via its own synchronization, typically the
    /// frame's timeline wait).
    ///
    /// # Safety
    /// `device` must be the device the pools were created with, and no
    /// worker may still be recording into them.
    pub unsafe fn begin_frame(&self, device: &ash::Device) -> Result<(), FrameError> {
        self.recording.store(true, Ordering::Release);
        self.secondary_commands.buffers.lock().clear();
        let mut pools = self.pools.lock();
        for pool in pools.iter_mut() {
            pool.reset(device)?;
        }
        Ok(())
    }

    pub fn take_secondary_buffers(&self) -> Vec<vk::CommandBuffer> {
        self.recording.store(false, Ordering::Release);
        std::mem::take(&mut *self.secondary_commands.buffers.lock())
    }

    /// Signals workers to exit and joins every thread. Must be called
    /// before destroying the device or the command pools.
    ///
    /// # Safety
    /// `device` must be the device the pools were created with.
    pub unsafe fn shutdown(mut self, device: &ash::Device) {
        self.queue.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        let pools = self.pools.lock();
        for pool in pools.iter() {
            pool.destroy(device);
        }
    }
}

/// One recorded resource access, for [`BarrierValidator`]'s race heuristic.
#[derive(Clone, Copy, Debug)]
struct AccessEvent {
    resource_id: u64,
    stage_mask: vk::PipelineStageFlags2,
    access_mask: vk::AccessFlags2,
    thread: ThreadId,
    barrier_seen_after: bool,
}

/// Optional race-flagging instrument supplementing C13's task queue:
/// records every resource access a worker reports and warns when two
/// accesses from different threads touch the same resource with
/// overlapping read/write semantics and no barrier recorded between them.
/// This never blocks or rejects a submission — it only logs, matching
/// `original_source/`'s debug-only validation layer that the distilled
/// spec dropped. Gated behind
/// [`crate::config::RendererConfig::enable_barrier_validation`].
pub struct BarrierValidator {
    capacity: usize,
    events: Mutex<Vec<AccessEvent>>,
    flagged: AtomicU64,
}

impl BarrierValidator {
    pub fn new(capacity: usize) -> BarrierValidator {
        BarrierValidator {
            capacity,
            events: Mutex::new(Vec::with_capacity(capacity)),
            flagged: AtomicU64::new(0),
        }
    }

    /// Records that the current thread accessed `resource_id` with the
    /// given stage/access masks, flagging a potential race if the most
    /// recent access to that same resource was from a different thread,
    /// the access masks conflict (either side writes), and no barrier was
    /// recorded for it since.
    pub fn record_access(
        &self,
        resource_id: u64,
        stage_mask: vk::PipelineStageFlags2,
        access_mask: vk::AccessFlags2,
    ) {
        let thread = std::thread::current().id();
        let mut events = self.events.lock();

        if let Some(prior) = events
            .iter_mut()
            .rev()
            .find(|e| e.resource_id == resource_id)
        {
            let conflicts = writes(access_mask) || writes(prior.access_mask);
            if conflicts && prior.thread != thread && !prior.barrier_seen_after {
                self.flagged.fetch_add(1, Ordering::Relaxed);
                warn!(
                    resource_id,
                    ?prior.thread,
                    ?thread,
                    "unsynchronized concurrent access to the same resource"
                );
            }
        }

        if events.len() == self.capacity {
            events.remove(0);
        }
        events.push(AccessEvent { resource_id, stage_mask, access_mask, thread, barrier_seen_after: false });
    }

    /// Marks every recorded access to `resource_id` as covered by a
    /// barrier, so subsequent accesses don't re-flag against it.
    pub fn mark_barrier(&self, resource_id: u64) {
        let mut events = self.events.lock();
        for event in events.iter_mut().filter(|e| e.resource_id == resource_id) {
            event.barrier_seen_after = true;
        }
    }

    pub fn flagged_count(&self) -> u64 {
        self.flagged.load(Ordering::Relaxed)
    }
}

fn writes(access: vk::AccessFlags2) -> bool {
    access.intersects(
        vk::AccessFlags2::SHADER_WRITE
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            | vk::AccessFlags2::TRANSFER_WRITE
            | vk::AccessFlags2::HOST_WRITE
            | vk::AccessFlags2::MEMORY_WRITE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_queue_delivers_pushed_task_and_shuts_down() {
        let queue = TaskQueue::new();
        queue.push(Task { kind: TaskType::MeshLoad, record: Box::new(|_, _| {}) });
        let task = queue.pop();
        assert!(task.is_some());
        assert_eq!(task.unwrap().kind, TaskType::MeshLoad);

        queue.shutdown();
        assert!(queue.pop().is_none());
    }

    #[test]
    fn checkout_buffer_rejects_non_owning_thread() {
        // No thread-local worker index has been set on the test thread, so
        // any pool index is "foreign".
        let pools = Mutex::new(Vec::<ThreadCommandPool>::new());
        let result = checkout_buffer(&pools, 0);
        assert!(matches!(result, Err(FrameError::ForeignThreadPoolAccess { owner: 0, caller: None })));
    }

    #[test]
    fn barrier_validator_flags_conflicting_cross_thread_access() {
        let validator = BarrierValidator::new(16);
        validator.record_access(1, vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                validator.record_access(
                    1,
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_READ,
                );
            });
        });
        assert_eq!(validator.flagged_count(), 1);
    }

    #[test]
    fn barrier_validator_does_not_flag_after_mark_barrier() {
        let validator = BarrierValidator::new(16);
        validator.record_access(2, vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE);
        validator.mark_barrier(2);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                validator.record_access(
                    2,
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_READ,
                );
            });
        });
        assert_eq!(validator.flagged_count(), 0);
    }
}
