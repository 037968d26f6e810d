//! C4 — per-resource lifecycle FSM guarding concurrent loads.
//!
//! ```text
//! unloaded →(try_acquire_loading) loading
//! loading  →(complete)            loaded
//! loading  →(fail)                error
//! loaded   →(release)             unloading
//! unloading→(done)                unloaded
//! error    →(retry)               loading | unloaded
//! ```
//!
//! Only the thread that moves a resource into `Loading` may drive it back
//! out. Transitions are serialized per-entry with a mutex + condvar (spec
//! §4.4); the registry map itself uses its own lock for insert/remove, and
//! that lock is never held while waiting on a condvar (locking discipline,
//! spec §5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceState {
    Unloaded,
    Loading,
    Loaded,
    Error,
    Unloading,
}

impl ResourceState {
    fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loading, Error)
                | (Loaded, Unloading)
                | (Unloading, Unloaded)
                | (Error, Loading)
                | (Error, Unloaded)
        )
    }
}

struct TrackerInner {
    state: ResourceState,
    loading_thread: Option<std::thread::ThreadId>,
    last_transition: Instant,
}

/// A single tracked resource's state machine.
pub struct StateTracker {
    identifier: String,
    inner: Mutex<TrackerInner>,
    changed: Condvar,
}

impl StateTracker {
    fn new(identifier: &str) -> StateTracker {
        StateTracker {
            identifier: identifier.to_owned(),
            inner: Mutex::new(TrackerInner {
                state: ResourceState::Unloaded,
                loading_thread: None,
                last_transition: Instant::now(),
            }),
            changed: Condvar::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    pub fn is_safe_to_access(&self) -> bool {
        self.state() == ResourceState::Loaded
    }

    /// Attempts to move `Unloaded`/`Error` -> `Loading`, recording the
    /// calling thread as the owner. Fails if another thread already holds
    /// the loading slot.
    pub fn try_acquire_loading(&self) -> bool {
        let mut inner = self.inner.lock();
        let target = ResourceState::Loading;
        if !inner.state.can_transition_to(target) {
            return false;
        }
        inner.state = target;
        inner.loading_thread = Some(std::thread::current().id());
        inner.last_transition = Instant::now();
        self.changed.notify_all();
        true
    }

    fn transition_owned(&self, target: ResourceState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ResourceState::Loading {
            return false;
        }
        if inner.loading_thread != Some(std::thread::current().id()) {
            return false;
        }
        if !inner.state.can_transition_to(target) {
            return false;
        }
        inner.state = target;
        inner.loading_thread = None;
        inner.last_transition = Instant::now();
        self.changed.notify_all();
        true
    }

    /// `Loading -> Loaded`. Only the owning thread may call this.
    pub fn complete(&self) -> bool {
        self.transition_owned(ResourceState::Loaded)
    }

    /// `Loading -> Error`. Only the owning thread may call this.
    pub fn fail(&self) -> bool {
        self.transition_owned(ResourceState::Error)
    }

    /// `Loaded -> Unloading -> Unloaded`.
    pub fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ResourceState::Loaded {
            return false;
        }
        inner.state = ResourceState::Unloading;
        inner.last_transition = Instant::now();
        self.changed.notify_all();
        drop(inner);

        let mut inner = self.inner.lock();
        inner.state = ResourceState::Unloaded;
        inner.last_transition = Instant::now();
        self.changed.notify_all();
        true
    }

    /// Blocks until `target` is reached or `timeout` elapses. Returns
    /// `true` if the target state was observed.
    pub fn wait_for(&self, target: ResourceState, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == target {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if inner.state == target {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return inner.state == target;
            }
            let result = self.changed.wait_for(&mut inner, remaining);
            if result.timed_out() && inner.state != target {
                return false;
            }
        }
    }
}

/// Registry of [`StateTracker`]s keyed by identifier. Mirrors the ref
/// registry's arena-over-buckets shape (C3), but a `StateTracker` owns its
/// own mutex/condvar so the registry lock is only needed for
/// insert/lookup/remove, never for the (potentially long) wait itself.
pub struct StateRegistry {
    trackers: RwLock<HashMap<String, Arc<StateTracker>>>,
}

impl StateRegistry {
    pub fn new(_bucket_count_hint: usize) -> StateRegistry {
        StateRegistry {
            trackers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a resource for tracking, or returns the existing tracker.
    pub fn register(&self, identifier: &str) -> Arc<StateTracker> {
        if let Some(tracker) = self.trackers.read().get(identifier) {
            return tracker.clone();
        }
        let mut trackers = self.trackers.write();
        trackers
            .entry(identifier.to_owned())
            .or_insert_with(|| Arc::new(StateTracker::new(identifier)))
            .clone()
    }

    pub fn unregister(&self, identifier: &str) {
        self.trackers.write().remove(identifier);
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<StateTracker>> {
        self.trackers.read().get(identifier).cloned()
    }

    pub fn state(&self, identifier: &str) -> ResourceState {
        self.get(identifier)
            .map(|t| t.state())
            .unwrap_or(ResourceState::Unloaded)
    }

    pub fn total_tracked(&self) -> usize {
        self.trackers.read().len()
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        StateRegistry::new(1009)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_rejects_double_loading() {
        let registry = StateRegistry::default();
        let tracker = registry.register("tex:a");
        assert!(tracker.try_acquire_loading());
        // A second concurrent attempt must fail while still `Loading`.
        assert!(!tracker.try_acquire_loading());
    }

    #[test]
    fn fsm_full_cycle() {
        let registry = StateRegistry::default();
        let tracker = registry.register("tex:b");
        assert_eq!(tracker.state(), ResourceState::Unloaded);
        assert!(tracker.try_acquire_loading());
        assert!(tracker.complete());
        assert!(tracker.is_safe_to_access());
        assert!(tracker.release());
        assert_eq!(tracker.state(), ResourceState::Unloaded);
    }

    #[test]
    fn fsm_error_then_retry() {
        let registry = StateRegistry::default();
        let tracker = registry.register("tex:c");
        assert!(tracker.try_acquire_loading());
        assert!(tracker.fail());
        assert_eq!(tracker.state(), ResourceState::Error);
        assert!(tracker.try_acquire_loading());
        assert!(tracker.complete());
    }

    #[test]
    fn wait_for_times_out() {
        let registry = StateRegistry::default();
        let tracker = registry.register("tex:d");
        let reached = tracker.wait_for(ResourceState::Loaded, Duration::from_millis(10));
        assert!(!reached);
    }
}
