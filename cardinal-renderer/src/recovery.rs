//! C14 — device-loss recovery controller.
//!
//! Grounded on `original_source/engine/src/renderer/vulkan_renderer_frame.c`
//! (`vk_recover_from_device_loss`, the teardown/rebuild sequencing and
//! attempt-count gate) and
//! `original_source/engine/src/renderer/vulkan_recovery_struct.h` (the
//! controller's state shape, including the loss/complete callback slots):
//! when a frame operation reports
//! [`crate::error::ErrorClass::RecoverableDevice`], the renderer hands
//! control here instead of propagating the error to the host. The
//! controller tears down every device-dependent subsystem in the reverse
//! of its bring-up order (scene buffers, command/sync, pipelines, render
//! pass, swapchain, device objects) and rebuilds them in forward order,
//! capped at [`crate::config::RendererConfig::max_recovery_attempts`]
//! attempts. A second loss reported while recovery is already underway is
//! rejected rather than queued — the caller must wait for the current
//! attempt to finish.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::RecoveryError;

type LossCallback = Box<dyn FnMut() + Send>;
type CompleteCallback = Box<dyn FnMut(bool) + Send>;

/// Tracks whether the renderer is currently mid-recovery and how many
/// attempts have been spent, independent of what is actually being torn
/// down and rebuilt — that sequencing lives in the caller's `rebuild`
/// closure, since only the renderer knows its own subsystem graph.
///
/// The loss/complete callbacks are the "(user ctx) -> void" /
/// "(user ctx, success) -> void" hooks from spec §9's design note on
/// duck-typed callback pointers: a boxed closure already carries its own
/// captured context, so there's no separate `void*` to thread through.
pub struct RecoveryController {
    device_lost: AtomicBool,
    recovering: AtomicBool,
    attempt_count: AtomicU32,
    max_attempts: u32,
    loss_callback: Mutex<Option<LossCallback>>,
    complete_callback: Mutex<Option<CompleteCallback>>,
}

impl RecoveryController {
    pub fn new(max_attempts: u32) -> RecoveryController {
        RecoveryController {
            device_lost: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            attempt_count: AtomicU32::new(0),
            max_attempts,
            loss_callback: Mutex::new(None),
            complete_callback: Mutex::new(None),
        }
    }

    /// Registers the callback invoked once per newly-detected device loss,
    /// before teardown begins (spec §4.14 step 2 "Notify the application").
    pub fn set_loss_callback(&self, callback: impl FnMut() + Send + 'static) {
        *self.loss_callback.lock() = Some(Box::new(callback));
    }

    /// Registers the callback invoked once a recovery attempt finishes,
    /// with `success` reflecting whether rebuild completed (spec §4.14
    /// step 5) or was abandoned after exhausting `max_attempts` (step 1).
    pub fn set_complete_callback(&self, callback: impl FnMut(bool) + Send + 'static) {
        *self.complete_callback.lock() = Some(Box::new(callback));
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::Acquire)
    }

    /// Marks the device as lost, to be observed by [`Self::is_device_lost`]
    /// callers (typically the frame driver, which should stop submitting
    /// until recovery completes).
    pub fn mark_device_lost(&self) {
        if !self.device_lost.swap(true, Ordering::AcqRel) {
            warn!("device loss detected, recovery will run on next opportunity");
        }
    }

    /// Runs one recovery attempt: `teardown` destroys every device-
    /// dependent subsystem (in reverse bring-up order), `rebuild`
    /// recreates them (in forward order). Returns the rebuilt value on
    /// success. On failure the caller's existing state has already been
    /// torn down; callers should fall back to a minimal headless-style
    /// state rather than leave half-destroyed Vulkan objects around.
    pub fn recover<T, E>(
        &self,
        teardown: impl FnOnce(),
        rebuild: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, RecoveryError>
    where
        E: std::fmt::Display,
    {
        if self.recovering.swap(true, Ordering::AcqRel) {
            return Err(RecoveryError::AlreadyRecovering);
        }
        let attempt = self.attempt_count.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > self.max_attempts {
            self.recovering.store(false, Ordering::Release);
            error!(attempt, max_attempts = self.max_attempts, "device-loss recovery attempts exhausted");
            if let Some(cb) = self.complete_callback.lock().as_mut() {
                cb(false);
            }
            return Err(RecoveryError::AttemptsExhausted(self.max_attempts));
        }

        info!(attempt, max_attempts = self.max_attempts, "beginning device-loss recovery");
        if let Some(cb) = self.loss_callback.lock().as_mut() {
            cb();
        }
        teardown();

        let result = rebuild();
        self.recovering.store(false, Ordering::Release);

        match result {
            Ok(value) => {
                self.device_lost.store(false, Ordering::Release);
                self.attempt_count.store(0, Ordering::Release);
                info!(attempt, "device-loss recovery succeeded");
                if let Some(cb) = self.complete_callback.lock().as_mut() {
                    cb(true);
                }
                Ok(value)
            }
            Err(e) => {
                error!(attempt, error = %e, "device-loss recovery attempt failed");
                if let Some(cb) = self.complete_callback.lock().as_mut() {
                    cb(false);
                }
                Err(RecoveryError::RebuildFailed(e.to_string()))
            }
        }
    }

    /// Resets attempt accounting without running a recovery pass, for
    /// hosts that want to retry from a clean slate (e.g. after the user
    /// acknowledges a fatal dialog and asks to try again).
    pub fn reset(&self) {
        self.device_lost.store(false, Ordering::Release);
        self.recovering.store(false, Ordering::Release);
        self.attempt_count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_resets_attempts_on_success() {
        let controller = RecoveryController::new(3);
        controller.mark_device_lost();
        let result: Result<u32, std::convert::Infallible> =
            controller.recover(|| {}, || Ok(7));
        assert!(result.is_ok());
        assert_eq!(controller.attempt_count(), 0);
        assert!(!controller.is_device_lost());
    }

    #[test]
    fn recovery_exhausts_after_max_attempts() {
        let controller = RecoveryController::new(2);
        for _ in 0..2 {
            let result: Result<u32, String> = controller.recover(|| {}, || Err("lost again".into()));
            assert!(result.is_err());
        }
        let result: Result<u32, String> = controller.recover(|| {}, || Err("lost again".into()));
        assert!(matches!(result, Err(RecoveryError::AttemptsExhausted(2))));
    }

    #[test]
    fn concurrent_recovery_is_rejected() {
        let controller = RecoveryController::new(3);
        controller.recovering.store(true, Ordering::Release);
        let result: Result<u32, std::convert::Infallible> = controller.recover(|| {}, || Ok(1));
        assert!(matches!(result, Err(RecoveryError::AlreadyRecovering)));
    }

    #[test]
    fn loss_and_complete_callbacks_fire_on_success() {
        let controller = RecoveryController::new(3);
        let losses = std::sync::Arc::new(AtomicU32::new(0));
        let completions = std::sync::Arc::new(Mutex::new(Vec::new()));

        let losses_handle = losses.clone();
        controller.set_loss_callback(move || {
            losses_handle.fetch_add(1, Ordering::AcqRel);
        });
        let completions_handle = completions.clone();
        controller.set_complete_callback(move |success| {
            completions_handle.lock().push(success);
        });

        let result: Result<u32, std::convert::Infallible> = controller.recover(|| {}, || Ok(42));
        assert!(result.is_ok());
        assert_eq!(losses.load(Ordering::Acquire), 1);
        assert_eq!(*completions.lock(), vec![true]);
    }

    #[test]
    fn complete_callback_fires_false_when_attempts_exhausted() {
        let controller = RecoveryController::new(1);
        let completions = std::sync::Arc::new(Mutex::new(Vec::new()));
        let completions_handle = completions.clone();
        controller.set_complete_callback(move |success| {
            completions_handle.lock().push(success);
        });

        let _: Result<u32, String> = controller.recover(|| {}, || Err("lost".into()));
        let _: Result<u32, String> = controller.recover(|| {}, || Err("lost again".into()));

        assert_eq!(*completions.lock(), vec![false, false]);
    }
}
