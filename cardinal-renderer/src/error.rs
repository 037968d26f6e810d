//! Error taxonomy for the renderer.
//!
//! Each subsystem gets its own `thiserror` enum; [`RendererError`] unifies
//! them for the public API. The variant shapes mirror the error-kind
//! taxonomy: recoverable-surface, recoverable-device, transient,
//! resource-missing, invalid-config, fatal.

use ash::vk;
use thiserror::Error;

/// Coarse classification used by the frame driver to decide whether to
/// retry next frame, skip a frame, or hand off to the recovery controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Swapchain/surface is stale; mark for recreation, no escalation.
    RecoverableSurface,
    /// The device or surface was lost; drive the recovery controller.
    RecoverableDevice,
    /// A wait timed out; retry next frame.
    Transient,
    /// A referenced resource (shader, texture) is missing; fall back.
    ResourceMissing,
    /// A requested configuration isn't supported; renegotiate.
    InvalidConfig,
    /// Unrecoverable; bring-up must abort.
    Fatal,
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("requested allocation size is zero")]
    ZeroSize,
    #[error("no memory type satisfies the requested property flags")]
    NoCompatibleMemoryType,
    #[error("device memory allocation failed: {0:?}")]
    AllocationFailed(vk::Result),
    #[error("failed to bind resource to memory: {0:?}")]
    BindFailed(vk::Result),
    #[error("failed to create resource: {0:?}")]
    CreateFailed(vk::Result),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no physical device exposes the required features")]
    NoSuitablePhysicalDevice,
    #[error("timeline semaphores are not supported by the selected device")]
    TimelineSemaphoresUnsupported,
    #[error("instance creation failed: {0:?}")]
    InstanceCreation(vk::Result),
    #[error("device creation failed: {0:?}")]
    DeviceCreation(vk::Result),
    #[error("vulkan call failed: {0:?}")]
    Vulkan(#[from] vk::Result),
}

#[derive(Debug, Error)]
pub enum SwapchainError {
    #[error("surface query failed: {0:?}")]
    SurfaceQuery(vk::Result),
    #[error("swapchain creation failed: {0:?}")]
    CreateFailed(vk::Result),
    #[error("no supported depth format among the candidates")]
    NoDepthFormat,
    #[error("device was lost while recreating the swapchain")]
    DeviceLost,
    #[error("swapchain is out of date")]
    OutOfDate,
    #[error("swapchain is suboptimal")]
    Suboptimal,
    #[error("surface was lost")]
    SurfaceLost,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("wait timed out")]
    Timeout,
    #[error("device was lost")]
    DeviceLost,
    #[error("host or device ran out of memory: {0:?}")]
    OutOfMemory(vk::Result),
    #[error("semaphore value {requested} is not monotonic after {last}")]
    InvalidValue { last: u64, requested: u64 },
    #[error("semaphore handle is invalid")]
    SemaphoreInvalid,
    #[error("unknown vulkan error: {0:?}")]
    Unknown(vk::Result),
}

impl SyncError {
    pub fn from_vk_result(result: vk::Result) -> SyncError {
        match result {
            vk::Result::TIMEOUT => SyncError::Timeout,
            vk::Result::ERROR_DEVICE_LOST => SyncError::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                SyncError::OutOfMemory(result)
            }
            other => SyncError::Unknown(other),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Timeout => ErrorClass::Transient,
            SyncError::DeviceLost => ErrorClass::RecoverableDevice,
            SyncError::OutOfMemory(_) => ErrorClass::Fatal,
            SyncError::InvalidValue { .. } | SyncError::SemaphoreInvalid => ErrorClass::Fatal,
            SyncError::Unknown(_) => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Swapchain(#[from] SwapchainError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("recording failed: {0:?}")]
    Recording(vk::Result),
    #[error("submission failed: {0:?}")]
    Submit(vk::Result),
    #[error("present failed: {0:?}")]
    Present(vk::Result),
    #[error("the renderer is mid-recovery; frame skipped")]
    RecoveryInProgress,
    #[error("worker {caller:?} attempted to allocate from worker {owner}'s command pool")]
    ForeignThreadPoolAccess { owner: usize, caller: Option<usize> },
}

impl FrameError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FrameError::Swapchain(SwapchainError::OutOfDate)
            | FrameError::Swapchain(SwapchainError::Suboptimal) => ErrorClass::RecoverableSurface,
            FrameError::Swapchain(SwapchainError::DeviceLost)
            | FrameError::Swapchain(SwapchainError::SurfaceLost) => ErrorClass::RecoverableDevice,
            FrameError::Swapchain(_) => ErrorClass::Fatal,
            FrameError::Sync(e) => e.class(),
            FrameError::Recording(_) => ErrorClass::Fatal,
            FrameError::Submit(result) => match *result {
                vk::Result::ERROR_DEVICE_LOST => ErrorClass::RecoverableDevice,
                _ => ErrorClass::Fatal,
            },
            FrameError::Present(result) => match *result {
                vk::Result::ERROR_DEVICE_LOST | vk::Result::ERROR_SURFACE_LOST_KHR => {
                    ErrorClass::RecoverableDevice
                }
                _ => ErrorClass::Fatal,
            },
            FrameError::RecoveryInProgress => ErrorClass::Transient,
            FrameError::ForeignThreadPoolAccess { .. } => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("identifier already in use with a different payload layout")]
    IdentifierCollision,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("device loss recovery is already in progress")]
    AlreadyRecovering,
    #[error("exceeded the maximum number of recovery attempts ({0})")]
    AttemptsExhausted(u32),
    #[error("rebuild step failed: {0}")]
    RebuildFailed(String),
}

#[derive(Debug, Error)]
pub enum RendererError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Swapchain(#[from] SwapchainError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("shader module not found at {0}")]
    ShaderNotFound(String),
    #[error("vertex count is zero; refusing to upload an empty mesh")]
    EmptyMesh,
    #[error("no suitable physical device was found")]
    NoSuitableDevice,
    #[error("invalid window handle: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
}
