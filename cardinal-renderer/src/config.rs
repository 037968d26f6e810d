//! Renderer-wide configuration, assembled by the host from CLI flags and
//! environment variables and handed to [`crate::renderer::Renderer::new`].

use ash::vk;
use std::path::PathBuf;

/// Name of the environment variable that overrides the shader search
/// directory (spec §6).
pub const SHADERS_DIR_ENV: &str = "CARDINAL_SHADERS_DIR";

/// Default number of frames kept in flight.
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 2;

/// Default cap on device-loss recovery attempts before giving up
/// permanently (open question in spec §9, resolved here).
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Default capacity of the global bump allocator (C2).
pub const DEFAULT_BUMP_ALLOCATOR_CAPACITY: usize = 4 * 1024 * 1024;

/// Default number of worker threads for the multi-thread command subsystem
/// (C13), before clamping to `hardware_concurrency`.
pub const DEFAULT_WORKER_THREAD_CAP: usize = 8;

/// Default pre-allocated secondary command buffers per worker pool.
pub const DEFAULT_SECONDARY_BUFFERS_PER_WORKER: u32 = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RenderMode {
    /// Full metallic-roughness PBR pipeline.
    Normal,
    /// Flat-shaded UV visualization.
    Uv,
    /// Wireframe overlay.
    Wireframe,
    /// Mesh-shader placeholder; demoted to `Normal` if unsupported.
    MeshShader,
}

impl Default for RenderMode {
    fn default() -> Self {
        RenderMode::Normal
    }
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// Number of frames in flight, F. Typically 2-3.
    pub frames_in_flight: u32,
    /// Caller's preferred surface format; negotiated per §4.7 if absent.
    pub preferred_surface_format: Option<vk::SurfaceFormatKHR>,
    /// Caller's preferred present mode; negotiated per §4.7 if absent.
    pub preferred_present_mode: Option<vk::PresentModeKHR>,
    /// Directory to search for compiled SPIR-V modules.
    pub shaders_dir: PathBuf,
    /// Run without a window/surface; draws into offscreen-equivalent state
    /// and never calls acquire/present.
    pub headless: bool,
    /// Cap on device-loss recovery attempts (C14).
    pub max_recovery_attempts: u32,
    /// Number of worker threads for the multi-thread command subsystem.
    pub worker_thread_count: usize,
    /// Initial rendering mode.
    pub render_mode: RenderMode,
    /// Enable the optional barrier-validation subsystem (C13).
    pub enable_barrier_validation: bool,
    /// Enable the optional timeline debug trace (C8 supplement).
    pub enable_timeline_debug: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let worker_thread_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(DEFAULT_WORKER_THREAD_CAP);

        let shaders_dir = std::env::var_os(SHADERS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("assets/shaders"));

        RendererConfig {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            preferred_surface_format: None,
            preferred_present_mode: None,
            shaders_dir,
            headless: false,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            worker_thread_count,
            render_mode: RenderMode::default(),
            enable_barrier_validation: cfg!(debug_assertions),
            enable_timeline_debug: cfg!(debug_assertions),
        }
    }
}
