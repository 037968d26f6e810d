//! Cardinal — a Vulkan 3D rendering engine.
//!
//! The crate is organized as one module per component: logging (C1),
//! host-memory accounting (C2), the content-addressed ref registry (C3),
//! the resource-state FSM (C4), the device-memory allocator (C5),
//! instance/device bring-up (C6), the swapchain manager (C7), the sync
//! engine (C8), the per-frame command driver (C9), the pipeline set
//! (C10), material/texture caches (C11), the scene graph (C12), the
//! multi-threaded command subsystem (C13), and the device-loss recovery
//! controller (C14). [`renderer::Renderer`] assembles all of them behind
//! a single entry point for host applications.

pub mod allocator;
pub mod config;
pub mod device;
pub mod error;
mod handle;
pub mod instance;
pub mod logger;
pub mod materials;
pub mod memory;
pub mod mt;
pub mod pipeline;
pub mod recovery;
pub mod registry;
pub mod renderer;
pub mod resource_state;
pub mod scene;
pub mod swapchain;
pub mod sync;
pub mod frame;

pub use config::{RenderMode, RendererConfig};
pub use error::RendererError;
pub use renderer::Renderer;
