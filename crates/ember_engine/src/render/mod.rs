//! # Deferred-Execution Renderer
//!
//! The rendering system decouples the thread that decides *what* to draw
//! from the thread that owns the graphics context and issues the actual GPU
//! calls. Application code enqueues closures through
//! [`Renderer::submit`](renderer::Renderer::submit); once per frame the
//! executing thread drains the queue in FIFO order via
//! [`Renderer::wait_and_render`](renderer::Renderer::wait_and_render).
//!
//! ## Architecture
//!
//! - [`command_queue`] — the FIFO closure queue, double-buffered by the facade
//! - [`release_queue`] — per-frame-in-flight deferred destruction queues
//! - [`renderer`] — the facade owning queues, frame index, and the backend
//! - [`render_thread`] — optional dedicated executor thread
//! - [`backend`] — the backend-agnostic GPU interface ([`RenderBackend`])
//! - [`vulkan`] — the concrete Vulkan backend
//! - [`buffer_set`], [`shader`], [`material`] — per-frame GPU resource model
//!
//! ## Frame lifecycle
//!
//! ```text
//! begin_frame  -> fence wait for reused slot, pool reset, release-slot drain
//! submit...    -> commands accumulate in the write queue
//! end_frame    -> submit + present command; frame index advances
//! wait_and_render -> executing thread replays the previous write queue
//! ```

pub mod backend;
pub mod buffer_set;
pub mod command_queue;
pub mod material;
pub mod release_queue;
pub mod render_thread;
pub mod renderer;
pub mod shader;
pub mod vulkan;

#[cfg(test)]
mod renderer_tests;

pub use backend::{BackendResult, PipelineHandle, RenderBackend};
pub use buffer_set::{StorageBufferSet, UniformBufferSet};
pub use command_queue::{CommandQueue, RenderCommand};
pub use material::Material;
pub use release_queue::{ReleaseHandle, ReleaseQueues};
pub use render_thread::RenderThread;
pub use renderer::{Renderer, ShaderReloadListener};
pub use shader::{ShaderReflection, ShaderStage};

use thiserror::Error;

/// Errors surfaced by the rendering system
///
/// Only construction and explicit frame-boundary operations return errors.
/// Failures inside replayed render commands are logged and dropped instead:
/// the closures are deliberately non-failable so an error can never unwind
/// across queued commands and corrupt replay state.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Renderer or backend construction failed
    #[error("renderer initialization failed: {0}")]
    InitializationFailed(String),

    /// A backend operation failed
    #[error("backend error: {0}")]
    Backend(String),

    /// The swap chain could not be (re)created for the requested extent
    #[error("swapchain error: {0}")]
    Swapchain(String),
}
