//! # Ember Engine
//!
//! A real-time renderer core built around deferred command execution.
//!
//! The central piece is the [`render::Renderer`] facade: application code
//! submits closures ("render commands") from the simulation thread, and a
//! render thread (or the same thread, in the single-threaded configuration)
//! replays them in FIFO order against a [`render::RenderBackend`]. GPU
//! resource destruction is deferred through per-frame-in-flight release
//! queues so objects are never destroyed while a still-executing frame might
//! reference them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ember_engine::prelude::*;
//! # fn backend() -> Box<dyn RenderBackend> { unimplemented!() }
//!
//! # fn run() -> Result<(), RenderError> {
//! let config = RendererConfig::default();
//! let release = ReleaseQueues::new(config.frames_in_flight);
//! let renderer = Renderer::new(&config, backend(), release)?;
//!
//! renderer.begin_frame();
//! renderer.submit(|backend| {
//!     let _ = backend.begin_render_pass([0.1, 0.1, 0.1, 1.0]);
//!     let _ = backend.end_render_pass();
//! });
//! renderer.end_frame();
//! renderer.wait_and_render();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod core;
pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        core::config::{EngineConfig, RendererConfig, WindowConfig},
        render::{
            backend::{BackendResult, PipelineHandle, RenderBackend},
            material::Material,
            release_queue::{ReleaseHandle, ReleaseQueues},
            render_thread::RenderThread,
            renderer::Renderer,
            shader::{ShaderReflection, ShaderStage},
            RenderError,
        },
    };
}
