//! Renderer facade
//!
//! The single source of truth for frame index, frames-in-flight count, and
//! command queue selection. Application code talks to [`Renderer`]; the
//! concrete [`RenderBackend`](crate::render::RenderBackend) only ever sees
//! replayed closures on the executing thread.
//!
//! `Renderer` is a cheap clonable handle around one owned state block; there
//! are no process-wide statics, so tests can run several renderers side by
//! side. One clone typically lives on the simulation thread (submitting) and
//! one inside the [`RenderThread`](crate::render::RenderThread) loop
//! (draining); in the single-threaded configuration the same clone does both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::core::config::RendererConfig;
use crate::render::backend::{PipelineHandle, RenderBackend};
use crate::render::command_queue::{CommandQueue, RenderCommand};
use crate::render::release_queue::{ReleaseCommand, ReleaseQueues};
use crate::render::RenderError;

/// Objects that must be re-invalidated when their shader is hot-reloaded
///
/// Implemented by materials and pipelines; invalidation must be idempotent
/// because the registry delivers at-least-once notifications.
pub trait ShaderReloadListener: Send + Sync {
    /// Drop any state derived from the old shader binary
    fn on_shader_reloaded(&self);
}

// Carries a deletion closure through the render queue. Pushing happens in
// Drop, so the free reaches the release queues whether the wrapper command
// is replayed normally or discarded by a shutdown queue clear.
struct DeferredFree {
    release: ReleaseQueues,
    command: Option<ReleaseCommand>,
}

impl Drop for DeferredFree {
    fn drop(&mut self) {
        if let Some(command) = self.command.take() {
            self.release.push_current(command);
        }
    }
}

struct RendererState {
    frames_in_flight: u32,
    // Double-buffered command queues: `submission_index` selects the queue
    // currently accepting submits; the other one is being (or about to be)
    // drained by the executing thread.
    queues: [Mutex<CommandQueue>; 2],
    submission_index: AtomicUsize,
    frame_index: AtomicU32,
    draw_calls: AtomicU32,
    release: ReleaseQueues,
    backend: Mutex<Box<dyn RenderBackend>>,
    shader_deps: Mutex<HashMap<u64, Vec<Weak<dyn ShaderReloadListener>>>>,
}

/// Process entry point for all rendering
#[derive(Clone)]
pub struct Renderer {
    state: Arc<RendererState>,
}

impl Renderer {
    /// Create a renderer over the given backend.
    ///
    /// `release` must be the same queue set handed to the backend's resource
    /// constructors; the facade advances its current slot in lockstep with
    /// the frame index.
    pub fn new(
        config: &RendererConfig,
        backend: Box<dyn RenderBackend>,
        release: ReleaseQueues,
    ) -> Result<Self, RenderError> {
        config
            .validate()
            .map_err(|e| RenderError::InitializationFailed(e.to_string()))?;
        if backend.frames_in_flight() != config.frames_in_flight {
            return Err(RenderError::InitializationFailed(format!(
                "backend built for {} frames in flight, config requests {}",
                backend.frames_in_flight(),
                config.frames_in_flight
            )));
        }
        if release.frames_in_flight() != config.frames_in_flight {
            return Err(RenderError::InitializationFailed(format!(
                "release queues sized for {} frames in flight, config requests {}",
                release.frames_in_flight(),
                config.frames_in_flight
            )));
        }

        log::info!(
            "renderer initialized ({} frames in flight)",
            config.frames_in_flight
        );

        Ok(Self {
            state: Arc::new(RendererState {
                frames_in_flight: config.frames_in_flight,
                queues: [
                    Mutex::new(CommandQueue::with_capacity(1024)),
                    Mutex::new(CommandQueue::with_capacity(1024)),
                ],
                submission_index: AtomicUsize::new(0),
                frame_index: AtomicU32::new(0),
                draw_calls: AtomicU32::new(0),
                release,
                backend: Mutex::new(backend),
                shader_deps: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Number of frames in flight, fixed at construction
    pub fn frames_in_flight(&self) -> u32 {
        self.state.frames_in_flight
    }

    /// The frame-in-flight index for the frame currently being recorded.
    ///
    /// Stable between `begin_frame` and `end_frame`; every per-frame
    /// resource access in this frame must use this value.
    pub fn current_frame_index(&self) -> u32 {
        self.state.frame_index.load(Ordering::Acquire)
    }

    /// Draw calls recorded since the last `begin_frame`
    pub fn draw_call_count(&self) -> u32 {
        self.state.draw_calls.load(Ordering::Acquire)
    }

    /// Schedule a closure to run on the executing thread.
    ///
    /// Fire and forget: the closure runs during the next
    /// [`wait_and_render`](Self::wait_and_render) cycle, in submission order
    /// relative to other commands of the same frame. Captured state is moved
    /// in; shared GPU resources are captured as `Arc` clones, which keeps
    /// them alive until the command has executed.
    pub fn submit(&self, command: impl FnOnce(&mut dyn RenderBackend) + Send + 'static) {
        self.push_command(Box::new(command));
    }

    // The drain flips `submission_index` while holding the drained queue's
    // lock, so the index must be re-read after taking the lock: an unchanged
    // index proves this queue is still the write queue, while a changed one
    // means the queue we hold was just taken and the command belongs in the
    // other queue.
    fn push_command(&self, command: RenderCommand) {
        loop {
            let index = self.state.submission_index.load(Ordering::Acquire);
            let mut queue = self.state.queues[index]
                .lock()
                .expect("command queue poisoned");
            if self.state.submission_index.load(Ordering::Acquire) == index {
                queue.push(command);
                return;
            }
        }
    }

    /// Schedule a deletion closure, keyed to the frame slot being executed.
    ///
    /// The closure is routed through the render queue so it lands in the
    /// release slot of the frame whose commands are replaying, *after* that
    /// slot's drain has already run; it then fires when the same frame index
    /// is revisited after a full frames-in-flight cycle, at which point the
    /// GPU is guaranteed to be done with every frame that could have
    /// referenced the resource.
    pub fn submit_resource_free(&self, command: ReleaseCommand) {
        let deferred = DeferredFree {
            release: self.state.release.clone(),
            command: Some(command),
        };
        self.submit(move |_backend| drop(deferred));
    }

    /// Shared deletion queues, for wiring up resource constructors
    pub fn release_queues(&self) -> &ReleaseQueues {
        &self.state.release
    }

    /// Open the frame: resets the draw-call counter and schedules the
    /// backend frame start (fence wait, image acquire, descriptor pool
    /// reset) followed by the deferred-free drain for the reused slot.
    pub fn begin_frame(&self) {
        self.state.draw_calls.store(0, Ordering::Release);
        let frame = self.current_frame_index();
        let release = self.state.release.clone();
        self.submit(move |backend| {
            if let Err(err) = backend.begin_frame(frame) {
                log::error!("failed to begin frame slot {frame}: {err}");
                return;
            }
            // The fence wait inside begin_frame proves the GPU is done with
            // this slot, so its deferred frees are now safe to run.
            release.drain_slot(frame);
        });
    }

    /// Close the frame: schedules submit + present, then advances the frame
    /// index. The new index applies to all submissions that follow.
    ///
    /// The release queues' current slot advances inside the replayed
    /// closure, so deferred frees key to the frame the executing thread is
    /// actually in, not the one being recorded.
    pub fn end_frame(&self) {
        let next = (self.current_frame_index() + 1) % self.state.frames_in_flight;
        let release = self.state.release.clone();
        self.submit(move |backend| {
            if let Err(err) = backend.end_frame() {
                log::error!("failed to end frame: {err}");
            }
            release.set_current(next);
        });
        self.state.frame_index.store(next, Ordering::Release);
    }

    /// Drain point: replays every command of the previous frame in FIFO
    /// order on the calling thread.
    ///
    /// Must be called exactly once per frame, on the executing thread.
    /// Submissions made while the drain is in progress (including from
    /// inside replayed commands) land in the other queue and are not visible
    /// to this drain. Never call this from inside a render command.
    pub fn wait_and_render(&self) {
        let batch = {
            let drain = self.state.submission_index.load(Ordering::Acquire);
            let mut queue = self.state.queues[drain]
                .lock()
                .expect("command queue poisoned");
            // Flip while holding the drained queue's lock so a concurrent
            // submit either made it into this batch or goes to the other
            // queue.
            self.state
                .submission_index
                .store(drain ^ 1, Ordering::Release);
            queue.take()
        };

        let mut backend = self.state.backend.lock().expect("backend poisoned");
        for command in batch {
            command(&mut **backend);
        }
    }

    // Convenience submissions mirroring the backend's draw interface.

    /// Submit a render pass begin with the given clear color
    pub fn begin_render_pass(&self, clear_color: [f32; 4]) {
        self.submit(move |backend| {
            if let Err(err) = backend.begin_render_pass(clear_color) {
                log::error!("begin_render_pass failed: {err}");
            }
        });
    }

    /// Submit a render pass end
    pub fn end_render_pass(&self) {
        self.submit(|backend| {
            if let Err(err) = backend.end_render_pass() {
                log::error!("end_render_pass failed: {err}");
            }
        });
    }

    /// Submit a pipeline bind
    pub fn bind_pipeline(&self, pipeline: PipelineHandle) {
        self.submit(move |backend| {
            if let Err(err) = backend.bind_pipeline(pipeline) {
                log::error!("bind_pipeline failed: {err}");
            }
        });
    }

    /// Submit an indexed draw and count it toward the frame's statistics
    pub fn draw_indexed(&self, index_count: u32, instance_count: u32) {
        self.state.draw_calls.fetch_add(1, Ordering::AcqRel);
        self.submit(move |backend| {
            if let Err(err) = backend.draw_indexed(index_count, instance_count, 0, 0, 0) {
                log::error!("draw_indexed failed: {err}");
            }
        });
    }

    /// Submit a synchronous one-shot compute dispatch.
    ///
    /// The dispatch blocks the executing thread on a fence during replay;
    /// intended for ad-hoc work, not per-frame compute.
    pub fn dispatch_compute(&self, pipeline: PipelineHandle, groups: [u32; 3]) {
        self.submit(move |backend| {
            if let Err(err) = backend.dispatch_compute(pipeline, groups) {
                log::error!("compute dispatch failed: {err}");
            }
        });
    }

    /// Submit a swap-chain recreation for a new window extent
    pub fn resize(&self, width: u32, height: u32) {
        self.submit(move |backend| {
            if let Err(err) = backend.recreate_swapchain(width, height) {
                log::error!("swapchain recreation to {width}x{height} failed: {err}");
            }
        });
    }

    /// Register an object to be invalidated when `shader_hash` reloads
    pub fn register_shader_dependency<T>(&self, shader_hash: u64, dependent: &Arc<T>)
    where
        T: ShaderReloadListener + 'static,
    {
        let weak = Arc::downgrade(&(Arc::clone(dependent) as Arc<dyn ShaderReloadListener>));
        self.state
            .shader_deps
            .lock()
            .expect("shader registry poisoned")
            .entry(shader_hash)
            .or_default()
            .push(weak);
    }

    /// Invalidate everything depending on a reloaded shader.
    ///
    /// At-least-once delivery; listeners must tolerate repeated calls. Dead
    /// registrations are pruned as a side effect.
    pub fn on_shader_reloaded(&self, shader_hash: u64) {
        let listeners: Vec<Arc<dyn ShaderReloadListener>> = {
            let mut deps = self
                .state
                .shader_deps
                .lock()
                .expect("shader registry poisoned");
            match deps.get_mut(&shader_hash) {
                Some(entries) => {
                    entries.retain(|weak| weak.strong_count() > 0);
                    entries.iter().filter_map(Weak::upgrade).collect()
                }
                None => Vec::new(),
            }
        };
        if !listeners.is_empty() {
            log::debug!(
                "shader {shader_hash:#x} reloaded, invalidating {} dependents",
                listeners.len()
            );
        }
        for listener in listeners {
            listener.on_shader_reloaded();
        }
    }

    /// Flush all pending work and run every deferred free.
    ///
    /// Pending commands are dropped, not executed; dropping them releases
    /// their captured resources, which enqueue their own frees before the
    /// final drain.
    pub fn shutdown(&self) {
        log::info!("renderer shutting down");
        let backend = self.state.backend.lock().expect("backend poisoned");
        for queue in &self.state.queues {
            queue.lock().expect("command queue poisoned").clear();
        }
        if let Err(err) = backend.wait_idle() {
            log::error!("wait_idle during shutdown failed: {err}");
        }
        self.state.release.drain_all();
    }
}

impl Drop for RendererState {
    fn drop(&mut self) {
        // Last handle gone: same sequence as shutdown, lock-free via
        // exclusive access. Safe to run after an explicit shutdown (both
        // steps are idempotent on empty queues).
        for queue in &mut self.queues {
            if let Ok(queue) = queue.get_mut() {
                queue.clear();
            }
        }
        if let Ok(backend) = self.backend.get_mut() {
            if let Err(err) = backend.wait_idle() {
                log::error!("wait_idle during renderer drop failed: {err}");
            }
        }
        self.release.drain_all();
    }
}
