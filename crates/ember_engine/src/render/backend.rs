//! Backend abstraction for the rendering system
//!
//! [`RenderBackend`] is the seam between the deferred-execution core and a
//! concrete graphics API. Exactly one backend is maintained (Vulkan); the
//! trait exists so the submission machinery can be exercised against a mock
//! in tests, and so a second backend can be added without touching the
//! command queue or release queue code.

use crate::render::RenderError;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, RenderError>;

/// Opaque handle to a backend-owned pipeline object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

/// Interface every rendering backend must implement
///
/// All methods are called from the executing thread, from inside replayed
/// render commands or the frame-boundary path; the trait is `Send` so the
/// backend can be moved behind the render thread. Methods that record into
/// the current command buffer (`begin_render_pass` through `draw_indexed`)
/// are only valid between `begin_frame` and `end_frame`.
pub trait RenderBackend: Send {
    /// Number of frames in flight this backend was built for
    fn frames_in_flight(&self) -> u32;

    /// Start a frame for the given frame-in-flight slot.
    ///
    /// Blocks on the slot's fence until the GPU has finished the previous
    /// use of this slot, acquires the next presentable image, and resets the
    /// slot's descriptor pool (invalidating every set allocated from it last
    /// cycle).
    fn begin_frame(&mut self, frame_index: u32) -> BackendResult<()>;

    /// Finish the frame: submit the recorded command buffer and present.
    ///
    /// An out-of-date swap chain is handled internally by recreating it; it
    /// is not an error.
    fn end_frame(&mut self) -> BackendResult<()>;

    /// Begin the swap-chain render pass, clearing to the given color
    fn begin_render_pass(&mut self, clear_color: [f32; 4]) -> BackendResult<()>;

    /// End the current render pass
    fn end_render_pass(&mut self) -> BackendResult<()>;

    /// Bind a previously registered pipeline.
    ///
    /// An unknown handle logs a warning and leaves the previous pipeline
    /// bound; pipelines are data-driven content, not programmer error.
    fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> BackendResult<()>;

    /// Record an indexed draw with the currently bound pipeline
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> BackendResult<()>;

    /// Run a one-shot compute dispatch synchronously.
    ///
    /// Records the dispatch into a transient command buffer, submits it with
    /// a fence, and blocks until the GPU completes. Simplicity over
    /// throughput: this path exists for ad-hoc work (e.g. lookup-table
    /// generation), not per-frame compute.
    fn dispatch_compute(&mut self, pipeline: PipelineHandle, groups: [u32; 3]) -> BackendResult<()>;

    /// Recreate the swap chain for a new surface extent.
    ///
    /// Fully recreates images, depth attachment, framebuffers, and command
    /// buffers; every object dependent on the old extent is destroyed first.
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()>;

    /// Block until the GPU has finished all submitted work
    fn wait_idle(&self) -> BackendResult<()>;

    /// Current swap-chain extent (width, height)
    fn swapchain_extent(&self) -> (u32, u32);
}

#[cfg(test)]
pub(crate) mod mock {
    //! A counting backend for exercising the submission core without a GPU.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// Counters shared between the test and the backend it handed off
    #[derive(Default)]
    pub struct MockCounters {
        pub frames_begun: AtomicU32,
        pub frames_ended: AtomicU32,
        pub passes_begun: AtomicU32,
        pub passes_ended: AtomicU32,
        pub draws: AtomicU32,
        pub dispatches: AtomicU32,
        pub swapchain_creates: AtomicU32,
        pub swapchain_destroys: AtomicU32,
        pub last_frame_index: AtomicU32,
    }

    pub struct MockBackend {
        pub counters: Arc<MockCounters>,
        frames_in_flight: u32,
        extent: (u32, u32),
        fail_next_begin: Arc<AtomicBool>,
        frame_active: bool,
    }

    impl MockBackend {
        pub fn new(frames_in_flight: u32) -> Self {
            let backend = Self {
                counters: Arc::new(MockCounters::default()),
                frames_in_flight,
                extent: (1280, 720),
                fail_next_begin: Arc::new(AtomicBool::new(false)),
                frame_active: false,
            };
            // The initial swap chain counts as one create.
            backend.counters.swapchain_creates.store(1, Ordering::SeqCst);
            backend
        }

        pub fn counters(&self) -> Arc<MockCounters> {
            Arc::clone(&self.counters)
        }

        /// Arm a one-shot `begin_frame` failure (e.g. a lost surface)
        pub fn failure_switch(&self) -> Arc<AtomicBool> {
            Arc::clone(&self.fail_next_begin)
        }
    }

    impl RenderBackend for MockBackend {
        fn frames_in_flight(&self) -> u32 {
            self.frames_in_flight
        }

        fn begin_frame(&mut self, frame_index: u32) -> BackendResult<()> {
            assert!(frame_index < self.frames_in_flight);
            self.frame_active = false;
            if self.fail_next_begin.swap(false, Ordering::SeqCst) {
                return Err(RenderError::Backend("synthetic begin failure".into()));
            }
            self.counters.last_frame_index.store(frame_index, Ordering::SeqCst);
            self.counters.frames_begun.fetch_add(1, Ordering::SeqCst);
            self.frame_active = true;
            Ok(())
        }

        fn end_frame(&mut self) -> BackendResult<()> {
            // Same contract as the real backend: recording and presenting
            // are no-ops while no frame is open.
            if !self.frame_active {
                return Ok(());
            }
            self.frame_active = false;
            self.counters.frames_ended.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn begin_render_pass(&mut self, _clear_color: [f32; 4]) -> BackendResult<()> {
            if !self.frame_active {
                return Ok(());
            }
            self.counters.passes_begun.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn end_render_pass(&mut self) -> BackendResult<()> {
            if !self.frame_active {
                return Ok(());
            }
            self.counters.passes_ended.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn bind_pipeline(&mut self, _pipeline: PipelineHandle) -> BackendResult<()> {
            Ok(())
        }

        fn draw_indexed(
            &mut self,
            _index_count: u32,
            _instance_count: u32,
            _first_index: u32,
            _vertex_offset: i32,
            _first_instance: u32,
        ) -> BackendResult<()> {
            if !self.frame_active {
                return Ok(());
            }
            self.counters.draws.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn dispatch_compute(
            &mut self,
            _pipeline: PipelineHandle,
            _groups: [u32; 3],
        ) -> BackendResult<()> {
            self.counters.dispatches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
            self.counters.swapchain_destroys.fetch_add(1, Ordering::SeqCst);
            self.counters.swapchain_creates.fetch_add(1, Ordering::SeqCst);
            self.extent = (width, height);
            Ok(())
        }

        fn wait_idle(&self) -> BackendResult<()> {
            Ok(())
        }

        fn swapchain_extent(&self) -> (u32, u32) {
            self.extent
        }
    }
}
