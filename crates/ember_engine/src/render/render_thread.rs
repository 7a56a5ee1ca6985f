//! Dedicated render thread
//!
//! Owns the pump loop that calls [`Renderer::wait_and_render`] once per kick.
//! The simulation thread drives it with a two-phase handshake: `kick` wakes
//! the thread for one drain cycle, `block_until_idle` waits for that cycle to
//! finish. Splitting the two lets the simulation overlap building frame N+1
//! with the render thread executing frame N.
//!
//! The renderer also works without this thread: calling `wait_and_render`
//! directly on the main loop gives the single-threaded configuration.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::render::renderer::Renderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    /// Waiting for work
    Idle,
    /// A drain cycle has been requested
    Kicked,
    /// The loop should exit after any in-progress cycle
    Terminating,
}

struct Shared {
    state: Mutex<ThreadState>,
    condvar: Condvar,
}

/// Handle to the dedicated executor thread
///
/// Joining happens in `Drop`, so letting the handle fall out of scope shuts
/// the thread down cleanly.
pub struct RenderThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Spawn the executor thread over a clone of the renderer
    pub fn spawn(renderer: Renderer) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ThreadState::Idle),
            condvar: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("render".into())
            .spawn(move || render_loop(&renderer, &thread_shared))
            .expect("failed to spawn render thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Request one drain cycle.
    ///
    /// Returns immediately; pair with [`block_until_idle`](Self::block_until_idle)
    /// at the point the simulation must not run ahead of rendering.
    pub fn kick(&self) {
        let mut state = self.shared.state.lock().expect("render thread poisoned");
        if *state == ThreadState::Idle {
            *state = ThreadState::Kicked;
            self.shared.condvar.notify_one();
        }
    }

    /// Block until the thread has finished its current cycle and gone idle
    pub fn block_until_idle(&self) {
        let mut state = self.shared.state.lock().expect("render thread poisoned");
        while *state == ThreadState::Kicked {
            state = self
                .shared
                .condvar
                .wait(state)
                .expect("render thread poisoned");
        }
    }

    /// Ask the loop to exit and join the thread
    pub fn terminate(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("render thread poisoned");
            *state = ThreadState::Terminating;
            self.shared.condvar.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("render thread panicked");
            }
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn render_loop(renderer: &Renderer, shared: &Shared) {
    log::debug!("render thread started");
    loop {
        {
            let mut state = shared.state.lock().expect("render thread poisoned");
            loop {
                match *state {
                    ThreadState::Kicked => break,
                    ThreadState::Terminating => {
                        log::debug!("render thread exiting");
                        return;
                    }
                    ThreadState::Idle => {
                        state = shared.condvar.wait(state).expect("render thread poisoned");
                    }
                }
            }
        }

        renderer.wait_and_render();

        let mut state = shared.state.lock().expect("render thread poisoned");
        if *state == ThreadState::Kicked {
            *state = ThreadState::Idle;
        }
        shared.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RendererConfig;
    use crate::render::backend::mock::MockBackend;
    use crate::render::release_queue::ReleaseQueues;
    use std::sync::atomic::Ordering;

    fn test_renderer() -> (Renderer, Arc<crate::render::backend::mock::MockCounters>) {
        let config = RendererConfig {
            frames_in_flight: 2,
            ..RendererConfig::default()
        };
        let backend = MockBackend::new(2);
        let counters = backend.counters();
        let release = ReleaseQueues::new(2);
        let renderer = Renderer::new(&config, Box::new(backend), release).unwrap();
        (renderer, counters)
    }

    #[test]
    fn kick_executes_submitted_commands_on_the_thread() {
        let (renderer, counters) = test_renderer();
        let mut thread = RenderThread::spawn(renderer.clone());

        renderer.begin_render_pass([0.0; 4]);
        renderer.draw_indexed(6, 1);
        renderer.end_render_pass();

        thread.kick();
        thread.block_until_idle();

        assert_eq!(counters.passes_begun.load(Ordering::SeqCst), 1);
        assert_eq!(counters.draws.load(Ordering::SeqCst), 1);
        assert_eq!(counters.passes_ended.load(Ordering::SeqCst), 1);

        thread.terminate();
    }

    #[test]
    fn commands_run_on_the_render_thread_not_the_caller() {
        let (renderer, _counters) = test_renderer();
        let thread = RenderThread::spawn(renderer.clone());

        let main_thread = std::thread::current().id();
        let (sender, receiver) = std::sync::mpsc::channel();
        renderer.submit(move |_backend| {
            let _ = sender.send(std::thread::current().id());
        });

        thread.kick();
        thread.block_until_idle();

        let executed_on = receiver.recv().expect("command never ran");
        assert_ne!(executed_on, main_thread);
    }

    #[test]
    fn multiple_kicks_pump_successive_frames() {
        let (renderer, counters) = test_renderer();
        let thread = RenderThread::spawn(renderer.clone());

        for _ in 0..4 {
            renderer.begin_frame();
            renderer.end_frame();
            thread.kick();
            thread.block_until_idle();
        }

        assert_eq!(counters.frames_begun.load(Ordering::SeqCst), 4);
        assert_eq!(counters.frames_ended.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn terminate_is_idempotent() {
        let (renderer, _) = test_renderer();
        let mut thread = RenderThread::spawn(renderer);
        thread.terminate();
        thread.terminate();
    }
}
