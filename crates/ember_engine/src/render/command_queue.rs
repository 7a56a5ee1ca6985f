//! Render command queue
//!
//! A render command is a boxed closure capturing (by value) everything it
//! needs to perform one GPU-affecting operation later, on the executing
//! thread. The queue itself is a plain FIFO; the double-buffering that lets
//! one queue accumulate while the other drains lives in the
//! [`Renderer`](crate::render::renderer::Renderer) facade, which owns a pair
//! of these.
//!
//! Commands receive exclusive access to the backend when replayed, so a
//! closure can issue any sequence of [`RenderBackend`] calls. Once enqueued a
//! command is immutable until it executes exactly once; the closure type is
//! `FnOnce` precisely so the compiler enforces that.

use crate::render::backend::RenderBackend;

/// A deferred unit of rendering work
pub type RenderCommand = Box<dyn FnOnce(&mut dyn RenderBackend) + Send>;

/// FIFO queue of render commands
///
/// Lifecycle per instance: Idle (empty) → Accumulating (`push` calls) →
/// Draining (`execute`) → Idle. Not internally synchronized; the facade
/// wraps each instance in a mutex and guarantees that one side appends while
/// only the other drains.
pub struct CommandQueue {
    commands: Vec<RenderCommand>,
}

impl CommandQueue {
    /// Create a new empty queue
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Create a queue with pre-allocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    /// Append a command to the queue
    pub fn push(&mut self, command: RenderCommand) {
        self.commands.push(command);
    }

    /// Number of pending commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check whether the queue has no pending commands
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Take all pending commands, leaving the queue empty.
    ///
    /// The facade swaps the batch out under its lock and replays it without
    /// holding the lock, so commands executed mid-drain may submit new work.
    pub fn take(&mut self) -> Vec<RenderCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Execute every pending command in FIFO order, then reset the queue.
    ///
    /// Replay order is load-bearing: "bind pipeline" must run before the
    /// "draw" that was submitted after it.
    pub fn execute(&mut self, backend: &mut dyn RenderBackend) {
        for command in self.commands.drain(..) {
            command(backend);
        }
    }

    /// Drop all pending commands without executing them.
    ///
    /// Shutdown-only path; dropping a command releases the resources it
    /// captured, which may in turn enqueue deferred frees.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::mock::MockBackend;
    use std::sync::{Arc, Mutex};

    #[test]
    fn new_queue_is_empty() {
        let queue = CommandQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn execute_replays_in_fifo_order() {
        let mut queue = CommandQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=16 {
            let log = Arc::clone(&log);
            queue.push(Box::new(move |_backend| {
                log.lock().unwrap().push(i);
            }));
        }
        assert_eq!(queue.len(), 16);

        let mut backend = MockBackend::new(2);
        queue.execute(&mut backend);

        assert!(queue.is_empty());
        assert_eq!(*log.lock().unwrap(), (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn commands_reach_the_backend() {
        let mut queue = CommandQueue::new();
        queue.push(Box::new(|backend| {
            backend.begin_render_pass([0.0; 4]).unwrap();
            backend.draw_indexed(6, 1, 0, 0, 0).unwrap();
            backend.end_render_pass().unwrap();
        }));

        let mut backend = MockBackend::new(2);
        let counters = backend.counters();
        queue.execute(&mut backend);

        use std::sync::atomic::Ordering;
        assert_eq!(counters.passes_begun.load(Ordering::SeqCst), 1);
        assert_eq!(counters.draws.load(Ordering::SeqCst), 1);
        assert_eq!(counters.passes_ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn take_leaves_queue_reusable() {
        let mut queue = CommandQueue::new();
        queue.push(Box::new(|_| {}));
        let batch = queue.take();
        assert_eq!(batch.len(), 1);
        assert!(queue.is_empty());

        queue.push(Box::new(|_| {}));
        assert_eq!(queue.len(), 1);
    }
}
