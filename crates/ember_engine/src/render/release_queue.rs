//! Deferred GPU resource destruction
//!
//! Destroying a GPU object the moment its last owner drops it is unsound
//! while a previously submitted frame may still be executing on the GPU.
//! Instead, resource wrappers push a deletion closure into the release queue
//! slot for the *current* frame-in-flight index. That slot is only drained
//! when the same frame index comes around again — after the swap chain has
//! waited on the slot's fence — which guarantees the GPU has finished every
//! command buffer that could reference the resource.
//!
//! With `frames_in_flight = 2`: a resource freed while frame index 0 is
//! being recorded survives all of frame 1 and is destroyed at the start of
//! the next frame 0.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// A deferred deletion closure
///
/// Frees capture the raw native handles (and a device clone) they need; they
/// never touch the backend and cannot fail.
pub type ReleaseCommand = Box<dyn FnOnce() + Send>;

struct ReleaseInner {
    slots: Vec<Mutex<Vec<ReleaseCommand>>>,
    // The frame slot frees currently key to. Advanced on the executing
    // thread as part of frame-end replay, so Drop impls on any thread key
    // frees to the frame actually in flight, not the one being recorded.
    current: AtomicU32,
}

/// The per-frame-in-flight deletion queues
///
/// Cheaply clonable (shared state); the facade owns the authoritative copy
/// and resource wrappers hold [`ReleaseHandle`]s.
#[derive(Clone)]
pub struct ReleaseQueues {
    inner: Arc<ReleaseInner>,
}

impl ReleaseQueues {
    /// Create one queue slot per frame in flight
    pub fn new(frames_in_flight: u32) -> Self {
        assert!(frames_in_flight > 0, "frames_in_flight must be at least 1");
        let slots = (0..frames_in_flight)
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Self {
            inner: Arc::new(ReleaseInner {
                slots,
                current: AtomicU32::new(0),
            }),
        }
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> u32 {
        self.inner.slots.len() as u32
    }

    /// A handle resource wrappers can store to enqueue deferred frees
    pub fn handle(&self) -> ReleaseHandle {
        ReleaseHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Enqueue a deletion closure in the current frame's slot
    pub fn push_current(&self, command: ReleaseCommand) {
        let frame = self.inner.current.load(Ordering::Acquire);
        self.push_slot(frame, command);
    }

    /// Enqueue a deletion closure in a specific frame slot
    pub fn push_slot(&self, frame_index: u32, command: ReleaseCommand) {
        let slot = &self.inner.slots[frame_index as usize];
        slot.lock().expect("release queue poisoned").push(command);
    }

    /// Advance the slot that `push_current` targets.
    ///
    /// Called by the facade in lockstep with the renderer frame index.
    pub fn set_current(&self, frame_index: u32) {
        debug_assert!((frame_index as usize) < self.inner.slots.len());
        self.inner.current.store(frame_index, Ordering::Release);
    }

    /// Run and clear every deletion closure queued for the given slot.
    ///
    /// Must only be called once the GPU is known to be done with that slot
    /// (after the swap-chain fence wait on revisit, or after `wait_idle`).
    pub fn drain_slot(&self, frame_index: u32) {
        let commands = {
            let slot = &self.inner.slots[frame_index as usize];
            std::mem::take(&mut *slot.lock().expect("release queue poisoned"))
        };
        if !commands.is_empty() {
            log::trace!(
                "releasing {} deferred resources for frame slot {}",
                commands.len(),
                frame_index
            );
        }
        for command in commands {
            command();
        }
    }

    /// Drain every slot. Shutdown-only; requires the device to be idle.
    pub fn drain_all(&self) {
        for frame in 0..self.frames_in_flight() {
            self.drain_slot(frame);
        }
    }

    /// Number of pending deletions in a slot (for tests and stats)
    pub fn pending(&self, frame_index: u32) -> usize {
        self.inner.slots[frame_index as usize]
            .lock()
            .expect("release queue poisoned")
            .len()
    }
}

/// Write-only handle to the release queues
///
/// Held by GPU resource wrappers so their `Drop` impls can route native
/// handle destruction through the deferred path.
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<ReleaseInner>,
}

impl ReleaseHandle {
    /// Enqueue a deletion closure in the current frame's slot
    pub fn free(&self, command: ReleaseCommand) {
        let frame = self.inner.current.load(Ordering::Acquire);
        self.inner.slots[frame as usize]
            .lock()
            .expect("release queue poisoned")
            .push(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_command(counter: &Arc<AtomicUsize>) -> ReleaseCommand {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn free_lands_in_current_slot() {
        let queues = ReleaseQueues::new(2);
        let freed = Arc::new(AtomicUsize::new(0));

        queues.set_current(1);
        queues.handle().free(counting_command(&freed));

        assert_eq!(queues.pending(0), 0);
        assert_eq!(queues.pending(1), 1);
    }

    #[test]
    fn drain_runs_and_clears_only_that_slot() {
        let queues = ReleaseQueues::new(3);
        let freed = Arc::new(AtomicUsize::new(0));

        queues.push_slot(0, counting_command(&freed));
        queues.push_slot(2, counting_command(&freed));

        queues.drain_slot(0);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert_eq!(queues.pending(0), 0);
        assert_eq!(queues.pending(2), 1);

        // Draining an already-empty slot is a no-op.
        queues.drain_slot(0);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn free_delayed_for_a_full_cycle_with_two_frames() {
        // Simulates the renderer frame loop with frames_in_flight = 2:
        // a free at frame 0 must not run after frame 1, and must run when
        // frame index 0 is revisited.
        let queues = ReleaseQueues::new(2);
        let freed = Arc::new(AtomicUsize::new(0));

        // Frame 0: resource freed mid-frame.
        queues.set_current(0);
        queues.handle().free(counting_command(&freed));

        // Frame 1 begins: its slot is drained on revisit.
        queues.set_current(1);
        queues.drain_slot(1);
        assert_eq!(freed.load(Ordering::SeqCst), 0);

        // Frame 2 (index 0 again): now the free runs.
        queues.set_current(0);
        queues.drain_slot(0);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_all_flushes_every_slot() {
        let queues = ReleaseQueues::new(3);
        let freed = Arc::new(AtomicUsize::new(0));
        for frame in 0..3 {
            queues.push_slot(frame, counting_command(&freed));
        }
        queues.drain_all();
        assert_eq!(freed.load(Ordering::SeqCst), 3);
    }
}
