//! Per-frame buffer sets
//!
//! A uniform or storage buffer that the CPU writes every frame needs one
//! replica per frame in flight, otherwise frame N+1's write would race the
//! GPU still reading frame N's data. A buffer set owns that replication:
//! logically one buffer per (descriptor set, binding) slot, physically
//! `frames_in_flight` replicas, selected by the frame index at bind time.
//!
//! The container is generic over the buffer type so the frame/set/binding
//! bookkeeping can be tested without a GPU; the Vulkan backend instantiates
//! it with its own buffer wrappers.

use std::collections::HashMap;

/// Frame-replicated buffers addressed by (set, binding)
pub struct BufferSet<B> {
    frames_in_flight: u32,
    // (set, binding) -> one replica per frame in flight
    buffers: HashMap<(u32, u32), Vec<B>>,
}

impl<B> BufferSet<B> {
    /// Create an empty set for the given replication factor
    pub fn new(frames_in_flight: u32) -> Self {
        assert!(frames_in_flight > 0, "frames_in_flight must be at least 1");
        Self {
            frames_in_flight,
            buffers: HashMap::new(),
        }
    }

    /// Replication factor
    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Create the replicas for a slot by calling `create` once per frame.
    ///
    /// Replaces any buffers previously registered at this slot; the old
    /// replicas drop (and defer their GPU frees) here.
    pub fn create_with(
        &mut self,
        set: u32,
        binding: u32,
        mut create: impl FnMut(u32) -> B,
    ) {
        let replicas = (0..self.frames_in_flight).map(&mut create).collect();
        if self.buffers.insert((set, binding), replicas).is_some() {
            log::debug!("replaced buffer replicas at set {set}, binding {binding}");
        }
    }

    /// Register pre-built replicas for a slot.
    ///
    /// `replicas.len()` must equal the replication factor.
    pub fn insert(&mut self, set: u32, binding: u32, replicas: Vec<B>) {
        assert_eq!(
            replicas.len(),
            self.frames_in_flight as usize,
            "buffer set requires one replica per frame in flight"
        );
        self.buffers.insert((set, binding), replicas);
    }

    /// The replica for one frame of a slot.
    ///
    /// A missing slot is a content problem (shader declared a buffer nothing
    /// created), so it logs a warning and returns `None` rather than
    /// panicking mid-frame.
    pub fn get(&self, binding: u32, set: u32, frame: u32) -> Option<&B> {
        debug_assert!(frame < self.frames_in_flight);
        match self.buffers.get(&(set, binding)) {
            Some(replicas) => replicas.get(frame as usize),
            None => {
                log::warn!("no buffer registered at set {set}, binding {binding}");
                None
            }
        }
    }

    /// Mutable access to one frame's replica, for per-frame CPU writes
    pub fn get_mut(&mut self, binding: u32, set: u32, frame: u32) -> Option<&mut B> {
        debug_assert!(frame < self.frames_in_flight);
        self.buffers
            .get_mut(&(set, binding))
            .and_then(|replicas| replicas.get_mut(frame as usize))
    }

    /// Whether a slot has been populated
    pub fn contains(&self, set: u32, binding: u32) -> bool {
        self.buffers.contains_key(&(set, binding))
    }

    /// Iterate all populated (set, binding) slots
    pub fn slots(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.buffers.keys().copied()
    }
}

/// Frame-replicated uniform buffers
pub struct UniformBufferSet<B> {
    inner: BufferSet<B>,
}

impl<B> UniformBufferSet<B> {
    /// Create an empty uniform buffer set
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            inner: BufferSet::new(frames_in_flight),
        }
    }

    /// Create replicas for a (set, binding) slot
    pub fn create_with(&mut self, set: u32, binding: u32, create: impl FnMut(u32) -> B) {
        self.inner.create_with(set, binding, create);
    }

    /// The replica to bind for this frame
    pub fn get(&self, binding: u32, set: u32, frame: u32) -> Option<&B> {
        self.inner.get(binding, set, frame)
    }

    /// The replica to write this frame's data into
    pub fn get_mut(&mut self, binding: u32, set: u32, frame: u32) -> Option<&mut B> {
        self.inner.get_mut(binding, set, frame)
    }

    /// Replication factor
    pub fn frames_in_flight(&self) -> u32 {
        self.inner.frames_in_flight()
    }
}

/// Frame-replicated storage buffers
///
/// Same bookkeeping as [`UniformBufferSet`]; kept as a distinct type because
/// the two kinds bind through different descriptor types and are never
/// interchangeable at a binding point.
pub struct StorageBufferSet<B> {
    inner: BufferSet<B>,
}

impl<B> StorageBufferSet<B> {
    /// Create an empty storage buffer set
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            inner: BufferSet::new(frames_in_flight),
        }
    }

    /// Create replicas for a (set, binding) slot
    pub fn create_with(&mut self, set: u32, binding: u32, create: impl FnMut(u32) -> B) {
        self.inner.create_with(set, binding, create);
    }

    /// The replica to bind for this frame
    pub fn get(&self, binding: u32, set: u32, frame: u32) -> Option<&B> {
        self.inner.get(binding, set, frame)
    }

    /// The replica to write this frame's data into
    pub fn get_mut(&mut self, binding: u32, set: u32, frame: u32) -> Option<&mut B> {
        self.inner.get_mut(binding, set, frame)
    }

    /// Replication factor
    pub fn frames_in_flight(&self) -> u32 {
        self.inner.frames_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeBuffer {
        frame: u32,
        contents: u32,
    }

    #[test]
    fn creates_one_replica_per_frame() {
        let mut set = UniformBufferSet::new(3);
        set.create_with(0, 2, |frame| FakeBuffer { frame, contents: 0 });

        for frame in 0..3 {
            let buffer = set.get(2, 0, frame).unwrap();
            assert_eq!(buffer.frame, frame);
        }
    }

    #[test]
    fn replicas_are_independent_across_frames() {
        let mut set = UniformBufferSet::new(2);
        set.create_with(0, 0, |frame| FakeBuffer { frame, contents: 0 });

        set.get_mut(0, 0, 0).unwrap().contents = 42;

        assert_eq!(set.get(0, 0, 0).unwrap().contents, 42);
        assert_eq!(set.get(0, 0, 1).unwrap().contents, 0);
    }

    #[test]
    fn missing_slot_returns_none() {
        let set: UniformBufferSet<FakeBuffer> = UniformBufferSet::new(2);
        assert!(set.get(5, 1, 0).is_none());
    }

    #[test]
    fn slots_are_keyed_by_set_and_binding() {
        let mut buffers = BufferSet::new(2);
        buffers.create_with(0, 1, |frame| FakeBuffer { frame, contents: 1 });
        buffers.create_with(1, 1, |frame| FakeBuffer { frame, contents: 2 });

        assert_eq!(buffers.get(1, 0, 0).unwrap().contents, 1);
        assert_eq!(buffers.get(1, 1, 0).unwrap().contents, 2);
        assert!(!buffers.contains(2, 1));
    }

    #[test]
    #[should_panic(expected = "one replica per frame")]
    fn insert_rejects_wrong_replica_count() {
        let mut buffers = BufferSet::new(3);
        buffers.insert(0, 0, vec![FakeBuffer { frame: 0, contents: 0 }]);
    }
}
