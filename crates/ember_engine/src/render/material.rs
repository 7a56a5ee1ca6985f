//! Materials
//!
//! A material is a CPU-side parameter block over one shader: a flat byte
//! arena laid out by the shader's [`MaterialLayout`], written by name with
//! typed values, and flushed to per-frame GPU resources on demand.
//!
//! Because descriptor sets and uniform replicas exist once per frame in
//! flight, a single parameter change must be re-applied to every replica.
//! The material tracks that with one dirty flag per frame slot: any change
//! marks all slots dirty; flushing a frame clears only that frame's flag, so
//! the remaining slots still pick the change up when their turn comes.

use std::sync::{Arc, Mutex};

use crate::render::renderer::ShaderReloadListener;
use crate::render::shader::{MaterialLayout, ShaderReflection};

struct MaterialState {
    storage: Vec<u8>,
    dirty_frames: Vec<bool>,
}

/// A shader parameter block with per-frame flush tracking
///
/// All methods take `&self`; state lives behind a mutex so an
/// `Arc<Material>` can be shared with the shader reload registry and across
/// threads.
pub struct Material {
    name: String,
    reflection: Arc<ShaderReflection>,
    layout: MaterialLayout,
    state: Mutex<MaterialState>,
}

impl Material {
    /// Create a material over a shader's reflection data.
    ///
    /// Storage is zero-initialized and every frame slot starts dirty, so the
    /// first flush of each frame uploads the defaults.
    pub fn new(
        name: impl Into<String>,
        reflection: Arc<ShaderReflection>,
        frames_in_flight: u32,
    ) -> Self {
        let layout = reflection.material_layout();
        let storage_size = layout.total_size() as usize;
        Self {
            name: name.into(),
            reflection,
            layout,
            state: Mutex::new(MaterialState {
                storage: vec![0; storage_size],
                dirty_frames: vec![true; frames_in_flight as usize],
            }),
        }
    }

    /// Material name, for logs and tooling
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shader this material parameterizes
    pub fn reflection(&self) -> &Arc<ShaderReflection> {
        &self.reflection
    }

    /// Write a typed value to a named parameter.
    ///
    /// An unknown name or a size mismatch logs a warning and leaves the
    /// storage untouched; material parameters are content, and content
    /// errors must not take the frame down.
    pub fn set<T: bytemuck::Pod>(&self, name: &str, value: T) {
        let Some(member) = self.layout.member(name) else {
            log::warn!(
                "material '{}': shader '{}' has no parameter '{name}'",
                self.name,
                self.reflection.name()
            );
            return;
        };
        let bytes = bytemuck::bytes_of(&value);
        if bytes.len() != member.size as usize {
            log::warn!(
                "material '{}': parameter '{name}' is {} bytes, value is {}",
                self.name,
                member.size,
                bytes.len()
            );
            return;
        }
        let mut state = self.state.lock().expect("material poisoned");
        let start = member.offset as usize;
        state.storage[start..start + bytes.len()].copy_from_slice(bytes);
        for slot in &mut state.dirty_frames {
            *slot = true;
        }
    }

    /// Read a typed value back from a named parameter
    pub fn get<T: bytemuck::Pod>(&self, name: &str) -> Option<T> {
        let member = self.layout.member(name)?;
        if member.size as usize != std::mem::size_of::<T>() {
            return None;
        }
        let state = self.state.lock().expect("material poisoned");
        let start = member.offset as usize;
        Some(bytemuck::pod_read_unaligned(
            &state.storage[start..start + member.size as usize],
        ))
    }

    /// Mark every frame slot as needing a re-upload
    pub fn mark_all_dirty(&self) {
        let mut state = self.state.lock().expect("material poisoned");
        for slot in &mut state.dirty_frames {
            *slot = true;
        }
    }

    /// Whether the given frame slot still needs a flush
    pub fn is_dirty(&self, frame: u32) -> bool {
        let state = self.state.lock().expect("material poisoned");
        state.dirty_frames[frame as usize]
    }

    /// Flush this frame's GPU replica if the slot is dirty.
    ///
    /// `upload` receives the current parameter bytes; it is only invoked when
    /// the slot is dirty, and only that slot's flag is cleared afterwards.
    /// Returns whether an upload happened.
    pub fn update_for_rendering(&self, frame: u32, upload: impl FnOnce(&[u8])) -> bool {
        let mut state = self.state.lock().expect("material poisoned");
        if !state.dirty_frames[frame as usize] {
            return false;
        }
        let MaterialState {
            storage,
            dirty_frames,
        } = &mut *state;
        upload(storage);
        dirty_frames[frame as usize] = false;
        true
    }
}

impl ShaderReloadListener for Material {
    // The old descriptor sets and uploaded values died with the old shader
    // binary; marking every slot dirty forces full re-upload. Repeated
    // notifications just re-set already-set flags.
    fn on_shader_reloaded(&self) {
        log::debug!(
            "material '{}': shader '{}' reloaded, invalidating",
            self.name,
            self.reflection.name()
        );
        self.mark_all_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::shader::{ShaderBufferMember, ShaderStage, ShaderUniformBuffer};

    fn test_reflection() -> Arc<ShaderReflection> {
        let mut reflection = ShaderReflection::new("lit");
        reflection.register_uniform_buffer(
            0,
            ShaderUniformBuffer {
                name: "uMaterial".into(),
                binding: 1,
                size: 32,
                stages: ShaderStage::FRAGMENT,
                members: vec![
                    ShaderBufferMember {
                        name: "albedo".into(),
                        offset: 0,
                        size: 16,
                    },
                    ShaderBufferMember {
                        name: "metallic".into(),
                        offset: 16,
                        size: 4,
                    },
                ],
            },
        );
        Arc::new(reflection)
    }

    #[test]
    fn set_writes_at_the_member_offset() {
        let material = Material::new("bronze", test_reflection(), 2);
        material.set("metallic", 0.75_f32);
        assert_eq!(material.get::<f32>("metallic"), Some(0.75));
        // Neighbouring members are untouched.
        assert_eq!(material.get::<[f32; 4]>("albedo"), Some([0.0; 4]));
    }

    #[test]
    fn unknown_parameter_is_a_logged_no_op() {
        let material = Material::new("bronze", test_reflection(), 2);
        material.set("uNope", 1.0_f32);
        assert_eq!(material.get::<f32>("uNope"), None);
    }

    #[test]
    fn size_mismatch_leaves_storage_untouched() {
        let material = Material::new("bronze", test_reflection(), 2);
        material.set("metallic", 0.5_f32);
        material.set("metallic", [1.0_f32; 4]);
        assert_eq!(material.get::<f32>("metallic"), Some(0.5));
    }

    #[test]
    fn a_change_dirties_every_frame_slot() {
        let material = Material::new("bronze", test_reflection(), 3);
        // Drain the initial dirtiness.
        for frame in 0..3 {
            material.update_for_rendering(frame, |_| {});
        }
        assert!(!material.is_dirty(0));

        material.set("metallic", 1.0_f32);
        for frame in 0..3 {
            assert!(material.is_dirty(frame));
        }
    }

    #[test]
    fn flush_clears_only_that_frame_slot() {
        let material = Material::new("bronze", test_reflection(), 3);
        material.set("metallic", 1.0_f32);

        let uploaded = material.update_for_rendering(1, |bytes| {
            assert_eq!(bytes.len(), 32);
        });
        assert!(uploaded);
        assert!(material.is_dirty(0));
        assert!(!material.is_dirty(1));
        assert!(material.is_dirty(2));

        // A clean slot skips the upload.
        assert!(!material.update_for_rendering(1, |_| panic!("should not upload")));
    }

    #[test]
    fn reload_invalidation_is_idempotent() {
        let material = Material::new("bronze", test_reflection(), 2);
        for frame in 0..2 {
            material.update_for_rendering(frame, |_| {});
        }

        material.on_shader_reloaded();
        material.on_shader_reloaded();

        assert!(material.is_dirty(0));
        assert!(material.is_dirty(1));
        material.update_for_rendering(0, |_| {});
        assert!(!material.is_dirty(0));
        assert!(material.is_dirty(1));
    }
}
