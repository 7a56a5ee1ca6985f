//! Descriptor set layouts and per-frame descriptor pools
//!
//! Descriptor sets are transient: each frame in flight owns a pool, the
//! pool is reset wholesale at the start of its frame, and every set used in
//! that frame is allocated and written fresh. Pools are created without
//! `FREE_DESCRIPTOR_SET`, so individual sets are never returned; the whole
//! pool reset is the only reclamation path, which keeps allocation a cheap
//! bump and sidesteps per-set lifetime tracking entirely.

use std::collections::HashMap;

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Builder for descriptor set layouts
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Start an empty layout
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a uniform buffer binding
    pub fn with_uniform_buffer(mut self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    /// Add a storage buffer binding
    pub fn with_storage_buffer(mut self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    /// Add a combined image sampler binding
    pub fn with_combined_image_sampler(
        mut self,
        binding: u32,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(count)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    /// Create the layout object
    pub fn build(self, device: Device) -> VulkanResult<DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);

        let layout = unsafe {
            device
                .create_descriptor_set_layout(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(DescriptorSetLayout { device, layout })
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor set layout with RAII cleanup
pub struct DescriptorSetLayout {
    device: Device,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Get the layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

// Generous defaults; content that exhausts these fails allocation loudly
// rather than growing pools mid-frame.
const MAX_SETS_PER_FRAME: u32 = 1024;
const MAX_DESCRIPTORS_PER_TYPE: u32 = 2048;

/// One descriptor pool per frame in flight
pub struct FrameDescriptorPools {
    device: Device,
    pools: Vec<vk::DescriptorPool>,
    allocated: Vec<u32>,
}

impl FrameDescriptorPools {
    /// Create the pools, one per frame slot
    pub fn new(device: Device, frames_in_flight: u32) -> VulkanResult<Self> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: MAX_DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: MAX_DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: MAX_DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: MAX_DESCRIPTORS_PER_TYPE,
            },
        ];

        // No FREE_DESCRIPTOR_SET: sets are reclaimed only by pool reset.
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(MAX_SETS_PER_FRAME)
            .pool_sizes(&pool_sizes);

        let mut pools = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight {
            let pool = unsafe {
                device
                    .create_descriptor_pool(&create_info, None)
                    .map_err(VulkanError::Api)?
            };
            pools.push(pool);
        }

        Ok(Self {
            device,
            allocated: vec![0; frames_in_flight as usize],
            pools,
        })
    }

    /// Reset the given frame's pool, invalidating every set allocated from
    /// it last cycle.
    ///
    /// Only valid after the frame's fence wait; callers re-write their sets
    /// each frame and never hold one across the reset.
    pub fn reset_frame(&mut self, frame: u32) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(
                    self.pools[frame as usize],
                    vk::DescriptorPoolResetFlags::empty(),
                )
                .map_err(VulkanError::Api)?;
        }
        self.allocated[frame as usize] = 0;
        Ok(())
    }

    /// Allocate a set for this frame from this frame's pool only
    pub fn allocate(
        &mut self,
        frame: u32,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pools[frame as usize])
            .set_layouts(&layouts);

        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        self.allocated[frame as usize] += 1;
        Ok(sets[0])
    }

    /// Sets allocated from a frame's pool since its last reset
    pub fn allocated_this_frame(&self, frame: u32) -> u32 {
        self.allocated[frame as usize]
    }
}

impl Drop for FrameDescriptorPools {
    fn drop(&mut self) {
        unsafe {
            for pool in &self.pools {
                self.device.destroy_descriptor_pool(*pool, None);
            }
        }
    }
}

// One cached buffer binding: the per-frame buffer infos outlive the
// transient descriptor sets they get written into.
struct CachedWrite {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    buffer_infos: Vec<vk::DescriptorBufferInfo>,
}

/// Cache of descriptor write parameters, keyed by shader and set index.
///
/// Sets are reallocated from the frame pools every frame, but the buffers
/// behind them change rarely. Registering a binding once records its
/// buffer info for every frame slot; `flush` then rebuilds the
/// `vkUpdateDescriptorSets` call for a freshly allocated set without the
/// caller re-deriving handles, offsets, and ranges each frame. Replacing a
/// buffer patches the affected slot instead of re-registering.
pub struct DescriptorWriteCache {
    frames_in_flight: u32,
    writes: HashMap<(u64, u32), Vec<CachedWrite>>,
}

impl DescriptorWriteCache {
    /// Create an empty cache for the given frame count
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            frames_in_flight,
            writes: HashMap::new(),
        }
    }

    /// Record a buffer binding for every frame slot.
    ///
    /// `infos` holds one buffer info per frame in flight. Registering the
    /// same binding again replaces the previous record (the shader reload
    /// path re-registers everything).
    pub fn register_buffer(
        &mut self,
        shader_hash: u64,
        set: u32,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        infos: Vec<vk::DescriptorBufferInfo>,
    ) -> VulkanResult<()> {
        if infos.len() != self.frames_in_flight as usize {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "binding {binding} registered with {} buffer infos, expected {}",
                    infos.len(),
                    self.frames_in_flight
                ),
            });
        }
        let entries = self.writes.entry((shader_hash, set)).or_default();
        entries.retain(|entry| entry.binding != binding);
        entries.push(CachedWrite {
            binding,
            descriptor_type,
            buffer_infos: infos,
        });
        Ok(())
    }

    /// Replace one frame slot's buffer info for an already registered
    /// binding (buffer replacement after a resize or reupload).
    pub fn patch_buffer(
        &mut self,
        shader_hash: u64,
        set: u32,
        binding: u32,
        frame: u32,
        info: vk::DescriptorBufferInfo,
    ) -> VulkanResult<()> {
        let entry = self
            .writes
            .get_mut(&(shader_hash, set))
            .and_then(|entries| entries.iter_mut().find(|entry| entry.binding == binding))
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("binding {binding} of set {set} was never registered"),
            })?;
        entry.buffer_infos[frame as usize] = info;
        Ok(())
    }

    /// Write every cached binding of a set into a freshly allocated
    /// descriptor set for the given frame slot.
    pub fn flush(
        &self,
        device: &Device,
        shader_hash: u64,
        set: u32,
        frame: u32,
        dst_set: vk::DescriptorSet,
    ) -> VulkanResult<()> {
        let Some(entries) = self.writes.get(&(shader_hash, set)) else {
            return Ok(());
        };
        let writes: Vec<vk::WriteDescriptorSet> = entries
            .iter()
            .map(|entry| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(dst_set)
                    .dst_binding(entry.binding)
                    .descriptor_type(entry.descriptor_type)
                    .buffer_info(std::slice::from_ref(
                        &entry.buffer_infos[frame as usize],
                    ))
                    .build()
            })
            .collect();
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
        Ok(())
    }

    /// Drop every cached write derived from a shader (called on reload;
    /// the new reflection re-registers its bindings)
    pub fn invalidate_shader(&mut self, shader_hash: u64) {
        self.writes.retain(|(hash, _), _| *hash != shader_hash);
    }

    /// Number of bindings cached for one set
    pub fn binding_count(&self, shader_hash: u64, set: u32) -> usize {
        self.writes
            .get(&(shader_hash, set))
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn info(raw: u64, range: u64) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: vk::Buffer::from_raw(raw),
            offset: 0,
            range,
        }
    }

    #[test]
    fn register_requires_one_info_per_frame() {
        let mut cache = DescriptorWriteCache::new(3);
        let result = cache.register_buffer(
            0xabc,
            0,
            1,
            vk::DescriptorType::UNIFORM_BUFFER,
            vec![info(1, 64); 2],
        );
        assert!(result.is_err());
        assert_eq!(cache.binding_count(0xabc, 0), 0);
    }

    #[test]
    fn re_registering_a_binding_replaces_it() {
        let mut cache = DescriptorWriteCache::new(2);
        cache
            .register_buffer(
                0xabc,
                0,
                1,
                vk::DescriptorType::UNIFORM_BUFFER,
                vec![info(1, 64), info(2, 64)],
            )
            .unwrap();
        cache
            .register_buffer(
                0xabc,
                0,
                1,
                vk::DescriptorType::UNIFORM_BUFFER,
                vec![info(3, 128), info(4, 128)],
            )
            .unwrap();
        assert_eq!(cache.binding_count(0xabc, 0), 1);
    }

    #[test]
    fn patch_rejects_unregistered_bindings() {
        let mut cache = DescriptorWriteCache::new(2);
        assert!(cache.patch_buffer(0xabc, 0, 1, 0, info(9, 64)).is_err());

        cache
            .register_buffer(
                0xabc,
                0,
                1,
                vk::DescriptorType::STORAGE_BUFFER,
                vec![info(1, 64), info(2, 64)],
            )
            .unwrap();
        assert!(cache.patch_buffer(0xabc, 0, 1, 0, info(9, 64)).is_ok());
        // A different set index is a different key.
        assert!(cache.patch_buffer(0xabc, 1, 1, 0, info(9, 64)).is_err());
    }

    #[test]
    fn shader_invalidation_drops_only_that_shader() {
        let mut cache = DescriptorWriteCache::new(2);
        let infos = || vec![info(1, 64), info(2, 64)];
        cache
            .register_buffer(0xabc, 0, 0, vk::DescriptorType::UNIFORM_BUFFER, infos())
            .unwrap();
        cache
            .register_buffer(0xabc, 1, 0, vk::DescriptorType::UNIFORM_BUFFER, infos())
            .unwrap();
        cache
            .register_buffer(0xdef, 0, 0, vk::DescriptorType::UNIFORM_BUFFER, infos())
            .unwrap();

        cache.invalidate_shader(0xabc);
        assert_eq!(cache.binding_count(0xabc, 0), 0);
        assert_eq!(cache.binding_count(0xabc, 1), 0);
        assert_eq!(cache.binding_count(0xdef, 0), 1);
    }
}
