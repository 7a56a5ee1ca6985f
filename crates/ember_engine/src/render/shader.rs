//! Shader reflection model
//!
//! The renderer never hardcodes descriptor layouts; it learns them from the
//! shader. A [`ShaderReflection`] is populated per stage as the shader's
//! resources are discovered and merges declarations that appear in more than
//! one stage, so the rest of the system sees a single per-shader view:
//! descriptor sets keyed by binding, push constant ranges packed
//! contiguously, and a flat member layout for material parameter writes.
//!
//! Uniform buffers named [`RESERVED_RENDERER_UNIFORM`] belong to the renderer
//! itself (camera matrices and the like) and are excluded from the
//! material-facing layout.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use bitflags::bitflags;

/// Name of the renderer-owned uniform block, invisible to materials
pub const RESERVED_RENDERER_UNIFORM: &str = "uRenderer";

bitflags! {
    /// Pipeline stages a shader resource is visible to
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShaderStage: u32 {
        /// Vertex stage
        const VERTEX = 1 << 0;
        /// Fragment stage
        const FRAGMENT = 1 << 1;
        /// Compute stage
        const COMPUTE = 1 << 2;
    }
}

/// One named member inside a uniform block or push constant range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBufferMember {
    /// Member name as declared in the shader
    pub name: String,
    /// Byte offset within the parent block
    pub offset: u32,
    /// Byte size
    pub size: u32,
}

/// A reflected uniform buffer declaration
#[derive(Debug, Clone)]
pub struct ShaderUniformBuffer {
    /// Block name
    pub name: String,
    /// Binding index within its descriptor set
    pub binding: u32,
    /// Byte size of the block
    pub size: u32,
    /// Stages the block is declared in
    pub stages: ShaderStage,
    /// Block members, in declaration order
    pub members: Vec<ShaderBufferMember>,
}

/// A reflected storage buffer declaration
#[derive(Debug, Clone)]
pub struct ShaderStorageBuffer {
    /// Block name
    pub name: String,
    /// Binding index within its descriptor set
    pub binding: u32,
    /// Declared byte size (0 for runtime-sized)
    pub size: u32,
    /// Stages the block is declared in
    pub stages: ShaderStage,
}

/// A reflected combined image sampler declaration
#[derive(Debug, Clone)]
pub struct ShaderSampler {
    /// Sampler name
    pub name: String,
    /// Binding index within its descriptor set
    pub binding: u32,
    /// Array element count (1 for non-arrays)
    pub array_count: u32,
    /// Stages the sampler is declared in
    pub stages: ShaderStage,
}

/// A reflected storage image declaration
#[derive(Debug, Clone)]
pub struct ShaderStorageImage {
    /// Image name
    pub name: String,
    /// Binding index within its descriptor set
    pub binding: u32,
    /// Stages the image is declared in
    pub stages: ShaderStage,
}

/// All resources of one descriptor set, keyed by binding.
///
/// `BTreeMap` keeps iteration in binding order, which is the order layouts
/// are built in.
#[derive(Debug, Clone, Default)]
pub struct ShaderDescriptorSet {
    /// Uniform buffers by binding
    pub uniform_buffers: BTreeMap<u32, ShaderUniformBuffer>,
    /// Storage buffers by binding
    pub storage_buffers: BTreeMap<u32, ShaderStorageBuffer>,
    /// Combined image samplers by binding
    pub samplers: BTreeMap<u32, ShaderSampler>,
    /// Storage images by binding
    pub storage_images: BTreeMap<u32, ShaderStorageImage>,
}

impl ShaderDescriptorSet {
    /// Whether any resource kind already occupies `binding`
    pub fn binding_occupied(&self, binding: u32) -> bool {
        self.uniform_buffers.contains_key(&binding)
            || self.storage_buffers.contains_key(&binding)
            || self.samplers.contains_key(&binding)
            || self.storage_images.contains_key(&binding)
    }

    /// Total number of reflected resources
    pub fn resource_count(&self) -> usize {
        self.uniform_buffers.len()
            + self.storage_buffers.len()
            + self.samplers.len()
            + self.storage_images.len()
    }
}

/// A reflected push constant range
#[derive(Debug, Clone)]
pub struct PushConstantRange {
    /// Block name
    pub name: String,
    /// Byte offset, assigned by contiguous packing across stages
    pub offset: u32,
    /// Byte size
    pub size: u32,
    /// Stages the range is declared in
    pub stages: ShaderStage,
    /// Block members, offsets relative to the range
    pub members: Vec<ShaderBufferMember>,
}

/// Byte location of one material parameter in the flat layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialMember {
    /// Offset into the material's parameter storage
    pub offset: u32,
    /// Byte size
    pub size: u32,
}

/// Flat, name-addressed layout of every material-visible parameter
///
/// Built once from a [`ShaderReflection`]; materials size their CPU-side
/// storage from `total_size` and resolve `set("uColor", ...)` calls through
/// [`member`](Self::member).
#[derive(Debug, Clone, Default)]
pub struct MaterialLayout {
    total_size: u32,
    members: HashMap<String, MaterialMember>,
}

impl MaterialLayout {
    /// Total byte size of the parameter storage
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Resolve a parameter name to its byte location
    pub fn member(&self, name: &str) -> Option<MaterialMember> {
        self.members.get(name).copied()
    }

    /// Number of addressable parameters
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Merged reflection data for one shader across all its stages
#[derive(Debug, Clone)]
pub struct ShaderReflection {
    name: String,
    hash: u64,
    sets: BTreeMap<u32, ShaderDescriptorSet>,
    push_constants: Vec<PushConstantRange>,
}

impl ShaderReflection {
    /// Start an empty reflection for the named shader
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let hash = hasher.finish();
        Self {
            name,
            hash,
            sets: BTreeMap::new(),
            push_constants: Vec::new(),
        }
    }

    /// Shader name (asset path or logical name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable hash of the shader name, the key used by the reload registry
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Reflected descriptor sets, keyed by set index
    pub fn descriptor_sets(&self) -> &BTreeMap<u32, ShaderDescriptorSet> {
        &self.sets
    }

    /// Reflected push constant ranges in packing order
    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constants
    }

    /// Record a uniform buffer declaration from one stage.
    ///
    /// A block already reflected at the same (set, binding) from another
    /// stage is merged: visible stages are unioned and the larger
    /// declaration wins for size and member list. A different resource kind
    /// at the same binding is a malformed shader.
    pub fn register_uniform_buffer(&mut self, set: u32, buffer: ShaderUniformBuffer) {
        let descriptor_set = self.sets.entry(set).or_default();
        if let Some(existing) = descriptor_set.uniform_buffers.get_mut(&buffer.binding) {
            assert_eq!(
                existing.name, buffer.name,
                "set {set} binding {} declared as both '{}' and '{}'",
                buffer.binding, existing.name, buffer.name
            );
            existing.stages |= buffer.stages;
            if buffer.size > existing.size {
                existing.size = buffer.size;
                existing.members = buffer.members;
            }
            return;
        }
        assert!(
            !descriptor_set.binding_occupied(buffer.binding),
            "set {set} binding {} occupied by a different resource kind",
            buffer.binding
        );
        descriptor_set.uniform_buffers.insert(buffer.binding, buffer);
    }

    /// Record a storage buffer declaration from one stage
    pub fn register_storage_buffer(&mut self, set: u32, buffer: ShaderStorageBuffer) {
        let descriptor_set = self.sets.entry(set).or_default();
        if let Some(existing) = descriptor_set.storage_buffers.get_mut(&buffer.binding) {
            existing.stages |= buffer.stages;
            existing.size = existing.size.max(buffer.size);
            return;
        }
        assert!(
            !descriptor_set.binding_occupied(buffer.binding),
            "set {set} binding {} occupied by a different resource kind",
            buffer.binding
        );
        descriptor_set.storage_buffers.insert(buffer.binding, buffer);
    }

    /// Record a combined image sampler declaration from one stage
    pub fn register_sampler(&mut self, set: u32, sampler: ShaderSampler) {
        let descriptor_set = self.sets.entry(set).or_default();
        if let Some(existing) = descriptor_set.samplers.get_mut(&sampler.binding) {
            existing.stages |= sampler.stages;
            existing.array_count = existing.array_count.max(sampler.array_count);
            return;
        }
        assert!(
            !descriptor_set.binding_occupied(sampler.binding),
            "set {set} binding {} occupied by a different resource kind",
            sampler.binding
        );
        descriptor_set.samplers.insert(sampler.binding, sampler);
    }

    /// Record a storage image declaration from one stage
    pub fn register_storage_image(&mut self, set: u32, image: ShaderStorageImage) {
        let descriptor_set = self.sets.entry(set).or_default();
        if let Some(existing) = descriptor_set.storage_images.get_mut(&image.binding) {
            existing.stages |= image.stages;
            return;
        }
        assert!(
            !descriptor_set.binding_occupied(image.binding),
            "set {set} binding {} occupied by a different resource kind",
            image.binding
        );
        descriptor_set.storage_images.insert(image.binding, image);
    }

    /// Record a push constant block from one stage.
    ///
    /// Ranges are packed contiguously: a new block starts where the previous
    /// one ended. A block name seen before (from another stage) merges into
    /// the existing range instead of consuming new space.
    pub fn register_push_constant(
        &mut self,
        name: impl Into<String>,
        size: u32,
        stages: ShaderStage,
        members: Vec<ShaderBufferMember>,
    ) {
        let name = name.into();
        if let Some(existing) = self.push_constants.iter_mut().find(|r| r.name == name) {
            existing.stages |= stages;
            if size > existing.size {
                log::warn!(
                    "push constant block '{name}' grew from {} to {size} bytes across stages",
                    existing.size
                );
                existing.size = size;
                existing.members = members;
            }
            return;
        }
        let offset = self
            .push_constants
            .last()
            .map_or(0, |last| last.offset + last.size);
        self.push_constants.push(PushConstantRange {
            name,
            offset,
            size,
            stages,
            members,
        });
    }

    /// Total push constant bytes consumed by this shader
    pub fn push_constant_size(&self) -> u32 {
        self.push_constants
            .last()
            .map_or(0, |last| last.offset + last.size)
    }

    /// Build the flat material parameter layout.
    ///
    /// Material-visible storage concatenates every non-reserved uniform
    /// block (in set, then binding order) followed by every non-reserved
    /// push constant range, with each block's members addressed by name.
    pub fn material_layout(&self) -> MaterialLayout {
        let mut layout = MaterialLayout::default();
        for descriptor_set in self.sets.values() {
            for buffer in descriptor_set.uniform_buffers.values() {
                if buffer.name == RESERVED_RENDERER_UNIFORM {
                    continue;
                }
                let base = layout.total_size;
                for member in &buffer.members {
                    layout.members.insert(
                        member.name.clone(),
                        MaterialMember {
                            offset: base + member.offset,
                            size: member.size,
                        },
                    );
                }
                layout.total_size += buffer.size;
            }
        }
        for range in &self.push_constants {
            if range.name == RESERVED_RENDERER_UNIFORM {
                continue;
            }
            let base = layout.total_size;
            for member in &range.members {
                layout.members.insert(
                    member.name.clone(),
                    MaterialMember {
                        offset: base + member.offset,
                        size: member.size,
                    },
                );
            }
            layout.total_size += range.size;
        }
        layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(name: &str, binding: u32, size: u32, stages: ShaderStage) -> ShaderUniformBuffer {
        ShaderUniformBuffer {
            name: name.into(),
            binding,
            size,
            stages,
            members: vec![ShaderBufferMember {
                name: format!("{name}.first"),
                offset: 0,
                size: 16,
            }],
        }
    }

    #[test]
    fn duplicate_binding_across_stages_merges() {
        let mut reflection = ShaderReflection::new("pbr");
        reflection.register_uniform_buffer(0, uniform("uCamera", 0, 64, ShaderStage::VERTEX));
        reflection.register_uniform_buffer(0, uniform("uCamera", 0, 128, ShaderStage::FRAGMENT));

        let set = &reflection.descriptor_sets()[&0];
        assert_eq!(set.resource_count(), 1);
        let merged = &set.uniform_buffers[&0];
        assert_eq!(merged.size, 128);
        assert_eq!(merged.stages, ShaderStage::VERTEX | ShaderStage::FRAGMENT);
    }

    #[test]
    #[should_panic(expected = "different resource kind")]
    fn conflicting_resource_kinds_at_one_binding_panic() {
        let mut reflection = ShaderReflection::new("broken");
        reflection.register_uniform_buffer(0, uniform("uData", 3, 64, ShaderStage::VERTEX));
        reflection.register_sampler(
            0,
            ShaderSampler {
                name: "uAlbedo".into(),
                binding: 3,
                array_count: 1,
                stages: ShaderStage::FRAGMENT,
            },
        );
    }

    #[test]
    fn push_constants_pack_contiguously() {
        let mut reflection = ShaderReflection::new("composite");
        reflection.register_push_constant("uRenderer", 64, ShaderStage::VERTEX, Vec::new());
        reflection.register_push_constant("uMaterial", 32, ShaderStage::FRAGMENT, Vec::new());
        reflection.register_push_constant("uDebug", 8, ShaderStage::FRAGMENT, Vec::new());

        let ranges = reflection.push_constant_ranges();
        assert_eq!(ranges[0].offset, 0);
        assert_eq!(ranges[1].offset, 64);
        assert_eq!(ranges[2].offset, 96);
        assert_eq!(reflection.push_constant_size(), 104);
    }

    #[test]
    fn push_constant_reregistration_does_not_consume_space() {
        let mut reflection = ShaderReflection::new("shared");
        reflection.register_push_constant("uMaterial", 32, ShaderStage::VERTEX, Vec::new());
        reflection.register_push_constant("uMaterial", 32, ShaderStage::FRAGMENT, Vec::new());

        assert_eq!(reflection.push_constant_ranges().len(), 1);
        assert_eq!(reflection.push_constant_size(), 32);
        assert_eq!(
            reflection.push_constant_ranges()[0].stages,
            ShaderStage::VERTEX | ShaderStage::FRAGMENT
        );
    }

    #[test]
    fn material_layout_excludes_renderer_uniform() {
        let mut reflection = ShaderReflection::new("pbr");
        reflection.register_uniform_buffer(
            0,
            ShaderUniformBuffer {
                name: RESERVED_RENDERER_UNIFORM.into(),
                binding: 0,
                size: 192,
                stages: ShaderStage::VERTEX,
                members: vec![ShaderBufferMember {
                    name: "viewProjection".into(),
                    offset: 0,
                    size: 64,
                }],
            },
        );
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
                        name: "roughness".into(),
                        offset: 16,
                        size: 4,
                    },
                ],
            },
        );

        let layout = reflection.material_layout();
        assert_eq!(layout.total_size(), 32);
        assert!(layout.member("viewProjection").is_none());
        assert_eq!(
            layout.member("roughness"),
            Some(MaterialMember { offset: 16, size: 4 })
        );
    }

    #[test]
    fn material_layout_concatenates_blocks() {
        let mut reflection = ShaderReflection::new("terrain");
        reflection.register_uniform_buffer(
            0,
            ShaderUniformBuffer {
                name: "uTiling".into(),
                binding: 0,
                size: 16,
                stages: ShaderStage::FRAGMENT,
                members: vec![ShaderBufferMember {
                    name: "tiling".into(),
                    offset: 0,
                    size: 8,
                }],
            },
        );
        reflection.register_push_constant(
            "uBlend",
            16,
            ShaderStage::FRAGMENT,
            vec![ShaderBufferMember {
                name: "blendSharpness".into(),
                offset: 0,
                size: 4,
            }],
        );

        let layout = reflection.material_layout();
        assert_eq!(layout.total_size(), 32);
        assert_eq!(layout.member("tiling").unwrap().offset, 0);
        assert_eq!(layout.member("blendSharpness").unwrap().offset, 16);
    }

    #[test]
    fn hash_is_stable_per_name() {
        let a = ShaderReflection::new("water");
        let b = ShaderReflection::new("water");
        let c = ShaderReflection::new("fire");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}
