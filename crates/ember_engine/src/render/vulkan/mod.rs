//! Vulkan backend
//!
//! The one maintained [`RenderBackend`](crate::render::RenderBackend)
//! implementation. Everything in this module runs on the executing thread;
//! GPU resource wrappers follow RAII, with destruction routed through the
//! deferred release queues so nothing dies while an in-flight frame may
//! still reference it.

pub mod backend;
pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod image;
pub mod swapchain;
pub mod sync;

pub use backend::VulkanBackend;
pub use buffer::{GpuBuffer, IndexBuffer, StorageBuffer, UniformBuffer, VertexBuffer};
pub use context::{LogicalDevice, PhysicalDeviceInfo, VulkanContext, VulkanInstance};
pub use descriptor::{
    DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriteCache, FrameDescriptorPools,
};
pub use image::GpuImage;
pub use swapchain::Swapchain;
pub use sync::{Fence, FrameSync, Semaphore};

use ash::vk;
use thiserror::Error;

use crate::render::RenderError;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

impl From<VulkanError> for RenderError {
    fn from(err: VulkanError) -> Self {
        match err {
            VulkanError::InitializationFailed(msg) => RenderError::InitializationFailed(msg),
            other => RenderError::Backend(other.to_string()),
        }
    }
}
