//! GPU buffer management
//!
//! Host-visible buffers with manual memory allocation. Ownership is RAII,
//! but destruction is deferred: dropping a buffer pushes a deletion closure
//! into the release queues instead of destroying the Vulkan objects
//! immediately, so a frame still in flight can finish reading them.

use std::mem;

use ash::{vk, Device, Instance};

use crate::render::release_queue::ReleaseHandle;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Find a memory type matching the filter and required properties
pub fn find_memory_type(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    let mem_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };

    for i in 0..mem_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && (mem_properties.memory_types[i as usize].property_flags & properties) == properties
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType)
}

/// A buffer plus its backing memory, freed through the release queues
pub struct GpuBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    release: ReleaseHandle,
}

impl GpuBuffer {
    /// Create a buffer with freshly allocated memory
    pub fn new(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        release: ReleaseHandle,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = match find_memory_type(
            instance,
            physical_device,
            mem_requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(err) => {
                // Constructor failure destroys immediately: nothing in
                // flight can reference a buffer that was never returned.
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(VulkanError::Api(err));
            }
        };

        unsafe {
            if let Err(err) = device.bind_buffer_memory(buffer, memory, 0) {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
                return Err(VulkanError::Api(err));
            }
        }

        Ok(Self {
            device,
            buffer,
            memory,
            size,
            release,
        })
    }

    /// Write a slice of plain-old-data into the buffer.
    ///
    /// Writes larger than the buffer are rejected rather than truncated;
    /// the material flush path feeds this caller-sized byte slices.
    pub fn write_data<T: bytemuck::Pod>(&self, data: &[T]) -> VulkanResult<()> {
        let byte_len = mem::size_of_val(data);
        if byte_len as vk::DeviceSize > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "write of {byte_len} bytes exceeds buffer size {}",
                    self.size
                ),
            });
        }

        unsafe {
            let mapped = self
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(
                data.as_ptr().cast::<std::ffi::c_void>(),
                mapped,
                byte_len,
            );
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the buffer size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for GpuBuffer {
    // Destruction goes through the release queue for the current frame
    // slot; the closure runs after a full frames-in-flight cycle.
    fn drop(&mut self) {
        let device = self.device.clone();
        let buffer = self.buffer;
        let memory = self.memory;
        self.release.free(Box::new(move || unsafe {
            device.destroy_buffer(buffer, None);
            device.free_memory(memory, None);
        }));
    }
}

/// Vertex buffer with host-visible storage
pub struct VertexBuffer {
    buffer: GpuBuffer,
    vertex_count: u32,
}

impl VertexBuffer {
    /// Create a vertex buffer pre-filled with vertex data
    pub fn new<T: bytemuck::Pod>(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        release: ReleaseHandle,
        vertices: &[T],
    ) -> VulkanResult<Self> {
        let size = mem::size_of_val(vertices) as vk::DeviceSize;
        let buffer = GpuBuffer::new(
            device,
            instance,
            physical_device,
            release,
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.write_data(vertices)?;

        Ok(Self {
            buffer,
            vertex_count: vertices.len() as u32,
        })
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Number of vertices in the buffer
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }
}

/// Index buffer with host-visible storage
pub struct IndexBuffer {
    buffer: GpuBuffer,
    index_count: u32,
}

impl IndexBuffer {
    /// Create an index buffer pre-filled with indices
    pub fn new(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        release: ReleaseHandle,
        indices: &[u32],
    ) -> VulkanResult<Self> {
        let size = mem::size_of_val(indices) as vk::DeviceSize;
        let buffer = GpuBuffer::new(
            device,
            instance,
            physical_device,
            release,
            size,
            vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.write_data(indices)?;

        Ok(Self {
            buffer,
            index_count: indices.len() as u32,
        })
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Number of indices in the buffer
    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Storage buffer, one replica of a per-frame set
pub struct StorageBuffer {
    buffer: GpuBuffer,
    binding: u32,
}

impl StorageBuffer {
    /// Create an uninitialized storage buffer of the given size
    pub fn new(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        release: ReleaseHandle,
        size: vk::DeviceSize,
        binding: u32,
    ) -> VulkanResult<Self> {
        let buffer = GpuBuffer::new(
            device,
            instance,
            physical_device,
            release,
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        Ok(Self { buffer, binding })
    }

    /// Upload new contents
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> VulkanResult<()> {
        self.buffer.write_data(data)
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Binding index this buffer is written to
    pub fn binding(&self) -> u32 {
        self.binding
    }

    /// Buffer size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

/// Uniform buffer, one replica of a per-frame set
pub struct UniformBuffer {
    buffer: GpuBuffer,
    binding: u32,
}

impl UniformBuffer {
    /// Create an uninitialized uniform buffer of the given size
    pub fn new(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        release: ReleaseHandle,
        size: vk::DeviceSize,
        binding: u32,
    ) -> VulkanResult<Self> {
        let buffer = GpuBuffer::new(
            device,
            instance,
            physical_device,
            release,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        Ok(Self { buffer, binding })
    }

    /// Upload new contents
    pub fn update<T: bytemuck::Pod>(&self, data: &T) -> VulkanResult<()> {
        self.buffer.write_data(std::slice::from_ref(data))
    }

    /// Upload raw bytes (the material flush path)
    pub fn update_bytes(&self, bytes: &[u8]) -> VulkanResult<()> {
        self.buffer.write_data(bytes)
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Binding index this buffer is written to
    pub fn binding(&self) -> u32 {
        self.binding
    }

    /// Buffer size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}
