//! GPU image management
//!
//! Device-local sampled images with the same ownership contract as the
//! buffers: RAII wrappers whose `Drop` routes destruction through the
//! deferred release queues. The backend keeps a few of these alive for the
//! whole session as fallbacks for shaders whose real textures are missing
//! or still loading.

use ash::{vk, Device, Instance};

use crate::render::release_queue::ReleaseHandle;
use crate::render::vulkan::buffer::find_memory_type;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// A sampled image with its view, sampler, and backing memory
pub struct GpuImage {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: vk::Sampler,
    extent: vk::Extent2D,
    format: vk::Format,
    layers: u32,
    release: ReleaseHandle,
}

impl GpuImage {
    /// Create a device-local sampled 2D image
    pub fn new_2d(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        release: ReleaseHandle,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> VulkanResult<Self> {
        Self::new(device, instance, physical_device, release, extent, format, 1, false)
    }

    /// Create a device-local sampled cube image (6 layers)
    pub fn new_cube(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        release: ReleaseHandle,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> VulkanResult<Self> {
        Self::new(device, instance, physical_device, release, extent, format, 6, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        release: ReleaseHandle,
        extent: vk::Extent2D,
        format: vk::Format,
        layers: u32,
        cube: bool,
    ) -> VulkanResult<Self> {
        let flags = if cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(layers)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(VulkanError::Api)?
        };

        let mem_requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = match find_memory_type(
            instance,
            physical_device,
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(index) => index,
            Err(err) => {
                // Constructor failure destroys immediately: nothing in
                // flight can reference an image that was never returned.
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(VulkanError::Api(err));
            }
        };

        unsafe {
            if let Err(err) = device.bind_image_memory(image, memory, 0) {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
                return Err(VulkanError::Api(err));
            }
        }

        let view_type = if cube {
            vk::ImageViewType::CUBE
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: layers,
            });
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(VulkanError::Api(err));
            }
        };

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let sampler = match unsafe { device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(err) => {
                unsafe {
                    device.destroy_image_view(view, None);
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(VulkanError::Api(err));
            }
        };

        Ok(Self {
            device,
            image,
            memory,
            view,
            sampler,
            extent,
            format,
            layers,
            release,
        })
    }

    /// Get the image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Get the image view handle
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Get the sampler handle
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Image format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Subresource range covering every layer of the image
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }
}

impl Drop for GpuImage {
    // Destruction goes through the release queue for the current frame
    // slot, same as the buffers.
    fn drop(&mut self) {
        let device = self.device.clone();
        let image = self.image;
        let memory = self.memory;
        let view = self.view;
        let sampler = self.sampler;
        self.release.free(Box::new(move || unsafe {
            device.destroy_sampler(sampler, None);
            device.destroy_image_view(view, None);
            device.destroy_image(image, None);
            device.free_memory(memory, None);
        }));
    }
}
