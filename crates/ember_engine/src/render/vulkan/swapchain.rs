//! Vulkan swap chain management
//!
//! Owns the presentable images plus everything whose lifetime is tied to
//! them: depth attachment, render pass, framebuffers, per-frame command
//! buffers, and per-frame synchronization. Resize destroys and rebuilds all
//! of it under a device idle; an `ERROR_OUT_OF_DATE_KHR` from acquire or
//! present triggers the same full recreation and is never surfaced as an
//! error.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Instance};

use crate::render::vulkan::buffer::find_memory_type;
use crate::render::vulkan::context::VulkanContext;
use crate::render::vulkan::sync::FrameSync;
use crate::render::vulkan::{VulkanError, VulkanResult};

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Swap chain with per-frame command buffers and synchronization
pub struct Swapchain {
    device: Device,
    instance: Instance,
    swapchain_loader: SwapchainLoader,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    frames_in_flight: u32,
    vsync: bool,

    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,

    depth_image: vk::Image,
    depth_memory: vk::DeviceMemory,
    depth_view: vk::ImageView,

    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,

    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    frame_syncs: Vec<FrameSync>,

    current_frame: u32,
    current_image: u32,
}

impl Swapchain {
    /// Create a swap chain for the context's surface
    pub fn new(
        context: &VulkanContext,
        window_extent: vk::Extent2D,
        frames_in_flight: u32,
        vsync: bool,
    ) -> VulkanResult<Self> {
        let device = context.raw_device();
        let instance = context.instance().clone();
        let swapchain_loader = context.device.swapchain_loader.clone();
        let surface_loader = context.surface_loader.clone();

        let (swapchain, images, image_views, format, extent) = create_swapchain_objects(
            &device,
            &swapchain_loader,
            &surface_loader,
            context.surface,
            context.physical_device.device,
            window_extent,
            vsync,
            vk::SwapchainKHR::null(),
        )?;

        let (depth_image, depth_memory, depth_view) = create_depth_attachment(
            &device,
            &instance,
            context.physical_device.device,
            extent,
        )?;

        let render_pass = create_render_pass(&device, format.format)?;
        let framebuffers =
            create_framebuffers(&device, render_pass, &image_views, depth_view, extent)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(context.device.graphics_family);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight);
        let command_buffers = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };

        let frame_syncs = (0..frames_in_flight)
            .map(|_| FrameSync::new(device.clone()))
            .collect::<VulkanResult<Vec<_>>>()?;

        log::info!(
            "swapchain created: {}x{}, {} images, {} frames in flight, vsync {}",
            extent.width,
            extent.height,
            images.len(),
            frames_in_flight,
            vsync
        );

        Ok(Self {
            device,
            instance,
            swapchain_loader,
            surface_loader,
            surface: context.surface,
            physical_device: context.physical_device.device,
            graphics_queue: context.graphics_queue(),
            present_queue: context.present_queue(),
            frames_in_flight,
            vsync,
            swapchain,
            images,
            image_views,
            format,
            extent,
            depth_image,
            depth_memory,
            depth_view,
            render_pass,
            framebuffers,
            command_pool,
            command_buffers,
            frame_syncs,
            current_frame: 0,
            current_image: 0,
        })
    }

    /// Current extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// The swap-chain render pass
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Command buffer recording the current frame
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers[self.current_frame as usize]
    }

    /// Framebuffer for the acquired image
    pub fn current_framebuffer(&self) -> vk::Framebuffer {
        self.framebuffers[self.current_image as usize]
    }

    /// Wait for the slot's fence, acquire the next image, and begin
    /// recording the slot's command buffer.
    ///
    /// Acquire reporting an out-of-date swap chain recreates it at the
    /// current extent and retries once.
    pub fn begin_frame(&mut self, frame: u32) -> VulkanResult<()> {
        debug_assert!(frame < self.frames_in_flight);
        self.current_frame = frame;

        self.frame_syncs[frame as usize].in_flight.wait(u64::MAX)?;

        self.current_image = match self.acquire_image(frame) {
            Ok(index) => index,
            Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                log::debug!("swapchain out of date at acquire, recreating");
                self.recreate(self.extent)?;
                self.acquire_image(frame)?
            }
            Err(err) => return Err(err),
        };

        let command_buffer = self.command_buffers[frame as usize];
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }
        Ok(())
    }

    fn acquire_image(&mut self, frame: u32) -> VulkanResult<u32> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.frame_syncs[frame as usize].image_available.handle(),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("swapchain suboptimal at acquire");
                }
                Ok(index)
            }
            Err(err) => Err(VulkanError::Api(err)),
        }
    }

    /// End recording, submit with the slot's fence, and present.
    ///
    /// The fence is reset only here, immediately before the submit that
    /// signals it; a present reporting out-of-date or suboptimal recreates
    /// the swap chain for the next frame.
    pub fn submit_and_present(&mut self) -> VulkanResult<()> {
        let frame = self.current_frame as usize;
        let command_buffer = self.command_buffers[frame];
        unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)?;
        }

        let wait_semaphores = [self.frame_syncs[frame].image_available.handle()];
        let signal_semaphores = [self.frame_syncs[frame].render_finished.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];

        self.frame_syncs[frame].in_flight.reset()?;

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(
                    self.graphics_queue,
                    &[submit_info.build()],
                    self.frame_syncs[frame].in_flight.handle(),
                )
                .map_err(VulkanError::Api)?;
        }

        let swapchains = [self.swapchain];
        let image_indices = [self.current_image];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let present_result = unsafe {
            self.swapchain_loader
                .queue_present(self.present_queue, &present_info)
        };
        match present_result {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("swapchain stale at present, recreating");
                self.recreate(self.extent)
            }
            Err(err) => Err(VulkanError::Api(err)),
        }
    }

    /// Recreate for a new window extent
    pub fn resize(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        self.recreate(vk::Extent2D { width, height })
    }

    /// Full recreation: everything dependent on the old extent or the old
    /// images is destroyed first, then rebuilt against the new swap chain.
    fn recreate(&mut self, window_extent: vk::Extent2D) -> VulkanResult<()> {
        unsafe {
            self.device.device_wait_idle().map_err(VulkanError::Api)?;
        }

        self.destroy_extent_dependent();

        let old_swapchain = self.swapchain;
        let (swapchain, images, image_views, format, extent) = create_swapchain_objects(
            &self.device,
            &self.swapchain_loader,
            &self.surface_loader,
            self.surface,
            self.physical_device,
            window_extent,
            self.vsync,
            old_swapchain,
        )?;
        unsafe {
            self.swapchain_loader.destroy_swapchain(old_swapchain, None);
        }

        let (depth_image, depth_memory, depth_view) =
            create_depth_attachment(&self.device, &self.instance, self.physical_device, extent)?;
        let framebuffers =
            create_framebuffers(&self.device, self.render_pass, &image_views, depth_view, extent)?;

        // Anything recorded in the old command buffers references the old
        // framebuffers; free and reallocate rather than reuse.
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &self.command_buffers);
        }
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(self.frames_in_flight);
        self.command_buffers = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };

        self.swapchain = swapchain;
        self.images = images;
        self.image_views = image_views;
        self.format = format;
        self.extent = extent;
        self.depth_image = depth_image;
        self.depth_memory = depth_memory;
        self.depth_view = depth_view;
        self.framebuffers = framebuffers;

        log::info!(
            "swapchain recreated: {}x{}, {} images",
            extent.width,
            extent.height,
            self.images.len()
        );
        Ok(())
    }

    fn destroy_extent_dependent(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.destroy_image_view(self.depth_view, None);
            self.device.destroy_image(self.depth_image, None);
            self.device.free_memory(self.depth_memory, None);
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        self.frame_syncs.clear();
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
        self.destroy_extent_dependent();
        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_swapchain_objects(
    device: &Device,
    swapchain_loader: &SwapchainLoader,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    window_extent: vk::Extent2D,
    vsync: bool,
    old_swapchain: vk::SwapchainKHR,
) -> VulkanResult<(
    vk::SwapchainKHR,
    Vec<vk::Image>,
    Vec<vk::ImageView>,
    vk::SurfaceFormatKHR,
    vk::Extent2D,
)> {
    let surface_caps = unsafe {
        surface_loader
            .get_physical_device_surface_capabilities(physical_device, surface)
            .map_err(VulkanError::Api)?
    };

    let surface_formats = unsafe {
        surface_loader
            .get_physical_device_surface_formats(physical_device, surface)
            .map_err(VulkanError::Api)?
    };
    let format = surface_formats
        .iter()
        .find(|sf| {
            sf.format == vk::Format::B8G8R8A8_SRGB
                && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .copied()
        .unwrap_or(surface_formats[0]);

    let present_modes = unsafe {
        surface_loader
            .get_physical_device_surface_present_modes(physical_device, surface)
            .map_err(VulkanError::Api)?
    };
    // FIFO is always available and rate-limited; MAILBOX trades tearing-free
    // low latency for extra images when vsync is off.
    let present_mode = if vsync {
        vk::PresentModeKHR::FIFO
    } else {
        present_modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO)
    };

    let extent = if surface_caps.current_extent.width != u32::MAX {
        surface_caps.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                surface_caps.min_image_extent.width,
                surface_caps.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                surface_caps.min_image_extent.height,
                surface_caps.max_image_extent.height,
            ),
        }
    };

    let image_count = (surface_caps.min_image_count + 1).min(if surface_caps.max_image_count > 0 {
        surface_caps.max_image_count
    } else {
        surface_caps.min_image_count + 1
    });

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(surface_caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let swapchain = unsafe {
        swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(VulkanError::Api)?
    };

    let images = unsafe {
        swapchain_loader
            .get_swapchain_images(swapchain)
            .map_err(VulkanError::Api)?
    };

    let image_views: Result<Vec<_>, _> = images
        .iter()
        .map(|&image| {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            unsafe { device.create_image_view(&create_info, None) }
        })
        .collect();
    let image_views = image_views.map_err(VulkanError::Api)?;

    Ok((swapchain, images, image_views, format, extent))
}

fn create_depth_attachment(
    device: &Device,
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    extent: vk::Extent2D,
) -> VulkanResult<(vk::Image, vk::DeviceMemory, vk::ImageView)> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(DEPTH_FORMAT)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe {
        device
            .create_image(&image_info, None)
            .map_err(VulkanError::Api)?
    };

    let mem_requirements = unsafe { device.get_image_memory_requirements(image) };
    let memory_type_index = find_memory_type(
        instance,
        physical_device,
        mem_requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(mem_requirements.size)
        .memory_type_index(memory_type_index);
    let memory = unsafe {
        device
            .allocate_memory(&alloc_info, None)
            .map_err(VulkanError::Api)?
    };
    unsafe {
        device
            .bind_image_memory(image, memory, 0)
            .map_err(VulkanError::Api)?;
    }

    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(DEPTH_FORMAT)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    let view = unsafe {
        device
            .create_image_view(&view_info, None)
            .map_err(VulkanError::Api)?
    };

    Ok((image, memory, view))
}

fn create_render_pass(device: &Device, color_format: vk::Format) -> VulkanResult<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build(),
        vk::AttachmentDescription::builder()
            .format(DEPTH_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build(),
    ];

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpasses = [vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)
        .build()];

    let dependencies = [vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build()];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        device
            .create_render_pass(&create_info, None)
            .map_err(VulkanError::Api)
    }
}

fn create_framebuffers(
    device: &Device,
    render_pass: vk::RenderPass,
    image_views: &[vk::ImageView],
    depth_view: vk::ImageView,
    extent: vk::Extent2D,
) -> VulkanResult<Vec<vk::Framebuffer>> {
    image_views
        .iter()
        .map(|&view| {
            let attachments = [view, depth_view];
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe {
                device
                    .create_framebuffer(&create_info, None)
                    .map_err(VulkanError::Api)
            }
        })
        .collect()
}
