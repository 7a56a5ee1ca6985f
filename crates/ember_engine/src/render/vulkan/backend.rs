//! The Vulkan [`RenderBackend`] implementation
//!
//! Owns the context, swap chain, per-frame descriptor pools, registered
//! pipelines, and the default resources (fullscreen-quad geometry plus the
//! placeholder textures shaders fall back to). Everything here runs on the
//! executing thread inside replayed render commands.

use std::collections::HashMap;

use ash::{vk, Device};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use crate::core::config::RendererConfig;
use crate::render::backend::{BackendResult, PipelineHandle, RenderBackend};
use crate::render::release_queue::ReleaseQueues;

use crate::render::vulkan::buffer::{IndexBuffer, VertexBuffer};
use crate::render::vulkan::context::VulkanContext;
use crate::render::vulkan::descriptor::{DescriptorWriteCache, FrameDescriptorPools};
use crate::render::vulkan::image::GpuImage;
use crate::render::vulkan::swapchain::Swapchain;
use crate::render::vulkan::sync::Fence;
use crate::render::vulkan::{VulkanError, VulkanResult};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    uv: [f32; 2],
}

// Two triangles covering clip space, used by composite/post passes.
const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex { position: [-1.0, -1.0], uv: [0.0, 0.0] },
    QuadVertex { position: [1.0, -1.0], uv: [1.0, 0.0] },
    QuadVertex { position: [1.0, 1.0], uv: [1.0, 1.0] },
    QuadVertex { position: [-1.0, 1.0], uv: [0.0, 1.0] },
];
const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

struct PipelineEntry {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
}

/// Vulkan rendering backend
pub struct VulkanBackend {
    context: VulkanContext,
    swapchain: Swapchain,
    descriptor_pools: FrameDescriptorPools,
    descriptor_writes: DescriptorWriteCache,
    pipelines: HashMap<PipelineHandle, PipelineEntry>,
    next_pipeline_id: u64,
    bound_pipeline: Option<PipelineHandle>,
    frame_active: bool,
    quad_vertices: Option<VertexBuffer>,
    quad_indices: Option<IndexBuffer>,
    brdf_lut: Option<GpuImage>,
    black_cube: Option<GpuImage>,
    empty_environment: Option<GpuImage>,
    release: ReleaseQueues,
    frames_in_flight: u32,
    compute_pool: vk::CommandPool,
}

impl VulkanBackend {
    /// Build the backend for a window.
    ///
    /// `release` is the shared deletion queue set; the backend hands its
    /// [`ReleaseHandle`](crate::render::ReleaseHandle) to every resource it
    /// creates and drains the remainder on drop.
    pub fn new<W>(
        window: &W,
        window_extent: (u32, u32),
        required_extensions: &[String],
        config: &RendererConfig,
        release: ReleaseQueues,
    ) -> VulkanResult<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let context = VulkanContext::new(
            window,
            "ember",
            required_extensions,
            config.enable_validation,
        )?;

        let swapchain = Swapchain::new(
            &context,
            vk::Extent2D {
                width: window_extent.0,
                height: window_extent.1,
            },
            config.frames_in_flight,
            config.vsync,
        )?;

        let descriptor_pools =
            FrameDescriptorPools::new(context.raw_device(), config.frames_in_flight)?;

        let device = context.raw_device();
        let quad_vertices = VertexBuffer::new(
            device.clone(),
            context.instance(),
            context.physical_device.device,
            release.handle(),
            &QUAD_VERTICES,
        )?;
        let quad_indices = IndexBuffer::new(
            device.clone(),
            context.instance(),
            context.physical_device.device,
            release.handle(),
            &QUAD_INDICES,
        )?;

        // Transient pool for one-shot submissions (placeholder clears at
        // init, synchronous compute at runtime).
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(context.device.graphics_family);
        let compute_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        // Fallback textures bound in place of assets that are missing or
        // still loading: a zeroed BRDF lookup table, a black cube map, and
        // a black environment map.
        let physical = context.physical_device.device;
        let brdf_lut = GpuImage::new_2d(
            device.clone(),
            context.instance(),
            physical,
            release.handle(),
            vk::Extent2D { width: 1, height: 1 },
            vk::Format::R16G16_SFLOAT,
        )?;
        let black_cube = GpuImage::new_cube(
            device.clone(),
            context.instance(),
            physical,
            release.handle(),
            vk::Extent2D { width: 1, height: 1 },
            vk::Format::R8G8B8A8_UNORM,
        )?;
        let empty_environment = GpuImage::new_cube(
            device.clone(),
            context.instance(),
            physical,
            release.handle(),
            vk::Extent2D { width: 1, height: 1 },
            vk::Format::R8G8B8A8_UNORM,
        )?;
        for image in [&brdf_lut, &black_cube, &empty_environment] {
            clear_to_black(&device, context.graphics_queue(), compute_pool, image)?;
        }

        Ok(Self {
            context,
            swapchain,
            descriptor_pools,
            descriptor_writes: DescriptorWriteCache::new(config.frames_in_flight),
            pipelines: HashMap::new(),
            next_pipeline_id: 1,
            bound_pipeline: None,
            frame_active: false,
            quad_vertices: Some(quad_vertices),
            quad_indices: Some(quad_indices),
            brdf_lut: Some(brdf_lut),
            black_cube: Some(black_cube),
            empty_environment: Some(empty_environment),
            release,
            frames_in_flight: config.frames_in_flight,
            compute_pool,
        })
    }

    /// Core Vulkan objects, for pipeline and resource construction
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    /// The swap-chain render pass pipelines must be compatible with
    pub fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }

    /// Per-frame descriptor pools
    pub fn descriptor_pools(&mut self) -> &mut FrameDescriptorPools {
        &mut self.descriptor_pools
    }

    /// Cached descriptor write parameters, shared by resource constructors
    pub fn descriptor_writes(&mut self) -> &mut DescriptorWriteCache {
        &mut self.descriptor_writes
    }

    /// Rewrite a set's cached bindings into a freshly allocated set
    pub fn flush_descriptor_writes(
        &self,
        shader_hash: u64,
        set: u32,
        frame: u32,
        dst_set: vk::DescriptorSet,
    ) -> VulkanResult<()> {
        self.descriptor_writes
            .flush(&self.context.device.device, shader_hash, set, frame, dst_set)
    }

    /// Take ownership of a pipeline and hand out an opaque handle for it
    pub fn register_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
    ) -> PipelineHandle {
        let handle = PipelineHandle(self.next_pipeline_id);
        self.next_pipeline_id += 1;
        self.pipelines.insert(
            handle,
            PipelineEntry {
                pipeline,
                layout,
                bind_point,
            },
        );
        handle
    }

    /// Pipeline layout for a registered pipeline, for push constant writes
    pub fn pipeline_layout(&self, handle: PipelineHandle) -> Option<vk::PipelineLayout> {
        self.pipelines.get(&handle).map(|entry| entry.layout)
    }

    /// Fallback BRDF lookup table (`None` only during teardown)
    pub fn brdf_lut(&self) -> Option<&GpuImage> {
        self.brdf_lut.as_ref()
    }

    /// Fallback black cube map
    pub fn black_cube(&self) -> Option<&GpuImage> {
        self.black_cube.as_ref()
    }

    /// Fallback environment map (black)
    pub fn empty_environment(&self) -> Option<&GpuImage> {
        self.empty_environment.as_ref()
    }

    fn run_one_shot<F>(&self, record: F) -> VulkanResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        submit_one_shot(
            &self.context.device.device,
            self.context.graphics_queue(),
            self.compute_pool,
            record,
        )
    }
}

/// Record, submit, and fence-wait a single transient command buffer
fn submit_one_shot<F>(
    device: &Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
    record: F,
) -> VulkanResult<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = unsafe {
        device
            .allocate_command_buffers(&alloc_info)
            .map_err(VulkanError::Api)?[0]
    };

    let result = (|| {
        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }
        record(command_buffer);
        unsafe {
            device
                .end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)?;
        }

        let fence = Fence::new(device.clone(), false)?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            device
                .queue_submit(queue, &[submit_info.build()], fence.handle())
                .map_err(VulkanError::Api)?;
        }
        fence.wait(u64::MAX)
    })();

    unsafe {
        device.free_command_buffers(pool, &[command_buffer]);
    }
    result
}

/// Transition a fresh image to `SHADER_READ_ONLY_OPTIMAL` with all texels
/// cleared to zero
fn clear_to_black(
    device: &Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
    image: &GpuImage,
) -> VulkanResult<()> {
    let range = image.full_range();
    let handle = image.handle();
    submit_one_shot(device, queue, pool, |command_buffer| unsafe {
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(handle)
            .subresource_range(range)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .build();
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );

        device.cmd_clear_color_image(
            command_buffer,
            handle,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &vk::ClearColorValue { float32: [0.0; 4] },
            &[range],
        );

        let to_sampled = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(handle)
            .subresource_range(range)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .build();
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_sampled],
        );
    })
}

impl RenderBackend for VulkanBackend {
    fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    fn begin_frame(&mut self, frame_index: u32) -> BackendResult<()> {
        // No recording is valid until the slot's command buffer has been
        // reset and begun; the flag stays down if any step here fails.
        self.frame_active = false;
        self.swapchain.begin_frame(frame_index)?;
        // The fence wait above proves the GPU is done with this slot, so
        // every descriptor set allocated for it last cycle is dead weight.
        self.descriptor_pools.reset_frame(frame_index)?;
        self.bound_pipeline = None;
        self.frame_active = true;
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.frame_active {
            log::warn!("end_frame without an open frame, skipping present");
            return Ok(());
        }
        self.frame_active = false;
        self.swapchain.submit_and_present()?;
        Ok(())
    }

    fn begin_render_pass(&mut self, clear_color: [f32; 4]) -> BackendResult<()> {
        if !self.frame_active {
            log::warn!("begin_render_pass outside an open frame, skipping");
            return Ok(());
        }
        let command_buffer = self.swapchain.current_command_buffer();
        let extent = self.swapchain.extent();

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.swapchain.render_pass())
            .framebuffer(self.swapchain.current_framebuffer())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let device = &self.context.device.device;
        unsafe {
            device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(
                command_buffer,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );

            // Default geometry: the fullscreen quad is bound at pass start
            // so composite passes can draw without their own buffers.
            if let (Some(vertices), Some(indices)) = (&self.quad_vertices, &self.quad_indices) {
                device.cmd_bind_vertex_buffers(command_buffer, 0, &[vertices.handle()], &[0]);
                device.cmd_bind_index_buffer(
                    command_buffer,
                    indices.handle(),
                    0,
                    vk::IndexType::UINT32,
                );
            }
        }
        Ok(())
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        if !self.frame_active {
            log::warn!("end_render_pass outside an open frame, skipping");
            return Ok(());
        }
        let command_buffer = self.swapchain.current_command_buffer();
        unsafe {
            self.context.device.device.cmd_end_render_pass(command_buffer);
        }
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> BackendResult<()> {
        if !self.frame_active {
            log::warn!("bind_pipeline outside an open frame, skipping");
            return Ok(());
        }
        let Some(entry) = self.pipelines.get(&pipeline) else {
            log::warn!("bind_pipeline: unknown pipeline handle {}", pipeline.0);
            return Ok(());
        };
        let command_buffer = self.swapchain.current_command_buffer();
        unsafe {
            self.context.device.device.cmd_bind_pipeline(
                command_buffer,
                entry.bind_point,
                entry.pipeline,
            );
        }
        self.bound_pipeline = Some(pipeline);
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> BackendResult<()> {
        if !self.frame_active {
            log::warn!("draw_indexed outside an open frame, skipping");
            return Ok(());
        }
        if self.bound_pipeline.is_none() {
            log::warn!("draw_indexed with no bound pipeline, skipping");
            return Ok(());
        }
        let command_buffer = self.swapchain.current_command_buffer();
        unsafe {
            self.context.device.device.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    fn dispatch_compute(
        &mut self,
        pipeline: PipelineHandle,
        groups: [u32; 3],
    ) -> BackendResult<()> {
        let Some(entry) = self.pipelines.get(&pipeline) else {
            log::warn!("dispatch_compute: unknown pipeline handle {}", pipeline.0);
            return Ok(());
        };
        if entry.bind_point != vk::PipelineBindPoint::COMPUTE {
            return Err(VulkanError::InvalidOperation {
                reason: format!("pipeline {} is not a compute pipeline", pipeline.0),
            }
            .into());
        }

        let raw_pipeline = entry.pipeline;
        let device = self.context.raw_device();
        self.run_one_shot(|command_buffer| unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                raw_pipeline,
            );
            device.cmd_dispatch(command_buffer, groups[0], groups[1], groups[2]);
        })?;
        Ok(())
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        self.swapchain.resize(width, height)?;
        Ok(())
    }

    fn wait_idle(&self) -> BackendResult<()> {
        unsafe {
            self.context
                .device
                .device
                .device_wait_idle()
                .map_err(VulkanError::Api)?;
        }
        Ok(())
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        let extent = self.swapchain.extent();
        (extent.width, extent.height)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let device = &self.context.device.device;
        unsafe {
            let _ = device.device_wait_idle();
            for entry in self.pipelines.values() {
                device.destroy_pipeline(entry.pipeline, None);
                device.destroy_pipeline_layout(entry.layout, None);
            }
            device.destroy_command_pool(self.compute_pool, None);
        }
        // Dropping the default resources pushes their frees into the
        // release queues; drain them now while the device is idle and
        // still alive.
        self.quad_vertices = None;
        self.quad_indices = None;
        self.brdf_lut = None;
        self.black_cube = None;
        self.empty_environment = None;
        self.release.drain_all();
    }
}
