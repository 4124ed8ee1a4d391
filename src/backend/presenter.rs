// =============================================================================
// VULKAN PRESENTER - render-thread GPU objects
// =============================================================================
//
// Owns the swapchain, the render pass, the per-slot command buffers and
// descriptor sets, and everything that depends on the pixel format of the
// incoming frames (sampler, YCbCr conversion, pipelines, conversion targets).
//
// Format-dependent objects carry a generation number; transfer image views
// made under an older generation are recreated the next time they are bound.

use anyhow::{Context, Result};
use ash::vk;
use std::path::PathBuf;
use std::sync::Arc;

use super::image::{image_barrier, ConvertedImage, VulkanImage};
use super::pipeline::{create_render_pass, create_set_layout, dispatch_size, ConversionPipeline, RenderPipeline};
use super::shader::load_shader_module;
use super::swapchain::Swapchain;
use super::sync::FrameSync;
use super::VulkanDevice;
use crate::config::DisplayConfig;
use crate::error::Result as DisplayResult;
use crate::format::{is_ycbcr_format, needs_conversion_pass};
use crate::gpu::{PresentOutcome, Presenter, SwapchainImage};
use crate::image::{ImageDescription, TransferImage, WindowParameters};
use crate::render_area::RenderArea;

const RENDER_VERT: &str = "render.vert.spv";
const RENDER_FRAG: &str = "render.frag.spv";
const CONVERT_COMP: &str = "convert.comp.spv";

/// Upper bound of descriptors one YCbCr combined image sampler may consume.
const MAX_PLANE_DESCRIPTORS: u32 = 3;

/// Command buffer, semaphores and descriptor sets lent to one frame.
struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    sync: FrameSync,
    /// Sampled by the render pipeline.
    render_set: vk::DescriptorSet,
    /// Conversion pass input and output.
    source_set: vk::DescriptorSet,
    target_set: vk::DescriptorSet,
    converted: Option<ConvertedImage>,
}

/// Compute conversion state for formats that cannot be linearly filtered.
struct Conversion {
    source_layout: vk::DescriptorSetLayout,
    target_layout: vk::DescriptorSetLayout,
    pipeline: Option<ConversionPipeline>,
}

/// Everything rebuilt when the frame format changes.
struct FormatResources {
    description: ImageDescription,
    ycbcr_conversion: Option<vk::SamplerYcbcrConversion>,
    sampler: vk::Sampler,
    render_set_layout: vk::DescriptorSetLayout,
    pipeline: Option<RenderPipeline>,
    conversion: Option<Conversion>,
}

impl FormatResources {
    fn new(description: ImageDescription) -> Self {
        Self {
            description,
            ycbcr_conversion: None,
            sampler: vk::Sampler::null(),
            render_set_layout: vk::DescriptorSetLayout::null(),
            pipeline: None,
            conversion: None,
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            if let Some(conversion) = &self.conversion {
                if let Some(pipeline) = &conversion.pipeline {
                    pipeline.destroy(device);
                }
                device.destroy_descriptor_set_layout(conversion.source_layout, None);
                device.destroy_descriptor_set_layout(conversion.target_layout, None);
            }
            if let Some(pipeline) = &self.pipeline {
                pipeline.destroy(device);
            }
            device.destroy_descriptor_set_layout(self.render_set_layout, None);
            device.destroy_sampler(self.sampler, None);
            if let Some(conversion) = self.ycbcr_conversion {
                device.destroy_sampler_ycbcr_conversion(conversion, None);
            }
        }
    }
}

pub struct VulkanPresenter {
    device: Arc<VulkanDevice>,
    swapchain: Option<Swapchain>,
    surface_format: vk::SurfaceFormatKHR,
    render_pass: vk::RenderPass,
    present_mode: vk::PresentModeKHR,
    acquire_timeout_ns: u64,
    clear_color: [f32; 4],

    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    slots: Vec<FrameSlot>,

    shader_dir: PathBuf,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
    /// Loaded on first use of the conversion pass.
    convert_shader: vk::ShaderModule,
    /// Compute source sampler; `texelFetch` never filters.
    nearest_sampler: vk::Sampler,

    format: Option<FormatResources>,
    render_area: RenderArea,
    generation: u64,
}

impl VulkanPresenter {
    pub fn new(device: Arc<VulkanDevice>, config: &DisplayConfig, window: WindowParameters) -> Result<Self> {
        let surface_format = Swapchain::surface_format(&device)?;
        let slot_count = config.frames_in_flight.max(1);

        // Null handles are valid to destroy, so Drop can clean up after any
        // step below fails.
        let mut presenter = Self {
            device,
            swapchain: None,
            surface_format,
            render_pass: vk::RenderPass::null(),
            present_mode: config.present_mode(),
            acquire_timeout_ns: config.swapchain_timeout().as_nanos().min(u64::MAX as u128) as u64,
            clear_color: config.clear_color,
            command_pool: vk::CommandPool::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            slots: Vec::with_capacity(slot_count),
            shader_dir: config.shader_dir.clone(),
            vert_shader: vk::ShaderModule::null(),
            frag_shader: vk::ShaderModule::null(),
            convert_shader: vk::ShaderModule::null(),
            nearest_sampler: vk::Sampler::null(),
            format: None,
            render_area: RenderArea::default(),
            generation: 0,
        };

        presenter.render_pass = create_render_pass(&presenter.device, surface_format.format)?;
        presenter.swapchain = Some(Swapchain::new(
            Arc::clone(&presenter.device),
            surface_format,
            presenter.present_mode,
            window,
            presenter.render_pass,
            None,
        )?);

        presenter.vert_shader = load_shader_module(&presenter.device, &presenter.shader_dir, RENDER_VERT)?;
        presenter.frag_shader = load_shader_module(&presenter.device, &presenter.shader_dir, RENDER_FRAG)?;
        presenter.nearest_sampler = presenter.create_sampler(vk::Filter::NEAREST, None)?;
        presenter.create_slots(slot_count)?;

        log::info!("Presenter ready: {:?}, {} frame slots", surface_format.format, slot_count);
        Ok(presenter)
    }

    fn create_slots(&mut self, count: usize) -> Result<()> {
        let device = &self.device.device;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.device.graphics_queue_family);
        self.command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.context("Failed to create command pool")?;

        let slots = count as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 2 * slots * MAX_PLANE_DESCRIPTORS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: slots,
            },
        ];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(3 * slots);
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&descriptor_pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slots);
        let command_buffers =
            unsafe { device.allocate_command_buffers(&alloc_info) }.context("Failed to allocate command buffers")?;

        for command_buffer in command_buffers {
            let sync = FrameSync::new(&self.device)?;
            self.slots.push(FrameSlot {
                command_buffer,
                sync,
                render_set: vk::DescriptorSet::null(),
                source_set: vk::DescriptorSet::null(),
                target_set: vk::DescriptorSet::null(),
                converted: None,
            });
        }
        Ok(())
    }

    fn create_sampler(&self, filter: vk::Filter, ycbcr: Option<vk::SamplerYcbcrConversion>) -> Result<vk::Sampler> {
        let mut conversion_info = vk::SamplerYcbcrConversionInfo::default();
        let mut sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(0.0)
            .unnormalized_coordinates(false);
        if let Some(conversion) = ycbcr {
            conversion_info = conversion_info.conversion(conversion);
            sampler_info = sampler_info.push_next(&mut conversion_info);
        }

        unsafe { self.device.device.create_sampler(&sampler_info, None) }.context("Failed to create sampler")
    }

    fn create_ycbcr_conversion(&self, format: vk::Format, chroma_filter: vk::Filter) -> Result<vk::SamplerYcbcrConversion> {
        let info = vk::SamplerYcbcrConversionCreateInfo::default()
            .format(format)
            .ycbcr_model(vk::SamplerYcbcrModelConversion::YCBCR_709)
            .ycbcr_range(vk::SamplerYcbcrRange::ITU_NARROW)
            .components(vk::ComponentMapping::default())
            .x_chroma_offset(vk::ChromaLocation::MIDPOINT)
            .y_chroma_offset(vk::ChromaLocation::MIDPOINT)
            .chroma_filter(chroma_filter)
            .force_explicit_reconstruction(false);

        unsafe { self.device.device.create_sampler_ycbcr_conversion(&info, None) }
            .context("Failed to create sampler YCbCr conversion")
    }

    fn allocate_set(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?;
        sets.into_iter().next().context("Driver returned no descriptor set")
    }

    fn write_image(&self, set: vk::DescriptorSet, ty: vk::DescriptorType, view: vk::ImageView, layout: vk::ImageLayout) {
        let image_info = [vk::DescriptorImageInfo::default().image_view(view).image_layout(layout)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(ty)
            .image_info(&image_info);
        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }

    // =========================================================================
    // FORMAT-DEPENDENT OBJECTS
    // =========================================================================

    fn build_format_resources(&mut self, resources: &mut FormatResources) -> Result<()> {
        let format = resources.description.format;
        let features = self.device.linear_features(format);
        let ycbcr = is_ycbcr_format(format);

        // ─────────────────────────────────────────────────────────────────────
        // Sampler (with YCbCr conversion for chroma-subsampled formats)
        // ─────────────────────────────────────────────────────────────────────
        if ycbcr {
            let filter = if features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_YCBCR_CONVERSION_LINEAR_FILTER) {
                vk::Filter::LINEAR
            } else {
                vk::Filter::NEAREST
            };
            let conversion = self.create_ycbcr_conversion(format, filter)?;
            resources.ycbcr_conversion = Some(conversion);
            resources.sampler = self.create_sampler(filter, Some(conversion))?;
        } else {
            resources.sampler = self.create_sampler(vk::Filter::LINEAR, None)?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // Render pipeline
        // ─────────────────────────────────────────────────────────────────────
        resources.render_set_layout = create_set_layout(
            &self.device,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::FRAGMENT,
            Some(resources.sampler),
        )?;
        resources.pipeline = Some(RenderPipeline::new(
            &self.device,
            self.render_pass,
            resources.render_set_layout,
            self.vert_shader,
            self.frag_shader,
        )?);

        // ─────────────────────────────────────────────────────────────────────
        // Conversion pass
        // ─────────────────────────────────────────────────────────────────────
        if needs_conversion_pass(format, features) {
            if self.convert_shader == vk::ShaderModule::null() {
                self.convert_shader = load_shader_module(&self.device, &self.shader_dir, CONVERT_COMP)?;
            }
            let mut conversion = Conversion {
                source_layout: create_set_layout(
                    &self.device,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    vk::ShaderStageFlags::COMPUTE,
                    Some(self.nearest_sampler),
                )?,
                target_layout: vk::DescriptorSetLayout::null(),
                pipeline: None,
            };
            // Registered before the fallible steps so `destroy` sees it.
            let built = (|| -> Result<()> {
                conversion.target_layout = create_set_layout(
                    &self.device,
                    vk::DescriptorType::STORAGE_IMAGE,
                    vk::ShaderStageFlags::COMPUTE,
                    None,
                )?;
                conversion.pipeline = Some(ConversionPipeline::new(
                    &self.device,
                    conversion.source_layout,
                    conversion.target_layout,
                    self.convert_shader,
                )?);
                Ok(())
            })();
            resources.conversion = Some(conversion);
            built?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // Descriptor sets per slot
        // ─────────────────────────────────────────────────────────────────────
        for index in 0..self.slots.len() {
            let render_set = self.allocate_set(resources.render_set_layout)?;
            let (source_set, target_set) = match &resources.conversion {
                Some(conversion) => (
                    self.allocate_set(conversion.source_layout)?,
                    self.allocate_set(conversion.target_layout)?,
                ),
                None => (vk::DescriptorSet::null(), vk::DescriptorSet::null()),
            };
            let slot = &mut self.slots[index];
            slot.render_set = render_set;
            slot.source_set = source_set;
            slot.target_set = target_set;
        }

        if resources.conversion.is_some() {
            self.create_converted_images(resources.description)?;
        }
        Ok(())
    }

    /// (Re)allocate conversion targets and point the slot sets at them.
    fn create_converted_images(&mut self, description: ImageDescription) -> Result<()> {
        for index in 0..self.slots.len() {
            self.slots[index].converted = None;
            let converted = ConvertedImage::new(Arc::clone(&self.device), description.extent())?;
            let slot = &self.slots[index];
            self.write_image(slot.target_set, vk::DescriptorType::STORAGE_IMAGE, converted.view, vk::ImageLayout::GENERAL);
            self.write_image(
                slot.render_set,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                converted.view,
                vk::ImageLayout::GENERAL,
            );
            self.slots[index].converted = Some(converted);
        }
        Ok(())
    }

    fn release_format_resources(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.converted = None;
            slot.render_set = vk::DescriptorSet::null();
            slot.source_set = vk::DescriptorSet::null();
            slot.target_set = vk::DescriptorSet::null();
        }
        if let Some(resources) = self.format.take() {
            resources.destroy(&self.device.device);
        }
        unsafe {
            self.device
                .device
                .reset_descriptor_pool(self.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
        }
        .context("Failed to reset descriptor pool")?;
        Ok(())
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain is not available")
    }
}

impl Presenter for VulkanPresenter {
    type Storage = VulkanImage;

    fn frame_slot_count(&self) -> usize {
        self.slots.len()
    }

    fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.as_ref().map_or_else(vk::Extent2D::default, |swapchain| swapchain.extent)
    }

    fn recreate_swapchain(&mut self, window: WindowParameters) -> DisplayResult<()> {
        log::info!("Recreating swapchain for {}x{}", window.width, window.height);
        self.device.wait_idle()?;

        let old = self.swapchain.take();
        let created = Swapchain::new(
            Arc::clone(&self.device),
            self.surface_format,
            self.present_mode,
            window,
            self.render_pass,
            old.as_ref(),
        );
        drop(old);
        self.swapchain = Some(created?);
        Ok(())
    }

    fn acquire_swapchain_image(&mut self, slot: usize) -> DisplayResult<SwapchainImage> {
        // A failed recreation left no swapchain; the retry will build one.
        let Some(swapchain) = &self.swapchain else {
            return Ok(SwapchainImage::OutOfDate);
        };
        swapchain.acquire_next_image(self.acquire_timeout_ns, self.slots[slot].sync.image_available)
    }

    fn rebuild_pipelines(&mut self, description: ImageDescription) -> DisplayResult<()> {
        self.device.wait_idle()?;
        self.release_format_resources()?;
        self.generation += 1;

        let mut resources = FormatResources::new(description);
        if let Err(e) = self.build_format_resources(&mut resources) {
            for slot in &mut self.slots {
                slot.converted = None;
            }
            resources.destroy(&self.device.device);
            return Err(e.context(format!("Failed to build pipelines for {}", description)).into());
        }

        log::info!(
            "Render pipeline built for {} (YCbCr conversion: {}, compute conversion: {})",
            description,
            resources.ycbcr_conversion.is_some(),
            resources.conversion.is_some()
        );
        self.format = Some(resources);
        Ok(())
    }

    fn resize_targets(&mut self, description: ImageDescription) -> DisplayResult<()> {
        let Some(resources) = &mut self.format else {
            return self.rebuild_pipelines(description);
        };
        resources.description = description;
        if resources.conversion.is_some() {
            self.device.wait_idle()?;
            self.create_converted_images(description)?;
        }
        Ok(())
    }

    fn set_render_area(&mut self, area: RenderArea) {
        self.render_area = area;
    }

    fn bind_transfer_image(&mut self, slot: usize, image: &mut TransferImage<VulkanImage>) -> DisplayResult<()> {
        let resources = self.format.as_ref().context("Pipelines are not built")?;
        let view = image.storage_mut().view(self.generation, resources.ycbcr_conversion)?;
        let slot = &self.slots[slot];
        let set = if resources.conversion.is_some() {
            slot.source_set
        } else {
            slot.render_set
        };
        self.write_image(
            set,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            view,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        Ok(())
    }

    fn record_commands(
        &mut self,
        slot: usize,
        image: &mut TransferImage<VulkanImage>,
        swapchain_index: u32,
    ) -> DisplayResult<()> {
        let Self {
            device,
            swapchain,
            render_pass,
            clear_color,
            slots,
            format,
            render_area,
            ..
        } = self;
        let device = &device.device;
        let resources = format.as_ref().context("Pipelines are not built")?;
        let pipeline = resources.pipeline.as_ref().context("Render pipeline is missing")?;
        let swapchain = swapchain.as_ref().context("Swapchain is not available")?;
        let framebuffer = *swapchain
            .framebuffers
            .get(swapchain_index as usize)
            .context("Swapchain image index out of range")?;
        let slot = &mut slots[slot];
        let cb = slot.command_buffer;
        let transfer_image = image.storage().image;

        unsafe {
            device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cb, &begin_info)
                .context("Failed to begin command buffer")?;

            // ─────────────────────────────────────────────────────────────────
            // Host writes → shader reads
            // ─────────────────────────────────────────────────────────────────
            let sample_stage = if resources.conversion.is_some() {
                vk::PipelineStageFlags::COMPUTE_SHADER
            } else {
                vk::PipelineStageFlags::FRAGMENT_SHADER
            };
            let to_read = image.transition(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ);
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::HOST,
                sample_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier(transfer_image, to_read)],
            );

            // ─────────────────────────────────────────────────────────────────
            // Conversion pass
            // ─────────────────────────────────────────────────────────────────
            if let Some(conversion) = &resources.conversion {
                let compute = conversion.pipeline.as_ref().context("Conversion pipeline is missing")?;
                let target = slot.converted.as_mut().context("Conversion target is missing")?;

                let to_write = target.state.transition(vk::ImageLayout::GENERAL, vk::AccessFlags::SHADER_WRITE);
                device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[image_barrier(target.image, to_write)],
                );

                device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, compute.pipeline);
                device.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::COMPUTE,
                    compute.layout,
                    0,
                    &[slot.source_set, slot.target_set],
                    &[],
                );
                let (groups_x, groups_y) = dispatch_size(target.extent);
                device.cmd_dispatch(cb, groups_x, groups_y, 1);

                let to_sample = target.state.transition(vk::ImageLayout::GENERAL, vk::AccessFlags::SHADER_READ);
                device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[image_barrier(target.image, to_sample)],
                );
            }

            // ─────────────────────────────────────────────────────────────────
            // Render pass: clear, then the frame into the render area
            // ─────────────────────────────────────────────────────────────────
            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue { float32: *clear_color },
            }];
            let pass_info = vk::RenderPassBeginInfo::default()
                .render_pass(*render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: swapchain.extent,
                })
                .clear_values(&clear_values);
            device.cmd_begin_render_pass(cb, &pass_info, vk::SubpassContents::INLINE);

            if render_area.width > 0 && render_area.height > 0 {
                device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
                device.cmd_set_viewport(cb, 0, &[render_area.viewport()]);
                device.cmd_set_scissor(cb, 0, &[render_area.scissor()]);
                device.cmd_push_constants(
                    cb,
                    pipeline.layout,
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    render_area.push_constants(),
                );
                device.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    &[slot.render_set],
                    &[],
                );
                device.cmd_draw(cb, 6, 1, 0, 0);
            }

            device.cmd_end_render_pass(cb);

            // ─────────────────────────────────────────────────────────────────
            // Hand the transfer image back to the host
            // ─────────────────────────────────────────────────────────────────
            let to_host = image.transition(
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::HOST_WRITE | vk::AccessFlags::HOST_READ,
            );
            device.cmd_pipeline_barrier(
                cb,
                sample_stage,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier(transfer_image, to_host)],
            );

            device.end_command_buffer(cb).context("Failed to end command buffer")?;
        }
        Ok(())
    }

    fn submit(&mut self, slot: usize, image: &mut TransferImage<VulkanImage>) -> DisplayResult<()> {
        let slot = &self.slots[slot];
        let storage = image.storage_mut();
        storage.reset_fence()?;

        let wait_semaphores = [slot.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [slot.sync.render_finished];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], storage.fence)
        }
        .context("Failed to submit frame")?;
        storage.mark_submitted();
        Ok(())
    }

    fn present(&mut self, slot: usize, swapchain_index: u32) -> DisplayResult<PresentOutcome> {
        let swapchain = self.swapchain()?;
        swapchain.present(
            self.device.graphics_queue,
            swapchain_index,
            &[self.slots[slot].sync.render_finished],
        )
    }

    fn reset_frame_slot(&mut self, slot: usize) -> DisplayResult<()> {
        self.device.wait_idle()?;
        let fresh = FrameSync::new(&self.device)?;
        let frame_slot = self.slots.get_mut(slot).context("Frame slot out of range")?;
        let stale = std::mem::replace(&mut frame_slot.sync, fresh);
        stale.destroy(&self.device.device);
        Ok(())
    }
}

impl Drop for VulkanPresenter {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Presenter teardown: {:#}", e);
        }

        let device = &self.device.device;
        for slot in &mut self.slots {
            slot.converted = None;
            slot.sync.destroy(device);
        }
        if let Some(resources) = self.format.take() {
            resources.destroy(device);
        }
        self.swapchain = None;

        unsafe {
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_sampler(self.nearest_sampler, None);
            device.destroy_shader_module(self.vert_shader, None);
            device.destroy_shader_module(self.frag_shader, None);
            device.destroy_shader_module(self.convert_shader, None);
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}
