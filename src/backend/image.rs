// Image helpers - transfer image storage and compute targets
//
// Transfer images are linear, host-visible and persistently mapped so the
// producer writes pixels straight into memory the GPU samples from. The
// compute conversion pass writes into optimal-tiled device-local images.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::Arc;

use super::VulkanDevice;
use crate::format::is_multi_planar;
use crate::image::{HostMapping, ImageDescription, ImageState};

/// Usage of every transfer image; capability queries must ask for the same.
pub const TRANSFER_IMAGE_USAGE: vk::ImageUsageFlags =
    vk::ImageUsageFlags::from_raw(vk::ImageUsageFlags::SAMPLED.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw());

/// Format written by the compute conversion pass.
pub const CONVERTED_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

// =============================================================================
// TRANSFER IMAGE STORAGE
// =============================================================================

/// GPU side of one transfer image: image, mapped memory, completion fence.
pub struct VulkanImage {
    device: Arc<VulkanDevice>,
    id: u32,
    pub(crate) image: vk::Image,
    allocation: Option<Allocation>,
    /// Signalled by the submission that last sampled this image.
    pub(crate) fence: vk::Fence,
    /// Whether `fence` belongs to a submission we have not waited for.
    submitted: bool,
    pub(crate) description: Option<ImageDescription>,
    view: vk::ImageView,
    /// Presenter generation the view was created for; 0 = no view.
    view_generation: u64,
}

impl VulkanImage {
    pub(crate) fn new(device: Arc<VulkanDevice>, id: u32) -> Result<Self> {
        // Unsignaled: reset before every submission anyway.
        let fence = unsafe { device.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .context("Failed to create transfer image fence")?;

        Ok(Self {
            device,
            id,
            image: vk::Image::null(),
            allocation: None,
            fence,
            submitted: false,
            description: None,
            view: vk::ImageView::null(),
            view_generation: 0,
        })
    }

    /// Replace image and memory with ones sized for `description`.
    pub(crate) fn recreate(&mut self, description: ImageDescription) -> Result<HostMapping> {
        self.wait_for_gpu()?;
        self.destroy_image();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(description.format)
            .extent(vk::Extent3D {
                width: description.width,
                height: description.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(TRANSFER_IMAGE_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);

        self.image = unsafe { self.device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create transfer image {} ({})", self.id, description))?;

        let requirements = unsafe { self.device.device.get_image_memory_requirements(self.image) };
        let allocation = self
            .device
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "transfer image",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("Failed to allocate transfer image memory")?;

        let bound = unsafe {
            self.device
                .device
                .bind_image_memory(self.image, allocation.memory(), allocation.offset())
        };
        let mapped = allocation.mapped_ptr();
        self.allocation = Some(allocation);
        bound.context("Failed to bind transfer image memory")?;

        // Multi-planar images report the layout of plane 0; later planes follow it.
        let aspect_mask = if is_multi_planar(description.format) {
            vk::ImageAspectFlags::PLANE_0
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let layout = unsafe {
            self.device.device.get_image_subresource_layout(
                self.image,
                vk::ImageSubresource {
                    aspect_mask,
                    mip_level: 0,
                    array_layer: 0,
                },
            )
        };

        let base = mapped.context("Transfer image memory is not host visible")?;
        let offset = layout.offset as usize;
        let len = requirements.size.saturating_sub(layout.offset) as usize;
        // SAFETY: the subresource offset lies inside the allocation.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(offset)) };

        self.description = Some(description);
        log::trace!(
            "Transfer image {} is {} (row pitch {}, {} bytes mapped)",
            self.id,
            description,
            layout.row_pitch,
            len
        );

        // SAFETY: the allocation stays mapped until `destroy_image`, which
        // only runs through `recreate` or `drop`.
        Ok(unsafe { HostMapping::new(ptr, len, layout.row_pitch as usize) })
    }

    pub(crate) fn is_released(&self) -> Result<bool> {
        if !self.submitted {
            return Ok(true);
        }
        let signalled = unsafe { self.device.device.get_fence_status(self.fence) }
            .context("Failed to query transfer image fence")?;
        Ok(signalled)
    }

    /// Reset the fence ahead of the submission that will signal it.
    pub(crate) fn reset_fence(&mut self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.fence]) }.context("Failed to reset transfer image fence")?;
        self.submitted = false;
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.submitted = true;
    }

    /// View for sampling, recreated when the presenter's format-dependent
    /// objects changed since it was made.
    pub(crate) fn view(
        &mut self,
        generation: u64,
        conversion: Option<vk::SamplerYcbcrConversion>,
    ) -> Result<vk::ImageView> {
        if self.view != vk::ImageView::null() && self.view_generation == generation {
            return Ok(self.view);
        }
        let description = self.description.context("Transfer image has no backing store yet")?;
        self.destroy_view();

        let mut conversion_info = vk::SamplerYcbcrConversionInfo::default();
        let mut view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(description.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(COLOR_RANGE);
        if let Some(conversion) = conversion {
            conversion_info = conversion_info.conversion(conversion);
            view_info = view_info.push_next(&mut conversion_info);
        }

        self.view = unsafe { self.device.device.create_image_view(&view_info, None) }
            .context("Failed to create transfer image view")?;
        self.view_generation = generation;
        Ok(self.view)
    }

    fn wait_for_gpu(&mut self) -> Result<()> {
        if self.submitted {
            unsafe { self.device.device.wait_for_fences(&[self.fence], true, u64::MAX) }
                .context("Failed waiting for transfer image fence")?;
            self.submitted = false;
        }
        Ok(())
    }

    fn destroy_view(&mut self) {
        if self.view != vk::ImageView::null() {
            unsafe { self.device.device.destroy_image_view(self.view, None) };
            self.view = vk::ImageView::null();
            self.view_generation = 0;
        }
    }

    fn destroy_image(&mut self) {
        self.destroy_view();
        if self.image != vk::Image::null() {
            unsafe { self.device.device.destroy_image(self.image, None) };
            self.image = vk::Image::null();
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::error!("Failed to free transfer image {} memory: {}", self.id, e);
            }
        }
        self.description = None;
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_gpu() {
            log::error!("Transfer image {}: {:#}", self.id, e);
        }
        self.destroy_image();
        unsafe { self.device.device.destroy_fence(self.fence, None) };
    }
}

// =============================================================================
// CONVERTED IMAGE
// =============================================================================

/// Device-local target of the compute conversion pass, kept in `GENERAL`.
pub struct ConvertedImage {
    device: Arc<VulkanDevice>,
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    pub extent: vk::Extent2D,
    pub state: ImageState,
}

impl ConvertedImage {
    pub fn new(device: Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(CONVERTED_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create converted image")?;

        // From here on Drop cleans up whatever was created.
        let mut converted = Self {
            device,
            image,
            view: vk::ImageView::null(),
            allocation: None,
            extent,
            state: ImageState::UNDEFINED,
        };

        let requirements = unsafe { converted.device.device.get_image_memory_requirements(image) };
        let allocation = converted
            .device
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "converted image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("Failed to allocate converted image memory")?;
        let bound = unsafe {
            converted
                .device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        converted.allocation = Some(allocation);
        bound.context("Failed to bind converted image memory")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(CONVERTED_FORMAT)
            .subresource_range(COLOR_RANGE);
        converted.view = unsafe { converted.device.device.create_image_view(&view_info, None) }
            .context("Failed to create converted image view")?;

        Ok(converted)
    }
}

impl Drop for ConvertedImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::error!("Failed to free converted image memory: {}", e);
            }
        }
    }
}

/// Barrier for a tracked image transition.
pub fn image_barrier<'a>(
    image: vk::Image,
    transition: crate::image::LayoutTransition,
) -> vk::ImageMemoryBarrier<'a> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access)
        .old_layout(transition.old_layout)
        .new_layout(transition.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_usage_is_sampled_copy_target() {
        assert!(TRANSFER_IMAGE_USAGE.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(TRANSFER_IMAGE_USAGE.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(!TRANSFER_IMAGE_USAGE.contains(vk::ImageUsageFlags::STORAGE));
    }

    #[test]
    fn barrier_carries_tracked_transition() {
        let mut state = ImageState::HOST_PREINITIALIZED;
        let transition = state.transition(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ);
        let barrier = image_barrier(vk::Image::null(), transition);

        assert_eq!(barrier.old_layout, vk::ImageLayout::PREINITIALIZED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::HOST_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(barrier.subresource_range.layer_count, 1);
    }
}
