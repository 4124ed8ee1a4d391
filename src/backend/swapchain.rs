// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Recreated from the previous chain whenever the window changes size or a
// present reports it stale.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::pipeline::create_framebuffers;
use super::VulkanDevice;
use crate::error::DisplayError;
use crate::gpu::{PresentOutcome, SwapchainImage};
use crate::image::WindowParameters;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Surface format every swapchain of this device will use.
    pub fn surface_format(device: &VulkanDevice) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, device.surface)
        }?;
        choose_surface_format(&formats).context("No suitable surface format")
    }

    /// Create a swapchain for `window`, handing over from `old` if given.
    pub fn new(
        device: Arc<VulkanDevice>,
        format: vk::SurfaceFormatKHR,
        preferred_mode: vk::PresentModeKHR,
        window: WindowParameters,
        render_pass: vk::RenderPass,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        // Query surface capabilities
        let surface_caps = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, device.surface)
        }?;

        // Query supported present modes
        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, device.surface)
        }?;

        let present_mode = choose_present_mode(preferred_mode, &present_modes).context("Surface offers no present modes")?;
        if present_mode != preferred_mode {
            log::warn!("Present mode {:?} unavailable, using {:?}", preferred_mode, present_mode);
        }

        let extent = choose_extent(&surface_caps, window);
        let image_count = choose_image_count(&surface_caps);
        let composite_alpha = choose_composite_alpha(surface_caps.supported_composite_alpha);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.swapchain));

        let swapchain = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on Drop cleans up whatever was created.
        let mut chain = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            format,
            extent,
            present_mode,
            device,
        };

        chain.images = unsafe { chain.device.swapchain_loader.get_swapchain_images(swapchain) }?;

        for &image in &chain.images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { chain.device.device.create_image_view(&create_info, None) }
                .context("Failed to create image view")?;
            chain.image_views.push(view);
        }

        chain.framebuffers = create_framebuffers(&chain.device, &chain.image_views, render_pass, extent)?;

        log::info!(
            "Created swapchain: {}x{}, {:?}, {} images",
            extent.width,
            extent.height,
            present_mode,
            chain.images.len()
        );

        Ok(chain)
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, timeout_ns: u64, semaphore: vk::Semaphore) -> Result<SwapchainImage, DisplayError> {
        let result = unsafe {
            self.device
                .swapchain_loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(SwapchainImage::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SwapchainImage::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Ok(SwapchainImage::Timeout),
            Err(e) => Err(DisplayError::Vulkan(e)),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome, DisplayError> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(DisplayError::Present(e)),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.device.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

// =============================================================================
// SELECTION
// =============================================================================

/// Prefer sRGB BGRA, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// `preferred` if offered. IMMEDIATE falls back to MAILBOX, everything
/// falls back to FIFO, and failing that to the first available mode.
pub fn choose_present_mode(
    preferred: vk::PresentModeKHR,
    available: &[vk::PresentModeKHR],
) -> Option<vk::PresentModeKHR> {
    let offered = |mode: vk::PresentModeKHR| available.contains(&mode).then_some(mode);

    offered(preferred)
        .or_else(|| {
            if preferred == vk::PresentModeKHR::IMMEDIATE {
                offered(vk::PresentModeKHR::MAILBOX)
            } else {
                None
            }
        })
        .or_else(|| offered(vk::PresentModeKHR::FIFO))
        .or_else(|| available.first().copied())
}

/// Window size clamped to what the surface allows.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: WindowParameters) -> vk::Extent2D {
    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width.max(caps.min_image_extent.width)),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height.max(caps.min_image_extent.height)),
    }
}

/// At least two images; `max_image_count == 0` means no upper limit.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count.max(2);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Lowest supported composite-alpha bit.
pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    let raw = supported.as_raw();
    if raw == 0 {
        return vk::CompositeAlphaFlagsKHR::OPAQUE;
    }
    vk::CompositeAlphaFlagsKHR::from_raw(raw & raw.wrapping_neg())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: (u32, u32), max: (u32, u32), min_images: u32, max_images: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    #[test]
    fn present_mode_prefers_requested() {
        use ash::vk::PresentModeKHR as M;
        let all = [M::FIFO, M::FIFO_RELAXED, M::MAILBOX, M::IMMEDIATE];
        for mode in all {
            assert_eq!(choose_present_mode(mode, &all), Some(mode));
        }
    }

    #[test]
    fn present_mode_fallbacks() {
        use ash::vk::PresentModeKHR as M;
        assert_eq!(choose_present_mode(M::IMMEDIATE, &[M::FIFO, M::MAILBOX]), Some(M::MAILBOX));
        assert_eq!(choose_present_mode(M::IMMEDIATE, &[M::FIFO]), Some(M::FIFO));
        assert_eq!(choose_present_mode(M::MAILBOX, &[M::IMMEDIATE, M::FIFO]), Some(M::FIFO));
        assert_eq!(choose_present_mode(M::FIFO_RELAXED, &[M::FIFO]), Some(M::FIFO));
        assert_eq!(choose_present_mode(M::MAILBOX, &[M::IMMEDIATE]), Some(M::IMMEDIATE));
        assert_eq!(choose_present_mode(M::FIFO, &[]), None);
    }

    #[test]
    fn surface_format_prefers_srgb_bgra() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn extent_is_clamped_to_surface_limits() {
        let caps = caps((64, 64), (2048, 2048), 2, 8);
        let extent = choose_extent(&caps, WindowParameters::new(4000, 10));
        assert_eq!((extent.width, extent.height), (2048, 64));
        let extent = choose_extent(&caps, WindowParameters::new(1280, 720));
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn image_count_is_at_least_two() {
        assert_eq!(choose_image_count(&caps((1, 1), (8, 8), 1, 0)), 2);
        assert_eq!(choose_image_count(&caps((1, 1), (8, 8), 3, 0)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), (8, 8), 1, 1)), 1);
    }

    #[test]
    fn composite_alpha_takes_lowest_bit() {
        let supported = vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED;
        assert_eq!(choose_composite_alpha(supported), vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED);
        let every = vk::CompositeAlphaFlagsKHR::OPAQUE
            | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
            | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
            | vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(choose_composite_alpha(every), vk::CompositeAlphaFlagsKHR::OPAQUE);
    }
}
