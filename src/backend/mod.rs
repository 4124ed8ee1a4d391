// Backend module - Vulkan implementation of the presentation traits
//
// Design: Thin wrapper around ash, one owner per Vulkan object
// `VulkanDevice` is shared by both threads, `VulkanPresenter` lives on the
// render thread.

pub mod device;
pub mod image;
pub mod pipeline;
pub mod presenter;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use image::VulkanImage;
pub use presenter::VulkanPresenter;
pub use swapchain::Swapchain;
