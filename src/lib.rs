// Low-latency video presentation on Vulkan
//
// A producer thread fills host-visible transfer images; the render thread
// samples them onto the swapchain. Images move between the two through a
// pair of channels and only come back once the GPU is done with them.

pub mod backend;
pub mod config;
pub mod display;
pub mod error;
pub mod format;
pub mod gpu;
pub mod image;
pub mod pool;
pub mod render_area;

#[cfg(test)]
mod testing;

pub use config::{Config, DisplayConfig};
pub use display::Display;
pub use error::{DisplayError, Result};
pub use gpu::{PresentOutcome, Presenter, SwapchainImage, TransferDevice, WindowSource};
pub use image::{ImageDescription, PixelsMut, TransferImage, WindowParameters};
pub use pool::Producer;
pub use render_area::RenderArea;

/// Display running on the ash backend.
pub type VulkanDisplay = Display<backend::VulkanDevice, backend::VulkanPresenter>;
/// Producer handle of a [`VulkanDisplay`].
pub type VulkanProducer = Producer<backend::VulkanDevice>;
