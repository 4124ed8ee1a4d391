// Seams between the presentation core and the graphics backend
//
// The core (pool, queues, display loop) only talks to these traits. The ash
// implementation lives in `backend`; tests use the mock in `testing`.

use ash::vk;

use crate::error::Result;
use crate::image::{HostMapping, ImageDescription, TransferImage, WindowParameters};
use crate::render_area::RenderArea;

/// Reports the current window size to the render thread.
pub trait WindowSource: Send {
    fn window_parameters(&self) -> WindowParameters;
}

impl<F> WindowSource for F
where
    F: Fn() -> WindowParameters + Send,
{
    fn window_parameters(&self) -> WindowParameters {
        self()
    }
}

/// Device operations shared by the producer and render threads.
///
/// Callers serialize `recreate_storage` against pipeline and swapchain
/// rebuilds with the display's device lock; the rest is safe to call freely.
pub trait TransferDevice: Send + Sync + 'static {
    /// GPU resources behind one transfer image (image, memory, completion fence).
    type Storage: Send + 'static;

    /// Device API version, as packed by `vk::make_api_version`.
    fn api_version(&self) -> u32;

    /// Whether sampler YCbCr conversion can be used.
    fn ycbcr_supported(&self) -> bool;

    /// Capability query. Unsupported formats yield `Ok(false)`.
    fn is_format_supported(&self, description: ImageDescription) -> Result<bool>;

    /// Storage without backing memory; sized by the first `recreate_storage`.
    fn create_storage(&self, id: u32) -> Result<Self::Storage>;

    /// Free the old backing memory (after its last GPU use completed) and
    /// allocate new memory for `description`.
    fn recreate_storage(&self, storage: &mut Self::Storage, description: ImageDescription) -> Result<HostMapping>;

    /// Non-blocking test of the storage's completion fence.
    fn is_released(&self, storage: &Self::Storage) -> Result<bool>;

    fn wait_idle(&self) -> Result<()>;
}

/// Outcome of a swapchain image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainImage {
    /// Usable image. `suboptimal` asks for a recreation once this frame is out.
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
    Timeout,
}

/// Outcome of a present that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn needs_recreation(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Render-thread side of the backend: swapchain, pipelines, command recording.
///
/// Slots index a fixed set of frame resources (command buffer, semaphores,
/// descriptor sets); the display loop lends one to each frame in flight.
pub trait Presenter {
    type Storage;

    fn frame_slot_count(&self) -> usize;

    /// Extent of the current swapchain images; the render area lives in it.
    fn swapchain_extent(&self) -> vk::Extent2D;

    fn recreate_swapchain(&mut self, window: WindowParameters) -> Result<()>;

    /// Acquire the next swapchain image, signalling the slot's acquire semaphore.
    fn acquire_swapchain_image(&mut self, slot: usize) -> Result<SwapchainImage>;

    /// Rebuild every format-dependent object for `description`.
    fn rebuild_pipelines(&mut self, description: ImageDescription) -> Result<()>;

    /// Same format, new size. Only size-dependent targets change.
    fn resize_targets(&mut self, description: ImageDescription) -> Result<()>;

    fn set_render_area(&mut self, area: RenderArea);

    fn bind_transfer_image(&mut self, slot: usize, image: &mut TransferImage<Self::Storage>) -> Result<()>;

    fn record_commands(
        &mut self,
        slot: usize,
        image: &mut TransferImage<Self::Storage>,
        swapchain_index: u32,
    ) -> Result<()>;

    /// Submit the slot's commands, signalling the image's completion fence.
    fn submit(&mut self, slot: usize, image: &mut TransferImage<Self::Storage>) -> Result<()>;

    fn present(&mut self, slot: usize, swapchain_index: u32) -> Result<PresentOutcome>;

    /// Give the slot fresh semaphores. Called when a frame is abandoned
    /// between acquire and submit, which leaves the acquire semaphore signalled.
    fn reset_frame_slot(&mut self, slot: usize) -> Result<()>;
}
