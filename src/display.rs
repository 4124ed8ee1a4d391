// =============================================================================
// DISPLAY LOOP - render-thread side of the pool
// =============================================================================
//
// One call to `display_queued_image` runs one cycle:
//
//   WindowCheck → Reclaim → Dequeue → Preprocess → Reconfigure?
//     → AcquireSwapchain → Bind → Record → Submit → Present → Recycle
//
// Transfer images only go back to the producer once their fence has
// signalled, and frame slots are only taken once there is a frame to draw,
// so every exit path can hand both back without leaking pool members.
//
// A frame that fails after its swapchain image was acquired leaves the slot's
// acquire semaphore signalled. That slot is parked until the swapchain has
// been recreated and the slot has fresh semaphores.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DisplayConfig;
use crate::error::{DisplayError, Result};
use crate::gpu::{PresentOutcome, Presenter, SwapchainImage, TransferDevice, WindowSource};
use crate::image::{ImageDescription, TransferImage, WindowParameters};
use crate::pool::{Producer, Shared};
use crate::render_area::RenderArea;

/// Submitted image waiting for its fence, with the slot it borrowed.
struct RenderedImage<S> {
    image: TransferImage<S>,
    slot: usize,
}

/// Render-thread handle: owns the presenter and drives the display cycle.
pub struct Display<D, P>
where
    D: TransferDevice,
    P: Presenter<Storage = D::Storage>,
{
    // Field order is drop order: images, then GPU objects, then the device.
    rendered: VecDeque<RenderedImage<D::Storage>>,
    /// Reclaimed images the available queue had no room for yet.
    returning: VecDeque<TransferImage<D::Storage>>,
    presenter: P,
    window: Box<dyn WindowSource>,
    shared: Arc<Shared<D>>,

    free_slots: Vec<usize>,
    /// Slots whose acquire semaphore may still be signalled.
    abandoned_slots: Vec<usize>,
    window_parameters: WindowParameters,
    current_description: Option<ImageDescription>,
    swapchain_stale: bool,
    filled_wait: Duration,
    retry_limit: u32,
    destroyed: bool,
}

impl<D, P> Display<D, P>
where
    D: TransferDevice,
    P: Presenter<Storage = D::Storage>,
{
    /// Build the display and its producer handle around an initialized device
    /// and a presenter whose swapchain matches the window's current size.
    pub fn new(
        device: Arc<D>,
        presenter: P,
        window: Box<dyn WindowSource>,
        config: &DisplayConfig,
    ) -> Result<(Self, Producer<D>)> {
        let shared = Arc::new(Shared::new(device, config));

        let mut warm = Vec::with_capacity(config.initial_image_count);
        for _ in 0..config.initial_image_count {
            warm.push(shared.allocate_image()?);
        }
        let producer = Producer::new(Arc::clone(&shared), warm, config);

        let slots = presenter.frame_slot_count();
        log::info!(
            "Display ready: {} frame slots, {} warm transfer images, filled queue depth {}",
            slots,
            config.initial_image_count,
            config.filled_queue_depth.max(1)
        );

        let window_parameters = window.window_parameters();
        let display = Self {
            rendered: VecDeque::with_capacity(slots),
            returning: VecDeque::new(),
            presenter,
            window,
            shared,
            free_slots: (0..slots).rev().collect(),
            abandoned_slots: Vec::new(),
            window_parameters,
            current_description: None,
            swapchain_stale: false,
            filled_wait: config.filled_wait(),
            retry_limit: config.swapchain_retry_limit,
            destroyed: false,
        };
        Ok((display, producer))
    }

    /// Run one display cycle. `Ok(true)` iff a frame was presented.
    pub fn display_queued_image(&mut self) -> Result<bool> {
        // ─────────────────────────────────────────────────────────────────────
        // WindowCheck: nothing can be shown, keep the filled queue moving
        // ─────────────────────────────────────────────────────────────────────
        let window = self.window.window_parameters();
        if window.is_minimized() {
            self.discard_one_filled_image();
            return Ok(false);
        }

        // ─────────────────────────────────────────────────────────────────────
        // Reclaim images the GPU is done with
        // ─────────────────────────────────────────────────────────────────────
        self.reclaim_rendered_images()?;

        if self.swapchain_stale {
            let shared = Arc::clone(&self.shared);
            let _device = shared.device_lock.lock();
            self.recreate_swapchain(window)?;
        }

        if self.free_slots.is_empty() {
            log::trace!("All frame slots are in flight, skipping cycle");
            return Ok(false);
        }

        // ─────────────────────────────────────────────────────────────────────
        // Dequeue + Preprocess
        // ─────────────────────────────────────────────────────────────────────
        let Ok(mut image) = self.shared.filled.rx.recv_timeout(self.filled_wait) else {
            return Ok(false);
        };
        image.preprocess();

        let Some(slot) = self.free_slots.pop() else {
            self.release_to_producer(image);
            return Ok(false);
        };

        // ─────────────────────────────────────────────────────────────────────
        // Reconfigure? + AcquireSwapchain (under the device lock)
        // ─────────────────────────────────────────────────────────────────────
        let swapchain_index = match self.prepare_frame(slot, image.description()) {
            Ok(Some(index)) => index,
            Ok(None) => {
                // Minimized while the swapchain was being recreated.
                self.free_slots.push(slot);
                self.release_to_producer(image);
                self.discard_one_filled_image();
                return Ok(false);
            }
            Err(err) => {
                self.free_slots.push(slot);
                self.release_to_producer(image);
                return Err(err);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // Bind + Record + Submit
        // ─────────────────────────────────────────────────────────────────────
        if let Err(err) = self.draw_frame(slot, &mut image, swapchain_index) {
            log::warn!("Frame abandoned after swapchain acquire: {err}");
            self.abandoned_slots.push(slot);
            self.swapchain_stale = true;
            self.release_to_producer(image);
            return Err(err);
        }

        // ─────────────────────────────────────────────────────────────────────
        // Present + Recycle: the fence signals whatever present reports
        // ─────────────────────────────────────────────────────────────────────
        let outcome = self.presenter.present(slot, swapchain_index);
        self.rendered.push_back(RenderedImage { image, slot });

        let outcome = outcome?;
        if outcome.needs_recreation() {
            log::debug!("Present reported {:?}, swapchain will be recreated", outcome);
            self.swapchain_stale = true;
        }
        Ok(true)
    }

    /// React to a window resize. Equal sizes and minimized windows are ignored.
    pub fn window_parameters_changed(&mut self, window: WindowParameters) -> Result<()> {
        if window == self.window_parameters || window.is_minimized() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let _device = shared.device_lock.lock();
        self.recreate_swapchain(window)
    }

    /// Poll the window source and apply its current size.
    pub fn refresh_window_parameters(&mut self) -> Result<()> {
        let window = self.window.window_parameters();
        self.window_parameters_changed(window)
    }

    /// Wait for the GPU, then free every transfer image this side can reach.
    /// Both threads must have stopped calling into the display.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        log::info!("Destroying display ({} images in flight)", self.rendered.len());

        let idle = self.shared.device.wait_idle();
        self.rendered.clear();
        self.returning.clear();
        drop(self.shared.filled.drain());
        drop(self.shared.available.drain());
        idle
    }

    /// Images submitted to the GPU whose fences have not been seen signalled.
    pub fn in_flight_count(&self) -> usize {
        self.rendered.len()
    }

    pub fn free_slot_count(&self) -> usize {
        self.free_slots.len()
    }

    /// Slots waiting for a swapchain recreation before they can be reused.
    pub fn abandoned_slot_count(&self) -> usize {
        self.abandoned_slots.len()
    }

    /// Description the pipelines are currently built for.
    pub fn current_description(&self) -> Option<ImageDescription> {
        self.current_description
    }

    pub fn window_parameters(&self) -> WindowParameters {
        self.window_parameters
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    // =========================================================================
    // CYCLE STEPS
    // =========================================================================

    /// Fence test in submission order; stops at the first busy image.
    fn reclaim_rendered_images(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        {
            let _device = shared.device_lock.lock();
            while let Some(front) = self.rendered.front() {
                if !shared.device.is_released(front.image.storage())? {
                    break;
                }
                if let Some(RenderedImage { image, slot }) = self.rendered.pop_front() {
                    self.free_slots.push(slot);
                    self.returning.push_back(image);
                }
            }
        }
        self.flush_returning();
        Ok(())
    }

    /// Returns the swapchain image index, or `None` if the window was
    /// minimized while retrying.
    fn prepare_frame(&mut self, slot: usize, description: Option<ImageDescription>) -> Result<Option<u32>> {
        let shared = Arc::clone(&self.shared);
        let _device = shared.device_lock.lock();

        if let Some(description) = description {
            self.reconfigure(description)?;
        }
        self.acquire_swapchain_image(slot)
    }

    /// Everything between a successful acquire and present.
    fn draw_frame(&mut self, slot: usize, image: &mut TransferImage<D::Storage>, swapchain_index: u32) -> Result<()> {
        {
            let shared = Arc::clone(&self.shared);
            let _device = shared.device_lock.lock();
            self.presenter.bind_transfer_image(slot, image)?;
        }
        self.presenter.record_commands(slot, image, swapchain_index)?;
        self.presenter.submit(slot, image)
    }

    /// Rebuild pipelines on a format change, resize targets on a size change.
    fn reconfigure(&mut self, description: ImageDescription) -> Result<()> {
        match self.current_description {
            Some(current) if current == description => return Ok(()),
            Some(current) if current.same_format(&description) => {
                log::debug!("Image size changed from {} to {}", current, description);
                self.presenter.resize_targets(description)?;
            }
            _ => {
                log::info!("Reconfiguring render pipeline for {}", description);
                // A failed rebuild leaves nothing valid behind.
                self.current_description = None;
                self.presenter.rebuild_pipelines(description)?;
            }
        }
        self.current_description = Some(description);
        self.update_render_area();
        Ok(())
    }

    fn acquire_swapchain_image(&mut self, slot: usize) -> Result<Option<u32>> {
        let mut attempt = 0;
        loop {
            match self.presenter.acquire_swapchain_image(slot)? {
                SwapchainImage::Acquired { index, suboptimal } => {
                    if suboptimal {
                        self.swapchain_stale = true;
                    }
                    return Ok(Some(index));
                }
                failed => {
                    attempt += 1;
                    if attempt > self.retry_limit {
                        return Err(DisplayError::SwapchainUnavailable { attempts: self.retry_limit });
                    }
                    log::debug!(
                        "Swapchain acquire returned {:?}, recreating ({}/{})",
                        failed,
                        attempt,
                        self.retry_limit
                    );
                    let window = self.window.window_parameters();
                    if window.is_minimized() {
                        return Ok(None);
                    }
                    self.recreate_swapchain(window)?;
                }
            }
        }
    }

    /// Caller holds the device lock.
    fn recreate_swapchain(&mut self, window: WindowParameters) -> Result<()> {
        self.presenter.recreate_swapchain(window)?;
        self.window_parameters = window;
        self.swapchain_stale = false;
        self.update_render_area();
        self.reset_abandoned_slots();
        Ok(())
    }

    /// The acquired images were released with the old swapchain; the slots
    /// still need new semaphores. Failures stay parked for the next recreation.
    fn reset_abandoned_slots(&mut self) {
        for slot in std::mem::take(&mut self.abandoned_slots) {
            match self.presenter.reset_frame_slot(slot) {
                Ok(()) => {
                    log::debug!("Frame slot {} reset", slot);
                    self.free_slots.push(slot);
                }
                Err(err) => {
                    log::error!("Frame slot {} could not be reset: {}", slot, err);
                    self.abandoned_slots.push(slot);
                    self.swapchain_stale = true;
                }
            }
        }
    }

    fn update_render_area(&mut self) {
        if let Some(description) = self.current_description {
            let area = RenderArea::fit(self.presenter.swapchain_extent(), description.extent());
            self.presenter.set_render_area(area);
        }
    }

    fn discard_one_filled_image(&mut self) {
        if let Ok(image) = self.shared.filled.rx.try_recv() {
            log::trace!("Dropping frame in transfer image {} without display", image.id());
            self.release_to_producer(image);
        }
    }

    fn release_to_producer(&mut self, mut image: TransferImage<D::Storage>) {
        image.clear_preprocess();
        self.returning.push_back(image);
        self.flush_returning();
    }

    fn flush_returning(&mut self) {
        while let Some(image) = self.returning.pop_front() {
            if let Err(full) = self.shared.available.tx.try_send(image) {
                self.returning.push_front(full.into_inner());
                break;
            }
        }
    }
}

impl<D, P> Drop for Display<D, P>
where
    D: TransferDevice,
    P: Presenter<Storage = D::Storage>,
{
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::error!("Display teardown failed: {err}");
        }
    }
}
