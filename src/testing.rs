// Test doubles for the backend traits
//
// MockDevice hands out heap-backed "memory" and exposes each image's fence as
// a flag the test flips, and counts storages so tests can check nothing leaks.
// MockPresenter scripts swapchain outcomes and counts every call so tests can
// assert what the display loop did.

use ash::vk;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DisplayConfig;
use crate::error::Result;
use crate::format::{is_multi_planar, packed_row_bytes};
use crate::gpu::{PresentOutcome, Presenter, SwapchainImage, TransferDevice};
use crate::image::{HostMapping, ImageDescription, TransferImage, WindowParameters};
use crate::render_area::RenderArea;

/// Config with short waits so timeouts don't slow the suite down.
pub fn test_config() -> DisplayConfig {
    DisplayConfig {
        initial_image_count: 2,
        available_wait_ms: 1,
        filled_wait_ms: 1,
        ..DisplayConfig::default()
    }
}

// =============================================================================
// DEVICE
// =============================================================================

pub struct MockStorage {
    pub id: u32,
    pixels: Vec<u8>,
    /// Fence state: true once the GPU is done with the image.
    released: Arc<AtomicBool>,
    destroyed: Arc<AtomicUsize>,
}

impl MockStorage {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for MockStorage {
    fn drop(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockDevice {
    ycbcr: bool,
    row_alignment: usize,
    rejected: Mutex<Vec<vk::Format>>,
    fences: Mutex<HashMap<u32, Arc<AtomicBool>>>,
    recreations: AtomicUsize,
    created: AtomicUsize,
    destroyed: Arc<AtomicUsize>,
}

impl MockDevice {
    pub fn with_ycbcr() -> Self {
        Self { ycbcr: true, ..Self::default() }
    }

    pub fn with_row_alignment(alignment: usize) -> Self {
        Self { row_alignment: alignment, ..Self::default() }
    }

    pub fn reject_format(&self, format: vk::Format) {
        self.rejected.lock().push(format);
    }

    pub fn storage(&self, id: u32) -> MockStorage {
        let released = Arc::new(AtomicBool::new(true));
        self.fences.lock().insert(id, Arc::clone(&released));
        self.created.fetch_add(1, Ordering::SeqCst);
        MockStorage {
            id,
            pixels: Vec::new(),
            released,
            destroyed: Arc::clone(&self.destroyed),
        }
    }

    /// Signal the completion fence of image `id`.
    pub fn signal(&self, id: u32) {
        if let Some(fence) = self.fences.lock().get(&id) {
            fence.store(true, Ordering::SeqCst);
        }
    }

    pub fn signal_all(&self) {
        for fence in self.fences.lock().values() {
            fence.store(true, Ordering::SeqCst);
        }
    }

    pub fn recreations(&self) -> usize {
        self.recreations.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Storages created and not yet dropped.
    pub fn live_storages(&self) -> usize {
        self.created() - self.destroyed()
    }
}

impl TransferDevice for MockDevice {
    type Storage = MockStorage;

    fn api_version(&self) -> u32 {
        if self.ycbcr {
            vk::API_VERSION_1_1
        } else {
            vk::API_VERSION_1_0
        }
    }

    fn ycbcr_supported(&self) -> bool {
        self.ycbcr
    }

    fn is_format_supported(&self, description: ImageDescription) -> Result<bool> {
        Ok(!self.rejected.lock().contains(&description.format))
    }

    fn create_storage(&self, id: u32) -> Result<MockStorage> {
        Ok(self.storage(id))
    }

    fn recreate_storage(&self, storage: &mut MockStorage, description: ImageDescription) -> Result<HostMapping> {
        self.recreations.fetch_add(1, Ordering::SeqCst);
        let row_bytes = packed_row_bytes(description.format, description.width).unwrap_or(description.width as usize);
        let row_pitch = row_bytes.next_multiple_of(self.row_alignment.max(1));
        let planes = if is_multi_planar(description.format) { 2 } else { 1 };
        storage.pixels = vec![0; row_pitch * description.height as usize * planes];

        let ptr = NonNull::new(storage.pixels.as_mut_ptr()).unwrap_or(NonNull::dangling());
        // SAFETY: the Vec's heap buffer lives until the next recreate.
        Ok(unsafe { HostMapping::new(ptr, storage.pixels.len(), row_pitch) })
    }

    fn is_released(&self, storage: &MockStorage) -> Result<bool> {
        Ok(storage.is_released())
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// WINDOW
// =============================================================================

/// Window whose size the test changes; a script of sizes is served first.
#[derive(Clone, Default)]
pub struct MockWindow {
    inner: Arc<Mutex<(VecDeque<WindowParameters>, WindowParameters)>>,
}

impl MockWindow {
    pub fn new(width: u32, height: u32) -> Self {
        let window = Self::default();
        window.set(width, height);
        window
    }

    pub fn set(&self, width: u32, height: u32) {
        self.inner.lock().1 = WindowParameters::new(width, height);
    }

    /// Serve these sizes on the next polls, then fall back to the current one.
    pub fn script(&self, sizes: &[(u32, u32)]) {
        let mut inner = self.inner.lock();
        inner.0.extend(sizes.iter().map(|&(w, h)| WindowParameters::new(w, h)));
    }
}

impl crate::gpu::WindowSource for MockWindow {
    fn window_parameters(&self) -> WindowParameters {
        let mut inner = self.inner.lock();
        match inner.0.pop_front() {
            Some(scripted) => scripted,
            None => inner.1,
        }
    }
}

// =============================================================================
// PRESENTER
// =============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub acquires: usize,
    pub swapchain_recreations: usize,
    pub rebuilds: usize,
    pub resizes: usize,
    pub binds: usize,
    pub records: usize,
    pub submits: usize,
    pub presents: usize,
}

pub struct MockPresenter {
    pub slots: usize,
    pub window: WindowParameters,
    pub calls: Calls,
    /// Acquire outcomes served in order; afterwards images are acquired normally.
    pub acquire_script: VecDeque<SwapchainImage>,
    pub always_out_of_date: bool,
    pub present_script: VecDeque<PresentOutcome>,
    pub fail_present: Option<vk::Result>,
    /// One-shot failures for the next bind or submit.
    pub fail_bind: Option<vk::Result>,
    pub fail_submit: Option<vk::Result>,
    pub fail_slot_reset: bool,
    /// Slots whose semaphores were replaced, in order.
    pub slot_resets: Vec<usize>,
    /// Bumped on every rebuild; stands in for pipeline handle identity.
    pub pipeline_generation: u64,
    pub built_for: Option<ImageDescription>,
    pub render_area: Option<RenderArea>,
    /// First pixel byte of every image as seen at record time.
    pub recorded_first_bytes: Vec<u8>,
    pub recorded_ids: Vec<u32>,
    next_index: u32,
}

impl MockPresenter {
    pub fn new(slots: usize, window: WindowParameters) -> Self {
        Self {
            slots,
            window,
            calls: Calls::default(),
            acquire_script: VecDeque::new(),
            always_out_of_date: false,
            present_script: VecDeque::new(),
            fail_present: None,
            fail_bind: None,
            fail_submit: None,
            fail_slot_reset: false,
            slot_resets: Vec::new(),
            pipeline_generation: 0,
            built_for: None,
            render_area: None,
            recorded_first_bytes: Vec::new(),
            recorded_ids: Vec::new(),
            next_index: 0,
        }
    }
}

impl Presenter for MockPresenter {
    type Storage = MockStorage;

    fn frame_slot_count(&self) -> usize {
        self.slots
    }

    fn swapchain_extent(&self) -> vk::Extent2D {
        self.window.extent()
    }

    fn recreate_swapchain(&mut self, window: WindowParameters) -> Result<()> {
        self.calls.swapchain_recreations += 1;
        self.window = window;
        Ok(())
    }

    fn acquire_swapchain_image(&mut self, _slot: usize) -> Result<SwapchainImage> {
        self.calls.acquires += 1;
        if self.always_out_of_date {
            return Ok(SwapchainImage::OutOfDate);
        }
        if let Some(scripted) = self.acquire_script.pop_front() {
            return Ok(scripted);
        }
        let index = self.next_index;
        self.next_index = (self.next_index + 1) % 3;
        Ok(SwapchainImage::Acquired { index, suboptimal: false })
    }

    fn rebuild_pipelines(&mut self, description: ImageDescription) -> Result<()> {
        self.calls.rebuilds += 1;
        self.pipeline_generation += 1;
        self.built_for = Some(description);
        Ok(())
    }

    fn resize_targets(&mut self, description: ImageDescription) -> Result<()> {
        self.calls.resizes += 1;
        self.built_for = Some(description);
        Ok(())
    }

    fn set_render_area(&mut self, area: RenderArea) {
        self.render_area = Some(area);
    }

    fn bind_transfer_image(&mut self, _slot: usize, _image: &mut TransferImage<MockStorage>) -> Result<()> {
        self.calls.binds += 1;
        if let Some(err) = self.fail_bind.take() {
            return Err(err.into());
        }
        Ok(())
    }

    fn record_commands(
        &mut self,
        _slot: usize,
        image: &mut TransferImage<MockStorage>,
        _swapchain_index: u32,
    ) -> Result<()> {
        self.calls.records += 1;
        self.recorded_first_bytes.push(image.pixels().first().copied().unwrap_or(0));
        self.recorded_ids.push(image.id());
        image.transition(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ);
        image.transition(
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::HOST_WRITE | vk::AccessFlags::HOST_READ,
        );
        Ok(())
    }

    fn submit(&mut self, _slot: usize, image: &mut TransferImage<MockStorage>) -> Result<()> {
        self.calls.submits += 1;
        if let Some(err) = self.fail_submit.take() {
            return Err(err.into());
        }
        image.storage().released.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn present(&mut self, _slot: usize, _swapchain_index: u32) -> Result<PresentOutcome> {
        self.calls.presents += 1;
        if let Some(err) = self.fail_present {
            return Err(crate::error::DisplayError::Present(err));
        }
        Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }

    fn reset_frame_slot(&mut self, slot: usize) -> Result<()> {
        if self.fail_slot_reset {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
        }
        self.slot_resets.push(slot);
        Ok(())
    }
}
