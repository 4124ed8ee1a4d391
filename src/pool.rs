// Transfer image pool - producer side
//
// Images live in exactly one place at a time:
//   producer-local list ─┐
//   available queue ─────┴─> producer ──queue_image──> filled queue
//                                                         │
//   available queue <──fence signalled── rendered <──display_queued_image
//
// The local list is only touched by the producer thread and avoids a lock
// round-trip for images the producer just handed back to itself.

use ash::vk;
use crossbeam_channel::{Receiver, SendError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DisplayConfig;
use crate::error::{DisplayError, Result};
use crate::format::{is_ycbcr_format, packed_row_bytes};
use crate::gpu::TransferDevice;
use crate::image::{ImageDescription, TransferImage};

/// One of the two pool queues. Both channel ends live in `Shared`, so either
/// thread can push and pop, and the channel never disconnects while the pool
/// is alive.
pub(crate) struct FrameQueue<T> {
    pub(crate) tx: Sender<T>,
    pub(crate) rx: Receiver<T>,
}

impl<T> FrameQueue<T> {
    /// `capacity` of zero is treated as one.
    fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    fn unbounded() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take everything currently queued, oldest first.
    pub(crate) fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }
}

/// State shared by the producer and render threads.
pub(crate) struct Shared<D: TransferDevice> {
    pub(crate) device: Arc<D>,
    /// Serializes device-object mutation: image recreation, pipeline
    /// rebuilds, swapchain recreation.
    pub(crate) device_lock: Mutex<()>,
    pub(crate) available: FrameQueue<TransferImage<D::Storage>>,
    pub(crate) filled: FrameQueue<TransferImage<D::Storage>>,
    image_count: AtomicU32,
}

impl<D: TransferDevice> Shared<D> {
    pub(crate) fn new(device: Arc<D>, config: &DisplayConfig) -> Self {
        Self {
            device,
            device_lock: Mutex::new(()),
            available: match config.available_queue_capacity {
                Some(capacity) => FrameQueue::bounded(capacity),
                None => FrameQueue::unbounded(),
            },
            filled: FrameQueue::bounded(config.filled_queue_depth),
            image_count: AtomicU32::new(0),
        }
    }

    /// New pool member with the next free id.
    pub(crate) fn allocate_image(&self) -> Result<TransferImage<D::Storage>> {
        let id = self.image_count.fetch_add(1, Ordering::Relaxed);
        let storage = self.device.create_storage(id)?;
        Ok(TransferImage::new(id, storage))
    }

    pub(crate) fn image_count(&self) -> u32 {
        self.image_count.load(Ordering::Relaxed)
    }

    fn check_description(&self, description: ImageDescription) -> Result<()> {
        if !description.is_valid() {
            return Err(DisplayError::InvalidDescription(description));
        }
        if is_ycbcr_format(description.format) && !self.device.ycbcr_supported() {
            let version = self.device.api_version();
            return Err(DisplayError::UnsupportedFormat {
                format: description.format,
                reason: format!(
                    "YCbCr sampling needs Vulkan 1.1 with samplerYcbcrConversion, device offers {}.{}",
                    vk::api_version_major(version),
                    vk::api_version_minor(version),
                ),
            });
        }
        Ok(())
    }
}

/// Producer-thread handle onto the pool.
///
/// Exactly one exists per display; `&mut self` on every method keeps it to
/// a single caller.
pub struct Producer<D: TransferDevice> {
    pub(crate) shared: Arc<Shared<D>>,
    pub(crate) local: Vec<TransferImage<D::Storage>>,
    available_wait: Duration,
    blocking_timeout: Option<Duration>,
}

impl<D: TransferDevice> Producer<D> {
    pub(crate) fn new(
        shared: Arc<Shared<D>>,
        local: Vec<TransferImage<D::Storage>>,
        config: &DisplayConfig,
    ) -> Self {
        Self {
            shared,
            local,
            available_wait: config.available_wait(),
            blocking_timeout: config.blocking_queue_timeout(),
        }
    }

    /// Borrow a transfer image sized for `description`.
    ///
    /// Never fails for lack of free images; the pool grows instead.
    pub fn acquire_image(&mut self, description: ImageDescription) -> Result<TransferImage<D::Storage>> {
        self.shared.check_description(description)?;

        let mut image = self.take_image()?;
        if image.description() != Some(description) {
            if let Err(err) = self.resize(&mut image, description) {
                self.local.push(image);
                return Err(err);
            }
        }
        Ok(image)
    }

    fn take_image(&mut self) -> Result<TransferImage<D::Storage>> {
        if let Some(image) = self.local.pop() {
            return Ok(image);
        }
        if let Ok(image) = self.shared.available.rx.recv_timeout(self.available_wait) {
            return Ok(image);
        }

        let image = self.shared.allocate_image()?;
        log::warn!(
            "Transfer image pool grew to {} images, display is falling behind the producer",
            self.shared.image_count()
        );
        Ok(image)
    }

    fn resize(&self, image: &mut TransferImage<D::Storage>, description: ImageDescription) -> Result<()> {
        let _device = self.shared.device_lock.lock();
        if !self.shared.device.is_format_supported(description)? {
            return Err(DisplayError::UnsupportedFormat {
                format: description.format,
                reason: format!("device cannot sample {} linear images", description),
            });
        }
        log::debug!("Recreating transfer image {} as {}", image.id(), description);
        image.recreate(&*self.shared.device, description)
    }

    /// Hand a written image to the render thread. Returns whether a frame was
    /// discarded along the way.
    ///
    /// A discardable image replaces whatever is still waiting in a full filled
    /// queue; the superseded frame comes back to the producer. Otherwise the
    /// call blocks until the render thread takes a frame, for at most the
    /// configured timeout, after which this image is the one dropped.
    pub fn queue_image(&mut self, image: TransferImage<D::Storage>, discardable: bool) -> bool {
        if discardable {
            return self.supersede(image);
        }

        let filled = &self.shared.filled.tx;
        let pushed = match self.blocking_timeout {
            None => filled.send(image).map_err(|SendError(image)| image),
            Some(timeout) => filled.send_timeout(image, timeout).map_err(SendTimeoutError::into_inner),
        };
        match pushed {
            Ok(()) => false,
            Err(image) => {
                log::debug!("Filled queue stayed full for {:?}, dropping frame", self.blocking_timeout);
                self.recycle(image);
                true
            }
        }
    }

    /// Push without waiting, evicting the oldest queued frames until there is room.
    fn supersede(&mut self, mut image: TransferImage<D::Storage>) -> bool {
        let mut superseded = false;
        loop {
            match self.shared.filled.tx.try_send(image) {
                Ok(()) => return superseded,
                Err(TrySendError::Full(back)) => {
                    image = back;
                    // The render thread may have taken it first; then the retry fits.
                    if let Ok(old) = self.shared.filled.rx.try_recv() {
                        log::trace!("Frame in transfer image {} superseded before display", old.id());
                        self.recycle(old);
                        superseded = true;
                    }
                }
                Err(TrySendError::Disconnected(back)) => {
                    self.recycle(back);
                    return true;
                }
            }
        }
    }

    /// Give an image back without displaying it.
    pub fn discard_image(&mut self, image: TransferImage<D::Storage>) {
        self.recycle(image);
    }

    /// Copy `frame` into a fresh image and queue it non-discardably.
    ///
    /// `frame` is either already laid out with the image's row pitch or,
    /// for packed single-plane formats, tightly packed rows. Frames longer
    /// than the image's mapped memory are refused with `FrameSize`.
    ///
    /// Multi-planar frames are copied as one block, so they must already
    /// follow the image's plane layout (see [`row_pitch`](Self::row_pitch)
    /// and the mapped length); planes are not relocated.
    pub fn copy_and_queue_image(&mut self, frame: &[u8], description: ImageDescription) -> Result<()> {
        let mut image = self.acquire_image(description)?;
        if let Err(err) = copy_frame(&mut image, frame, description) {
            self.discard_image(image);
            return Err(err);
        }
        self.queue_image(image, false);
        Ok(())
    }

    /// Row pitch the device uses for `description`.
    pub fn row_pitch(&mut self, description: ImageDescription) -> Result<usize> {
        let image = self.acquire_image(description)?;
        let pitch = image.row_pitch();
        self.discard_image(image);
        Ok(pitch)
    }

    pub fn is_image_description_supported(&self, description: ImageDescription) -> Result<bool> {
        if !description.is_valid() {
            return Ok(false);
        }
        if is_ycbcr_format(description.format) && !self.shared.device.ycbcr_supported() {
            return Ok(false);
        }
        let _device = self.shared.device_lock.lock();
        self.shared.device.is_format_supported(description)
    }

    pub fn is_ycbcr_supported(&self) -> bool {
        self.shared.device.ycbcr_supported()
    }

    /// Device API version, as packed by `vk::make_api_version`.
    pub fn vulkan_version(&self) -> u32 {
        self.shared.device.api_version()
    }

    /// Images allocated so far, across all owners.
    pub fn image_count(&self) -> u32 {
        self.shared.image_count()
    }

    fn recycle(&mut self, mut image: TransferImage<D::Storage>) {
        image.clear_preprocess();
        self.local.push(image);
    }
}

impl<D: TransferDevice> Drop for Producer<D> {
    fn drop(&mut self) {
        // Whatever the available queue refuses is freed right here.
        for image in self.local.drain(..) {
            let _ = self.shared.available.tx.try_send(image);
        }
    }
}

fn copy_frame<S>(image: &mut TransferImage<S>, frame: &[u8], description: ImageDescription) -> Result<()> {
    let row_pitch = image.row_pitch();
    let height = description.height as usize;
    let pitched = row_pitch * height;
    let pixels = image.pixels_mut();

    if frame.len() > pixels.len() {
        return Err(DisplayError::FrameSize {
            description,
            expected: pixels.len(),
            actual: frame.len(),
        });
    }
    if frame.len() >= pitched && pitched > 0 {
        pixels[..frame.len()].copy_from_slice(frame);
        return Ok(());
    }

    let packed = packed_row_bytes(description.format, description.width);
    if let Some(row_bytes) = packed {
        if frame.len() == row_bytes * height && row_bytes <= row_pitch {
            for (src, dst) in frame.chunks_exact(row_bytes).zip(pixels.chunks_mut(row_pitch)) {
                dst[..row_bytes].copy_from_slice(src);
            }
            return Ok(());
        }
    }

    Err(DisplayError::FrameSize {
        description,
        expected: packed.map_or(pitched, |row_bytes| row_bytes * height),
        actual: frame.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MockDevice};

    const RGBA_640: ImageDescription = ImageDescription::new(640, 480, vk::Format::R8G8B8A8_UNORM);

    fn producer(device: &Arc<MockDevice>, initial: usize) -> Producer<MockDevice> {
        let config = DisplayConfig {
            initial_image_count: initial,
            ..test_config()
        };
        producer_with(device, &config)
    }

    fn producer_with(device: &Arc<MockDevice>, config: &DisplayConfig) -> Producer<MockDevice> {
        let shared = Arc::new(Shared::new(Arc::clone(device), config));
        let local = (0..config.initial_image_count)
            .map(|_| shared.allocate_image().unwrap())
            .collect();
        Producer::new(shared, local, config)
    }

    #[test]
    fn warm_images_are_used_before_growing() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 2);

        let first = producer.acquire_image(RGBA_640).unwrap();
        let second = producer.acquire_image(RGBA_640).unwrap();
        assert_eq!(producer.image_count(), 2);

        let third = producer.acquire_image(RGBA_640).unwrap();
        assert_eq!(producer.image_count(), 3);
        assert_eq!(third.id(), 2);
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn available_queue_feeds_acquire() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 0);
        let image = producer.acquire_image(RGBA_640).unwrap();
        let id = image.id();
        producer.shared.available.tx.try_send(image).unwrap();

        let again = producer.acquire_image(RGBA_640).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(producer.image_count(), 1);
    }

    #[test]
    fn recreates_only_when_description_changes() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 1);

        let image = producer.acquire_image(RGBA_640).unwrap();
        producer.discard_image(image);
        let image = producer.acquire_image(RGBA_640).unwrap();
        assert_eq!(device.recreations(), 1);
        producer.discard_image(image);

        let bigger = ImageDescription::new(1280, 720, RGBA_640.format);
        let image = producer.acquire_image(bigger).unwrap();
        assert_eq!(device.recreations(), 2);
        assert_eq!(image.description(), Some(bigger));
        assert_eq!(image.row_pitch(), 1280 * 4);
    }

    #[test]
    fn ycbcr_refused_without_device_support() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 1);
        let nv12 = ImageDescription::new(64, 64, vk::Format::G8_B8R8_2PLANE_420_UNORM);

        let err = producer.acquire_image(nv12).unwrap_err();
        assert!(matches!(err, DisplayError::UnsupportedFormat { format, .. } if format == nv12.format));
        assert!(err.to_string().contains("1.1"));
        assert!(!producer.is_image_description_supported(nv12).unwrap());
        assert!(!producer.is_ycbcr_supported());
    }

    #[test]
    fn ycbcr_accepted_with_device_support() {
        let device = Arc::new(MockDevice::with_ycbcr());
        let mut producer = producer(&device, 1);
        let uyvy = ImageDescription::new(64, 64, vk::Format::G8B8G8R8_422_UNORM);

        let image = producer.acquire_image(uyvy).unwrap();
        assert_eq!(image.row_pitch(), 128);
        assert!(producer.is_image_description_supported(uyvy).unwrap());
    }

    #[test]
    fn unsupported_format_returns_image_to_pool() {
        let device = Arc::new(MockDevice::default());
        device.reject_format(vk::Format::R16G16B16A16_UNORM);
        let mut producer = producer(&device, 1);
        let wide = ImageDescription::new(8, 8, vk::Format::R16G16B16A16_UNORM);

        assert!(matches!(
            producer.acquire_image(wide),
            Err(DisplayError::UnsupportedFormat { .. })
        ));
        assert_eq!(producer.local.len(), 1);
        assert_eq!(producer.image_count(), 1);
        assert!(!producer.is_image_description_supported(wide).unwrap());
    }

    #[test]
    fn invalid_descriptions_are_rejected() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 1);
        let empty = ImageDescription::new(0, 480, vk::Format::R8G8B8A8_UNORM);
        assert!(matches!(producer.acquire_image(empty), Err(DisplayError::InvalidDescription(_))));
        assert!(!producer.is_image_description_supported(empty).unwrap());
    }

    #[test]
    fn discardable_queue_supersedes_older_frame() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 2);
        let first = producer.acquire_image(RGBA_640).unwrap();
        let second = producer.acquire_image(RGBA_640).unwrap();
        let (first_id, second_id) = (first.id(), second.id());

        assert!(!producer.queue_image(first, true));
        assert!(producer.queue_image(second, true));

        assert_eq!(producer.local.len(), 1);
        assert_eq!(producer.local[0].id(), first_id);
        let queued = producer.shared.filled.rx.try_recv().unwrap();
        assert_eq!(queued.id(), second_id);
    }

    #[test]
    fn discardable_queue_evicts_oldest_when_deeper() {
        let device = Arc::new(MockDevice::default());
        let config = DisplayConfig {
            initial_image_count: 3,
            filled_queue_depth: 2,
            ..test_config()
        };
        let mut producer = producer_with(&device, &config);
        let images: Vec<_> = (0..3).map(|_| producer.acquire_image(RGBA_640).unwrap()).collect();
        let ids: Vec<u32> = images.iter().map(|image| image.id()).collect();

        let discarded: Vec<bool> = images.into_iter().map(|image| producer.queue_image(image, true)).collect();
        assert_eq!(discarded, vec![false, false, true]);

        assert_eq!(producer.local.len(), 1);
        assert_eq!(producer.local[0].id(), ids[0]);
        let queued: Vec<u32> = producer.shared.filled.drain().iter().map(|image| image.id()).collect();
        assert_eq!(queued, ids[1..].to_vec());
    }

    #[test]
    fn superseded_frame_loses_its_preprocess_callback() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 2);
        let mut first = producer.acquire_image(RGBA_640).unwrap();
        first.set_preprocess(|_| {});
        producer.queue_image(first, true);
        let second = producer.acquire_image(RGBA_640).unwrap();
        producer.queue_image(second, true);

        assert!(!producer.local[0].has_preprocess());
    }

    #[test]
    fn blocking_queue_gives_up_after_timeout() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 2);
        producer.blocking_timeout = Some(Duration::from_millis(5));

        let first = producer.acquire_image(RGBA_640).unwrap();
        let second = producer.acquire_image(RGBA_640).unwrap();
        assert!(!producer.queue_image(first, false));
        assert!(producer.queue_image(second, false));
        assert_eq!(producer.shared.filled.len(), 1);
        assert_eq!(producer.local.len(), 1);
    }

    #[test]
    fn blocking_queue_waits_for_render_thread() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 2);
        producer.blocking_timeout = None;

        let first = producer.acquire_image(RGBA_640).unwrap();
        let first_id = first.id();
        assert!(!producer.queue_image(first, false));

        let shared = Arc::clone(&producer.shared);
        let render = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            shared.filled.rx.recv_timeout(Duration::from_secs(5)).map(|image| image.id())
        });

        let second = producer.acquire_image(RGBA_640).unwrap();
        let second_id = second.id();
        assert!(!producer.queue_image(second, false));
        assert_eq!(render.join().unwrap(), Ok(first_id));
        assert_eq!(producer.shared.filled.rx.try_recv().map(|image| image.id()), Ok(second_id));
    }

    #[test]
    fn acquire_waits_for_recycled_image_before_growing() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 1);
        producer.available_wait = Duration::from_secs(5);
        let image = producer.acquire_image(RGBA_640).unwrap();
        let id = image.id();

        let shared = Arc::clone(&producer.shared);
        let render = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            shared.available.tx.send(image).unwrap();
        });

        let again = producer.acquire_image(RGBA_640).unwrap();
        render.join().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(producer.image_count(), 1);
    }

    #[test]
    fn copy_respects_row_pitch() {
        let device = Arc::new(MockDevice::with_row_alignment(64));
        let mut producer = producer(&device, 1);
        let description = ImageDescription::new(3, 2, vk::Format::R8G8B8A8_UNORM);
        let frame: Vec<u8> = (0..24).collect();

        producer.copy_and_queue_image(&frame, description).unwrap();

        let image = producer.shared.filled.rx.try_recv().unwrap();
        assert_eq!(image.row_pitch(), 64);
        assert_eq!(&image.pixels()[..12], &frame[..12]);
        assert_eq!(&image.pixels()[64..76], &frame[12..]);
        assert_eq!(image.pixels()[12], 0);
    }

    #[test]
    fn copy_accepts_pre_pitched_frames() {
        let device = Arc::new(MockDevice::with_row_alignment(64));
        let mut producer = producer(&device, 1);
        let description = ImageDescription::new(3, 2, vk::Format::R8G8B8A8_UNORM);
        let frame = vec![7u8; 128];

        producer.copy_and_queue_image(&frame, description).unwrap();
        let image = producer.shared.filled.rx.try_recv().unwrap();
        assert!(image.pixels()[..128].iter().all(|&b| b == 7));
    }

    #[test]
    fn short_frame_is_rejected_and_image_kept() {
        let device = Arc::new(MockDevice::default());
        let mut producer = producer(&device, 1);
        let err = producer.copy_and_queue_image(&[0u8; 10], RGBA_640).unwrap_err();
        assert!(matches!(
            err,
            DisplayError::FrameSize { expected, actual: 10, .. } if expected == 640 * 4 * 480
        ));
        assert_eq!(producer.local.len(), 1);
        assert!(producer.shared.filled.is_empty());
    }

    #[test]
    fn long_frame_is_rejected_and_image_kept() {
        let device = Arc::new(MockDevice::with_row_alignment(64));
        let mut producer = producer(&device, 1);
        let description = ImageDescription::new(3, 2, vk::Format::R8G8B8A8_UNORM);

        let err = producer.copy_and_queue_image(&[1u8; 129], description).unwrap_err();
        assert!(matches!(err, DisplayError::FrameSize { expected: 128, actual: 129, .. }));
        assert!(err.is_capability_error());
        assert_eq!(producer.local.len(), 1);
        assert!(producer.shared.filled.is_empty());
    }

    #[test]
    fn row_pitch_query_keeps_image() {
        let device = Arc::new(MockDevice::with_row_alignment(256));
        let mut producer = producer(&device, 1);
        assert_eq!(producer.row_pitch(RGBA_640).unwrap(), 2560);
        assert_eq!(producer.local.len(), 1);
        assert_eq!(producer.image_count(), 1);
    }

    #[test]
    fn dropping_producer_returns_local_images() {
        let device = Arc::new(MockDevice::default());
        let producer = producer(&device, 3);
        let shared = Arc::clone(&producer.shared);
        drop(producer);
        assert_eq!(shared.available.len(), 3);
        assert_eq!(device.live_storages(), 3);
    }

    #[test]
    fn dropping_producer_frees_what_bounded_queue_refuses() {
        let device = Arc::new(MockDevice::default());
        let config = DisplayConfig {
            initial_image_count: 3,
            available_queue_capacity: Some(1),
            ..test_config()
        };
        let producer = producer_with(&device, &config);
        let shared = Arc::clone(&producer.shared);
        assert_eq!(device.created(), 3);

        drop(producer);
        assert_eq!(shared.available.len(), 1);
        assert_eq!(device.destroyed(), 2);

        drop(shared);
        assert_eq!(device.live_storages(), 0);
    }

    #[test]
    fn version_is_passed_through() {
        let device = Arc::new(MockDevice::default());
        let producer = producer(&device, 0);
        assert_eq!(producer.vulkan_version(), vk::API_VERSION_1_0);
    }
}
