// Transfer images and the value types around them
//
// A transfer image is the unit handed between the producer and render
// threads. It is always owned by exactly one side: the producer holds it
// between `acquire_image` and `queue_image`, the queues hold it in between,
// and the render thread holds it until the GPU fence says it is free again.
// Moving the value is the hand-off, so no image can be writable by the
// producer while the render thread still has it.

use ash::vk;
use std::fmt;
use std::ptr::NonNull;

use crate::error::Result;
use crate::gpu::TransferDevice;

// =============================================================================
// DESCRIPTIONS
// =============================================================================

/// Size and pixel format of a frame.
///
/// Full equality decides whether a transfer image must be reallocated; only
/// the format component decides whether pipelines must be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDescription {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
}

impl ImageDescription {
    pub const fn new(width: u32, height: u32, format: vk::Format) -> Self {
        Self { width, height, format }
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D { width: self.width, height: self.height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.format != vk::Format::UNDEFINED
    }

    pub fn same_format(&self, other: &Self) -> bool {
        self.format == other.format
    }
}

impl fmt::Display for ImageDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.format)
    }
}

/// Current window size as reported by the windowing layer.
/// A zero dimension means the window is minimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowParameters {
    pub width: u32,
    pub height: u32,
}

impl WindowParameters {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D { width: self.width, height: self.height }
    }
}

// =============================================================================
// LAYOUT TRACKING
// =============================================================================

/// Last layout and access mask recorded for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
}

/// Old and new layout/access of one image memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl ImageState {
    /// Freshly allocated host-visible image, contents written by the host.
    pub const HOST_PREINITIALIZED: Self = Self {
        layout: vk::ImageLayout::PREINITIALIZED,
        access: vk::AccessFlags::HOST_WRITE,
    };

    /// Freshly allocated device-local image, contents undefined.
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        access: vk::AccessFlags::empty(),
    };

    /// Describe the move from the recorded state to `layout`/`access` and
    /// record the new state. Not idempotent: a second call with the same
    /// arguments yields a transition whose old and new sides are equal.
    pub fn transition(&mut self, layout: vk::ImageLayout, access: vk::AccessFlags) -> LayoutTransition {
        let transition = LayoutTransition {
            old_layout: self.layout,
            new_layout: layout,
            src_access: self.access,
            dst_access: access,
        };
        self.layout = layout;
        self.access = access;
        transition
    }
}

// =============================================================================
// HOST MAPPING
// =============================================================================

/// Persistently mapped memory of a host-visible transfer image.
#[derive(Debug)]
pub struct HostMapping {
    ptr: NonNull<u8>,
    len: usize,
    row_pitch: usize,
}

// The pointer targets device memory owned by the image storage that travels
// alongside it; whoever owns the image owns the bytes.
unsafe impl Send for HostMapping {}

impl HostMapping {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the storage that produced it is neither recreated nor destroyed.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, row_pitch: usize) -> Self {
        Self { ptr, len, row_pitch }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }
}

/// Mutable view handed to preprocess callbacks.
pub struct PixelsMut<'a> {
    pub data: &'a mut [u8],
    pub row_pitch: usize,
    pub description: ImageDescription,
}

pub type PreprocessFn = Box<dyn FnOnce(&mut PixelsMut<'_>) + Send>;

// =============================================================================
// TRANSFER IMAGE
// =============================================================================

pub struct TransferImage<S> {
    id: u32,
    description: Option<ImageDescription>,
    state: ImageState,
    mapping: Option<HostMapping>,
    preprocess: Option<PreprocessFn>,
    storage: S,
}

impl<S> TransferImage<S> {
    pub(crate) fn new(id: u32, storage: S) -> Self {
        Self {
            id,
            description: None,
            state: ImageState::HOST_PREINITIALIZED,
            mapping: None,
            preprocess: None,
            storage,
        }
    }

    /// Stable index of this image within its pool.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// `None` until the first `acquire_image` sized it.
    pub fn description(&self) -> Option<ImageDescription> {
        self.description
    }

    pub fn row_pitch(&self) -> usize {
        self.mapping.as_ref().map_or(0, HostMapping::row_pitch)
    }

    /// CPU-visible pixel bytes, `height * row_pitch` or more.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        match &self.mapping {
            // SAFETY: the mapping belongs to `self.storage` and `&mut self`
            // guarantees nobody else can reach the bytes.
            Some(mapping) => unsafe { std::slice::from_raw_parts_mut(mapping.ptr.as_ptr(), mapping.len) },
            None => &mut [],
        }
    }

    pub fn pixels(&self) -> &[u8] {
        match &self.mapping {
            // SAFETY: as above, shared access only.
            Some(mapping) => unsafe { std::slice::from_raw_parts(mapping.ptr.as_ptr(), mapping.len) },
            None => &[],
        }
    }

    /// Register a callback run once on the render thread before the image is drawn.
    pub fn set_preprocess<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut PixelsMut<'_>) + Send + 'static,
    {
        self.preprocess = Some(Box::new(callback));
    }

    pub(crate) fn clear_preprocess(&mut self) {
        self.preprocess = None;
    }

    pub fn has_preprocess(&self) -> bool {
        self.preprocess.is_some()
    }

    /// Run and clear the registered callback, if any.
    pub fn preprocess(&mut self) {
        let Some(callback) = self.preprocess.take() else {
            return;
        };
        let Some(description) = self.description else {
            return;
        };
        let row_pitch = self.row_pitch();
        let mut pixels = PixelsMut {
            data: self.pixels_mut(),
            row_pitch,
            description,
        };
        callback(&mut pixels);
    }

    /// See [`ImageState::transition`].
    pub fn transition(&mut self, layout: vk::ImageLayout, access: vk::AccessFlags) -> LayoutTransition {
        self.state.transition(layout, access)
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Reallocate the backing store for `description`. The id survives.
    /// Callers hold the device lock.
    pub(crate) fn recreate<D>(&mut self, device: &D, description: ImageDescription) -> Result<()>
    where
        D: TransferDevice<Storage = S>,
    {
        // Drop the old mapping before its memory goes away.
        self.mapping = None;
        self.description = None;
        let mapping = device.recreate_storage(&mut self.storage, description)?;
        self.mapping = Some(mapping);
        self.description = Some(description);
        self.state = ImageState::HOST_PREINITIALIZED;
        Ok(())
    }
}

impl<S> fmt::Debug for TransferImage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferImage")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("state", &self.state)
            .field("row_pitch", &self.row_pitch())
            .field("preprocess", &self.preprocess.is_some())
            .finish()
    }
}
