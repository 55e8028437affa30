//! Owned page bitmap handles
//!
//! A [`PageBitmap`] owns one decoded RGBA page buffer. It is deliberately not
//! `Clone`: whoever holds the `PageBitmap` decides when the pixels are
//! released, and once a bitmap is inserted into the
//! [`RasterPageCache`](crate::RasterPageCache) that owner is the cache.
//!
//! Everyone else gets a [`PageView`], a read-only capability onto the same
//! buffer. A view can borrow the pixels for reading but can never release
//! them. Releasing takes the buffer's write lock, so it waits for in-flight
//! reads to finish instead of pulling pixels out from under a renderer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

/// Bytes per pixel of the RGBA8 buffers held by the cache.
pub const BYTES_PER_PIXEL: usize = 4;

static NEXT_BITMAP_ID: AtomicU64 = AtomicU64::new(1);

/// Read borrow of a live bitmap's pixels.
///
/// Holding this guard blocks release of the underlying buffer. Drop it before
/// calling back into the cache from the same thread.
pub type BitmapReadGuard<'a> = MappedRwLockReadGuard<'a, RgbaImage>;

struct BitmapSlot {
    id: u64,
    width: u32,
    height: u32,
    pixels: RwLock<Option<RgbaImage>>,
}

impl BitmapSlot {
    fn read(&self) -> Option<BitmapReadGuard<'_>> {
        RwLockReadGuard::try_map(self.pixels.read(), |pixels| pixels.as_ref()).ok()
    }

    fn is_released(&self) -> bool {
        self.pixels.read().is_none()
    }
}

/// Single-owner handle to a decoded page image.
pub struct PageBitmap {
    slot: Arc<BitmapSlot>,
}

impl PageBitmap {
    /// Take ownership of a decoded image.
    pub fn new(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            slot: Arc::new(BitmapSlot {
                id: NEXT_BITMAP_ID.fetch_add(1, Ordering::Relaxed),
                width,
                height,
                pixels: RwLock::new(Some(image)),
            }),
        }
    }

    /// Process-unique identifier of this buffer
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn width(&self) -> u32 {
        self.slot.width
    }

    pub fn height(&self) -> u32 {
        self.slot.height
    }

    /// Estimated footprint: width × height × bytes-per-pixel.
    ///
    /// Computed from the dimensions captured at construction, so it stays
    /// stable after release and matches what was charged to the budget.
    pub fn byte_size(&self) -> usize {
        estimated_byte_size(self.slot.width, self.slot.height)
    }

    /// Returns true once the pixels have been released.
    pub fn is_recycled(&self) -> bool {
        self.slot.is_released()
    }

    /// Borrow the pixels for reading, or `None` if already released.
    pub fn read(&self) -> Option<BitmapReadGuard<'_>> {
        self.slot.read()
    }

    /// Hand out a read-only view of this bitmap.
    pub fn view(&self) -> PageView {
        PageView {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Release the pixel buffer.
    ///
    /// Idempotent: returns `true` only for the call that actually freed the
    /// pixels. Waits for outstanding read guards to drop.
    pub(crate) fn recycle(&self) -> bool {
        self.slot.pixels.write().take().is_some()
    }
}

impl fmt::Debug for PageBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBitmap")
            .field("id", &self.slot.id)
            .field("width", &self.slot.width)
            .field("height", &self.slot.height)
            .field("recycled", &self.is_recycled())
            .finish()
    }
}

/// Read-only view of a bitmap owned elsewhere (usually by the cache).
///
/// Views never keep pixels alive past their owner's release: after the cache
/// evicts the entry, [`PageView::read`] returns `None` and the caller falls
/// back to decoding again.
#[derive(Clone)]
pub struct PageView {
    slot: Arc<BitmapSlot>,
}

impl PageView {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn width(&self) -> u32 {
        self.slot.width
    }

    pub fn height(&self) -> u32 {
        self.slot.height
    }

    pub fn byte_size(&self) -> usize {
        estimated_byte_size(self.slot.width, self.slot.height)
    }

    /// Returns true while the owner still retains the pixels.
    pub fn is_available(&self) -> bool {
        !self.slot.is_released()
    }

    /// Borrow the pixels for reading, or `None` if the owner released them.
    pub fn read(&self) -> Option<BitmapReadGuard<'_>> {
        self.slot.read()
    }

    /// Copy the pixels out, e.g. to feed a filter pass.
    pub fn to_image(&self) -> Option<RgbaImage> {
        self.read().map(|pixels| pixels.clone())
    }
}

impl fmt::Debug for PageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageView")
            .field("id", &self.slot.id)
            .field("width", &self.slot.width)
            .field("height", &self.slot.height)
            .field("available", &self.is_available())
            .finish()
    }
}

/// Footprint of an RGBA8 buffer with the given dimensions.
pub fn estimated_byte_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}
