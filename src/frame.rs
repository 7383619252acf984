//! Frame buffers and their ownership contract.
//!
//! - `BufferPool`: fixed set of sensor buffer slots. A slot is checked out per
//!   acquired frame and must come back exactly once.
//! - `SlotToken`: proof of a checked-out slot. Not `Clone`, not `Copy`.
//! - `Frame`: captured bytes plus the token of the slot they occupy.
//!
//! A `Frame` goes back to its pool by value, so the compiler rejects any read
//! after release:
//!
//! ```compile_fail
//! use doorcam::frame::{BufferPool, Frame, PixelFormat};
//!
//! let pool = BufferPool::new(1);
//! let token = pool.checkout().unwrap();
//! let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 1, 1, PixelFormat::Jpeg, 0, token);
//! pool.reclaim(frame);
//! let _ = frame.len();
//! ```
//!
//! and a slot cannot be duplicated to release it twice:
//!
//! ```compile_fail
//! use doorcam::frame::BufferPool;
//!
//! let pool = BufferPool::new(1);
//! let token = pool.checkout().unwrap();
//! let twin = token.clone();
//! pool.checkin(token);
//! pool.checkin(twin);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::DeviceError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Pixel layout of a frame's bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Already a complete JPEG image; the wire format.
    Jpeg,
    /// Packed 8-bit RGB.
    Rgb24,
    /// 8-bit luminance.
    Gray8,
    /// Y plane followed by interleaved UV at half resolution. Odd sizes
    /// round the chroma plane up.
    Nv12,
}

impl PixelFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" | "mjpeg" => Some(PixelFormat::Jpeg),
            "rgb" | "rgb24" => Some(PixelFormat::Rgb24),
            "gray" | "grey" | "gray8" => Some(PixelFormat::Gray8),
            "nv12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }

    pub fn is_jpeg(self) -> bool {
        self == PixelFormat::Jpeg
    }

    /// Byte length of a raw `width` x `height` frame. `None` for JPEG, whose
    /// size is not fixed, and on overflow.
    pub fn raw_len(self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        let pixels = w.checked_mul(h)?;
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Rgb24 => pixels.checked_mul(3),
            PixelFormat::Nv12 => {
                let chroma = nv12_chroma_stride(width).checked_mul(h.div_ceil(2))?;
                pixels.checked_add(chroma)
            }
        }
    }
}

/// Bytes per row of the interleaved NV12 chroma plane.
pub(crate) fn nv12_chroma_stride(width: u32) -> usize {
    (width as usize).div_ceil(2) * 2
}

// ----------------------------------------------------------------------------
// BufferPool
// ----------------------------------------------------------------------------

/// A checked-out buffer slot. Returned to its pool with `BufferPool::checkin`.
#[derive(Debug)]
pub struct SlotToken {
    pool_id: u64,
    slot: usize,
}

impl SlotToken {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Fixed-size pool of sensor buffer slots.
///
/// Mirrors the driver-side frame buffers of a camera sensor: once every slot
/// is held, acquisition fails until one is released.
#[derive(Debug)]
pub struct BufferPool {
    id: u64,
    capacity: usize,
    free: Mutex<Vec<usize>>,
    checkouts: AtomicU64,
    checkins: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            free: Mutex::new((0..capacity).rev().collect()),
            checkouts: AtomicU64::new(0),
            checkins: AtomicU64::new(0),
        }
    }

    pub fn checkout(&self) -> Result<SlotToken, DeviceError> {
        let slot = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| {
                DeviceError::unavailable(format!(
                    "all {} frame buffers are in use",
                    self.capacity
                ))
            })?;
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        Ok(SlotToken {
            pool_id: self.id,
            slot,
        })
    }

    pub fn checkin(&self, token: SlotToken) {
        if token.pool_id != self.id {
            log::error!(
                "buffer slot {} returned to foreign pool {} (owner {})",
                token.slot,
                self.id,
                token.pool_id
            );
            return;
        }
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token.slot);
        self.checkins.fetch_add(1, Ordering::Relaxed);
    }

    /// Release a frame's slot. The frame's bytes are dropped with it.
    pub fn reclaim(&self, mut frame: Frame) {
        if let Some(token) = frame.token.take() {
            self.checkin(token);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            checkouts: self.checkouts.load(Ordering::Relaxed),
            checkins: self.checkins.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub checkouts: u64,
    pub checkins: u64,
}

impl PoolStats {
    pub fn outstanding(&self) -> u64 {
        self.checkouts.saturating_sub(self.checkins)
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image occupying a pool slot.
///
/// No `Clone`: there is exactly one owner of a slot at a time.
#[must_use = "a frame holds a sensor buffer and must be released to its source"]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    format: PixelFormat,
    sequence: u64,
    token: Option<SlotToken>,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
        token: SlotToken,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            sequence,
            token: Some(token),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Per-source capture counter.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn slot(&self) -> Option<usize> {
        self.token.as_ref().map(SlotToken::slot)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("slot", &self.slot())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // The slot stays checked out: a dropped frame shrinks the pool for good.
        if let Some(token) = &self.token {
            log::error!(
                "frame #{} dropped without release; buffer slot {} leaked",
                self.sequence,
                token.slot
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
