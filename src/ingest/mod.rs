//! Frame sources.
//!
//! This module provides the sensors the device can stream from:
//! - Synthetic sensor (`stub://`) for hosts without a camera and for tests
//! - A directory of JPEG stills, replayed in name order
//! - USB/V4L2 devices (feature: ingest-v4l2)
//! - An upstream MJPEG/JPEG camera over HTTP (feature: ingest-http)
//!
//! Every source owns a `BufferPool` sized like the sensor's frame buffer
//! count. `acquire` checks out a slot and `release` returns it; a source that
//! runs out of slots reports `DeviceError::Unavailable` until one comes back.

pub mod file;
#[cfg(feature = "ingest-http")]
pub mod http;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

use crate::error::DeviceError;
use crate::frame::{Frame, PixelFormat, PoolStats};

pub use file::DirectorySource;
#[cfg(feature = "ingest-http")]
pub use http::HttpSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Number of buffered frames discarded before a one-shot capture.
pub const SNAPSHOT_FLUSH_FRAMES: usize = 2;

/// Sensor settings shared by every source kind.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `stub://name`, a local directory, `/dev/videoN` or `http(s)://...`.
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Format the sensor is asked to emit. Sources may negotiate another.
    pub format: PixelFormat,
    /// Number of frame buffers the sensor owns.
    pub fb_count: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            width: 640,
            height: 480,
            format: PixelFormat::Jpeg,
            fb_count: 2,
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
    pub pool: PoolStats,
}

/// A camera sensor shared by every request handler.
///
/// Implementations serialise access to the sensor internally; handlers only
/// ever hold the frames they acquired.
pub trait FrameSource: Send + Sync {
    /// Prepare the sensor. Called once before the source is shared.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Check out one frame. Fails with `Unavailable` when the sensor is busy,
    /// faulted, or every buffer is already held.
    fn acquire(&self) -> Result<Frame, DeviceError>;

    /// Give a frame's buffer back to the sensor.
    fn release(&self, frame: Frame);

    /// Acquire and immediately release up to `count` frames so the next
    /// acquisition sees a fresh exposure instead of a buffered one.
    fn flush(&self, count: usize) {
        for _ in 0..count {
            match self.acquire() {
                Ok(frame) => self.release(frame),
                Err(err) => {
                    log::debug!("flush stopped early: {}", err);
                    break;
                }
            }
        }
    }

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// A frame borrowed from a source, released when the lease is dropped.
///
/// Holding the lease across a write keeps the sensor buffer alive exactly as
/// long as the bytes are needed, and every exit path gives it back.
pub struct FrameLease<'a> {
    source: &'a dyn FrameSource,
    frame: Option<Frame>,
}

impl<'a> FrameLease<'a> {
    pub fn acquire(source: &'a dyn FrameSource) -> Result<Self, DeviceError> {
        let frame = source.acquire()?;
        Ok(Self {
            source,
            frame: Some(frame),
        })
    }

    pub fn frame(&self) -> &Frame {
        self.frame
            .as_ref()
            .expect("lease holds its frame until dropped")
    }
}

impl std::fmt::Debug for FrameLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLease")
            .field("frame", &self.frame)
            .finish()
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.source.release(frame);
        }
    }
}

/// Open the source named by `config.url`.
pub fn open_source(config: SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.fb_count == 0 {
        return Err(anyhow!("camera needs at least one frame buffer"));
    }
    let url = config.url.clone();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        #[cfg(feature = "ingest-http")]
        {
            return Ok(Box::new(HttpSource::new(config)?));
        }
        #[cfg(not(feature = "ingest-http"))]
        {
            return Err(anyhow!("camera url '{}' requires the ingest-http feature", url));
        }
    }
    if url.starts_with("/dev/video") {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(config)));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!("camera device '{}' requires the ingest-v4l2 feature", url));
        }
    }
    Ok(Box::new(DirectorySource::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BufferPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        pool: BufferPool,
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl CountingSource {
        fn new(fb_count: usize) -> Self {
            Self {
                pool: BufferPool::new(fb_count),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }
        }
    }

    impl FrameSource for CountingSource {
        fn acquire(&self) -> Result<Frame, DeviceError> {
            let token = self.pool.checkout()?;
            let n = self.acquired.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 1, 1, PixelFormat::Jpeg, n, token))
        }

        fn release(&self, frame: Frame) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.pool.reclaim(frame);
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.acquired.load(Ordering::SeqCst) as u64,
                source: "counting".to_string(),
                pool: self.pool.stats(),
            }
        }
    }

    #[test]
    fn flush_acquires_and_releases_each_frame() {
        let source = CountingSource::new(1);
        source.flush(SNAPSHOT_FLUSH_FRAMES);
        assert_eq!(source.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(source.released.load(Ordering::SeqCst), 2);
        assert_eq!(source.pool.available(), 1);
    }

    #[test]
    fn flush_stops_when_sensor_is_unavailable() {
        let source = CountingSource::new(1);
        let held = source.acquire().unwrap();
        source.flush(SNAPSHOT_FLUSH_FRAMES);
        assert_eq!(source.acquired.load(Ordering::SeqCst), 1);
        source.release(held);
    }

    #[test]
    fn lease_releases_on_drop() {
        let source = CountingSource::new(1);
        {
            let lease = FrameLease::acquire(&source).unwrap();
            assert_eq!(lease.frame().len(), 4);
            assert_eq!(source.pool.available(), 0);
        }
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
        assert_eq!(source.pool.available(), 1);
    }

    #[test]
    fn lease_formats_its_frame_and_fails_when_pool_is_empty() {
        let source = CountingSource::new(1);
        let held = FrameLease::acquire(&source).unwrap();
        assert!(format!("{:?}", held).contains("sequence: 0"));

        let err = FrameLease::acquire(&source).unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
        drop(held);
        assert_eq!(source.pool.available(), 1);
    }

    #[test]
    fn open_source_rejects_zero_buffers() {
        let config = SourceConfig {
            fb_count: 0,
            ..SourceConfig::default()
        };
        assert!(open_source(config).is_err());
    }

    #[test]
    fn open_source_dispatches_stub_urls() -> Result<()> {
        let mut source = open_source(SourceConfig::default())?;
        source.connect()?;
        assert_eq!(source.stats().source, "stub://camera");
        Ok(())
    }
}
