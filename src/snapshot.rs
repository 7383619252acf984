//! One-shot capture.
//!
//! The sensor may still hold frames exposed before the request arrived, so
//! the buffered ones are thrown away first. Snapshots are served exactly as
//! the sensor produced them; a sensor configured for raw output will hand
//! out raw bytes here.

use crate::error::DeviceError;
use crate::ingest::{FrameLease, FrameSource, SNAPSHOT_FLUSH_FRAMES};

pub const SNAPSHOT_DISPOSITION: &str = "inline; filename=capture.jpg";

/// Flush stale buffers and lease one fresh frame.
pub fn take_snapshot(source: &dyn FrameSource) -> Result<FrameLease<'_>, DeviceError> {
    source.flush(SNAPSHOT_FLUSH_FRAMES);
    let lease = FrameLease::acquire(source)?;
    if !lease.frame().format().is_jpeg() {
        log::warn!(
            "snapshot frame #{} is {:?}, served unencoded",
            lease.frame().sequence(),
            lease.frame().format()
        );
    }
    Ok(lease)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::ingest::{SourceConfig, SyntheticSource};

    fn jpeg_source() -> SyntheticSource {
        SyntheticSource::new(SourceConfig {
            url: "stub://snapshot".to_string(),
            width: 32,
            height: 24,
            format: PixelFormat::Jpeg,
            fb_count: 2,
        })
    }

    #[test]
    fn snapshot_skips_buffered_frames() {
        let source = jpeg_source();
        let lease = take_snapshot(&source).unwrap();
        // Two flushed frames, then the served one.
        assert_eq!(lease.frame().sequence(), 3);
        assert!(crate::encode::looks_like_jpeg(lease.frame().bytes()));
        drop(lease);

        let stats = source.stats();
        assert_eq!(stats.frames_captured, 3);
        assert_eq!(stats.pool.outstanding(), 0);
    }

    #[test]
    fn snapshot_fails_when_every_buffer_is_held() {
        let source = SyntheticSource::new(SourceConfig {
            fb_count: 1,
            ..SourceConfig::default()
        });
        let held = source.acquire().unwrap();

        match take_snapshot(&source) {
            Err(DeviceError::Unavailable(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(lease) => panic!("snapshot leased {:?} with no free buffer", lease),
        }

        source.release(held);
        assert_eq!(source.stats().pool.outstanding(), 0);
    }
}
