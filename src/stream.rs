//! MJPEG streaming session.
//!
//! `MjpegStream` is an iterator over JPEG parts pulled from a frame source.
//! It only captures the next frame when the caller asks for it, i.e. after
//! the previous part was written, and it paces captures to at most one per
//! frame interval. The first capture or encode failure is returned once and
//! ends the iterator.
//!
//! `stream_mjpeg` drives a session into any writer until the writer fails
//! (the client went away) or the source fails.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::encode::{encode_jpeg, DEFAULT_JPEG_QUALITY};
use crate::error::DeviceError;
use crate::ingest::{FrameLease, FrameSource};

/// Multipart boundary token used between stream parts.
pub const BOUNDARY: &str = "frame";

pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Minimum time between the starts of two captures (~20 fps ceiling).
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
pub struct StreamSettings {
    pub frame_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

// ----------------------------------------------------------------------------
// Pacer
// ----------------------------------------------------------------------------

/// Cooperative frame-rate limiter.
///
/// Only ever sleeps the calling handler thread; it holds no locks.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last_start: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: None,
        }
    }

    /// Delay owed after an iteration that took `elapsed`.
    pub fn delay_after(&self, elapsed: Duration) -> Option<Duration> {
        self.interval
            .checked_sub(elapsed)
            .filter(|delay| !delay.is_zero())
    }

    /// Sleep until the interval since the previous start has passed, then
    /// mark a new start.
    pub fn begin_iteration(&mut self) -> Instant {
        if let Some(last) = self.last_start {
            if let Some(delay) = self.delay_after(last.elapsed()) {
                std::thread::sleep(delay);
            }
        }
        let now = Instant::now();
        self.last_start = Some(now);
        now
    }
}

// ----------------------------------------------------------------------------
// Parts
// ----------------------------------------------------------------------------

/// One multipart body part. Holds its frame until dropped.
pub struct JpegPart<'a> {
    lease: FrameLease<'a>,
    encoded: Option<Vec<u8>>,
    index: u64,
}

impl JpegPart<'_> {
    /// The JPEG bytes sent on the wire.
    pub fn body(&self) -> &[u8] {
        match &self.encoded {
            Some(jpeg) => jpeg,
            None => self.lease.frame().bytes(),
        }
    }

    /// Position of this part within its session, starting at 0.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn was_encoded(&self) -> bool {
        self.encoded.is_some()
    }

    pub fn header(&self) -> String {
        part_header(self.body().len())
    }

    /// Boundary header, JPEG bytes, then the part terminator.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.header().as_bytes())?;
        out.write_all(self.body())?;
        out.write_all(b"\r\n")
    }
}

pub fn part_header(len: usize) -> String {
    format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY, len
    )
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Sending,
    Failed,
}

pub struct MjpegStream<'a> {
    source: &'a dyn FrameSource,
    settings: StreamSettings,
    pacer: Pacer,
    next_index: u64,
    state: StreamState,
}

impl<'a> MjpegStream<'a> {
    pub fn new(source: &'a dyn FrameSource, settings: StreamSettings) -> Self {
        Self {
            source,
            pacer: Pacer::new(settings.frame_interval),
            settings,
            next_index: 0,
            state: StreamState::Sending,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn fail(&mut self, err: DeviceError) -> Option<Result<JpegPart<'a>, DeviceError>> {
        self.state = StreamState::Failed;
        Some(Err(err))
    }
}

impl<'a> Iterator for MjpegStream<'a> {
    type Item = Result<JpegPart<'a>, DeviceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == StreamState::Failed {
            return None;
        }
        self.pacer.begin_iteration();

        let lease = match FrameLease::acquire(self.source) {
            Ok(lease) => lease,
            Err(err) => return self.fail(err),
        };
        let encoded = if lease.frame().format().is_jpeg() {
            None
        } else {
            match encode_jpeg(lease.frame(), self.settings.jpeg_quality) {
                Ok(jpeg) => Some(jpeg),
                // Dropping the lease releases the frame before the session ends.
                Err(err) => return self.fail(err),
            }
        };

        let index = self.next_index;
        self.next_index += 1;
        Some(Ok(JpegPart {
            lease,
            encoded,
            index,
        }))
    }
}

/// How a streaming session ended.
#[derive(Debug)]
pub struct StreamReport {
    pub frames_sent: u64,
    pub end: DeviceError,
}

impl StreamReport {
    pub fn client_disconnected(&self) -> bool {
        self.end.is_transport()
    }
}

/// Write MJPEG parts to `out` until the client leaves or the source fails.
pub fn stream_mjpeg<W: Write + ?Sized>(
    source: &dyn FrameSource,
    settings: StreamSettings,
    out: &mut W,
) -> StreamReport {
    let mut parts = MjpegStream::new(source, settings);
    let mut frames_sent = 0u64;
    let end = loop {
        match parts.next() {
            Some(Ok(part)) => {
                if part.index() == 0 && part.was_encoded() {
                    log::debug!("stream source is raw; encoding every part");
                }
                if let Err(err) = part.write_to(out).and_then(|_| out.flush()) {
                    break DeviceError::TransportFailure(err);
                }
                frames_sent = part.index() + 1;
            }
            Some(Err(err)) => break err,
            None => break DeviceError::unavailable("stream source exhausted"),
        }
    };

    if end.is_transport() {
        log::debug!("stream client disconnected after {} frames", frames_sent);
    } else {
        log::warn!("stream ended after {} frames: {}", frames_sent, end);
    }
    StreamReport { frames_sent, end }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
