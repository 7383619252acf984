//! Upstream HTTP camera source.
//!
//! This module provides `HttpSource` for re-serving another camera that
//! already speaks HTTP:
//! - `multipart/x-mixed-replace` MJPEG streams are read continuously and
//!   split on JPEG SOI/EOI markers
//! - any other content type is treated as a snapshot endpoint and fetched
//!   once per acquisition
//!
//! Frames are passed through as JPEG; nothing is decoded.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use url::Url;

use super::{FrameSource, SourceConfig, SourceStats};
use crate::error::DeviceError;
use crate::frame::{BufferPool, Frame, PixelFormat};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpSource {
    config: SourceConfig,
    pool: BufferPool,
    state: Mutex<HttpState>,
}

#[derive(Default)]
struct HttpState {
    stream: Option<HttpStream>,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    SingleJpeg,
}

impl HttpSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse camera url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported camera scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        Ok(Self {
            pool: BufferPool::new(config.fb_count),
            config,
            state: Mutex::new(HttpState::default()),
        })
    }

    fn open_stream(&self) -> Result<HttpStream> {
        let response = ureq::get(&self.config.url)
            .call()
            .context("connect to upstream camera")?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            Ok(HttpStream::Mjpeg(MjpegReader::new(response.into_reader())))
        } else {
            Ok(HttpStream::SingleJpeg)
        }
    }

    fn next_jpeg(&self, state: &mut HttpState) -> Result<Vec<u8>> {
        if state.stream.is_none() {
            state.stream = Some(self.open_stream()?);
            state.connected_at = Some(Instant::now());
        }
        let result = match state.stream.as_mut() {
            Some(HttpStream::Mjpeg(reader)) => reader.read_next_jpeg(),
            Some(HttpStream::SingleJpeg) | None => fetch_single_jpeg(&self.config.url),
        };
        if result.is_err() {
            // Reconnect on the next acquisition rather than retrying here.
            state.stream = None;
        }
        result
    }
}

impl FrameSource for HttpSource {
    fn connect(&mut self) -> Result<()> {
        let stream = self.open_stream()?;
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.stream = Some(stream);
        state.connected_at = Some(Instant::now());
        log::info!("HttpSource: connected to {}", self.config.url);
        Ok(())
    }

    fn acquire(&self) -> Result<Frame, DeviceError> {
        let token = self.pool.checkout()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match self.next_jpeg(&mut state) {
            Ok(jpeg) => {
                state.frame_count += 1;
                state.last_frame_at = Some(Instant::now());
                state.last_error = None;
                Ok(Frame::new(
                    jpeg,
                    self.config.width,
                    self.config.height,
                    PixelFormat::Jpeg,
                    state.frame_count,
                    token,
                ))
            }
            Err(err) => {
                self.pool.checkin(token);
                state.last_error = Some(err.to_string());
                Err(DeviceError::unavailable(format!("{:#}", err)))
            }
        }
    }

    fn release(&self, frame: Frame) {
        self.pool.reclaim(frame);
    }

    fn is_healthy(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = state.connected_at else {
            return false;
        };
        let Some(last_frame_at) = state.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= Duration::from_secs(5)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .frame_count,
            source: self.config.url.clone(),
            pool: self.pool.stats(),
        }
    }
}

struct MjpegReader {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_jpeg_between_multipart_headers() {
        let mut buf = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let jpeg_start = buf.len();
        buf.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        buf.extend_from_slice(b"\r\n--frame");

        let (start, end) = find_jpeg_bounds(&buf).unwrap();
        assert_eq!(start, jpeg_start);
        assert_eq!(&buf[start..end], &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    }

    #[test]
    fn incomplete_jpeg_is_not_split() {
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 1, 2]).is_none());
        assert!(find_jpeg_bounds(b"no markers").is_none());
    }

    #[test]
    fn mjpeg_reader_yields_consecutive_frames() {
        let mut body = Vec::new();
        for n in 0..3u8 {
            body.extend_from_slice(b"--frame\r\n\r\n");
            body.extend_from_slice(&[0xFF, 0xD8, n, 0xFF, 0xD9]);
        }
        let mut reader = MjpegReader::new(Box::new(std::io::Cursor::new(body)));
        for n in 0..3u8 {
            assert_eq!(reader.read_next_jpeg().unwrap(), vec![0xFF, 0xD8, n, 0xFF, 0xD9]);
        }
        assert!(reader.read_next_jpeg().is_err());
    }

    #[test]
    fn rejects_non_http_urls() {
        let config = SourceConfig {
            url: "udp://0.0.0.0:5000".to_string(),
            ..SourceConfig::default()
        };
        assert!(HttpSource::new(config).is_err());
    }
}
