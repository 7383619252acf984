//! V4L2 camera source.
//!
//! This module provides `V4l2Source` for local V4L2 devices (USB cameras,
//! CSI sensors behind a V4L2 driver). The driver's mmap buffers play the part
//! of the sensor frame buffers: the source asks for `fb_count` of them.
//!
//! The requested pixel format picks the fourcc:
//! - `jpeg` asks for `MJPG`, handed out without re-encoding
//! - `gray` asks for `GREY`
//! - anything else asks for `RGB3`
//!
//! If the driver negotiates a different fourcc the frame is tagged with what
//! the driver actually delivers.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceConfig, SourceStats};
use crate::error::DeviceError;
use crate::frame::{BufferPool, Frame, PixelFormat};

pub struct V4l2Source {
    config: SourceConfig,
    pool: BufferPool,
    state: Mutex<V4l2State>,
}

struct V4l2State {
    device: Option<DeviceStream>,
    active_width: u32,
    active_height: u32,
    active_format: PixelFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

#[self_referencing]
struct DeviceStream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            pool: BufferPool::new(config.fb_count),
            state: Mutex::new(V4l2State {
                device: None,
                active_width: config.width,
                active_height: config.height,
                active_format: config.format,
                frame_count: 0,
                last_frame_at: None,
                last_error: None,
            }),
            config,
        }
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.url)
            .with_context(|| format!("open v4l2 device {}", self.config.url))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = requested_fourcc(self.config.format);

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.url,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let active_format = format_for_fourcc(&format.fourcc).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} delivers unsupported fourcc {}",
                self.config.url,
                format.fourcc
            )
        })?;

        let buffers = self.config.fb_count as u32;
        let stream = DeviceStreamBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, buffers)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.device = Some(stream);
        state.active_width = format.width;
        state.active_height = format.height;
        state.active_format = active_format;
        state.last_error = None;

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?}, {} buffers)",
            self.config.url,
            format.width,
            format.height,
            active_format,
            buffers
        );
        Ok(())
    }

    fn acquire(&self) -> Result<Frame, DeviceError> {
        use v4l::io::traits::CaptureStream;

        let token = self.pool.checkout()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let captured = match state.device.as_mut() {
            Some(device) => device
                .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
                .map_err(|err| err.to_string()),
            None => Err("v4l2 device not connected".to_string()),
        };

        match captured {
            Ok(data) => {
                state.frame_count += 1;
                state.last_frame_at = Some(Instant::now());
                Ok(Frame::new(
                    data,
                    state.active_width,
                    state.active_height,
                    state.active_format,
                    state.frame_count,
                    token,
                ))
            }
            Err(reason) => {
                self.pool.checkin(token);
                state.last_error = Some(reason.clone());
                Err(DeviceError::unavailable(reason))
            }
        }
    }

    fn release(&self, frame: Frame) {
        self.pool.reclaim(frame);
    }

    fn is_healthy(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.last_error.is_some() || state.device.is_none() {
            return false;
        }
        match state.last_frame_at {
            Some(last) => last.elapsed() <= Duration::from_secs(2),
            None => true,
        }
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

fn requested_fourcc(format: PixelFormat) -> v4l::FourCC {
    match format {
        PixelFormat::Jpeg => v4l::FourCC::new(b"MJPG"),
        PixelFormat::Gray8 => v4l::FourCC::new(b"GREY"),
        PixelFormat::Nv12 => v4l::FourCC::new(b"NV12"),
        PixelFormat::Rgb24 => v4l::FourCC::new(b"RGB3"),
    }
}

fn format_for_fourcc(fourcc: &v4l::FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" | b"JPEG" => Some(PixelFormat::Jpeg),
        b"GREY" => Some(PixelFormat::Gray8),
        b"NV12" => Some(PixelFormat::Nv12),
        b"RGB3" => Some(PixelFormat::Rgb24),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_for_supported_formats() {
        for format in [
            PixelFormat::Jpeg,
            PixelFormat::Gray8,
            PixelFormat::Nv12,
            PixelFormat::Rgb24,
        ] {
            assert_eq!(format_for_fourcc(&requested_fourcc(format)), Some(format));
        }
        assert_eq!(format_for_fourcc(&v4l::FourCC::new(b"YUYV")), None);
    }

    #[test]
    fn unconnected_device_is_unavailable() {
        let source = V4l2Source::new(SourceConfig {
            url: "/dev/video99".to_string(),
            ..SourceConfig::default()
        });
        assert!(matches!(source.acquire(), Err(DeviceError::Unavailable(_))));
        assert!(!source.is_healthy());
        assert_eq!(source.stats().pool.outstanding(), 0);
    }
}
