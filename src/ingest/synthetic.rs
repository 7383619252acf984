//! Synthetic sensor (`stub://`).
//!
//! Generates a moving test pattern in the configured pixel format. With
//! `PixelFormat::Jpeg` the pattern is compressed at capture time, the way a
//! JPEG-native sensor hands out finished images; any other format exercises
//! the stream encoder.

use std::sync::{Mutex, PoisonError};

use super::{FrameSource, SourceConfig, SourceStats};
use crate::encode::{encode_pixels, DEFAULT_JPEG_QUALITY};
use crate::error::DeviceError;
use crate::frame::{BufferPool, Frame, PixelFormat};

pub struct SyntheticSource {
    config: SourceConfig,
    pool: BufferPool,
    state: Mutex<SyntheticState>,
}

#[derive(Default)]
struct SyntheticState {
    frame_count: u64,
    /// Simulated scene, shifted every 50 frames.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            pool: BufferPool::new(config.fb_count),
            config,
            state: Mutex::new(SyntheticState::default()),
        }
    }

    fn capture(&self, state: &mut SyntheticState) -> Result<Vec<u8>, DeviceError> {
        state.frame_count += 1;
        if state.frame_count % 50 == 0 {
            state.scene_state = state.scene_state.wrapping_add(1);
        }

        let (width, height) = (self.config.width, self.config.height);
        let raw_format = match self.config.format {
            PixelFormat::Jpeg => PixelFormat::Rgb24,
            other => other,
        };
        let pixels = pattern(width, height, raw_format, state.frame_count, state.scene_state);
        if self.config.format.is_jpeg() {
            encode_pixels(&pixels, width, height, raw_format, DEFAULT_JPEG_QUALITY)
                .map_err(|err| DeviceError::unavailable(format!("sensor jpeg stage: {}", err)))
        } else {
            Ok(pixels)
        }
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> anyhow::Result<()> {
        log::info!(
            "SyntheticSource: connected to {} ({}x{} {:?}, {} buffers)",
            self.config.url,
            self.config.width,
            self.config.height,
            self.config.format,
            self.config.fb_count
        );
        Ok(())
    }

    fn acquire(&self) -> Result<Frame, DeviceError> {
        let token = self.pool.checkout()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match self.capture(&mut state) {
            Ok(data) => Ok(Frame::new(
                data,
                self.config.width,
                self.config.height,
                self.config.format,
                state.frame_count,
                token,
            )),
            Err(err) => {
                self.pool.checkin(token);
                Err(err)
            }
        }
    }

    fn release(&self, frame: Frame) {
        self.pool.reclaim(frame);
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        let frames_captured = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame_count;
        SourceStats {
            frames_captured,
            source: self.config.url.clone(),
            pool: self.pool.stats(),
        }
    }
}

fn pattern(width: u32, height: u32, format: PixelFormat, frame: u64, scene: u8) -> Vec<u8> {
    let len = match format {
        PixelFormat::Jpeg => PixelFormat::Rgb24.raw_len(width, height),
        raw => raw.raw_len(width, height),
    }
    .unwrap_or(0);
    (0..len)
        .map(|i| ((i as u64 + frame + scene as u64) % 256) as u8)
        .collect()
}
