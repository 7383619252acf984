//! Local still-image source.
//!
//! `DirectorySource` replays the `*.jpg` / `*.jpeg` files of a local
//! directory in name order, looping at the end. Files are read at acquisition
//! time, so replacing a file on disk changes the next frame served.
//!
//! The directory source only accepts local paths; URL schemes are rejected.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{FrameSource, SourceConfig, SourceStats};
use crate::error::DeviceError;
use crate::frame::{BufferPool, Frame, PixelFormat};

pub struct DirectorySource {
    config: SourceConfig,
    dir: PathBuf,
    pool: BufferPool,
    stills: Vec<Still>,
    state: Mutex<DirectoryState>,
}

struct Still {
    path: PathBuf,
    width: u32,
    height: u32,
}

#[derive(Default)]
struct DirectoryState {
    next: usize,
    frame_count: u64,
    last_error: Option<String>,
}

impl DirectorySource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        if !is_local_path(&config.url) {
            return Err(anyhow!(
                "directory source only supports local paths, got '{}'",
                config.url
            ));
        }
        Ok(Self {
            dir: PathBuf::from(&config.url),
            pool: BufferPool::new(config.fb_count),
            config,
            stills: Vec::new(),
            state: Mutex::new(DirectoryState::default()),
        })
    }

    pub fn len(&self) -> usize {
        self.stills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stills.is_empty()
    }
}

impl FrameSource for DirectorySource {
    fn connect(&mut self) -> Result<()> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("read image directory {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_jpeg_path(path))
            .collect();
        paths.sort();

        self.stills = paths
            .into_iter()
            .filter_map(|path| match image::image_dimensions(&path) {
                Ok((width, height)) => Some(Still {
                    path,
                    width,
                    height,
                }),
                Err(err) => {
                    log::warn!("DirectorySource: skipping {}: {}", path.display(), err);
                    None
                }
            })
            .collect();

        if self.stills.is_empty() {
            return Err(anyhow!("no JPEG images found in {}", self.dir.display()));
        }
        log::info!(
            "DirectorySource: connected to {} ({} images, {} buffers)",
            self.dir.display(),
            self.stills.len(),
            self.config.fb_count
        );
        Ok(())
    }

    fn acquire(&self) -> Result<Frame, DeviceError> {
        if self.stills.is_empty() {
            return Err(DeviceError::unavailable("directory source not connected"));
        }
        let token = self.pool.checkout()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let still = &self.stills[state.next % self.stills.len()];
        state.next = (state.next + 1) % self.stills.len();

        match std::fs::read(&still.path) {
            Ok(data) => {
                state.frame_count += 1;
                state.last_error = None;
                Ok(Frame::new(
                    data,
                    still.width,
                    still.height,
                    PixelFormat::Jpeg,
                    state.frame_count,
                    token,
                ))
            }
            Err(err) => {
                self.pool.checkin(token);
                let reason = format!("read {}: {}", still.path.display(), err);
                state.last_error = Some(reason.clone());
                Err(DeviceError::unavailable(reason))
            }
        }
    }

    fn release(&self, frame: Frame) {
        self.pool.reclaim(frame);
    }

    fn is_healthy(&self) -> bool {
        !self.stills.is_empty()
            && self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last_error
                .is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .frame_count,
            source: self.dir.display().to_string(),
            pool: self.pool.stats(),
        }
    }
}

fn is_local_path(path: &str) -> bool {
    !path.trim().is_empty() && !path.contains("://")
}

fn is_jpeg_path(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            .unwrap_or(false)
}
