//! Digital pins driven by the actuator.
//!
//! Pins are expected to be exported and configured before the device core
//! starts; this module only reads and writes levels.
//!
//! - `MemoryPin`: keeps the level in memory and logs transitions. Used on
//!   hosts without GPIO and in tests.
//! - `SysfsOutputPin` / `SysfsInputPin`: `/sys/class/gpio/gpioN/value`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    fn as_sysfs(self) -> &'static [u8] {
        match self {
            Level::Low => b"0",
            Level::High => b"1",
        }
    }
}

pub trait OutputPin: Send + Sync {
    fn name(&self) -> &str;

    fn set(&self, level: Level) -> Result<()>;
}

pub trait InputPin: Send + Sync {
    /// True while the input is in its active (pressed) state.
    fn is_active(&self) -> Result<bool>;
}

// ----------------------------------------------------------------------------
// In-memory pins
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct MemoryPin {
    name: String,
    writes: Mutex<Vec<Level>>,
}

impl MemoryPin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Last level written, `Low` if never driven.
    pub fn level(&self) -> Level {
        self.history().last().copied().unwrap_or(Level::Low)
    }

    /// Every level written, in order.
    pub fn history(&self) -> Vec<Level> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.history().iter().filter(|l| **l == level).count()
    }
}

impl OutputPin for MemoryPin {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, level: Level) -> Result<()> {
        log::debug!("pin {} -> {:?}", self.name, level);
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(level);
        Ok(())
    }
}

/// Input that never reports activity; stands in for an unwired button.
#[derive(Debug, Default)]
pub struct IdleInput;

impl InputPin for IdleInput {
    fn is_active(&self) -> Result<bool> {
        Ok(false)
    }
}

// ----------------------------------------------------------------------------
// sysfs pins
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct SysfsOutputPin {
    name: String,
    value_path: PathBuf,
}

impl SysfsOutputPin {
    pub fn new(root: &Path, gpio: u32, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_path: value_path(root, gpio),
        }
    }
}

impl OutputPin for SysfsOutputPin {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, level: Level) -> Result<()> {
        std::fs::write(&self.value_path, level.as_sysfs()).with_context(|| {
            format!(
                "write {:?} to {} ({})",
                level,
                self.value_path.display(),
                self.name
            )
        })
    }
}

/// A push button wired with a pull-up reads `0` while pressed.
#[derive(Debug)]
pub struct SysfsInputPin {
    value_path: PathBuf,
    active_low: bool,
}

impl SysfsInputPin {
    pub fn new(root: &Path, gpio: u32, active_low: bool) -> Self {
        Self {
            value_path: value_path(root, gpio),
            active_low,
        }
    }
}

impl InputPin for SysfsInputPin {
    fn is_active(&self) -> Result<bool> {
        let raw = std::fs::read_to_string(&self.value_path)
            .with_context(|| format!("read {}", self.value_path.display()))?;
        let high = raw.trim() == "1";
        Ok(high != self.active_low)
    }
}

fn value_path(root: &Path, gpio: u32) -> PathBuf {
    root.join(format!("gpio{}", gpio)).join("value")
}
