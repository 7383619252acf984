use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::actuator::gpio::{
    IdleInput, InputPin, SysfsInputPin, SysfsOutputPin, DEFAULT_SYSFS_ROOT,
};
use crate::actuator::ticker::{DEFAULT_BUTTON_DEBOUNCE, DEFAULT_TICK_INTERVAL};
use crate::actuator::{
    ActuatorOutputs, ActuatorTiming, Button, MemoryPin, INDICATOR_DELAY, RELAY_DURATION,
};
use crate::api::ApiConfig;
use crate::encode::DEFAULT_JPEG_QUALITY;
use crate::frame::PixelFormat;
use crate::ingest::SourceConfig;
use crate::stream::{StreamSettings, DEFAULT_FRAME_INTERVAL};

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_CAMERA_URL: &str = "stub://door";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FB_COUNT: usize = 2;
const DEFAULT_RELAY_PIN: u32 = 12;
const DEFAULT_BUZZER_PIN: u32 = 14;
const DEFAULT_INDICATOR_PIN: u32 = 4;
const DEFAULT_BUTTON_PIN: u32 = 13;

#[derive(Debug, Deserialize, Default)]
struct DoorcamConfigFile {
    http: Option<HttpConfigFile>,
    camera: Option<CameraConfigFile>,
    stream: Option<StreamConfigFile>,
    actuator: Option<ActuatorConfigFile>,
    gpio: Option<GpioConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    format: Option<String>,
    fb_count: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct ActuatorConfigFile {
    relay_duration_ms: Option<u64>,
    indicator_delay_ms: Option<u64>,
    tick_interval_ms: Option<u64>,
    button_debounce_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct GpioConfigFile {
    backend: Option<String>,
    sysfs_root: Option<PathBuf>,
    relay: Option<u32>,
    buzzer: Option<u32>,
    indicator: Option<u32>,
    /// `null` disables the button.
    #[serde(default, deserialize_with = "present_or_null")]
    button: Option<Option<u32>>,
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<u32>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<u32>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone)]
pub struct DoorcamConfig {
    pub http_addr: String,
    pub camera: SourceConfig,
    pub stream: StreamSettings,
    pub actuator: ActuatorSettings,
    pub gpio: GpioSettings,
}

#[derive(Debug, Clone)]
pub struct ActuatorSettings {
    pub timing: ActuatorTiming,
    pub tick_interval: Duration,
    pub button_debounce: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioBackend {
    /// Levels are kept in memory and logged.
    Log,
    Sysfs { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct GpioSettings {
    pub backend: GpioBackend,
    pub relay: u32,
    pub buzzer: u32,
    pub indicator: u32,
    pub button: Option<u32>,
}

impl DoorcamConfig {
    /// Defaults, then the file named by `DOORCAM_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DOORCAM_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, None)
    }

    /// Like `load_from`, with a listen address that wins over the file and
    /// `DOORCAM_ADDR`. The override is validated with everything else.
    pub fn load_with(path: Option<&Path>, addr_override: Option<&str>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        if let Some(addr) = addr_override {
            cfg.http_addr = addr.to_string();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DoorcamConfigFile) -> Result<Self> {
        let http_addr = file
            .http
            .and_then(|http| http.addr)
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());

        let camera_file = file.camera.unwrap_or_default();
        let format = match camera_file.format.as_deref() {
            Some(raw) => parse_format(raw)?,
            None => PixelFormat::Jpeg,
        };
        let camera = SourceConfig {
            url: camera_file
                .url
                .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
            width: camera_file.width.unwrap_or(DEFAULT_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_HEIGHT),
            format,
            fb_count: camera_file.fb_count.unwrap_or(DEFAULT_FB_COUNT),
        };

        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            frame_interval: stream_file
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FRAME_INTERVAL),
            jpeg_quality: stream_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let actuator_file = file.actuator.unwrap_or_default();
        let actuator = ActuatorSettings {
            timing: ActuatorTiming {
                relay_duration: actuator_file
                    .relay_duration_ms
                    .map(Duration::from_millis)
                    .unwrap_or(RELAY_DURATION),
                indicator_delay: actuator_file
                    .indicator_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(INDICATOR_DELAY),
            },
            tick_interval: actuator_file
                .tick_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TICK_INTERVAL),
            button_debounce: actuator_file
                .button_debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BUTTON_DEBOUNCE),
        };

        let gpio_file = file.gpio.unwrap_or_default();
        let backend = parse_backend(
            gpio_file.backend.as_deref().unwrap_or("log"),
            gpio_file.sysfs_root,
        )?;
        let gpio = GpioSettings {
            backend,
            relay: gpio_file.relay.unwrap_or(DEFAULT_RELAY_PIN),
            buzzer: gpio_file.buzzer.unwrap_or(DEFAULT_BUZZER_PIN),
            indicator: gpio_file.indicator.unwrap_or(DEFAULT_INDICATOR_PIN),
            button: gpio_file.button.unwrap_or(Some(DEFAULT_BUTTON_PIN)),
        };

        Ok(Self {
            http_addr,
            camera,
            stream,
            actuator,
            gpio,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("DOORCAM_ADDR") {
            if !addr.trim().is_empty() {
                self.http_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("DOORCAM_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(interval) = std::env::var("DOORCAM_STREAM_INTERVAL_MS") {
            let ms: u64 = interval.parse().map_err(|_| {
                anyhow!("DOORCAM_STREAM_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.stream.frame_interval = Duration::from_millis(ms);
        }
        if let Ok(quality) = std::env::var("DOORCAM_JPEG_QUALITY") {
            self.stream.jpeg_quality = quality
                .parse()
                .map_err(|_| anyhow!("DOORCAM_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        if let Ok(duration) = std::env::var("DOORCAM_RELAY_DURATION_MS") {
            let ms: u64 = duration.parse().map_err(|_| {
                anyhow!("DOORCAM_RELAY_DURATION_MS must be an integer number of milliseconds")
            })?;
            self.actuator.timing.relay_duration = Duration::from_millis(ms);
        }
        if let Ok(backend) = std::env::var("DOORCAM_GPIO") {
            if !backend.trim().is_empty() {
                let root = match &self.gpio.backend {
                    GpioBackend::Sysfs { root } => Some(root.clone()),
                    GpioBackend::Log => None,
                };
                self.gpio.backend = parse_backend(&backend, root)?;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.http_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| anyhow!("http addr '{}' is not a socket address", self.http_addr))?;
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera dimensions must be non-zero"));
        }
        if self.camera.fb_count == 0 {
            return Err(anyhow!("camera fb_count must be at least 1"));
        }
        if self.stream.frame_interval.is_zero() {
            return Err(anyhow!("stream interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be in 1..=100, got {}",
                self.stream.jpeg_quality
            ));
        }
        if self.actuator.timing.relay_duration.is_zero() {
            return Err(anyhow!("relay duration must be greater than zero"));
        }
        if self.actuator.timing.indicator_delay >= self.actuator.timing.relay_duration {
            log::warn!(
                "indicator delay {:?} is not shorter than the relay window {:?}; the indicator will never light",
                self.actuator.timing.indicator_delay,
                self.actuator.timing.relay_duration
            );
        }
        if self.actuator.tick_interval.is_zero() {
            return Err(anyhow!("actuator tick interval must be greater than zero"));
        }
        Ok(())
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.http_addr.clone(),
        }
    }

    pub fn actuator_outputs(&self) -> ActuatorOutputs {
        match &self.gpio.backend {
            GpioBackend::Log => ActuatorOutputs {
                relay: Arc::new(MemoryPin::new(format!("relay(gpio{})", self.gpio.relay))),
                buzzer: Arc::new(MemoryPin::new(format!("buzzer(gpio{})", self.gpio.buzzer))),
                indicator: Arc::new(MemoryPin::new(format!(
                    "indicator(gpio{})",
                    self.gpio.indicator
                ))),
            },
            GpioBackend::Sysfs { root } => ActuatorOutputs {
                relay: Arc::new(SysfsOutputPin::new(root, self.gpio.relay, "relay")),
                buzzer: Arc::new(SysfsOutputPin::new(root, self.gpio.buzzer, "buzzer")),
                indicator: Arc::new(SysfsOutputPin::new(root, self.gpio.indicator, "indicator")),
            },
        }
    }

    /// The door button, if one is wired.
    pub fn button(&self) -> Option<Button> {
        let gpio = self.gpio.button?;
        let pin: Arc<dyn InputPin> = match &self.gpio.backend {
            GpioBackend::Log => Arc::new(IdleInput),
            GpioBackend::Sysfs { root } => Arc::new(SysfsInputPin::new(root, gpio, true)),
        };
        Some(Button::new(pin, self.actuator.button_debounce))
    }
}

fn parse_format(raw: &str) -> Result<PixelFormat> {
    PixelFormat::parse(raw).ok_or_else(|| {
        anyhow!(
            "unknown camera format '{}'; expected jpeg, rgb, gray or nv12",
            raw
        )
    })
}

fn parse_backend(raw: &str, root: Option<PathBuf>) -> Result<GpioBackend> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "log" | "none" => Ok(GpioBackend::Log),
        "sysfs" => Ok(GpioBackend::Sysfs {
            root: root.unwrap_or_else(|| PathBuf::from(DEFAULT_SYSFS_ROOT)),
        }),
        other => Err(anyhow!(
            "unknown gpio backend '{}'; expected log or sysfs",
            other
        )),
    }
}

fn read_config_file(path: &Path) -> Result<DoorcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
