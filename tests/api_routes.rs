use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use doorcam::actuator::{ActuatorController, ActuatorOutputs, ActuatorTiming, Level, MemoryPin};
use doorcam::api::{ApiConfig, ApiHandle, ApiServer};
use doorcam::frame::{BufferPool, Frame, PixelFormat};
use doorcam::ingest::{FrameSource, SourceConfig, SourceStats, SyntheticSource};
use doorcam::stream::StreamSettings;
use doorcam::DeviceError;

const CORS: [&str; 3] = [
    "Access-Control-Allow-Origin: *",
    "Access-Control-Allow-Methods: GET, POST, OPTIONS",
    "Access-Control-Allow-Headers: Content-Type",
];

/// Sensor that never produces a frame.
struct DeadSensor {
    pool: BufferPool,
}

impl FrameSource for DeadSensor {
    fn acquire(&self) -> Result<Frame, DeviceError> {
        Err(DeviceError::unavailable("sensor not responding"))
    }

    fn release(&self, frame: Frame) {
        self.pool.reclaim(frame);
    }

    fn is_healthy(&self) -> bool {
        false
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: 0,
            source: "dead://".to_string(),
            pool: self.pool.stats(),
        }
    }
}

struct Pins {
    relay: Arc<MemoryPin>,
    buzzer: Arc<MemoryPin>,
    indicator: Arc<MemoryPin>,
}

impl Pins {
    fn untouched(&self) -> bool {
        self.relay.history().is_empty()
            && self.buzzer.history().is_empty()
            && self.indicator.history().is_empty()
    }
}

struct TestDevice {
    controller: Arc<ActuatorController>,
    pins: Pins,
    api_handle: Option<ApiHandle>,
}

impl TestDevice {
    fn new(source: Arc<dyn FrameSource>) -> Result<Self> {
        let pins = Pins {
            relay: Arc::new(MemoryPin::new("relay")),
            buzzer: Arc::new(MemoryPin::new("buzzer")),
            indicator: Arc::new(MemoryPin::new("indicator")),
        };
        let controller = Arc::new(ActuatorController::new(
            ActuatorOutputs {
                relay: pins.relay.clone(),
                buzzer: pins.buzzer.clone(),
                indicator: pins.indicator.clone(),
            },
            ActuatorTiming::default(),
        ));
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let settings = StreamSettings {
            frame_interval: Duration::from_millis(5),
            ..StreamSettings::default()
        };
        let api_handle =
            ApiServer::new(api_config, source, controller.clone(), settings).spawn()?;
        Ok(Self {
            controller,
            pins,
            api_handle: Some(api_handle),
        })
    }

    fn with_camera() -> Result<Self> {
        Self::new(Arc::new(SyntheticSource::new(SourceConfig {
            url: "stub://test".to_string(),
            width: 32,
            height: 24,
            format: PixelFormat::Jpeg,
            fb_count: 2,
        })))
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, method: &str, target: &str) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let request = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }
}

impl Drop for TestDevice {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("no header terminator"))?;
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response[split + 4..].to_vec();
    Ok((headers, body))
}

fn assert_cors(headers: &str) {
    for header in CORS {
        assert!(headers.contains(header), "missing '{}' in:\n{}", header, headers);
    }
}

fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8]) && bytes.ends_with(&[0xFF, 0xD9])
}

#[test]
fn control_open_activates_relay() -> Result<()> {
    let device = TestDevice::with_camera()?;

    let (headers, body) = device.request("GET", "/control?action=open")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert!(headers.contains("Content-Type: application/json"));
    assert_cors(&headers);
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["status"], "success");
    assert_eq!(value["message"], "Door opened");

    assert!(device.controller.is_active());
    assert_eq!(device.pins.relay.level(), Level::High);
    assert_eq!(device.pins.buzzer.level(), Level::High);
    Ok(())
}

#[test]
fn control_rejects_unknown_or_missing_action() -> Result<()> {
    let device = TestDevice::with_camera()?;

    for target in ["/control?action=close", "/control", "/control?door=open"] {
        let (headers, body) = device.request("GET", target)?;
        assert!(headers.starts_with("HTTP/1.1 200 OK"), "{}", target);
        assert_cors(&headers);
        let value: Value = serde_json::from_slice(&body)?;
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "Invalid action");
    }

    assert!(!device.controller.is_active());
    assert!(device.pins.untouched());
    Ok(())
}

#[test]
fn capture_returns_fresh_jpeg() -> Result<()> {
    let device = TestDevice::with_camera()?;

    let (headers, body) = device.request("GET", "/capture")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert!(headers.contains("Content-Type: image/jpeg"));
    assert!(headers.contains("Content-Disposition: inline; filename=capture.jpg"));
    assert!(headers.contains(&format!("Content-Length: {}", body.len())));
    assert_cors(&headers);
    assert!(is_jpeg(&body));
    Ok(())
}

#[test]
fn capture_failure_is_a_server_error_with_no_body() -> Result<()> {
    let device = TestDevice::new(Arc::new(DeadSensor {
        pool: BufferPool::new(2),
    }))?;

    let (headers, body) = device.request("GET", "/capture")?;
    assert!(headers.starts_with("HTTP/1.1 500"));
    assert!(headers.contains("Content-Length: 0"));
    assert_cors(&headers);
    assert!(body.is_empty());
    assert!(device.pins.untouched());
    Ok(())
}

#[test]
fn preflight_answers_any_path_with_empty_body() -> Result<()> {
    let device = TestDevice::with_camera()?;

    for target in ["/control", "/stream", "/does/not/exist"] {
        let (headers, body) = device.request("OPTIONS", target)?;
        assert!(headers.starts_with("HTTP/1.1 200 OK"), "{}", target);
        assert_cors(&headers);
        assert!(body.is_empty());
    }
    assert!(device.pins.untouched());
    Ok(())
}

#[test]
fn unknown_routes_still_carry_cors() -> Result<()> {
    let device = TestDevice::with_camera()?;

    let (headers, body) = device.request("GET", "/admin")?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    assert_cors(&headers);
    assert_eq!(serde_json::from_slice::<Value>(&body)?["error"], "not_found");

    let (headers, _) = device.request("POST", "/control?action=open")?;
    assert!(headers.starts_with("HTTP/1.1 405"));
    assert_cors(&headers);
    assert!(!device.controller.is_active());

    let (headers, body) = device.request("GET", "/health")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(serde_json::from_slice::<Value>(&body)?["status"], "ok");
    Ok(())
}

fn read_part(reader: &mut impl BufRead) -> Result<Vec<u8>> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line != "--frame\r\n" {
        return Err(anyhow!("expected boundary, got {:?}", line));
    }
    let mut length = None;
    loop {
        line.clear();
        reader.read_line(&mut line)?;
        if line == "\r\n" {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length: ") {
            length = Some(value.trim().parse::<usize>()?);
        }
    }
    let length = length.ok_or_else(|| anyhow!("part without Content-Length"))?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    let mut terminator = [0u8; 2];
    reader.read_exact(&mut terminator)?;
    assert_eq!(&terminator, b"\r\n");
    Ok(body)
}

#[test]
fn stream_serves_length_delimited_jpeg_parts() -> Result<()> {
    let device = TestDevice::with_camera()?;

    let mut stream = TcpStream::connect(device.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut headers = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line == "\r\n" || line.is_empty() {
            break;
        }
        headers.push_str(&line);
    }
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert!(headers.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));
    assert_cors(&headers);

    for _ in 0..3 {
        assert!(is_jpeg(&read_part(&mut reader)?));
    }

    // A live stream does not hold up the control path.
    let (control_headers, _) = device.request("GET", "/control?action=open")?;
    assert!(control_headers.starts_with("HTTP/1.1 200 OK"));
    assert!(device.controller.is_active());

    assert!(is_jpeg(&read_part(&mut reader)?));
    drop(reader);
    drop(stream);
    Ok(())
}

#[test]
fn health_reports_an_unresponsive_camera() -> Result<()> {
    let device = TestDevice::new(Arc::new(DeadSensor {
        pool: BufferPool::new(2),
    }))?;

    let (headers, body) = device.request("GET", "/health")?;
    assert!(headers.starts_with("HTTP/1.1 503"));
    assert_cors(&headers);
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["status"], "degraded");
    assert_eq!(value["camera"], "unavailable");
    assert!(device.pins.untouched());
    Ok(())
}
