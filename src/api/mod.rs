//! HTTP surface of the device.
//!
//! A small hand-rolled HTTP/1.1 server on `std::net`. The accept loop runs on
//! its own thread and hands every connection to a fresh thread, so a
//! long-lived `/stream` never holds up `/capture` or `/control`.
//!
//! Every response, including errors and preflight, carries the same
//! cross-origin header set.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::actuator::ActuatorController;
use crate::error::DeviceError;
use crate::ingest::FrameSource;
use crate::snapshot::{take_snapshot, SNAPSHOT_DISPOSITION};
use crate::stream::{stream_mjpeg, StreamSettings, STREAM_CONTENT_TYPE};

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stops accepting connections. Sessions already running finish on
    /// their own when the client goes away.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

struct DeviceContext {
    source: Arc<dyn FrameSource>,
    actuator: Arc<ActuatorController>,
    stream: StreamSettings,
}

pub struct ApiServer {
    cfg: ApiConfig,
    ctx: Arc<DeviceContext>,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        source: Arc<dyn FrameSource>,
        actuator: Arc<ActuatorController>,
        stream: StreamSettings,
    ) -> Self {
        Self {
            cfg,
            ctx: Arc::new(DeviceContext {
                source,
                actuator,
                stream,
            }),
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("parse listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = self.ctx;
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx, shutdown_thread) {
                    log::error!("http server stopped: {}", err);
                }
            })
            .context("spawn http accept thread")?;

        log::info!("http server listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: Arc<DeviceContext>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("could not spawn handler for {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Stream,
    Capture,
    /// Carries the raw `action` query value, if any.
    Control(Option<String>),
    Health,
    Preflight,
    NotFound,
    MethodNotAllowed,
}

/// Maps a method and request target to a handler.
pub fn route(method: &str, target: &str) -> Route {
    if method == "OPTIONS" {
        return Route::Preflight;
    }
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let known = matches!(path, "/stream" | "/capture" | "/control" | "/health");
    if !known {
        return Route::NotFound;
    }
    if method != "GET" {
        return Route::MethodNotAllowed;
    }
    match path {
        "/stream" => Route::Stream,
        "/capture" => Route::Capture,
        "/control" => Route::Control(query.and_then(|q| query_param(q, "action"))),
        _ => Route::Health,
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then(|| v.to_string())
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlAction {
    Open,
}

impl ControlAction {
    pub fn parse(action: Option<&str>) -> Result<Self, DeviceError> {
        match action {
            Some("open") => Ok(ControlAction::Open),
            other => Err(DeviceError::InvalidCommand(other.map(str::to_string))),
        }
    }
}

#[derive(Debug, Serialize)]
struct ControlReply {
    status: &'static str,
    message: &'static str,
}

impl ControlReply {
    const OPENED: ControlReply = ControlReply {
        status: "success",
        message: "Door opened",
    };
    const INVALID: ControlReply = ControlReply {
        status: "error",
        message: "Invalid action",
    };
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_connection(mut stream: TcpStream, ctx: &DeviceContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };
    log::debug!(
        "{} {} ({})",
        request.method,
        request.raw_path,
        request.headers.get("user-agent").map(String::as_str).unwrap_or("-")
    );

    match route(&request.method, &request.raw_path) {
        Route::Stream => serve_stream(stream, ctx),
        Route::Capture => serve_capture(&mut stream, ctx),
        Route::Control(action) => serve_control(&mut stream, ctx, action.as_deref()),
        Route::Health => serve_health(&mut stream, ctx),
        Route::Preflight => write_response(&mut stream, 200, None, &[], &[]),
        Route::NotFound => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
        Route::MethodNotAllowed => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
    }
}

fn serve_stream(mut stream: TcpStream, ctx: &DeviceContext) -> Result<()> {
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    write_head(
        &mut stream,
        200,
        &[
            ("Content-Type", STREAM_CONTENT_TYPE),
            ("Cache-Control", "no-cache"),
            ("Connection", "close"),
        ],
    )?;
    let report = stream_mjpeg(ctx.source.as_ref(), ctx.stream, &mut stream);
    log::info!("stream session ended after {} frames", report.frames_sent);
    Ok(())
}

fn serve_capture(stream: &mut TcpStream, ctx: &DeviceContext) -> Result<()> {
    let lease = match take_snapshot(ctx.source.as_ref()) {
        Ok(lease) => lease,
        Err(err) => {
            log::warn!("capture failed: {}", err);
            return write_response(stream, 500, None, &[], &[]);
        }
    };
    write_response(
        stream,
        200,
        Some("image/jpeg"),
        &[("Content-Disposition", SNAPSHOT_DISPOSITION)],
        lease.frame().bytes(),
    )
}

/// 200 while the camera reports healthy, 503 otherwise.
fn health_reply(camera_healthy: bool) -> (u16, &'static str) {
    if camera_healthy {
        (200, r#"{"status":"ok"}"#)
    } else {
        (503, r#"{"status":"degraded","camera":"unavailable"}"#)
    }
}

fn serve_health(stream: &mut TcpStream, ctx: &DeviceContext) -> Result<()> {
    let (status, body) = health_reply(ctx.source.is_healthy());
    if status != 200 {
        log::warn!("health check: camera unavailable");
    }
    write_json_response(stream, status, body)
}

fn serve_control(stream: &mut TcpStream, ctx: &DeviceContext, action: Option<&str>) -> Result<()> {
    let reply = match ControlAction::parse(action) {
        Ok(ControlAction::Open) => {
            ctx.actuator.open();
            ControlReply::OPENED
        }
        Err(err) => {
            log::warn!("control rejected: {}", err);
            ControlReply::INVALID
        }
    };
    let body = serde_json::to_vec(&reply)?;
    write_response(stream, 200, Some("application/json"), &[], &body)
}

// ----------------------------------------------------------------------------
// Wire
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    raw_path: String,
    headers: HashMap<String, String>,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    parse_request(&data)
}

fn parse_request(data: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    Ok(HttpRequest {
        method: method.to_string(),
        raw_path: raw_path.to_string(),
        headers,
    })
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_head<W: Write>(out: &mut W, status: u16, headers: &[(&str, &str)]) -> io::Result<()> {
    let mut head = format!("{}\r\n", status_line(status));
    for (name, value) in CORS_HEADERS {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    out.write_all(head.as_bytes())
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, Some("application/json"), &[], body.as_bytes())
}

fn write_response<W: Write>(
    out: &mut W,
    status: u16,
    content_type: Option<&str>,
    extra: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let len = body.len().to_string();
    let mut headers: Vec<(&str, &str)> = Vec::with_capacity(extra.len() + 3);
    if let Some(content_type) = content_type {
        headers.push(("Content-Type", content_type));
    }
    headers.push(("Content-Length", &len));
    headers.push(("Connection", "close"));
    headers.extend_from_slice(extra);
    write_head(out, status, &headers)?;
    out.write_all(body)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_known_paths() {
        assert_eq!(route("GET", "/stream"), Route::Stream);
        assert_eq!(route("GET", "/capture"), Route::Capture);
        assert_eq!(route("GET", "/health"), Route::Health);
        assert_eq!(
            route("GET", "/control?action=open"),
            Route::Control(Some("open".to_string()))
        );
        assert_eq!(route("GET", "/control"), Route::Control(None));
        assert_eq!(route("GET", "/control?foo=1&action"), Route::Control(Some(String::new())));
    }

    #[test]
    fn options_is_preflight_for_any_path() {
        assert_eq!(route("OPTIONS", "/control"), Route::Preflight);
        assert_eq!(route("OPTIONS", "/anything/else"), Route::Preflight);
        assert_eq!(route("OPTIONS", "*"), Route::Preflight);
    }

    #[test]
    fn unknown_paths_and_methods() {
        assert_eq!(route("GET", "/"), Route::NotFound);
        assert_eq!(route("GET", "/controls"), Route::NotFound);
        assert_eq!(route("POST", "/control?action=open"), Route::MethodNotAllowed);
        assert_eq!(route("DELETE", "/nowhere"), Route::NotFound);
    }

    #[test]
    fn only_open_is_a_valid_action() {
        assert_eq!(ControlAction::parse(Some("open")).unwrap(), ControlAction::Open);
        for bad in [Some("close"), Some("OPEN"), Some(""), None] {
            let err = ControlAction::parse(bad).unwrap_err();
            assert!(matches!(err, DeviceError::InvalidCommand(_)));
        }
    }

    #[test]
    fn action_must_be_its_own_parameter() {
        assert_eq!(
            route("GET", "/control?reaction=open"),
            Route::Control(None)
        );
        assert_eq!(
            route("GET", "/control?mode=x&action=open"),
            Route::Control(Some("open".to_string()))
        );
    }

    #[test]
    fn every_response_carries_cors_headers() -> Result<()> {
        let mut out = Vec::new();
        write_response(&mut out, 500, None, &[], &[])?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        for (name, value) in CORS_HEADERS {
            assert!(text.contains(&format!("{}: {}\r\n", name, value)));
        }
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        Ok(())
    }

    #[test]
    fn control_replies_serialize_exactly() -> Result<()> {
        assert_eq!(
            serde_json::to_string(&ControlReply::OPENED)?,
            r#"{"status":"success","message":"Door opened"}"#
        );
        assert_eq!(
            serde_json::to_string(&ControlReply::INVALID)?,
            r#"{"status":"error","message":"Invalid action"}"#
        );
        Ok(())
    }

    #[test]
    fn health_follows_camera_state() {
        assert_eq!(health_reply(true), (200, r#"{"status":"ok"}"#));
        let (status, body) = health_reply(false);
        assert_eq!(status, 503);
        assert_eq!(status_line(status), "HTTP/1.1 503 Service Unavailable");
        assert!(body.contains("degraded"));
    }

    #[test]
    fn parses_request_line_and_headers() -> Result<()> {
        let req = parse_request(b"GET /control?action=open HTTP/1.1\r\nHost: door\r\n\r\n")?;
        assert_eq!(req.method, "GET");
        assert_eq!(req.raw_path, "/control?action=open");
        assert_eq!(req.headers.get("host").map(String::as_str), Some("door"));
        assert!(parse_request(b"").is_err());
        Ok(())
    }
}
