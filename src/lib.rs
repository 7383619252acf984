//! Door camera device core.
//!
//! A camera and a door lock behind one small HTTP server:
//!
//! - `GET /stream` serves a paced `multipart/x-mixed-replace` MJPEG stream
//! - `GET /capture` serves a single fresh JPEG
//! - `GET /control?action=open` energises the door relay for a fixed window
//!
//! # Module Structure
//!
//! - `frame`: frame buffers and the single-release `Frame` contract
//! - `ingest`: frame sources (synthetic, JPEG directory, V4L2, upstream HTTP)
//! - `encode`: raw-to-JPEG encoding
//! - `stream` / `snapshot`: the two camera responders
//! - `actuator`: timed relay state machine, GPIO pins and the tick loop
//! - `api`: request routing and the HTTP server
//! - `config`: layered daemon configuration

pub mod actuator;
pub mod api;
pub mod config;
pub mod encode;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod snapshot;
pub mod stream;

pub use actuator::{ActuatorController, ActuatorOutputs, ActuatorTiming, OpenOutcome, TickAction};
pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use error::DeviceError;
pub use frame::{BufferPool, Frame, PixelFormat, PoolStats, SlotToken};
pub use ingest::{open_source, FrameLease, FrameSource, SourceConfig, SourceStats};
pub use stream::{stream_mjpeg, MjpegStream, StreamReport, StreamSettings};
