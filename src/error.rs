//! Error taxonomy for the device core.
//!
//! None of these abort the process. Each one ends at most the request that
//! raised it.

use std::fmt;

#[derive(Debug)]
pub enum DeviceError {
    /// The sensor could not hand out a frame (busy, pool exhausted, or faulted).
    Unavailable(String),
    /// A non-JPEG frame could not be compressed.
    EncodeFailure(String),
    /// The peer went away or the connection failed mid-write.
    TransportFailure(std::io::Error),
    /// A control request named an action the device does not know.
    InvalidCommand(Option<String>),
}

impl DeviceError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        DeviceError::Unavailable(reason.into())
    }

    pub fn encode(reason: impl Into<String>) -> Self {
        DeviceError::EncodeFailure(reason.into())
    }

    /// True for errors that end a session because the client left.
    pub fn is_transport(&self) -> bool {
        matches!(self, DeviceError::TransportFailure(_))
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Unavailable(reason) => write!(f, "camera unavailable: {}", reason),
            DeviceError::EncodeFailure(reason) => write!(f, "jpeg encode failed: {}", reason),
            DeviceError::TransportFailure(err) => write!(f, "transport failure: {}", err),
            DeviceError::InvalidCommand(Some(action)) => {
                write!(f, "invalid control action '{}'", action)
            }
            DeviceError::InvalidCommand(None) => write!(f, "missing control action"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::TransportFailure(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::TransportFailure(err)
    }
}
