//! Unified error type for the inouttraffic-lib crate.
//!
//! [`TrafficError`] wraps per-device faults and the fatal startup conditions
//! (bad bitstream descriptor, unreadable image). Per-device faults are normally
//! handled by invalidating that device; a `TrafficError` reaching the binary
//! ends the run.

use std::fmt;

use crate::device::DeviceError;
use crate::usb::TransportError;

#[derive(Debug)]
pub enum TrafficError {
    /// Device fault that could not be confined to one device.
    Device(DeviceError),
    /// USB enumeration or other host-side I/O.
    Transport(TransportError),
    Io(std::io::Error),
    /// Invalid configuration or bitstream descriptor.
    Config(String),
    /// Configuration image could not be read.
    Image(String),
}

impl fmt::Display for TrafficError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficError::Device(e) => write!(f, "{e}"),
            TrafficError::Transport(e) => write!(f, "{e}"),
            TrafficError::Io(e) => write!(f, "I/O error: {e}"),
            TrafficError::Config(e) => write!(f, "Config error: {e}"),
            TrafficError::Image(e) => write!(f, "Bitstream error: {e}"),
        }
    }
}

impl std::error::Error for TrafficError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrafficError::Device(e) => Some(e),
            TrafficError::Transport(e) => Some(e),
            TrafficError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for TrafficError {
    fn from(e: DeviceError) -> Self {
        TrafficError::Device(e)
    }
}

impl From<TransportError> for TrafficError {
    fn from(e: TransportError) -> Self {
        TrafficError::Transport(e)
    }
}

impl From<std::io::Error> for TrafficError {
    fn from(e: std::io::Error) -> Self {
        TrafficError::Io(e)
    }
}

/// Crate-level Result alias using [`TrafficError`].
pub type Result<T> = std::result::Result<T, TrafficError>;
