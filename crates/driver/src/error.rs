//! Driver error types

use std::fmt;
use thiserror::Error;

/// Error name the transport reports when the device vanished mid-call
pub const DISCONNECT_ERROR_NAME: &str = "NotFoundError";

/// Message fragment the transport reports when the device vanished mid-call
pub const DISCONNECT_MESSAGE_MARKER: &str = "The device was disconnected";

/// Message of the driver's own "busy / not ready" error
pub const NOT_READY_MESSAGE: &str = "not ready";

/// Failure raised by a driver context
///
/// The driver produces exactly one of these shapes; the session controller
/// classifies them by variant and signature rather than by inspecting
/// arbitrary values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Application-level error raised by the driver library itself
    /// (e.g. "not ready", "already connected", invalid setting value)
    #[error("{message}")]
    Library { message: String },

    /// Error surfaced by the USB transport underneath the driver
    #[error("{name}: {message}")]
    Transport { name: String, message: String },

    /// Low-level fault inside the driver module (trap, type error, panic)
    #[error("{kind} fault: {message}")]
    Fault { kind: FaultKind, message: String },
}

/// Kind of low-level driver fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Runtime trap or abort inside the module
    Runtime,
    /// Value of unexpected type crossed the module boundary
    Type,
    /// Malformed data read from the device or module
    Syntax,
    /// Out-of-bounds or exhausted memory
    Memory,
    /// The module panicked
    Panic,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Runtime => write!(f, "Runtime"),
            FaultKind::Type => write!(f, "Type"),
            FaultKind::Syntax => write!(f, "Syntax"),
            FaultKind::Memory => write!(f, "Memory"),
            FaultKind::Panic => write!(f, "Panic"),
        }
    }
}

impl DriverError {
    /// Create a library error
    pub fn library(message: impl Into<String>) -> Self {
        DriverError::Library {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(name: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError::Transport {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a fault
    pub fn fault(kind: FaultKind, message: impl Into<String>) -> Self {
        DriverError::Fault {
            kind,
            message: message.into(),
        }
    }

    /// The driver's "not ready" error
    pub fn not_ready() -> Self {
        Self::library(NOT_READY_MESSAGE)
    }

    /// The transport error raised when the device is unplugged mid-call
    pub fn device_disconnected() -> Self {
        Self::transport(
            DISCONNECT_ERROR_NAME,
            format!("Failed to execute 'transferIn': {}.", DISCONNECT_MESSAGE_MARKER),
        )
    }

    /// Message text without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            DriverError::Library { message }
            | DriverError::Transport { message, .. }
            | DriverError::Fault { message, .. } => message,
        }
    }
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(DriverError::not_ready().to_string(), "not ready");

        let err = DriverError::fault(FaultKind::Runtime, "unreachable executed");
        assert_eq!(err.to_string(), "Runtime fault: unreachable executed");
    }

    #[test]
    fn test_device_disconnected_shape() {
        match DriverError::device_disconnected() {
            DriverError::Transport { name, message } => {
                assert_eq!(name, DISCONNECT_ERROR_NAME);
                assert!(message.contains(DISCONNECT_MESSAGE_MARKER));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
