//! Driver failure classification
//!
//! The driver cannot tell "camera unplugged" apart from "camera busy"
//! except through the transport's error signature, so this is a match over
//! the closed [`DriverError`] shapes and nothing else.

use driver::{DISCONNECT_ERROR_NAME, DISCONNECT_MESSAGE_MARKER, DriverError};

use super::error::SessionError;

/// What a driver failure means for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recognized library error; no state change
    Transient,
    /// The transport disappeared; tear down
    DeviceLost,
    /// Anything else; enter the error state
    Critical,
}

impl ErrorClass {
    /// Wrap `err` in the matching session error
    pub fn into_error(self, err: DriverError) -> SessionError {
        match self {
            ErrorClass::Transient => SessionError::Transient(err),
            ErrorClass::DeviceLost => SessionError::DeviceLost(err),
            ErrorClass::Critical => SessionError::Critical(err),
        }
    }
}

/// Classify a driver failure
///
/// The device-lost signature is checked before anything else, since it
/// arrives as a transport error that would otherwise count as critical.
pub fn classify(err: &DriverError) -> ErrorClass {
    if is_disconnection(err) {
        return ErrorClass::DeviceLost;
    }

    match err {
        DriverError::Library { .. } => ErrorClass::Transient,
        DriverError::Transport { .. } | DriverError::Fault { .. } => ErrorClass::Critical,
    }
}

/// Transport error named `NotFoundError` whose message carries the marker
pub fn is_disconnection(err: &DriverError) -> bool {
    matches!(
        err,
        DriverError::Transport { name, message }
            if name == DISCONNECT_ERROR_NAME && message.contains(DISCONNECT_MESSAGE_MARKER)
    )
}
