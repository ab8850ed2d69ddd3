//! Session error types

use driver::{DriverError, NOT_READY_MESSAGE, TransportError};
use thiserror::Error;

use super::state::SessionState;

/// Caller violated a precondition; nothing changed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("Camera is not ready (state: {state})")]
    NotReady { state: SessionState },

    #[error("Camera is already connected or connecting (state: {state})")]
    AlreadyConnected { state: SessionState },

    #[error("You need to connect to the camera first")]
    NotConnected,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("Operation queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },
}

impl UsageError {
    /// Rejection for an operation submitted in `state`
    pub fn unavailable_in(state: SessionState) -> Self {
        match state {
            SessionState::Disconnected => UsageError::NotConnected,
            state => UsageError::NotReady { state },
        }
    }
}

/// Failure of a session operation
///
/// Cloneable so one failure can reach both the awaiting caller and the
/// preview stream's completion channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// Recognized, recoverable driver error
    #[error("Driver error: {0}")]
    Transient(DriverError),

    /// The camera disappeared mid-operation
    #[error("Camera disconnected: {0}")]
    DeviceLost(DriverError),

    /// Unrecognized failure shape
    #[error("Critical driver failure: {0}")]
    Critical(DriverError),

    #[error("Config value '{name}' did not update after {attempts} polls")]
    Timeout { name: String, attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session worker stopped")]
    Shutdown,
}

impl SessionError {
    /// Errors that mean the preview loop lost a race with a stop request
    pub fn is_stop_race(&self) -> bool {
        match self {
            SessionError::Usage(UsageError::NotReady { .. }) | SessionError::Cancelled => true,
            SessionError::Transient(err) => err.message() == NOT_READY_MESSAGE,
            _ => false,
        }
    }
}
