//! Informational session events

use std::time::Duration;

/// Capacity of the event broadcast channel
pub const EVENT_CAPACITY: usize = 64;

/// Notable things that happened to a session
///
/// Events accompany state changes and errors; they never replace the error
/// returned to the caller of the operation that caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    ConnectionFailed { reason: String },
    Disconnected,
    /// The transport vanished; the context was torn down
    DeviceLost,
    OperationCancelled,
    CapturingPreview,
    CapturingImage,
    ErrorEntered,
    RecoveryScheduled { delay: Duration },
    RecoveryFailed { reason: String },
}
