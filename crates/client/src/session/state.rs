//! Session lifecycle state machine

use common::{ReplayReceiver, ReplaySender};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use super::error::UsageError;

/// Lifecycle state of a camera session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No context exists
    Disconnected,
    /// Transport pairing, module load and context creation in progress
    Connecting,
    /// Context created, driver still initializing
    Connected,
    /// Idle and accepting operations
    Ready,
    /// An operation or the preview loop owns the context
    Busy,
    /// Unrecognized failure; waiting for recovery or manual disconnect
    Error,
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`
    ///
    /// Same-state transitions are not listed; the state machine treats them
    /// as no-ops.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Ready | Error) => true,
            (Connected, Ready | Error) => true,
            (Ready, Busy | Error) => true,
            (Busy, Ready | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Current state plus a replaying stream of every change
///
/// All transitions go through this type. Each one is checked against the
/// transition table and published to subscribers under the same lock, so
/// observers see transitions in exactly the order they were made.
pub struct StateMachine {
    channel: ReplaySender<SessionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            channel: ReplaySender::new(SessionState::Disconnected),
        }
    }

    pub fn current(&self) -> SessionState {
        self.channel.latest()
    }

    /// Subscribe to the current state and all later transitions
    pub fn subscribe(&self) -> ReplayReceiver<SessionState> {
        self.channel.subscribe()
    }

    /// Move to `next`, returning the previous state
    ///
    /// Setting the current state again publishes nothing.
    pub fn set_state(&self, next: SessionState) -> Result<SessionState, UsageError> {
        let previous = self.channel.try_update(|current| {
            if *current == next {
                Ok(None)
            } else if current.can_transition_to(next) {
                Ok(Some(next))
            } else {
                Err(UsageError::InvalidTransition {
                    from: *current,
                    to: next,
                })
            }
        })?;

        match previous {
            Some(from) => {
                log_transition(from, next);
                Ok(from)
            }
            None => Ok(next),
        }
    }

    /// Move to `next` only if the current state is `expected`
    ///
    /// Returns the actual state when it differs.
    pub fn transition_from(
        &self,
        expected: SessionState,
        next: SessionState,
    ) -> Result<(), SessionState> {
        let previous = self.channel.try_update(|current| {
            if *current != expected || !current.can_transition_to(next) {
                Err(*current)
            } else {
                Ok(Some(next))
            }
        })?;

        if let Some(from) = previous {
            log_transition(from, next);
        }
        Ok(())
    }
}

fn log_transition(from: SessionState, to: SessionState) {
    match to {
        SessionState::Busy | SessionState::Ready if from != SessionState::Connecting => {
            debug!("Session state {} -> {}", from, to);
        }
        _ => info!("Session state {} -> {}", from, to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 6] = [Disconnected, Connecting, Connected, Ready, Busy, Error];

    #[test]
    fn test_transition_table_is_exhaustive() {
        let allowed = [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connecting, Ready),
            (Connecting, Error),
            (Connected, Ready),
            (Connected, Error),
            (Ready, Busy),
            (Ready, Error),
            (Busy, Ready),
            (Busy, Error),
        ];

        for from in ALL {
            for to in ALL {
                if from == to {
                    continue;
                }
                let expected = to == Disconnected || allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_error_reachable_from_everything_but_disconnected() {
        for from in ALL {
            if from == Error {
                continue;
            }
            assert_eq!(from.can_transition_to(Error), from != Disconnected);
        }
    }

    #[test]
    fn test_set_state_publishes_in_order() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();

        machine.set_state(Connecting).unwrap();
        machine.set_state(Ready).unwrap();
        machine.set_state(Ready).unwrap();
        machine.set_state(Busy).unwrap();

        assert_eq!(rx.drain_ready(), vec![Disconnected, Connecting, Ready, Busy]);
    }

    #[test]
    fn test_invalid_transition_rejected_without_publishing() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();

        let err = machine.set_state(Busy).unwrap_err();
        assert_eq!(
            err,
            UsageError::InvalidTransition {
                from: Disconnected,
                to: Busy
            }
        );
        assert_eq!(machine.current(), Disconnected);
        assert_eq!(rx.drain_ready(), vec![Disconnected]);
    }

    #[test]
    fn test_transition_from_checks_expected() {
        let machine = StateMachine::new();

        assert_eq!(machine.transition_from(Ready, Busy), Err(Disconnected));
        assert_eq!(machine.transition_from(Disconnected, Connecting), Ok(()));
        assert_eq!(machine.transition_from(Disconnected, Connecting), Err(Connecting));
        assert_eq!(machine.current(), Connecting);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(toml::Value::try_from(Busy).unwrap().as_str(), Some("busy"));
        assert_eq!(Ready.to_string(), "ready");
    }
}
