//! State shared by the operation queue, the preview streamer and the controller

use driver::{DriverContext, DriverError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::classify::{ErrorClass, classify};
use super::error::SessionError;
use super::events::{EVENT_CAPACITY, SessionEvent};
use super::state::{SessionState, StateMachine};

/// Context slot, state machine, cancellation generation and event stream
///
/// The context is only handed to operation-queue jobs; nothing else calls
/// into it except disposal.
pub struct SessionCore<C> {
    state: StateMachine,
    slot: Mutex<Slot<C>>,
    generation: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

struct Slot<C> {
    context: Option<Arc<C>>,
    /// Bumped by every teardown; a connect attempt stays current while it matches
    epoch: u64,
}

/// Token of one connect attempt, taken when it entered `Connecting`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAttempt {
    epoch: u64,
}

impl<C: DriverContext> Default for SessionCore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: DriverContext> SessionCore<C> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: StateMachine::new(),
            slot: Mutex::new(Slot {
                context: None,
                epoch: 0,
            }),
            generation: AtomicU64::new(0),
            events,
        }
    }

    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    fn slot(&self) -> MutexGuard<'_, Slot<C>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current context, if connected
    pub fn context(&self) -> Option<Arc<C>> {
        self.slot().context.clone()
    }

    pub fn has_context(&self) -> bool {
        self.slot().context.is_some()
    }

    /// Put a context into an empty slot
    ///
    /// Refuses, leaving the installed context in place, when the slot is
    /// already occupied.
    pub fn install_context(&self, context: Arc<C>) -> bool {
        let mut slot = self.slot();
        if slot.context.is_some() {
            warn!("Refusing to replace the installed camera context");
            return false;
        }
        slot.context = Some(context);
        true
    }

    /// Move `Disconnected` to `Connecting` and stamp the attempt
    pub fn begin_connect(&self) -> Result<ConnectAttempt, SessionState> {
        let slot = self.slot();
        self.state
            .transition_from(SessionState::Disconnected, SessionState::Connecting)?;
        Ok(ConnectAttempt { epoch: slot.epoch })
    }

    /// Install the attempt's context and move to `Ready`
    ///
    /// Fails without installing anything when a teardown happened since
    /// the attempt began; the caller still owns `context` then.
    pub fn complete_connect(
        &self,
        attempt: ConnectAttempt,
        context: Arc<C>,
        announce_connected: bool,
    ) -> bool {
        let mut slot = self.slot();
        if slot.epoch != attempt.epoch || slot.context.is_some() {
            return false;
        }

        let ready = if announce_connected {
            self.state
                .transition_from(SessionState::Connecting, SessionState::Connected)
                .and_then(|()| {
                    self.state
                        .transition_from(SessionState::Connected, SessionState::Ready)
                })
        } else {
            self.state
                .transition_from(SessionState::Connecting, SessionState::Ready)
        };

        match ready {
            Ok(()) => {
                slot.context = Some(context);
                true
            }
            Err(state) => {
                debug!("Connect attempt found session {} instead of connecting", state);
                false
            }
        }
    }

    /// Enter `Error` for a failed attempt unless it was superseded
    pub fn fail_connect(&self, attempt: ConnectAttempt) -> bool {
        let slot = self.slot();
        if slot.epoch != attempt.epoch {
            return false;
        }
        self.enter_error();
        true
    }

    /// Generation stamped on newly queued jobs
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate every job queued so far
    pub fn cancel_pending(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Dispose the context, drop queued work and move to `Disconnected`
    ///
    /// Safe to call repeatedly; the context is disposed at most once.
    /// Also invalidates any connect attempt still in progress.
    pub fn tear_down(&self) -> bool {
        let mut slot = self.slot();
        slot.epoch += 1;
        let context = slot.context.take();
        self.cancel_pending();

        let disposed = match context {
            Some(ctx) if !ctx.is_disposed() => {
                ctx.dispose();
                true
            }
            _ => false,
        };

        if let Err(e) = self.state.set_state(SessionState::Disconnected) {
            // Every state may move to Disconnected
            error!("Teardown transition rejected: {}", e);
        }
        disposed
    }

    /// Move to `Error` unless already torn down
    pub fn enter_error(&self) {
        match self.state.set_state(SessionState::Error) {
            Ok(SessionState::Error) => {}
            Ok(_) => self.emit(SessionEvent::ErrorEntered),
            Err(e) => debug!("Not entering error state: {}", e),
        }
    }

    /// Classify a driver failure and apply its state side effects
    pub fn apply_failure(&self, err: DriverError) -> SessionError {
        let class = classify(&err);
        match class {
            ErrorClass::DeviceLost => {
                warn!("Camera disconnected during operation: {}", err);
                self.tear_down();
                self.emit(SessionEvent::DeviceLost);
            }
            ErrorClass::Critical => {
                error!("Critical driver failure: {}", err);
                self.enter_error();
            }
            ErrorClass::Transient => {
                debug!("Driver error: {}", err);
            }
        }
        class.into_error(err)
    }
}
