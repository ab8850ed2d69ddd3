//! Camera session controller
//!
//! The driver context allows exactly one call at a time and may vanish when
//! the cable is pulled. This module owns that context and everything needed
//! to use it safely:
//!
//! - [`state`]: lifecycle state machine with a replaying state stream
//! - [`queue`]: single-flight operation queue
//! - [`classify`]: maps driver failures to transient / device lost / critical
//! - [`preview`]: cancellable live-view loop
//! - [`config_sync`]: configuration writes confirmed by read-back polling
//! - [`controller`]: the composition root with automatic recovery

pub mod classify;
pub mod config_sync;
pub mod controller;
pub mod core;
pub mod error;
pub mod events;
pub mod module;
pub mod preview;
pub mod queue;
pub mod state;

pub use classify::{ErrorClass, classify};
pub use config_sync::ConfigChangeRequest;
pub use controller::{ContextOf, SessionController, SessionOptions};
pub use error::{SessionError, UsageError};
pub use events::SessionEvent;
pub use module::ModuleCell;
pub use preview::PreviewStream;
pub use state::SessionState;
