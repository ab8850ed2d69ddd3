//! Common utilities for ptp-camera
//!
//! This crate provides functionality shared by the session controller and
//! its tests: the latest-value replay channel used for state observation,
//! error handling, logging setup, and an in-memory simulated camera.

pub mod channel;
pub mod error;
pub mod logging;
pub mod simulated;
pub mod test_utils;

pub use channel::{ReplayReceiver, ReplaySender};
pub use error::{Error, Result};
pub use logging::{LogFormat, setup_logging};
pub use simulated::{LoopbackTransport, SimOp, SimulatedCamera};
