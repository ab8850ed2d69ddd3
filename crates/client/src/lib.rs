//! ptp-camera client library
//!
//! Session controller for a USB still camera, the libusb transport and the
//! file-based configuration used by the `ptp-camera` binary.

pub mod config;
pub mod session;
pub mod usb;

pub use session::{SessionController, SessionError, SessionEvent, SessionOptions, SessionState};
