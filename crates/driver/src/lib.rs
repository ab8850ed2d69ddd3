//! Driver capability interfaces for ptp-camera
//!
//! The camera protocol itself (capture, configuration tree, event parsing)
//! is implemented by an external, separately built driver module, and USB
//! pairing by a transport. This crate defines the minimal surface the
//! session controller needs from both, plus the values they exchange.
//!
//! # Example
//!
//! ```
//! use driver::{ConfigKind, ConfigNode, ConfigValue};
//!
//! let tree = ConfigNode::window("main", "Camera").with_child(ConfigNode::leaf(
//!     "iso",
//!     "ISO Speed",
//!     ConfigKind::Radio {
//!         value: "400".to_string(),
//!         choices: vec!["100".into(), "400".into()],
//!     },
//! ));
//!
//! let iso = tree.find("iso").and_then(|n| n.value()).unwrap();
//! assert!(ConfigValue::from(400).matches(&iso));
//! ```

pub mod error;
pub mod traits;
pub mod transport;
pub mod types;

pub use error::{
    DISCONNECT_ERROR_NAME, DISCONNECT_MESSAGE_MARKER, DriverError, FaultKind, NOT_READY_MESSAGE,
    Result,
};
pub use traits::{DriverContext, DriverLoader, DriverModule};
pub use transport::{
    CameraDevice, DeviceFilter, PTP_INTERFACE_CLASS, PTP_INTERFACE_SUBCLASS, Transport,
    TransportError, TransportEvent,
};
pub use types::{CapturedFile, ConfigKind, ConfigNode, ConfigValue, PreviewFrame, SupportedOps};
