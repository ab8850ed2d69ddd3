//! Driver capability traits
//!
//! The camera driver is a separately built module. It is loaded once per
//! process ([`DriverLoader`]), after which the loaded module
//! ([`DriverModule`]) creates one [`DriverContext`] per connection.

use std::future::Future;

use crate::error::Result;
use crate::types::{CapturedFile, ConfigNode, ConfigValue, PreviewFrame, SupportedOps};

/// Loads the driver module
pub trait DriverLoader: Send + Sync + 'static {
    /// Loaded module type
    type Module: DriverModule;

    /// Load and initialize the module
    ///
    /// Expensive; callers cache the result for the lifetime of the process.
    fn load(&self) -> impl Future<Output = Result<Self::Module>> + Send;
}

/// A loaded driver module
pub trait DriverModule: Send + Sync + 'static {
    /// Context type created by this module
    type Context: DriverContext;

    /// Open a new session with the attached camera
    fn create_context(&self) -> impl Future<Output = Result<Self::Context>> + Send;
}

/// One open camera session
///
/// Calls must never overlap; the session controller serializes every
/// access through its operation queue.
pub trait DriverContext: Send + Sync + 'static {
    /// Read the full configuration tree (root is a window)
    fn config(&self) -> impl Future<Output = Result<ConfigNode>> + Send;

    /// Write a single named setting
    fn set_config_value(
        &self,
        name: &str,
        value: ConfigValue,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Capture one live-view frame
    fn capture_preview(&self) -> impl Future<Output = Result<PreviewFrame>> + Send;

    /// Capture one full-resolution image
    fn capture_image(&self) -> impl Future<Output = Result<CapturedFile>> + Send;

    /// Drain pending device events, returning whether any were pending
    fn consume_events(&self) -> impl Future<Output = Result<bool>> + Send;

    /// Static capability set
    fn supported_ops(&self) -> SupportedOps;

    /// Release the hardware session
    fn dispose(&self);

    /// Whether [`dispose`](Self::dispose) already ran
    fn is_disposed(&self) -> bool;
}
