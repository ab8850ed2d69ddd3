//! USB transport capability
//!
//! The transport finds a camera interface, opens and claims it, and tells
//! the session controller when the device goes away. Enumeration details
//! live in the implementation; the controller only sees this trait.

use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio::sync::broadcast;

/// USB interface class of still-image (PTP) devices
pub const PTP_INTERFACE_CLASS: u8 = 6;

/// USB interface subclass of still-image (PTP/MTP) devices
pub const PTP_INTERFACE_SUBCLASS: u8 = 1;

/// Camera device as seen by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDevice {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub address: u8,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Serial number string (if available)
    pub serial_number: Option<String>,
    /// Number of the still-image interface
    pub interface_number: u8,
}

impl CameraDevice {
    /// Human readable name for logs and listings
    pub fn display_name(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{} {}", m, p),
            (None, Some(p)) => p.clone(),
            _ => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

/// Selects which devices the transport may pair with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Required interface class
    pub interface_class: u8,
    /// Required interface subclass
    pub interface_subclass: u8,
    /// Allow patterns; empty allows every matching interface
    ///
    /// Pattern formats:
    /// - "vid:pid" (e.g., "04a9:32b4") - exact vendor:product match
    /// - "vid:*" (e.g., "04a9:*") - all devices from vendor
    /// - Any other string - case-insensitive product name substring match
    pub allowed: Vec<String>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            interface_class: PTP_INTERFACE_CLASS,
            interface_subclass: PTP_INTERFACE_SUBCLASS,
            allowed: Vec::new(),
        }
    }
}

impl DeviceFilter {
    /// Check the class/subclass pair of an interface
    pub fn matches_interface(&self, class: u8, subclass: u8) -> bool {
        class == self.interface_class && subclass == self.interface_subclass
    }

    /// Check a device against the allow patterns
    pub fn allows(&self, vendor_id: u16, product_id: u16, product_name: Option<&str>) -> bool {
        if self.allowed.is_empty() {
            return true;
        }

        let vid = format!("{:04x}", vendor_id);
        let pid = format!("{:04x}", product_id);

        self.allowed
            .iter()
            .any(|pattern| Self::matches_pattern(pattern, &vid, &pid, product_name))
    }

    fn matches_pattern(pattern: &str, vid: &str, pid: &str, product_name: Option<&str>) -> bool {
        let pattern = pattern.to_lowercase();

        if let Some((pattern_vid, pattern_pid)) = pattern.split_once(':') {
            if pattern_pid == "*" {
                return vid == pattern_vid;
            }
            return vid == pattern_vid && pid == pattern_pid;
        }

        product_name
            .map(|name| name.to_lowercase().contains(&pattern))
            .unwrap_or(false)
    }
}

/// Notification published by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The open device was unplugged or otherwise vanished
    Detached(CameraDevice),
}

/// Transport failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No device matches the filter
    #[error("No matching camera found")]
    NotFound,

    /// The OS refused access to the device
    #[error("Permission denied opening {0}")]
    PermissionDenied(String),

    /// Another process holds the interface
    #[error("Device busy: {0}")]
    Busy(String),

    /// The device went away during the operation
    #[error("Device disconnected")]
    Disconnected,

    /// Operation needs an open device
    #[error("Transport is not open")]
    NotOpen,

    /// Any other USB stack failure
    #[error("USB error: {0}")]
    Usb(String),
}

/// Pairing and teardown of the camera's USB interface
pub trait Transport: Send + Sync + 'static {
    /// Whether a device is currently open and claimed
    fn is_open(&self) -> bool;

    /// List devices that match the filter and may be opened
    fn authorized_devices(
        &self,
    ) -> impl Future<Output = Result<Vec<CameraDevice>, TransportError>> + Send;

    /// Select a device for pairing (the native counterpart of a device picker)
    fn request_device(&self) -> impl Future<Output = Result<CameraDevice, TransportError>> + Send;

    /// Open, select the configuration and claim the camera interface
    ///
    /// Returns the already-open device when called while open.
    fn open(&self) -> impl Future<Output = Result<CameraDevice, TransportError>> + Send;

    /// Release the interface, reset and close the device
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to transport notifications
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
