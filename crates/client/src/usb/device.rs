//! Camera interface discovery and claiming
//!
//! Blocking libusb calls only. The transport runs these on the blocking
//! thread pool.

use driver::{CameraDevice, DeviceFilter, TransportError};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use tracing::{debug, warn};

/// Map a libusb failure onto the transport error set
pub fn map_rusb_error(err: rusb::Error, device: &str) -> TransportError {
    match err {
        rusb::Error::Access => TransportError::PermissionDenied(device.to_string()),
        rusb::Error::Busy => TransportError::Busy(device.to_string()),
        rusb::Error::NoDevice => TransportError::Disconnected,
        rusb::Error::NotFound => TransportError::NotFound,
        other => TransportError::Usb(other.to_string()),
    }
}

/// Find the number of the first interface matching the filter's class pair
///
/// Looks through every configuration, not only the active one, so that a
/// camera still in its default configuration is found.
pub fn find_camera_interface(
    device: &Device<Context>,
    descriptor: &DeviceDescriptor,
    filter: &DeviceFilter,
) -> Option<u8> {
    for index in 0..descriptor.num_configurations() {
        let Ok(config) = device.config_descriptor(index) else {
            continue;
        };
        for interface in config.interfaces() {
            if let Some(alt) = interface
                .descriptors()
                .find(|alt| filter.matches_interface(alt.class_code(), alt.sub_class_code()))
            {
                return Some(alt.interface_number());
            }
        }
    }
    None
}

/// A device exposing a camera interface, not yet opened
pub struct Candidate {
    pub device: Device<Context>,
    pub info: CameraDevice,
}

/// Enumerate devices that expose a camera interface and pass the filter
///
/// Devices whose strings cannot be read (no permission yet) are still
/// listed; only the allow patterns on the product name need the strings.
pub fn enumerate(
    context: &Context,
    filter: &DeviceFilter,
) -> Result<Vec<Candidate>, TransportError> {
    let devices = context
        .devices()
        .map_err(|e| TransportError::Usb(format!("Failed to enumerate devices: {}", e)))?;

    let mut found = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!(
                    "Skipping device at bus {} address {}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };

        let Some(interface_number) = find_camera_interface(&device, &descriptor, filter) else {
            continue;
        };

        let (manufacturer, product, serial_number) = device
            .open()
            .map(|handle| read_strings(&handle, &descriptor))
            .unwrap_or((None, None, None));

        if !filter.allows(descriptor.vendor_id(), descriptor.product_id(), product.as_deref()) {
            debug!(
                "Camera {:04x}:{:04x} not in allow list",
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            continue;
        }

        let info = CameraDevice {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bus_number: device.bus_number(),
            address: device.address(),
            manufacturer,
            product,
            serial_number,
            interface_number,
        };
        found.push(Candidate { device, info });
    }

    Ok(found)
}

fn read_strings(
    handle: &DeviceHandle<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let read = |index: Option<u8>| {
        index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
    };
    (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    )
}

/// An opened camera with its interface claimed
pub struct OpenCamera {
    pub info: CameraDevice,
    handle: DeviceHandle<Context>,
    kernel_detached: bool,
}

impl OpenCamera {
    /// Open the device and claim the camera interface
    ///
    /// Detaches a kernel driver bound to the interface (gphoto-style tools
    /// and MTP daemons often hold it) and reattaches it on close.
    pub fn open(candidate: Candidate) -> Result<Self, TransportError> {
        let Candidate { device, info } = candidate;
        let name = info.display_name();
        let interface = info.interface_number;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open {}: {}", name, e);
            map_rusb_error(e, &name)
        })?;

        match device.active_config_descriptor() {
            Ok(config) => debug!("{} active configuration {}", name, config.number()),
            Err(rusb::Error::NotFound) => {
                // Unconfigured: select the first configuration
                let number = device
                    .config_descriptor(0)
                    .map(|config| config.number())
                    .map_err(|e| map_rusb_error(e, &name))?;
                handle
                    .set_active_configuration(number)
                    .map_err(|e| map_rusb_error(e, &name))?;
                debug!("{} selected configuration {}", name, number);
            }
            Err(e) => return Err(map_rusb_error(e, &name)),
        }

        let kernel_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {} of {}", interface, name);
                handle
                    .detach_kernel_driver(interface)
                    .map_err(|e| map_rusb_error(e, &name))?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!("Could not check kernel driver on interface {}: {}", interface, e);
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {} of {}: {}", interface, name, e);
            if kernel_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(map_rusb_error(e, &name));
        }

        debug!("Claimed interface {} of {}", interface, name);
        Ok(Self {
            info,
            handle,
            kernel_detached,
        })
    }

    /// Release the interface, give it back to the kernel and reset the device
    pub fn close(self) -> Result<(), TransportError> {
        let name = self.info.display_name();
        let interface = self.info.interface_number;

        if let Err(e) = self.handle.release_interface(interface) {
            warn!("Failed to release interface {} of {}: {}", interface, name, e);
        }
        if self.kernel_detached {
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!("Could not reattach kernel driver to {}: {}", name, e);
            }
        }

        match self.handle.reset() {
            Ok(()) => {}
            // Reset re-enumerates; a vanished device is already closed
            Err(rusb::Error::NotFound | rusb::Error::NoDevice) => {}
            Err(e) => return Err(map_rusb_error(e, &name)),
        }

        debug!("Closed {}", name);
        Ok(())
    }
}
