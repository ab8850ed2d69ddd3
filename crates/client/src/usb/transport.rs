//! libusb-backed transport
//!
//! Enumeration, open and close run on the blocking pool. While a camera is
//! open, a hot-plug callback watches for its departure and a dedicated
//! thread pumps libusb events so the callback fires.

use driver::{CameraDevice, DeviceFilter, Transport, TransportError, TransportEvent};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::device::{self, OpenCamera};

const EVENT_CAPACITY: usize = 16;

/// Timeout of one libusb event wait; bounds how long stopping the pump takes
const EVENT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Slots {
    /// Device chosen by `request_device`, as (bus, address)
    selected: Option<(u8, u8)>,
    open: Option<OpenCamera>,
    pump: Option<EventPump>,
}

/// Transport over a locally attached USB camera
pub struct UsbTransport {
    context: Context,
    filter: DeviceFilter,
    slots: Mutex<Slots>,
    events: broadcast::Sender<TransportEvent>,
}

impl UsbTransport {
    pub fn new(filter: DeviceFilter) -> Result<Self, TransportError> {
        let context = Context::new()
            .map_err(|e| TransportError::Usb(format!("Failed to create USB context: {}", e)))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        debug!(
            "USB transport ready (interface class {} subclass {}, {} allow patterns)",
            filter.interface_class,
            filter.interface_subclass,
            filter.allowed.len()
        );

        Ok(Self {
            context,
            filter,
            slots: Mutex::new(Slots::default()),
            events,
        })
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(Context, DeviceFilter) -> Result<T, TransportError> + Send + 'static,
    {
        let context = self.context.clone();
        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || f(context, filter))
            .await
            .map_err(|e| TransportError::Usb(format!("USB task failed: {}", e)))?
    }
}

impl Transport for UsbTransport {
    fn is_open(&self) -> bool {
        self.slots().open.is_some()
    }

    async fn authorized_devices(&self) -> Result<Vec<CameraDevice>, TransportError> {
        let candidates = self
            .blocking(|context, filter| {
                let candidates = device::enumerate(&context, &filter)?;
                // Only devices we may actually open count as authorized
                Ok(candidates
                    .into_iter()
                    .filter(|c| c.device.open().is_ok())
                    .map(|c| c.info)
                    .collect::<Vec<_>>())
            })
            .await?;

        debug!("{} authorized cameras", candidates.len());
        Ok(candidates)
    }

    async fn request_device(&self) -> Result<CameraDevice, TransportError> {
        let chosen = self
            .blocking(|context, filter| {
                let mut candidates = device::enumerate(&context, &filter)?.into_iter();
                let first = candidates.next().ok_or(TransportError::NotFound)?;
                first
                    .device
                    .open()
                    .map_err(|e| device::map_rusb_error(e, &first.info.display_name()))?;
                Ok(first.info)
            })
            .await?;

        self.slots().selected = Some((chosen.bus_number, chosen.address));
        info!("Selected camera {}", chosen.display_name());
        Ok(chosen)
    }

    async fn open(&self) -> Result<CameraDevice, TransportError> {
        let selected = {
            let slots = self.slots();
            if let Some(open) = &slots.open {
                return Ok(open.info.clone());
            }
            slots.selected
        };

        let camera = self
            .blocking(move |context, filter| {
                let candidates = device::enumerate(&context, &filter)?;
                let candidate = candidates
                    .into_iter()
                    .find(|c| {
                        selected.is_none_or(|(bus, address)| {
                            c.info.bus_number == bus && c.info.address == address
                        })
                    })
                    .ok_or(TransportError::NotFound)?;
                OpenCamera::open(candidate)
            })
            .await?;
        let info = camera.info.clone();

        let pump = match EventPump::start(&self.context, &info, self.events.clone()) {
            Ok(pump) => Some(pump),
            Err(e) => {
                warn!("Hot-plug watch unavailable, unplug will surface as I/O errors: {}", e);
                None
            }
        };

        let raced = {
            let mut slots = self.slots();
            match &slots.open {
                Some(existing) => Some((existing.info.clone(), camera, pump)),
                None => {
                    slots.selected = Some((info.bus_number, info.address));
                    slots.open = Some(camera);
                    slots.pump = pump;
                    None
                }
            }
        };

        // Lost a race with a concurrent open; keep the first
        if let Some((existing, camera, pump)) = raced {
            let _ = tokio::task::spawn_blocking(move || {
                if let Some(pump) = pump {
                    pump.stop();
                }
                camera.close()
            })
            .await;
            return Ok(existing);
        }

        info!("Opened camera {}", info.display_name());
        Ok(info)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (camera, pump) = {
            let mut slots = self.slots();
            (slots.open.take(), slots.pump.take())
        };
        let Some(camera) = camera else {
            debug!("Close requested with no open camera");
            return Ok(());
        };
        let name = camera.info.display_name();

        let closed = tokio::task::spawn_blocking(move || {
            if let Some(pump) = pump {
                pump.stop();
            }
            camera.close()
        })
        .await
        .map_err(|e| TransportError::Usb(format!("USB task failed: {}", e)))?;

        info!("Closed camera {}", name);
        closed
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Publishes `Detached` when the watched device leaves the bus
struct DepartureWatch {
    camera: CameraDevice,
    events: broadcast::Sender<TransportEvent>,
}

impl DepartureWatch {
    fn watches(&self, bus: u8, address: u8) -> bool {
        self.camera.bus_number == bus && self.camera.address == address
    }
}

impl<T: UsbContext> Hotplug<T> for DepartureWatch {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
    }

    fn device_left(&mut self, device: Device<T>) {
        if !self.watches(device.bus_number(), device.address()) {
            return;
        }
        warn!("Camera {} left the bus", self.camera.display_name());
        // No subscriber just means nobody is watching
        let _ = self.events.send(TransportEvent::Detached(self.camera.clone()));
    }
}

/// Hot-plug registration plus the thread that drives libusb events
struct EventPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _registration: Registration<Context>,
}

impl EventPump {
    fn start(
        context: &Context,
        camera: &CameraDevice,
        events: broadcast::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        if !rusb::has_hotplug() {
            return Err(TransportError::Usb("libusb built without hot-plug support".into()));
        }

        let watch = DepartureWatch {
            camera: camera.clone(),
            events,
        };
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .vendor_id(camera.vendor_id)
            .product_id(camera.product_id)
            .register(context, Box::new(watch))
            .map_err(|e| TransportError::Usb(format!("Hot-plug registration failed: {}", e)))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            let context = context.clone();
            std::thread::Builder::new()
                .name("usb-events".into())
                .spawn(move || pump_events(context, stop))
                .map_err(|e| {
                    TransportError::Usb(format!("Failed to spawn USB event thread: {}", e))
                })?
        };

        debug!("Hot-plug watch registered for {}", camera.display_name());
        Ok(Self {
            stop,
            thread: Some(thread),
            _registration: registration,
        })
    }

    /// Stop the thread; blocks for at most one poll timeout
    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("USB event thread panicked");
            }
        }
    }
}

fn pump_events(context: Context, stop: Arc<AtomicBool>) {
    debug!("USB event thread started");
    while !stop.load(Ordering::SeqCst) {
        match context.handle_events(Some(EVENT_POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL_TIMEOUT);
            }
        }
    }
    debug!("USB event thread stopped");
}
