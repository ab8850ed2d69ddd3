//! In-memory camera driver and loopback transport
//!
//! [`SimulatedCamera`] implements the driver capability traits without any
//! hardware: it serves a canned configuration tree, produces synthetic
//! preview frames and JPEG files, and can be scripted to fail, to delay
//! configuration writes, or to behave as if the camera was unplugged. It
//! also records how it was used (module loads, disposals, the peak number
//! of overlapping driver calls) so callers can check the session
//! controller's guarantees.
//!
//! [`LoopbackTransport`] is the matching transport: one always-present
//! device that can be opened, closed and unplugged on demand.

use bytes::{BufMut, Bytes, BytesMut};
use driver::{
    CameraDevice, CapturedFile, ConfigKind, ConfigNode, ConfigValue, DriverContext, DriverError,
    DriverLoader, DriverModule, FaultKind, PreviewFrame, SupportedOps, Transport, TransportError,
    TransportEvent,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Driver entry points, used for scripting failures and reading the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Load,
    CreateContext,
    Config,
    SetConfig,
    CapturePreview,
    CaptureImage,
    ConsumeEvents,
}

/// Write waiting to become visible in the configuration tree
struct PendingWrite {
    name: String,
    value: ConfigValue,
    /// Reads left before the write shows up; None never shows up
    reads_remaining: Option<u32>,
}

struct CameraState {
    config: Mutex<ConfigNode>,
    pending_writes: Mutex<Vec<PendingWrite>>,
    settle_after_reads: Mutex<Option<u32>>,
    failures: Mutex<VecDeque<(SimOp, DriverError)>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<SimOp>>,
    supported: SupportedOps,
    unplugged: AtomicBool,
    pending_events: AtomicUsize,
    loads: AtomicUsize,
    contexts_created: AtomicUsize,
    disposals: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    frames: AtomicU64,
    images: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements the in-flight counter when a call finishes
struct CallGuard<'a> {
    state: &'a CameraState,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CameraState {
    /// Common prologue of every driver call
    async fn enter(&self, op: SimOp) -> Result<CallGuard<'_>, DriverError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = CallGuard { state: self };

        lock(&self.calls).push(op);

        let latency = *lock(&self.latency);
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        if self.unplugged.load(Ordering::SeqCst) && op != SimOp::Load {
            return Err(DriverError::device_disconnected());
        }

        let scripted = {
            let mut failures = lock(&self.failures);
            failures
                .iter()
                .position(|(failing, _)| *failing == op)
                .and_then(|index| failures.remove(index))
        };
        if let Some((_, err)) = scripted {
            debug!("Simulated camera failing {:?}: {}", op, err);
            return Err(err);
        }

        Ok(guard)
    }

    /// Age pending writes by one read and apply the ones that became visible
    fn settle_pending_writes(&self) {
        let mut pending = lock(&self.pending_writes);
        let mut config = lock(&self.config);

        pending.retain_mut(|write| match write.reads_remaining.as_mut() {
            None => true,
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                if *remaining > 0 {
                    return true;
                }
                if let Some(node) = config.find_mut(&write.name) {
                    let _ = node.apply(&write.value);
                }
                false
            }
        });
    }
}

/// Scriptable in-memory camera
///
/// Cloning yields another handle to the same camera, so a test can keep one
/// handle for scripting while the session controller owns the other.
#[derive(Clone)]
pub struct SimulatedCamera {
    state: Arc<CameraState>,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCamera {
    /// Create a camera with the default configuration tree
    pub fn new() -> Self {
        Self::with_config(default_config_tree())
    }

    /// Create a camera serving the given configuration tree
    pub fn with_config(config: ConfigNode) -> Self {
        Self {
            state: Arc::new(CameraState {
                config: Mutex::new(config),
                pending_writes: Mutex::new(Vec::new()),
                settle_after_reads: Mutex::new(Some(1)),
                failures: Mutex::new(VecDeque::new()),
                latency: Mutex::new(Duration::ZERO),
                calls: Mutex::new(Vec::new()),
                supported: SupportedOps {
                    capture_image: true,
                    capture_video: false,
                    capture_audio: false,
                    capture_preview: true,
                    config: true,
                    trigger_capture: true,
                },
                unplugged: AtomicBool::new(false),
                pending_events: AtomicUsize::new(0),
                loads: AtomicUsize::new(0),
                contexts_created: AtomicUsize::new(0),
                disposals: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                frames: AtomicU64::new(0),
                images: AtomicU64::new(0),
            }),
        }
    }

    /// Number of reads after which a write becomes visible
    ///
    /// `Some(0)` applies writes immediately, `None` never applies them.
    pub fn set_settle_after_reads(&self, reads: Option<u32>) {
        *lock(&self.state.settle_after_reads) = reads;
    }

    /// Delay applied to every driver call
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.state.latency) = latency;
    }

    /// Fail the next call of `op` with `err`
    pub fn fail_next(&self, op: SimOp, err: DriverError) {
        lock(&self.state.failures).push_back((op, err));
    }

    /// Make every later call fail with the device-disconnected signature
    pub fn set_unplugged(&self, unplugged: bool) {
        self.state.unplugged.store(unplugged, Ordering::SeqCst);
    }

    /// Queue device events for `consume_events`
    pub fn queue_events(&self, count: usize) {
        self.state.pending_events.fetch_add(count, Ordering::SeqCst);
    }

    /// Current configuration tree, including applied writes
    pub fn config_snapshot(&self) -> ConfigNode {
        lock(&self.state.config).clone()
    }

    /// Times the module was loaded
    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    /// Contexts created so far
    pub fn contexts_created(&self) -> usize {
        self.state.contexts_created.load(Ordering::SeqCst)
    }

    /// Effective disposals (double disposals are not counted)
    pub fn disposals(&self) -> usize {
        self.state.disposals.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping driver calls observed
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every driver call in order
    pub fn calls(&self) -> Vec<SimOp> {
        lock(&self.state.calls).clone()
    }

    /// Number of calls of one kind
    pub fn count(&self, op: SimOp) -> usize {
        lock(&self.state.calls).iter().filter(|c| **c == op).count()
    }
}

impl DriverLoader for SimulatedCamera {
    type Module = SimulatedModule;

    async fn load(&self) -> driver::Result<SimulatedModule> {
        let _call = self.state.enter(SimOp::Load).await?;
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        info!("Simulated driver module loaded");
        Ok(SimulatedModule {
            state: self.state.clone(),
        })
    }
}

/// Loaded simulated module
pub struct SimulatedModule {
    state: Arc<CameraState>,
}

impl DriverModule for SimulatedModule {
    type Context = SimulatedContext;

    async fn create_context(&self) -> driver::Result<SimulatedContext> {
        let _call = self.state.enter(SimOp::CreateContext).await?;
        let id = self.state.contexts_created.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Simulated context {} created", id);
        Ok(SimulatedContext {
            id,
            state: self.state.clone(),
            disposed: AtomicBool::new(false),
        })
    }
}

/// Open simulated session
pub struct SimulatedContext {
    id: usize,
    state: Arc<CameraState>,
    disposed: AtomicBool,
}

impl SimulatedContext {
    fn check_alive(&self) -> driver::Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DriverError::fault(
                FaultKind::Type,
                "Cannot pass deleted object as a pointer",
            ));
        }
        Ok(())
    }
}

impl DriverContext for SimulatedContext {
    async fn config(&self) -> driver::Result<ConfigNode> {
        self.check_alive()?;
        let _call = self.state.enter(SimOp::Config).await?;
        self.state.settle_pending_writes();
        Ok(lock(&self.state.config).clone())
    }

    async fn set_config_value(&self, name: &str, value: ConfigValue) -> driver::Result<()> {
        self.check_alive()?;
        let _call = self.state.enter(SimOp::SetConfig).await?;

        // Validate against a copy so rejected writes never become pending
        let mut candidate = lock(&self.state.config)
            .find(name)
            .cloned()
            .ok_or_else(|| DriverError::library(format!("unknown setting '{}'", name)))?;
        candidate.apply(&value)?;

        let settle = *lock(&self.state.settle_after_reads);
        if settle == Some(0) {
            if let Some(node) = lock(&self.state.config).find_mut(name) {
                node.apply(&value)?;
            }
        } else {
            lock(&self.state.pending_writes).push(PendingWrite {
                name: name.to_string(),
                value,
                reads_remaining: settle,
            });
        }
        Ok(())
    }

    async fn capture_preview(&self) -> driver::Result<PreviewFrame> {
        self.check_alive()?;
        let _call = self.state.enter(SimOp::CapturePreview).await?;
        let sequence = self.state.frames.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PreviewFrame {
            data: synthetic_jpeg(sequence, 64),
            mime_type: "image/jpeg".to_string(),
        })
    }

    async fn capture_image(&self) -> driver::Result<CapturedFile> {
        self.check_alive()?;
        let _call = self.state.enter(SimOp::CaptureImage).await?;
        let sequence = self.state.images.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CapturedFile {
            name: format!("IMG_{:04}.JPG", sequence),
            data: synthetic_jpeg(sequence, 4096),
            mime_type: "image/jpeg".to_string(),
        })
    }

    async fn consume_events(&self) -> driver::Result<bool> {
        self.check_alive()?;
        let _call = self.state.enter(SimOp::ConsumeEvents).await?;
        Ok(self.state.pending_events.swap(0, Ordering::SeqCst) > 0)
    }

    fn supported_ops(&self) -> SupportedOps {
        self.state.supported
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.state.disposals.fetch_add(1, Ordering::SeqCst);
            debug!("Simulated context {} disposed", self.id);
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// JPEG-framed payload: SOI marker, sequence number, filler, EOI marker
fn synthetic_jpeg(sequence: u64, body_len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(body_len + 12);
    buf.put_slice(&[0xFF, 0xD8]);
    buf.put_u64(sequence);
    buf.put_bytes((sequence % 251) as u8, body_len);
    buf.put_slice(&[0xFF, 0xD9]);
    buf.freeze()
}

fn radio(name: &str, label: &str, value: &str, choices: &[&str]) -> ConfigNode {
    ConfigNode::leaf(
        name,
        label,
        ConfigKind::Radio {
            value: value.to_string(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
        },
    )
}

fn menu(name: &str, label: &str, value: &str, choices: &[&str]) -> ConfigNode {
    ConfigNode::leaf(
        name,
        label,
        ConfigKind::Menu {
            value: value.to_string(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
        },
    )
}

fn text(name: &str, label: &str, value: &str) -> ConfigNode {
    ConfigNode::leaf(
        name,
        label,
        ConfigKind::Text {
            value: value.to_string(),
        },
    )
}

/// Configuration tree of a typical interchangeable-lens camera
pub fn default_config_tree() -> ConfigNode {
    ConfigNode::window("main", "Camera and Driver Configuration")
        .with_child(
            ConfigNode::section("settings", "Camera Settings")
                .with_child(text("ownername", "Owner Name", ""))
                .with_child(ConfigNode::leaf(
                    "datetime",
                    "Camera Date and Time",
                    ConfigKind::DateTime { value: 1_700_000_000 },
                ))
                .with_child(radio(
                    "capturetarget",
                    "Capture Target",
                    "Internal RAM",
                    &["Internal RAM", "Memory card"],
                ))
                .with_child(ConfigNode::leaf(
                    "viewfinder",
                    "Viewfinder",
                    ConfigKind::Toggle { value: false },
                )),
        )
        .with_child(
            ConfigNode::section("imgsettings", "Image Settings")
                .with_child(radio(
                    "iso",
                    "ISO Speed",
                    "100",
                    &["Auto", "100", "200", "400", "800", "1600", "3200", "6400"],
                ))
                .with_child(menu(
                    "imageformat",
                    "Image Format",
                    "Large Fine JPEG",
                    &["Large Fine JPEG", "Medium Fine JPEG", "RAW", "RAW + Large Fine JPEG"],
                ))
                .with_child(radio(
                    "whitebalance",
                    "WhiteBalance",
                    "Auto",
                    &["Auto", "Daylight", "Shadow", "Cloudy", "Tungsten", "Fluorescent"],
                )),
        )
        .with_child(
            ConfigNode::section("capturesettings", "Capture Settings")
                .with_child(radio(
                    "shutterspeed",
                    "Shutter Speed",
                    "1/125",
                    &["1/30", "1/60", "1/125", "1/250", "1/500", "1/1000"],
                ))
                .with_child(radio(
                    "aperture",
                    "Aperture",
                    "5.6",
                    &["2.8", "4", "5.6", "8", "11", "16"],
                ))
                .with_child(ConfigNode::leaf(
                    "exposurecompensation",
                    "Exposure Compensation",
                    ConfigKind::Range {
                        value: 0.0,
                        min: -3.0,
                        max: 3.0,
                        step: 0.5,
                    },
                )),
        )
        .with_child(
            ConfigNode::section("status", "Camera Status Information")
                .with_child(text("serialnumber", "Serial Number", "SIM0001").read_only())
                .with_child(text("batterylevel", "Battery Level", "100%").read_only()),
        )
}

/// Device reported by [`LoopbackTransport`]
pub fn simulated_device() -> CameraDevice {
    CameraDevice {
        vendor_id: 0x1d6b,
        product_id: 0x0104,
        bus_number: 0,
        address: 1,
        manufacturer: Some("ptp-camera".to_string()),
        product: Some("Simulated Camera".to_string()),
        serial_number: Some("SIM0001".to_string()),
        interface_number: 0,
    }
}

/// In-memory transport with a single camera
pub struct LoopbackTransport {
    device: CameraDevice,
    authorized: AtomicBool,
    open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_open: Mutex<Option<TransportError>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Create a transport whose device is already authorized
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            device: simulated_device(),
            authorized: AtomicBool::new(true),
            open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_open: Mutex::new(None),
            events,
        }
    }

    /// Require `request_device` before the device is listed
    pub fn unauthorized() -> Self {
        let transport = Self::new();
        transport.authorized.store(false, Ordering::SeqCst);
        transport
    }

    /// Fail the next `open`
    pub fn fail_next_open(&self, err: TransportError) {
        *lock(&self.fail_open) = Some(err);
    }

    /// Simulate the cable being pulled
    pub fn unplug(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Loopback device unplugged");
            let _ = self.events.send(TransportEvent::Detached(self.device.clone()));
        }
    }

    /// Successful opens so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Closes so far
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn authorized_devices(&self) -> Result<Vec<CameraDevice>, TransportError> {
        if self.authorized.load(Ordering::SeqCst) {
            Ok(vec![self.device.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn request_device(&self) -> Result<CameraDevice, TransportError> {
        self.authorized.store(true, Ordering::SeqCst);
        Ok(self.device.clone())
    }

    async fn open(&self) -> Result<CameraDevice, TransportError> {
        if let Some(err) = lock(&self.fail_open).take() {
            return Err(err);
        }
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(TransportError::NotFound);
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            self.opens.fetch_add(1, Ordering::SeqCst);
            debug!("Loopback device opened");
        }
        Ok(self.device.clone())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            debug!("Loopback device closed");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_settles_after_configured_reads() {
        let camera = SimulatedCamera::new();
        camera.set_settle_after_reads(Some(3));
        let module = camera.load().await.unwrap();
        let ctx = module.create_context().await.unwrap();

        ctx.set_config_value("iso", ConfigValue::from(400)).await.unwrap();

        let read = |tree: ConfigNode| tree.find("iso").and_then(|n| n.value());
        assert_eq!(read(ctx.config().await.unwrap()), Some("100".into()));
        assert_eq!(read(ctx.config().await.unwrap()), Some("100".into()));
        assert_eq!(read(ctx.config().await.unwrap()), Some("400".into()));
    }

    #[tokio::test]
    async fn test_invalid_write_is_rejected() {
        let camera = SimulatedCamera::new();
        let module = camera.load().await.unwrap();
        let ctx = module.create_context().await.unwrap();

        let err = ctx
            .set_config_value("serialnumber", ConfigValue::from("X"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Library { .. }));

        let err = ctx
            .set_config_value("nosuchsetting", ConfigValue::from(1))
            .await
            .unwrap_err();
        assert!(err.message().contains("unknown setting"));
    }

    #[tokio::test]
    async fn test_disposed_context_faults() {
        let camera = SimulatedCamera::new();
        let module = camera.load().await.unwrap();
        let ctx = module.create_context().await.unwrap();

        ctx.dispose();
        ctx.dispose();
        assert!(ctx.is_disposed());
        assert_eq!(camera.disposals(), 1);
        assert!(matches!(
            ctx.capture_image().await,
            Err(DriverError::Fault { .. })
        ));
    }

    #[tokio::test]
    async fn test_scripted_failure_hits_matching_op_only() {
        let camera = SimulatedCamera::new();
        let module = camera.load().await.unwrap();
        let ctx = module.create_context().await.unwrap();

        camera.fail_next(SimOp::CaptureImage, DriverError::not_ready());
        assert!(ctx.capture_preview().await.is_ok());
        assert_eq!(ctx.capture_image().await.unwrap_err(), DriverError::not_ready());
        assert_eq!(ctx.capture_image().await.unwrap().name, "IMG_0001.JPG");
    }

    #[tokio::test]
    async fn test_consume_events_drains() {
        let camera = SimulatedCamera::new();
        let module = camera.load().await.unwrap();
        let ctx = module.create_context().await.unwrap();

        camera.queue_events(2);
        assert!(ctx.consume_events().await.unwrap());
        assert!(!ctx.consume_events().await.unwrap());
    }

    #[tokio::test]
    async fn test_loopback_unplug_publishes_detached() {
        let transport = LoopbackTransport::new();
        let mut events = transport.subscribe();

        transport.open().await.unwrap();
        transport.open().await.unwrap();
        assert_eq!(transport.opens(), 1);

        transport.unplug();
        assert!(!transport.is_open());
        assert!(matches!(events.recv().await, Ok(TransportEvent::Detached(_))));
    }

    #[tokio::test]
    async fn test_unauthorized_loopback_requires_request() {
        let transport = LoopbackTransport::unauthorized();
        assert!(transport.authorized_devices().await.unwrap().is_empty());
        assert_eq!(transport.open().await, Err(TransportError::NotFound));

        transport.request_device().await.unwrap();
        assert_eq!(transport.authorized_devices().await.unwrap().len(), 1);
        assert!(transport.open().await.is_ok());
    }
}
