//! Session controller
//!
//! Composes the state machine, operation queue, preview streamer and config
//! synchronizer into the public connect / disconnect / capture / preview
//! operations, and runs a supervisor task that reacts to the error state,
//! to device loss and to transport notifications.

use common::ReplayReceiver;
use driver::{
    CameraDevice, CapturedFile, ConfigNode, ConfigValue, DriverContext, DriverLoader,
    DriverModule, PreviewFrame, SupportedOps, Transport, TransportEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use super::classify::classify;
use super::config_sync::{self, ConfigChangeRequest, DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL};
use super::core::{ConnectAttempt, SessionCore};
use super::error::{SessionError, UsageError};
use super::events::SessionEvent;
use super::module::ModuleCell;
use super::preview::{DEFAULT_FRAME_INTERVAL, PreviewStream, PreviewStreamer};
use super::queue::OperationQueue;
use super::state::SessionState;

/// Context type produced by a loader's module
pub type ContextOf<L> = <<L as DriverLoader>::Module as DriverModule>::Context;

/// Default wait before recovering from the error state
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// Runtime tuning of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Read-back polls before a config write times out
    pub config_max_retries: u32,
    /// Pause between read-back polls
    pub config_poll_interval: Duration,
    /// Pause between preview frames
    pub preview_frame_interval: Duration,
    /// Disconnect and reconnect automatically after entering `Error`
    pub auto_recover: bool,
    /// Wait before the automatic recovery attempt
    pub recovery_delay: Duration,
    /// Publish `Connected` between `Connecting` and `Ready`
    pub announce_connected: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            config_max_retries: DEFAULT_MAX_RETRIES,
            config_poll_interval: DEFAULT_POLL_INTERVAL,
            preview_frame_interval: DEFAULT_FRAME_INTERVAL,
            auto_recover: true,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            announce_connected: false,
        }
    }
}

struct Inner<L: DriverLoader, T: Transport> {
    module: Arc<ModuleCell<L>>,
    transport: Arc<T>,
    options: SessionOptions,
    core: Arc<SessionCore<ContextOf<L>>>,
    queue: OperationQueue<ContextOf<L>>,
    preview: PreviewStreamer<ContextOf<L>>,
    /// One automatic recovery per entry into `Error`
    recovery_armed: AtomicBool,
}

/// Controller of one camera session
///
/// Cheap to clone; clones drive the same session.
pub struct SessionController<L: DriverLoader, T: Transport> {
    inner: Arc<Inner<L, T>>,
}

impl<L: DriverLoader, T: Transport> Clone for SessionController<L, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: DriverLoader, T: Transport> SessionController<L, T> {
    /// Create a disconnected controller and start its supervisor
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(module: Arc<ModuleCell<L>>, transport: Arc<T>, options: SessionOptions) -> Self {
        let core = Arc::new(SessionCore::new());
        let queue = OperationQueue::new(core.clone());
        let preview =
            PreviewStreamer::new(core.clone(), queue.clone(), options.preview_frame_interval);

        let states = core.state().subscribe();
        let events = core.subscribe_events();
        let transport_events = transport.subscribe();

        let inner = Arc::new(Inner {
            module,
            transport,
            options,
            core,
            queue,
            preview,
            recovery_armed: AtomicBool::new(false),
        });

        let supervisor = Supervisor {
            inner: Arc::downgrade(&inner),
            states,
            events,
            transport_events,
        };
        tokio::spawn(supervisor.run());

        Self { inner }
    }

    pub fn state(&self) -> SessionState {
        self.inner.core.state().current()
    }

    /// Current state followed by every later transition
    pub fn subscribe_state(&self) -> ReplayReceiver<SessionState> {
        self.inner.core.state().subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.core.subscribe_events()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn is_preview_active(&self) -> bool {
        self.inner.preview.is_active()
    }

    /// Jobs waiting in the operation queue
    pub fn pending_operations(&self) -> usize {
        self.inner.queue.pending()
    }

    /// Open the transport, load the driver module and create a context
    ///
    /// Fails without changing state unless the session is `Disconnected`.
    /// Any later failure leaves the session in `Error`.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.inner.recovery_armed.store(true, Ordering::SeqCst);
        self.establish().await
    }

    async fn establish(&self) -> Result<(), SessionError> {
        let core = &self.inner.core;
        let attempt = core
            .begin_connect()
            .map_err(|state| UsageError::AlreadyConnected { state })?;

        match self.open_session(attempt).await {
            Ok(()) => {
                self.inner.recovery_armed.store(true, Ordering::SeqCst);
                core.emit(SessionEvent::Connected);
                info!("Camera connected");
                Ok(())
            }
            Err(SessionError::Cancelled) => {
                debug!("Connect superseded by disconnect");
                Err(SessionError::Cancelled)
            }
            Err(err) => {
                if !core.fail_connect(attempt) {
                    debug!("Superseded connect attempt failed: {}", err);
                    return Err(SessionError::Cancelled);
                }
                error!("Connection error: {}", err);
                core.emit(SessionEvent::ConnectionFailed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn open_session(&self, attempt: ConnectAttempt) -> Result<(), SessionError> {
        let inner = &self.inner;

        if inner.transport.is_open() {
            debug!("Reusing open camera device");
        } else {
            let device = inner.transport.open().await?;
            info!("Opened {}", device.display_name());
        }

        let module = inner
            .module
            .get()
            .await
            .map_err(|e| classify(&e).into_error(e))?;
        let context = Arc::new(
            module
                .create_context()
                .await
                .map_err(|e| classify(&e).into_error(e))?,
        );

        if !inner
            .core
            .complete_connect(attempt, context.clone(), inner.options.announce_connected)
        {
            // Disconnected while connecting; this context was never installed
            context.dispose();
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    /// Tear the session down; safe to call in any state and repeatedly
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let was = inner.core.state().current();

        inner.preview.deactivate();
        if inner.core.tear_down() {
            debug!("Camera context disposed");
        }

        if inner.transport.is_open() {
            if let Err(e) = inner.transport.close().await {
                warn!("Failed to close camera device: {}", e);
            }
        }

        if was != SessionState::Disconnected {
            inner.core.emit(SessionEvent::Disconnected);
            info!("Camera disconnected");
        }
    }

    /// Capture a full-resolution image, stopping any preview first
    ///
    /// Driver failures also move the session to `Error`.
    pub async fn capture_image(&self) -> Result<CapturedFile, SessionError> {
        self.stop_preview().await;

        let core = self.inner.core.clone();
        let result = self
            .inner
            .queue
            .schedule("capture image", move |ctx| async move {
                core.emit(SessionEvent::CapturingImage);
                ctx.capture_image().await
            })
            .await;

        if let Err(SessionError::Transient(_) | SessionError::Critical(_)) = &result {
            self.inner.core.enter_error();
        }
        result
    }

    /// Capture a single preview frame outside the streaming loop
    pub async fn capture_preview(&self) -> Result<PreviewFrame, SessionError> {
        let core = self.inner.core.clone();
        self.inner
            .queue
            .schedule("capture preview", move |ctx| async move {
                core.emit(SessionEvent::CapturingPreview);
                ctx.capture_preview().await
            })
            .await
    }

    /// Read the full configuration tree
    pub async fn get_config(&self) -> Result<ConfigNode, SessionError> {
        self.inner
            .queue
            .schedule("read config", |ctx| async move { ctx.config().await })
            .await
    }

    /// Write a setting and wait until the camera reports it
    pub async fn set_config_value(
        &self,
        name: &str,
        value: impl Into<ConfigValue>,
    ) -> Result<(), SessionError> {
        let options = &self.inner.options;
        let request = ConfigChangeRequest::new(name, value)
            .with_budget(options.config_max_retries, options.config_poll_interval);

        let polls = config_sync::synchronize(&self.inner.queue, request).await?;
        debug!("Setting '{}' confirmed after {} polls", name, polls);
        Ok(())
    }

    /// Drain pending device events, returning whether any were pending
    pub async fn consume_events(&self) -> Result<bool, SessionError> {
        self.inner
            .queue
            .schedule("consume events", |ctx| async move { ctx.consume_events().await })
            .await
    }

    /// Capability set of the connected camera
    pub fn supported_ops(&self) -> Result<SupportedOps, SessionError> {
        self.inner
            .core
            .context()
            .map(|ctx| ctx.supported_ops())
            .ok_or_else(|| UsageError::NotConnected.into())
    }

    /// Start streaming preview frames into `on_frame`
    ///
    /// Returns the running stream when one is already active.
    pub fn start_preview<F>(&self, on_frame: F) -> Result<PreviewStream, SessionError>
    where
        F: FnMut(PreviewFrame) + Send + 'static,
    {
        self.inner.preview.start(on_frame)
    }

    /// Stop streaming; does nothing when no preview is active
    pub async fn stop_preview(&self) {
        self.inner.preview.stop().await;
    }

    /// Drop queued operations, force `Ready` and flush device events
    pub async fn cancel_current_operation(&self) {
        self.inner.queue.cancel_current();

        if self.inner.core.has_context() {
            if let Err(e) = self.consume_events().await {
                warn!("Failed to flush device events after cancel: {}", e);
            }
        }
    }

    /// Disconnect and reconnect if still in `Error`
    async fn recover(&self) {
        if self.state() != SessionState::Error {
            debug!("Recovery skipped, session is {}", self.state());
            return;
        }

        info!("Attempting to recover camera session");
        self.disconnect().await;
        match self.establish().await {
            Ok(()) => info!("Camera session recovered"),
            Err(e) => {
                error!("Recovery failed: {}", e);
                self.inner.core.emit(SessionEvent::RecoveryFailed {
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Watches the session on behalf of its controllers
struct Supervisor<L: DriverLoader, T: Transport> {
    inner: Weak<Inner<L, T>>,
    states: ReplayReceiver<SessionState>,
    events: broadcast::Receiver<SessionEvent>,
    transport_events: broadcast::Receiver<TransportEvent>,
}

impl<L: DriverLoader, T: Transport> Supervisor<L, T> {
    async fn run(mut self) {
        let mut transport_alive = true;

        loop {
            tokio::select! {
                state = self.states.recv() => match state {
                    Ok(SessionState::Error) => self.on_error(),
                    Ok(_) => {}
                    Err(_) => break,
                },
                event = self.events.recv() => match event {
                    Ok(SessionEvent::DeviceLost) => self.on_device_lost().await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Supervisor lagged, skipped {} session events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                event = self.transport_events.recv(), if transport_alive => match event {
                    Ok(TransportEvent::Detached(device)) => self.on_detached(device),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Supervisor lagged, skipped {} transport events", skipped);
                    }
                    Err(RecvError::Closed) => transport_alive = false,
                },
            }
        }
        debug!("Session supervisor stopped");
    }

    fn controller(&self) -> Option<SessionController<L, T>> {
        self.inner.upgrade().map(|inner| SessionController { inner })
    }

    fn on_error(&self) {
        let Some(controller) = self.controller() else {
            return;
        };
        let inner = &controller.inner;

        if !inner.options.auto_recover || !inner.recovery_armed.swap(false, Ordering::SeqCst) {
            warn!("Camera entered error state; waiting for manual intervention");
            return;
        }

        let delay = inner.options.recovery_delay;
        warn!("Camera entered error state; recovering in {:?}", delay);
        inner.core.emit(SessionEvent::RecoveryScheduled { delay });

        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SessionController { inner }.recover().await;
            }
        });
    }

    async fn on_device_lost(&self) {
        let Some(controller) = self.controller() else {
            return;
        };

        controller.inner.preview.deactivate();
        if controller.inner.transport.is_open() {
            if let Err(e) = controller.inner.transport.close().await {
                warn!("Failed to close lost camera device: {}", e);
            }
        }
        controller.inner.core.emit(SessionEvent::Disconnected);
        info!("Camera disconnected");
    }

    fn on_detached(&self, device: CameraDevice) {
        let Some(controller) = self.controller() else {
            return;
        };
        let core = &controller.inner.core;

        if core.state().current() == SessionState::Disconnected {
            debug!("{} detached while disconnected", device.display_name());
            return;
        }

        warn!("{} was unplugged", device.display_name());
        controller.inner.preview.deactivate();
        core.tear_down();
        core.emit(SessionEvent::DeviceLost);
    }
}
