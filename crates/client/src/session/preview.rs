//! Cancellable live-view loop
//!
//! The loop captures one preview frame at a time through the operation
//! queue, hands it to the frame callback and waits one frame interval
//! before the next capture. The cadence and the active flag are plain
//! fields; stopping only clears the flag and drops queued work, since a
//! driver call already in flight cannot be interrupted.

use driver::{DriverContext, PreviewFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::core::SessionCore;
use super::error::{SessionError, UsageError};
use super::events::SessionEvent;
use super::queue::OperationQueue;
use super::state::SessionState;

/// Default pause between frames (one display refresh at 60 Hz)
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

type Outcome = Option<Result<(), SessionError>>;

/// Handle to a running (or finished) preview loop
#[derive(Clone)]
pub struct PreviewStream {
    active: Arc<AtomicBool>,
    done: watch::Receiver<Outcome>,
}

impl PreviewStream {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for the loop to end
    ///
    /// Resolves `Ok` when the loop was stopped and with the loop's error
    /// when a capture failed.
    pub async fn finished(&self) -> Result<(), SessionError> {
        let mut done = self.done.clone();
        match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            Err(_) => Err(SessionError::Shutdown),
        }
    }
}

/// Starts and stops the preview loop of one session
pub struct PreviewStreamer<C> {
    core: Arc<SessionCore<C>>,
    queue: OperationQueue<C>,
    frame_interval: Duration,
    current: Mutex<Option<PreviewStream>>,
}

impl<C: DriverContext> PreviewStreamer<C> {
    pub fn new(
        core: Arc<SessionCore<C>>,
        queue: OperationQueue<C>,
        frame_interval: Duration,
    ) -> Self {
        Self {
            core,
            queue,
            frame_interval,
            current: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<PreviewStream>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.slot().as_ref().is_some_and(PreviewStream::is_active)
    }

    /// Start the loop, or return the running one
    ///
    /// Clears the queue and holds the session `Busy` until stopped.
    pub fn start<F>(&self, on_frame: F) -> Result<PreviewStream, SessionError>
    where
        F: FnMut(PreviewFrame) + Send + 'static,
    {
        let mut current = self.slot();
        if let Some(stream) = current.as_ref().filter(|s| s.is_active()) {
            debug!("Preview already running");
            return Ok(stream.clone());
        }

        self.core
            .state()
            .transition_from(SessionState::Ready, SessionState::Busy)
            .map_err(UsageError::unavailable_in)?;
        let generation = self.core.cancel_pending();
        self.core.emit(SessionEvent::CapturingPreview);

        let active = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = watch::channel(None);
        let stream = PreviewStream {
            active: active.clone(),
            done: done_rx,
        };
        *current = Some(stream.clone());
        drop(current);

        let preview = PreviewLoop {
            core: self.core.clone(),
            queue: self.queue.clone(),
            active,
            generation,
            frame_interval: self.frame_interval,
        };
        tokio::spawn(async move {
            let outcome = preview.run(on_frame).await;
            let _ = done_tx.send(Some(outcome));
        });

        info!("Preview started ({:?} frame interval)", self.frame_interval);
        Ok(stream)
    }

    /// Stop the loop, return to `Ready` and flush pending device events
    ///
    /// Does nothing when no preview is active.
    pub async fn stop(&self) {
        let Some(stream) = self.slot().take() else {
            return;
        };
        if !stream.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self
            .core
            .state()
            .transition_from(SessionState::Busy, SessionState::Ready);
        self.queue.cancel_current();

        match self
            .queue
            .schedule("flush events", |ctx| async move { ctx.consume_events().await })
            .await
        {
            Ok(pending) => debug!("Flushed device events after preview (pending: {})", pending),
            Err(e) => warn!("Failed to flush device events after preview: {}", e),
        }

        // The loop reports its own failures to whoever awaits the stream
        let _ = stream.finished().await;
        info!("Preview stopped");
    }

    /// Mark the loop inactive without touching the device
    pub fn deactivate(&self) {
        if let Some(stream) = self.slot().take() {
            stream.active.store(false, Ordering::SeqCst);
        }
    }
}

struct PreviewLoop<C> {
    core: Arc<SessionCore<C>>,
    queue: OperationQueue<C>,
    active: Arc<AtomicBool>,
    generation: u64,
    frame_interval: Duration,
}

impl<C: DriverContext> PreviewLoop<C> {
    async fn run<F>(self, mut on_frame: F) -> Result<(), SessionError>
    where
        F: FnMut(PreviewFrame) + Send + 'static,
    {
        let mut frames = 0u64;

        let outcome = loop {
            if !self.active.load(Ordering::SeqCst) {
                break Ok(());
            }

            let captured = self
                .queue
                .schedule_stream("capture preview", |ctx| async move {
                    ctx.capture_preview().await
                })
                .await;

            match captured {
                Ok(frame) if self.active.load(Ordering::SeqCst) => {
                    frames += 1;
                    on_frame(frame);
                }
                Ok(_) => {
                    debug!("Dropping preview frame captured after stop");
                    break Ok(());
                }
                Err(err) if err.is_stop_race() => {
                    debug!("Preview capture raced with stop: {}", err);
                    break Ok(());
                }
                Err(err) => {
                    warn!("Preview capture failed: {}", err);
                    break Err(err);
                }
            }

            tokio::time::sleep(self.frame_interval).await;
        };

        // Ended on its own: hand the session back unless it was cancelled
        if self.active.swap(false, Ordering::SeqCst) && self.core.generation() == self.generation {
            let _ = self
                .core
                .state()
                .transition_from(SessionState::Busy, SessionState::Ready);
        }

        debug!("Preview loop finished after {} frames", frames);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::simulated::{SimOp, SimulatedCamera, SimulatedContext};
    use driver::{DriverError, DriverLoader, DriverModule, FaultKind};
    use tokio::sync::mpsc;

    async fn ready_streamer() -> (
        SimulatedCamera,
        Arc<SessionCore<SimulatedContext>>,
        PreviewStreamer<SimulatedContext>,
    ) {
        let camera = SimulatedCamera::new();
        let module = camera.load().await.unwrap();
        let core = Arc::new(SessionCore::new());
        core.install_context(Arc::new(module.create_context().await.unwrap()));
        core.state().set_state(SessionState::Connecting).unwrap();
        core.state().set_state(SessionState::Ready).unwrap();
        let queue = OperationQueue::new(core.clone());
        let streamer = PreviewStreamer::new(core.clone(), queue, DEFAULT_FRAME_INTERVAL);
        (camera, core, streamer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_delivers_frames() {
        let (camera, core, streamer) = ready_streamer().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        streamer
            .start(move |frame| {
                let _ = tx.send(frame);
            })
            .unwrap();
        assert_eq!(core.state().current(), SessionState::Busy);

        for _ in 0..3 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.mime_type, "image/jpeg");
        }
        streamer.stop().await;

        assert!(!streamer.is_active());
        assert_eq!(core.state().current(), SessionState::Ready);
        assert_eq!(camera.count(SimOp::ConsumeEvents), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_returns_running_stream() {
        let (camera, _core, streamer) = ready_streamer().await;

        let first = streamer.start(|_| {}).unwrap();
        let second = streamer.start(|_| panic!("second loop must not run")).unwrap();
        assert!(first.is_active() && second.is_active());

        tokio::time::sleep(Duration::from_millis(100)).await;
        streamer.stop().await;

        assert!(first.finished().await.is_ok());
        assert!(camera.max_in_flight() <= 1);
    }

    #[tokio::test]
    async fn test_stop_when_inactive_is_noop() {
        let (camera, core, streamer) = ready_streamer().await;

        streamer.stop().await;

        assert_eq!(core.state().current(), SessionState::Ready);
        assert_eq!(camera.count(SimOp::ConsumeEvents), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_from_driver_ends_loop_quietly() {
        let (camera, core, streamer) = ready_streamer().await;
        camera.fail_next(SimOp::CapturePreview, DriverError::not_ready());

        let stream = streamer.start(|_| {}).unwrap();

        assert!(stream.finished().await.is_ok());
        assert!(!streamer.is_active());
        assert_eq!(core.state().current(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_surface_from_stream() {
        let (camera, core, streamer) = ready_streamer().await;
        camera.fail_next(SimOp::CapturePreview, DriverError::library("card full"));

        let stream = streamer.start(|_| {}).unwrap();

        assert_eq!(
            stream.finished().await.unwrap_err(),
            SessionError::Transient(DriverError::library("card full"))
        );
        assert_eq!(core.state().current(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_error_leaves_error_state() {
        let (camera, core, streamer) = ready_streamer().await;
        camera.fail_next(SimOp::CapturePreview, DriverError::fault(FaultKind::Memory, "oob"));

        let stream = streamer.start(|_| {}).unwrap();

        assert!(matches!(stream.finished().await, Err(SessionError::Critical(_))));
        assert_eq!(core.state().current(), SessionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_flight_during_stop_surfaces() {
        let (camera, core, streamer) = ready_streamer().await;
        camera.set_latency(Duration::from_millis(100));
        camera.fail_next(SimOp::CapturePreview, DriverError::fault(FaultKind::Memory, "oob"));

        let stream = streamer.start(|_| {}).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        streamer.stop().await;

        assert!(matches!(stream.finished().await, Err(SessionError::Critical(_))));
        assert_eq!(core.state().current(), SessionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_in_flight_during_stop_is_dropped() {
        let (camera, core, streamer) = ready_streamer().await;
        camera.set_latency(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let stream = streamer
            .start(move |frame| {
                let _ = tx.send(frame);
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        streamer.stop().await;

        assert!(stream.finished().await.is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(core.state().current(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_start_requires_ready() {
        let (_camera, core, streamer) = ready_streamer().await;
        core.tear_down();

        let err = streamer.start(|_| {}).err().unwrap();
        assert_eq!(err, SessionError::Usage(UsageError::NotConnected));
    }
}
