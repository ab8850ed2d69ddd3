//! Single-flight operation queue
//!
//! Every call into the driver context goes through one worker task fed by a
//! bounded `async-channel` queue. Each job carries a oneshot reply, much
//! like a command sent to a device worker thread. The worker runs jobs
//! strictly in submission order and never starts one before the previous
//! one has settled, so at most one driver call is ever in flight.
//!
//! Before running a job the worker checks it against the session state;
//! after it settles the worker applies the failure's state side effects and
//! only then replies, so a caller that sees an error also sees its effect on
//! the state.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use driver::{DriverContext, DriverError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use super::core::SessionCore;
use super::error::{SessionError, UsageError};
use super::events::SessionEvent;
use super::state::SessionState;

/// Maximum number of queued jobs
pub const QUEUE_CAPACITY: usize = 256;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type BoxOp<C, T> = Box<dyn FnOnce(Arc<C>) -> BoxFuture<driver::Result<T>> + Send>;

/// State precondition of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Needs `Ready`; runs as `Busy` and restores `Ready` when it settles
    Exclusive,
    /// Needs `Busy` (held by the preview loop); no transitions of its own
    Stream,
}

/// Outcome of a job, holding the reply until side effects are applied
enum Settled {
    Done(Box<dyn FnOnce() + Send>),
    Failed(DriverError, Box<dyn FnOnce(SessionError) + Send>),
}

/// Type-erased job body
trait PendingOp<C>: Send {
    fn run(self: Box<Self>, ctx: Arc<C>) -> BoxFuture<Settled>;
    fn reject(self: Box<Self>, err: SessionError);
}

struct Scheduled<C, T> {
    op: BoxOp<C, T>,
    reply: oneshot::Sender<Result<T, SessionError>>,
}

impl<C: DriverContext, T: Send + 'static> PendingOp<C> for Scheduled<C, T> {
    fn run(self: Box<Self>, ctx: Arc<C>) -> BoxFuture<Settled> {
        let Scheduled { op, reply } = *self;
        Box::pin(async move {
            match op(ctx).await {
                Ok(value) => Settled::Done(Box::new(move || {
                    let _ = reply.send(Ok(value));
                })),
                Err(err) => Settled::Failed(
                    err,
                    Box::new(move |classified| {
                        let _ = reply.send(Err(classified));
                    }),
                ),
            }
        })
    }

    fn reject(self: Box<Self>, err: SessionError) {
        let _ = self.reply.send(Err(err));
    }
}

struct Job<C> {
    generation: u64,
    admission: Admission,
    label: &'static str,
    op: Box<dyn PendingOp<C>>,
}

/// Pending result of a queued job
pub struct Ticket<T> {
    reply: oneshot::Receiver<Result<T, SessionError>>,
}

impl<T> Ticket<T> {
    /// Wait for the job to settle
    pub async fn wait(self) -> Result<T, SessionError> {
        self.reply.await.unwrap_or(Err(SessionError::Shutdown))
    }
}

/// Handle to the queue; clones share the same worker
pub struct OperationQueue<C> {
    core: Arc<SessionCore<C>>,
    jobs: Sender<Job<C>>,
}

impl<C> Clone for OperationQueue<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

impl<C: DriverContext> OperationQueue<C> {
    /// Create the queue and spawn its worker
    ///
    /// The worker exits once every handle is dropped.
    pub fn new(core: Arc<SessionCore<C>>) -> Self {
        let (jobs, rx) = bounded(QUEUE_CAPACITY);
        tokio::spawn(run_worker(core.clone(), rx));
        Self { core, jobs }
    }

    /// Queue an exclusive operation and wait for its result
    pub async fn schedule<T, F, Fut>(&self, label: &'static str, op: F) -> Result<T, SessionError>
    where
        F: FnOnce(Arc<C>) -> Fut + Send + 'static,
        Fut: Future<Output = driver::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(label, op)?.wait().await
    }

    /// Queue an exclusive operation without waiting
    ///
    /// Fails immediately unless the session is `Ready` or already `Busy`
    /// with earlier work.
    pub fn enqueue<T, F, Fut>(&self, label: &'static str, op: F) -> Result<Ticket<T>, SessionError>
    where
        F: FnOnce(Arc<C>) -> Fut + Send + 'static,
        Fut: Future<Output = driver::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.push(Admission::Exclusive, label, op)
    }

    /// Queue an operation on behalf of the preview loop
    pub(crate) async fn schedule_stream<T, F, Fut>(
        &self,
        label: &'static str,
        op: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(Arc<C>) -> Fut + Send + 'static,
        Fut: Future<Output = driver::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.push(Admission::Stream, label, op)?.wait().await
    }

    fn push<T, F, Fut>(
        &self,
        admission: Admission,
        label: &'static str,
        op: F,
    ) -> Result<Ticket<T>, SessionError>
    where
        F: FnOnce(Arc<C>) -> Fut + Send + 'static,
        Fut: Future<Output = driver::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.core.state().current();
        let admissible = match admission {
            Admission::Exclusive => matches!(state, SessionState::Ready | SessionState::Busy),
            Admission::Stream => state == SessionState::Busy,
        };
        if !admissible {
            return Err(UsageError::unavailable_in(state).into());
        }

        let (reply, rx) = oneshot::channel();
        let op: BoxOp<C, T> =
            Box::new(move |ctx: Arc<C>| -> BoxFuture<driver::Result<T>> { Box::pin(op(ctx)) });
        let job = Job {
            generation: self.core.generation(),
            admission,
            label,
            op: Box::new(Scheduled { op, reply }),
        };

        match self.jobs.try_send(job) {
            Ok(()) => {
                trace!("Queued {}", label);
                Ok(Ticket { reply: rx })
            }
            Err(TrySendError::Full(_)) => Err(UsageError::QueueFull {
                capacity: QUEUE_CAPACITY,
            }
            .into()),
            Err(TrySendError::Closed(_)) => Err(SessionError::Shutdown),
        }
    }

    /// Drop every queued job and force the session back to `Ready`
    ///
    /// The in-flight call, if any, still runs to completion but no longer
    /// moves the state when it settles.
    pub fn cancel_current(&self) {
        let generation = self.core.cancel_pending();
        let _ = self
            .core
            .state()
            .transition_from(SessionState::Busy, SessionState::Ready);
        self.core.emit(SessionEvent::OperationCancelled);
        info!("Current operation cancelled (generation {})", generation);
    }

    /// Jobs waiting behind the in-flight one
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }
}

async fn run_worker<C: DriverContext>(core: Arc<SessionCore<C>>, jobs: Receiver<Job<C>>) {
    while let Ok(job) = jobs.recv().await {
        let Job {
            generation,
            admission,
            label,
            op,
        } = job;

        if generation != core.generation() {
            debug!("Skipping cancelled {}", label);
            op.reject(SessionError::Cancelled);
            continue;
        }

        let Some(ctx) = core.context() else {
            op.reject(UsageError::NotConnected.into());
            continue;
        };

        if let Err(state) = admit(&core, admission) {
            debug!("Rejecting {} in state {}", label, state);
            op.reject(UsageError::unavailable_in(state).into());
            continue;
        }

        trace!("Running {}", label);
        let settled = op.run(ctx).await;
        let current = generation == core.generation();

        match settled {
            Settled::Done(reply) => {
                if current {
                    release(&core, admission);
                }
                reply();
            }
            Settled::Failed(err, reply) => {
                let err = core.apply_failure(err);
                if current && matches!(err, SessionError::Transient(_)) {
                    release(&core, admission);
                }
                reply(err);
            }
        }
    }
    debug!("Operation queue worker stopped");
}

fn admit<C: DriverContext>(
    core: &SessionCore<C>,
    admission: Admission,
) -> Result<(), SessionState> {
    match admission {
        Admission::Exclusive => core
            .state()
            .transition_from(SessionState::Ready, SessionState::Busy),
        Admission::Stream => match core.state().current() {
            SessionState::Busy => Ok(()),
            other => Err(other),
        },
    }
}

fn release<C: DriverContext>(core: &SessionCore<C>, admission: Admission) {
    if admission == Admission::Exclusive {
        // Left alone when teardown or an error won the race
        let _ = core
            .state()
            .transition_from(SessionState::Busy, SessionState::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::simulated::{SimOp, SimulatedCamera, SimulatedContext};
    use driver::{DriverLoader, DriverModule, FaultKind};
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn ready_queue() -> (SimulatedCamera, OperationQueue<SimulatedContext>) {
        let camera = SimulatedCamera::new();
        let module = camera.load().await.unwrap();
        let core = Arc::new(SessionCore::new());
        core.install_context(Arc::new(module.create_context().await.unwrap()));
        core.state().set_state(SessionState::Connecting).unwrap();
        core.state().set_state(SessionState::Ready).unwrap();
        (camera, OperationQueue::new(core))
    }

    #[tokio::test]
    async fn test_runs_in_submission_order() {
        let (camera, queue) = ready_queue().await;

        let a = queue.enqueue("config", |ctx| async move { ctx.config().await }).unwrap();
        let b = queue.enqueue("preview", |ctx| async move { ctx.capture_preview().await }).unwrap();
        let c = queue.enqueue("events", |ctx| async move { ctx.consume_events().await }).unwrap();

        assert!(a.wait().await.is_ok());
        assert!(b.wait().await.is_ok());
        assert!(c.wait().await.is_ok());
        assert_eq!(
            camera.calls()[1..].to_vec(),
            vec![SimOp::CreateContext, SimOp::Config, SimOp::CapturePreview, SimOp::ConsumeEvents]
        );
    }

    #[tokio::test]
    async fn test_busy_while_running_then_ready() {
        let (_camera, queue) = ready_queue().await;
        let mut states = queue.core.state().subscribe();

        queue
            .schedule("events", |ctx| async move { ctx.consume_events().await })
            .await
            .unwrap();

        assert_eq!(
            states.drain_ready(),
            vec![SessionState::Ready, SessionState::Busy, SessionState::Ready]
        );
    }

    #[tokio::test]
    async fn test_transient_failure_does_not_stall_queue() {
        let (camera, queue) = ready_queue().await;
        camera.fail_next(SimOp::CaptureImage, DriverError::not_ready());

        let first = queue
            .enqueue("capture", |ctx| async move { ctx.capture_image().await })
            .unwrap();
        let second = queue
            .enqueue("capture", |ctx| async move { ctx.capture_image().await })
            .unwrap();

        assert_eq!(
            first.wait().await.unwrap_err(),
            SessionError::Transient(DriverError::not_ready())
        );
        assert!(second.wait().await.is_ok());
        assert_eq!(queue.core.state().current(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_critical_failure_rejects_following_jobs() {
        let (camera, queue) = ready_queue().await;
        camera.fail_next(SimOp::Config, DriverError::fault(FaultKind::Runtime, "trap"));

        let first = queue.enqueue("config", |ctx| async move { ctx.config().await }).unwrap();
        let second = queue
            .enqueue("events", |ctx| async move { ctx.consume_events().await })
            .unwrap();

        assert!(matches!(first.wait().await, Err(SessionError::Critical(_))));
        assert_eq!(
            second.wait().await.unwrap_err(),
            SessionError::Usage(UsageError::NotReady {
                state: SessionState::Error
            })
        );
        assert_eq!(camera.count(SimOp::ConsumeEvents), 0);
    }

    #[tokio::test]
    async fn test_device_lost_disposes_and_rejects_rest() {
        let (camera, queue) = ready_queue().await;
        camera.fail_next(SimOp::CaptureImage, DriverError::device_disconnected());

        let first = queue
            .enqueue("capture", |ctx| async move { ctx.capture_image().await })
            .unwrap();
        let second = queue.enqueue("config", |ctx| async move { ctx.config().await }).unwrap();

        assert!(matches!(first.wait().await, Err(SessionError::DeviceLost(_))));
        assert_eq!(second.wait().await.unwrap_err(), SessionError::Cancelled);
        assert_eq!(queue.core.state().current(), SessionState::Disconnected);
        assert_eq!(camera.disposals(), 1);

        let err = queue
            .schedule("config", |ctx| async move { ctx.config().await })
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Usage(UsageError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejects_queued_work() {
        let (camera, queue) = ready_queue().await;
        camera.set_latency(Duration::from_millis(100));
        let mut events = queue.core.subscribe_events();

        let running = queue
            .enqueue("capture", |ctx| async move { ctx.capture_image().await })
            .unwrap();
        let queued = queue.enqueue("config", |ctx| async move { ctx.config().await }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.cancel_current();
        assert_eq!(queue.core.state().current(), SessionState::Ready);

        assert!(running.wait().await.is_ok());
        assert_eq!(queued.wait().await.unwrap_err(), SessionError::Cancelled);
        assert_eq!(camera.count(SimOp::Config), 0);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::OperationCancelled);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_not_ready_rejected_at_submission() {
        let (_camera, queue) = ready_queue().await;
        queue.core.tear_down();

        let err = queue
            .enqueue("config", |ctx| async move { ctx.config().await })
            .err()
            .unwrap();
        assert_eq!(err, SessionError::Usage(UsageError::NotConnected));

        queue.core.state().set_state(SessionState::Connecting).unwrap();
        let err = queue
            .enqueue("config", |ctx| async move { ctx.config().await })
            .err()
            .unwrap();
        assert_eq!(
            err,
            SessionError::Usage(UsageError::NotReady {
                state: SessionState::Connecting
            })
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_single_flight_under_random_latency(
            delays in prop::collection::vec(0u64..50, 1..20),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();

            rt.block_on(async {
                let (camera, queue) = ready_queue().await;
                let order = Arc::new(Mutex::new(Vec::new()));
                let in_flight = Arc::new(AtomicUsize::new(0));
                let peak = Arc::new(AtomicUsize::new(0));

                let tickets: Vec<_> = delays
                    .iter()
                    .enumerate()
                    .map(|(i, delay)| {
                        let order = order.clone();
                        let in_flight = in_flight.clone();
                        let peak = peak.clone();
                        let delay = Duration::from_millis(*delay);
                        queue
                            .enqueue("poll", move |ctx| async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                order.lock().unwrap().push(i);
                                tokio::time::sleep(delay).await;
                                let result = ctx.consume_events().await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                result
                            })
                            .unwrap()
                    })
                    .collect();

                for ticket in tickets {
                    ticket.wait().await.unwrap();
                }

                assert_eq!(peak.load(Ordering::SeqCst), 1);
                assert_eq!(camera.max_in_flight(), 1);
                assert_eq!(*order.lock().unwrap(), (0..delays.len()).collect::<Vec<_>>());
                assert_eq!(queue.core.state().current(), SessionState::Ready);
            });
        }
    }
}
