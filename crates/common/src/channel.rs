//! Latest-value replay broadcast channel
//!
//! A broadcast channel that remembers the last published value. Every new
//! subscriber first receives that value, then every later value in publish
//! order. Publishing happens under the same lock that guards the latest
//! value, so a subscriber never reorders a transition. A subscriber that
//! falls behind jumps to the latest value instead of replaying a stale
//! tail of the buffer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

/// Default number of values buffered per subscriber
pub const DEFAULT_CAPACITY: usize = 64;

/// Publishing side
pub struct ReplaySender<T> {
    latest: Arc<Mutex<T>>,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> ReplaySender<T> {
    /// Create a channel holding `initial`
    pub fn new(initial: T) -> Self {
        Self::with_capacity(initial, DEFAULT_CAPACITY)
    }

    /// Create a channel with an explicit per-subscriber buffer size
    pub fn with_capacity(initial: T, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: Arc::new(Mutex::new(initial)),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        lock(&self.latest)
    }

    /// Last published value
    pub fn latest(&self) -> T {
        self.lock().clone()
    }

    /// Atomically inspect the latest value and optionally replace it
    ///
    /// `decide` returns `Ok(Some(next))` to publish `next`, `Ok(None)` to
    /// leave the channel untouched, or an error that is passed through.
    /// Returns the replaced value when something was published.
    pub fn try_update<E>(
        &self,
        decide: impl FnOnce(&T) -> Result<Option<T>, E>,
    ) -> Result<Option<T>, E> {
        let mut latest = self.lock();
        match decide(&latest)? {
            Some(next) => {
                let previous = std::mem::replace(&mut *latest, next.clone());
                // No subscribers is fine; the value is still retained for replay
                let _ = self.tx.send(next);
                Ok(Some(previous))
            }
            None => Ok(None),
        }
    }

    /// Subscribe, receiving the latest value first
    pub fn subscribe(&self) -> ReplayReceiver<T> {
        let latest = self.lock();
        ReplayReceiver {
            pending: Some(latest.clone()),
            rx: self.tx.subscribe(),
            latest: self.latest.clone(),
        }
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Subscribing side
pub struct ReplayReceiver<T> {
    pending: Option<T>,
    rx: broadcast::Receiver<T>,
    latest: Arc<Mutex<T>>,
}

fn lock<T>(latest: &Mutex<T>) -> MutexGuard<'_, T> {
    latest.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone> ReplayReceiver<T> {
    /// Receive the next value
    ///
    /// Fails once the sender is dropped and every buffered value was read.
    /// A lagging subscriber receives the latest value next.
    pub async fn recv(&mut self) -> crate::Result<T> {
        if let Some(value) = self.pending.take() {
            return Ok(value);
        }

        match self.rx.recv().await {
            Ok(value) => Ok(value),
            Err(RecvError::Lagged(skipped)) => Ok(self.catch_up(skipped)),
            Err(RecvError::Closed) => Err(crate::Error::ChannelClosed),
        }
    }

    /// Receive a value if one is ready without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }

        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Lagged(skipped)) => Some(self.catch_up(skipped)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Drop the stale buffer and continue from the latest value
    ///
    /// Publishers hold the same lock, so nothing is published between
    /// reading the latest value and resubscribing.
    fn catch_up(&mut self, skipped: u64) -> T {
        warn!("Replay subscriber lagged, skipped {} values", skipped);
        let latest = lock(&self.latest);
        self.rx = self.rx.resubscribe();
        latest.clone()
    }

    /// Drain every value that is ready right now
    pub fn drain_ready(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
