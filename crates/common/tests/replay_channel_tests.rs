//! Replay Channel Integration Tests
//!
//! Tests for the latest-value replay channel used to observe session state.
//!
//! # Test Scenarios
//! - Late subscribers see the latest value first
//! - Ordering across concurrent publishers
//! - Atomic compare-and-publish
//! - Lagging and dropped senders
//!
//! Run with: `cargo test -p common --test replay_channel_tests`

use common::channel::ReplaySender;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, recv_until, with_timeout};
use std::convert::Infallible;
use std::sync::Arc;
use std::thread;

fn publish<T: Clone + Send + 'static>(sender: &ReplaySender<T>, value: T) {
    let _ = sender.try_update(|_| Ok::<_, Infallible>(Some(value)));
}

// ============================================================================
// Replay Tests
// ============================================================================

#[tokio::test]
async fn test_late_subscriber_receives_latest_only() {
    let sender = ReplaySender::new("disconnected");
    publish(&sender, "connecting");
    publish(&sender, "ready");

    let mut rx = sender.subscribe();
    let first = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
        .await
        .expect("recv timed out")
        .expect("channel closed");

    assert_eq!(first, "ready");
    assert_eq!(rx.try_recv(), None);
}

#[tokio::test]
async fn test_every_subscriber_sees_every_later_value() {
    let sender = ReplaySender::new(0u32);
    let mut a = sender.subscribe();
    let mut b = sender.subscribe();

    for i in 1..=10 {
        publish(&sender, i);
    }

    let expected: Vec<u32> = (0..=10).collect();
    assert_eq!(a.drain_ready(), expected);
    assert_eq!(b.drain_ready(), expected);
    assert_eq!(sender.receiver_count(), 2);
}

// ============================================================================
// Compare-and-Publish Tests
// ============================================================================

#[test]
fn test_concurrent_try_update_only_one_wins() {
    let sender = Arc::new(ReplaySender::new(false));
    let mut rx = sender.subscribe();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sender = sender.clone();
            thread::spawn(move || {
                sender
                    .try_update(|taken| if *taken { Err(()) } else { Ok(Some(true)) })
                    .is_ok()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().expect("publisher panicked"))
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(rx.drain_ready(), vec![false, true]);
}

#[test]
fn test_try_update_none_publishes_nothing() {
    let sender = ReplaySender::new(7u8);
    let mut rx = sender.subscribe();

    let replaced: Result<Option<u8>, ()> = sender.try_update(|_| Ok(None));
    assert_eq!(replaced, Ok(None));
    assert_eq!(rx.drain_ready(), vec![7]);
}

#[test]
fn test_concurrent_publishers_keep_per_thread_order() {
    let sender = Arc::new(ReplaySender::with_capacity((0usize, 0usize), 1024));
    let mut rx = sender.subscribe();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let sender = sender.clone();
            thread::spawn(move || {
                for i in 1..=50 {
                    publish(&sender, (t, i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("publisher panicked");
    }

    let values = rx.drain_ready();
    assert_eq!(values.len(), 201);
    for t in 0..4 {
        let seq: Vec<usize> = values
            .iter()
            .filter(|(th, _)| *th == t)
            .map(|(_, i)| *i)
            .collect();
        let expected: Vec<usize> = (1..=50).collect();
        if t == 0 {
            // (0, 0) is the initial value
            assert_eq!(seq[0], 0);
            assert_eq!(&seq[1..], expected.as_slice());
        } else {
            assert_eq!(seq, expected);
        }
    }
}

// ============================================================================
// Lag and Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_lagging_subscriber_jumps_to_latest() {
    let sender = ReplaySender::with_capacity(0u32, 4);
    let mut rx = sender.subscribe();
    for i in 1..=20 {
        publish(&sender, i);
    }

    // Pending value, then straight to the latest; the stale tail is dropped
    let seen = with_timeout(DEFAULT_TEST_TIMEOUT, recv_until(&mut rx, |v| *v == 20))
        .await
        .expect("recv timed out")
        .expect("channel closed");
    assert_eq!(seen, vec![0, 20]);

    publish(&sender, 21);
    assert_eq!(rx.recv().await.unwrap(), 21);
}

#[tokio::test]
async fn test_lagging_subscriber_never_misses_final_state() {
    let sender = ReplaySender::with_capacity("ready", 2);
    let mut rx = sender.subscribe();
    assert_eq!(rx.recv().await.unwrap(), "ready");

    for state in ["busy", "ready", "busy", "ready", "error"] {
        publish(&sender, state);
    }

    assert_eq!(rx.recv().await.unwrap(), "error");
    assert_eq!(rx.try_recv(), None);
}

#[tokio::test]
async fn test_dropped_sender_closes_after_buffer() {
    let sender = ReplaySender::new(1u32);
    let mut rx = sender.subscribe();
    publish(&sender, 2);
    drop(sender);

    assert_eq!(rx.recv().await.unwrap(), 1);
    assert_eq!(rx.recv().await.unwrap(), 2);
    assert!(rx.recv().await.is_err());
}
