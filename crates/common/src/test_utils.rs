//! Test utilities for ptp-camera
//!
//! Provides fixtures and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_config_tree;
//!
//! let tree = create_mock_config_tree();
//! assert!(tree.find("iso").is_some());
//! ```

use crate::channel::ReplayReceiver;
use driver::{ConfigKind, ConfigNode};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a small configuration tree with one writable and one read-only leaf
pub fn create_mock_config_tree() -> ConfigNode {
    ConfigNode::window("main", "Test Camera").with_child(
        ConfigNode::section("settings", "Settings")
            .with_child(ConfigNode::leaf(
                "iso",
                "ISO Speed",
                ConfigKind::Radio {
                    value: "100".to_string(),
                    choices: vec!["100".into(), "200".into(), "400".into()],
                },
            ))
            .with_child(
                ConfigNode::leaf(
                    "serialnumber",
                    "Serial Number",
                    ConfigKind::Text {
                        value: "SN000001".to_string(),
                    },
                )
                .read_only(),
            ),
    )
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug, Error)]
#[error("Test timed out after {duration:?}")]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

/// Receive from a replay subscriber until `predicate` matches
///
/// Returns every value seen, the matching one last.
pub async fn recv_until<T, P>(
    rx: &mut ReplayReceiver<T>,
    mut predicate: P,
) -> crate::Result<Vec<T>>
where
    T: Clone,
    P: FnMut(&T) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let value = rx.recv().await?;
        let done = predicate(&value);
        seen.push(value);
        if done {
            return Ok(seen);
        }
    }
}
