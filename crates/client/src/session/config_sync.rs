//! Configuration write with read-back confirmation
//!
//! The driver does not emit a change event for every setting, so a write is
//! confirmed by polling the configuration tree until the setting reads back
//! as written. Every write and poll is its own queued operation, so capture
//! calls submitted meanwhile still run in order between them.

use driver::{ConfigValue, DriverContext};
use std::time::Duration;
use tracing::{debug, warn};

use super::error::SessionError;
use super::queue::OperationQueue;

/// Default number of read-back polls
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default pause between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A pending configuration write
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChangeRequest {
    pub name: String,
    pub desired: ConfigValue,
    /// Polls made so far
    pub retry_count: u32,
    pub max_retries: u32,
    pub poll_interval: Duration,
}

impl ConfigChangeRequest {
    pub fn new(name: impl Into<String>, desired: impl Into<ConfigValue>) -> Self {
        Self {
            name: name.into(),
            desired: desired.into(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the polling budget
    pub fn with_budget(mut self, max_retries: u32, poll_interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.poll_interval = poll_interval;
        self
    }

    pub fn exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Write the setting and poll until it reads back, returning the poll count
///
/// A setting missing from the tree counts as not yet converged.
pub async fn synchronize<C: DriverContext>(
    queue: &OperationQueue<C>,
    mut request: ConfigChangeRequest,
) -> Result<u32, SessionError> {
    let name = request.name.clone();
    let value = request.desired.clone();
    queue
        .schedule("set config value", move |ctx| async move {
            ctx.set_config_value(&name, value).await
        })
        .await?;

    loop {
        let tree = queue
            .schedule("read config", |ctx| async move { ctx.config().await })
            .await?;
        request.retry_count += 1;

        let read_back = tree.find(&request.name).and_then(|node| node.value());
        if read_back
            .as_ref()
            .is_some_and(|value| request.desired.matches(value))
        {
            debug!(
                "Config '{}' = {} confirmed after {} polls",
                request.name, request.desired, request.retry_count
            );
            return Ok(request.retry_count);
        }

        if request.exhausted() {
            warn!(
                "Config '{}' did not update to {} after {} polls",
                request.name, request.desired, request.retry_count
            );
            return Err(SessionError::Timeout {
                name: request.name,
                attempts: request.retry_count,
            });
        }

        tokio::time::sleep(request.poll_interval).await;
    }
}
