//! Errors of the shared plumbing

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Every sender of a replay channel was dropped
    #[error("Replay channel closed")]
    ChannelClosed,

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
