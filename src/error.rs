//! Error types for the consumer engine.

use thiserror::Error;

/// Errors surfaced by a [`QueueClient`](crate::queue::QueueClient).
///
/// The engine only distinguishes transient from fatal: transient errors
/// are retried with backoff, everything else terminates the affected
/// pipeline stage.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Recoverable I/O failure (network timeout, throttling). Retried.
    #[error("transient queue error: {0}")]
    Transient(String),
    /// Unrecoverable client failure (bad credentials, permission denied).
    #[error("fatal queue error: {0}")]
    Fatal(String),
    /// The named queue does not exist.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

impl QueueError {
    /// Whether retrying the operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }
}

/// Errors returned from [`Consumer::start`](crate::consumer::Consumer::start).
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("queue connection failed: {0}")]
    Connect(#[from] QueueError),
}
