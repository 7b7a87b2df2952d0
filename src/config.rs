//! Consumer options and default sizing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConsumerError;

/// Default capacity of the message buffer between listeners and workers.
pub const DEFAULT_MESSAGE_CHANNEL_SIZE: usize = 20;

/// Default maximum number of messages requested per dequeue call.
pub const DEFAULT_DEQUEUE_LIMIT: usize = 10;

/// Default long-poll duration for dequeue calls, in seconds.
pub const DEFAULT_POLL_TIMEOUT_SECONDS: u64 = 20;

/// Tuning knobs for a consumer pipeline. All fields have defaults sized
/// from the host CPU count, so `ConsumerOptions::default()` is a working
/// configuration.
///
/// `num_workers` sizes the CPU budget; `max_concurrent_work` separately
/// caps handler invocations that are in progress, including those parked
/// on background I/O after their worker slot was released. Collapsing the
/// two caps throttles I/O-bound handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Capacity of the message buffer between listeners and workers.
    pub message_channel_size: usize,
    /// Concurrent worker slots.
    pub num_workers: usize,
    /// Long-polling listener tasks.
    pub num_listeners: usize,
    /// Maximum messages requested per dequeue call.
    pub dequeue_limit: usize,
    /// In-flight cap: handler invocations started but not yet completed.
    /// Clamped up to `num_workers` at start.
    pub max_concurrent_work: usize,
    /// Dead-letter queue to bind at connect time.
    /// Defaults to `"<queue_name>-failed"`.
    pub dl_queue_name: Option<String>,
    /// Long-poll duration passed to each dequeue call.
    pub poll_timeout_seconds: u64,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        let workers = default_num_workers();
        Self {
            message_channel_size: DEFAULT_MESSAGE_CHANNEL_SIZE,
            num_workers: workers,
            num_listeners: default_num_listeners(),
            dequeue_limit: DEFAULT_DEQUEUE_LIMIT,
            max_concurrent_work: workers * 10,
            dl_queue_name: None,
            poll_timeout_seconds: DEFAULT_POLL_TIMEOUT_SECONDS,
        }
    }
}

/// Host CPUs minus one, keeping a core free for the runtime. Floor of 1.
pub fn default_num_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// One listener per ten workers. Floor of 1.
pub fn default_num_listeners() -> usize {
    (num_cpus::get().saturating_sub(1) / 10).max(1)
}

impl ConsumerOptions {
    /// Resolve the dead-letter queue name for `queue_name`.
    pub fn dl_queue_name_for(&self, queue_name: &str) -> String {
        self.dl_queue_name
            .clone()
            .unwrap_or_else(|| format!("{queue_name}-failed"))
    }

    /// Long-poll duration as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }

    /// Validate and normalize the options. Called by `Consumer::start`;
    /// misconfiguration is reported synchronously from there.
    pub(crate) fn validate(&mut self) -> Result<(), ConsumerError> {
        if self.message_channel_size == 0 {
            return Err(ConsumerError::Config(
                "message_channel_size must be at least 1".into(),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConsumerError::Config("num_workers must be at least 1".into()));
        }
        if self.num_listeners == 0 {
            return Err(ConsumerError::Config(
                "num_listeners must be at least 1".into(),
            ));
        }
        if self.dequeue_limit == 0 {
            return Err(ConsumerError::Config("dequeue_limit must be at least 1".into()));
        }
        if self.dequeue_limit > self.message_channel_size {
            return Err(ConsumerError::Config(format!(
                "dequeue_limit ({}) exceeds message_channel_size ({}); a full \
                 batch must fit in the buffer",
                self.dequeue_limit, self.message_channel_size
            )));
        }
        if self.max_concurrent_work < self.num_workers {
            warn!(
                max_concurrent_work = self.max_concurrent_work,
                num_workers = self.num_workers,
                "max_concurrent_work below num_workers, raising to num_workers"
            );
            self.max_concurrent_work = self.num_workers;
        }
        if self.message_channel_size < self.dequeue_limit * self.num_listeners {
            // Listeners gate on room for a full batch, so a buffer smaller
            // than dequeue_limit * num_listeners can starve some of them.
            warn!(
                message_channel_size = self.message_channel_size,
                dequeue_limit = self.dequeue_limit,
                num_listeners = self.num_listeners,
                "buffer smaller than dequeue_limit * num_listeners; some listeners may starve"
            );
        }
        Ok(())
    }
}
