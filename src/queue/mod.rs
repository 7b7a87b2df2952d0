//! Queue client abstraction.
//!
//! The engine is backend-agnostic: anything that can long-poll a batch,
//! ack, and nack can drive the pipeline. Implementations own their
//! transport (HTTP API, AMQP, the in-memory backend in [`memory`]) and
//! its thread safety; the engine shares one connection read-only across
//! all of its tasks.

pub mod memory;

pub use memory::MemoryQueueClient;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::message::Message;

/// Opaque handle identifying the primary queue and the dead-letter queue
/// bound to it at connect time.
#[derive(Debug, Clone)]
pub struct QueueConnection {
    pub queue_name: String,
    pub dl_queue_name: String,
}

/// A remote queue with at-least-once delivery semantics.
///
/// `dequeue` long-polls; an empty batch is normal and not an error. `ack`
/// permanently removes a delivery, `nack` makes it visible again for
/// redelivery. A delivery that is neither acked nor nacked reappears once
/// its visibility timeout lapses.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    /// Establish a connection, creating or binding the dead-letter queue.
    async fn connect(
        &self,
        queue_name: &str,
        dl_queue_name: &str,
    ) -> Result<QueueConnection, QueueError>;

    /// Fetch up to `max_count` messages, waiting up to `poll_timeout` for
    /// at least one to arrive.
    async fn dequeue(
        &self,
        conn: &QueueConnection,
        max_count: usize,
        poll_timeout: Duration,
    ) -> Result<Vec<Message>, QueueError>;

    /// Permanently remove a delivered message.
    async fn ack(&self, conn: &QueueConnection, message: &Message) -> Result<(), QueueError>;

    /// Return a delivered message for redelivery.
    async fn nack(&self, conn: &QueueConnection, message: &Message) -> Result<(), QueueError>;
}
