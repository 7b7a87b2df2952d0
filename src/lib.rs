//! conveyor - concurrent message-consumer engine for at-least-once queues.
//!
//! Decouples the three rates of a queue consumer: a pool of long-polling
//! listeners fetches batches into a bounded buffer, a worker pool invokes
//! the user handler under a separate in-flight cap, and an ack dispatcher
//! routes completions back to the queue. The buffers provide backpressure
//! end to end, and [`Consumer::stop`] drains the pipeline without losing
//! acknowledgments.
//!
//! ```no_run
//! use conveyor::{Consumer, ConsumerOptions, DoneSender, Message, MemoryQueueClient};
//!
//! # async fn run() -> Result<(), conveyor::ConsumerError> {
//! let handler = |message: Message, done: DoneSender| async move {
//!     // ... process message.body ...
//!     done.complete(message).await;
//! };
//! let mut consumer =
//!     Consumer::start(MemoryQueueClient::new(), "orders", handler, ConsumerOptions::default())
//!         .await?;
//! // ...
//! consumer.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod buffer;
pub mod config;
pub mod consumer;
mod dispatcher;
pub mod error;
mod listener;
pub mod message;
pub mod queue;
pub mod worker;

pub use buffer::{DoneSender, MessageBuffer};
pub use config::ConsumerOptions;
pub use consumer::{Consumer, ConsumerStats};
pub use error::{ConsumerError, QueueError};
pub use message::Message;
pub use queue::{MemoryQueueClient, QueueClient, QueueConnection};
pub use worker::Handler;
