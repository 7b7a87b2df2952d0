//! Bounded FIFO buffers between pipeline stages.
//!
//! Thin wrapper over `async-channel`'s bounded MPMC channel. The receiver
//! is `Clone`, so worker tasks share one buffer without a mutex. Closing
//! is one-way and idempotent: receivers drain remaining items then see
//! end-of-stream, senders fail.

use crate::message::Message;

/// Bounded channel of messages with diagnostics for callers and tests.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    tx: async_channel::Sender<Message>,
    rx: async_channel::Receiver<Message>,
}

impl MessageBuffer {
    /// Create a buffer holding up to `capacity` messages. Capacity must be
    /// at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Messages currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(0)
    }

    pub fn is_full(&self) -> bool {
        self.rx.is_full()
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }

    /// Slots left before the buffer is full.
    pub fn room(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    /// Whether a batch of `n` messages fits right now.
    pub fn has_room_for(&self, n: usize) -> bool {
        self.room() >= n
    }

    /// Close the buffer. Idempotent; returns false when already closed.
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    /// Send a message, waiting while the buffer is full. Returns the
    /// message back when the buffer is closed.
    pub async fn send(&self, message: Message) -> Result<(), Message> {
        self.tx.send(message).await.map_err(|e| e.into_inner())
    }

    /// Receive the next message. `None` once the buffer is closed and
    /// fully drained.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.recv().await.ok()
    }

    /// Write half handed to handlers for signaling completion.
    pub fn sender(&self) -> DoneSender {
        DoneSender {
            tx: self.tx.clone(),
        }
    }
}

/// Write half of the done channel.
///
/// A handler must call [`complete`](DoneSender::complete) exactly once per
/// invocation, from any task: synchronously before returning, or later
/// from forked background work.
#[derive(Debug, Clone)]
pub struct DoneSender {
    tx: async_channel::Sender<Message>,
}

impl DoneSender {
    /// Signal completion for `message`. Set [`Message::nack`] before
    /// calling to request redelivery instead of an ack. Writes during
    /// shutdown land on a closed channel and are dropped silently.
    pub async fn complete(&self, message: Message) {
        let _ = self.tx.send(message).await;
    }
}
