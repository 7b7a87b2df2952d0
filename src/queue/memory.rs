//! In-memory queue backend with visibility-timeout redelivery.
//!
//! Used by the test suite and as a local development backend. Delivery
//! semantics mirror a hosted queue: a dequeued message becomes invisible
//! until it is acked, nacked, or its visibility timeout lapses; a message
//! redelivered more than `max_receives` times moves to the dead-letter
//! queue instead of becoming visible again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{QueueClient, QueueConnection};
use crate::error::QueueError;
use crate::message::Message;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RECEIVES: u32 = 5;

#[derive(Debug)]
struct InFlight {
    message: Message,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    /// Invisible deliveries, keyed by receipt handle.
    in_flight: HashMap<String, InFlight>,
    /// Delivery attempts per message id.
    receive_counts: HashMap<String, u32>,
    dead_letter: Vec<Message>,
}

/// In-process [`QueueClient`] with real redelivery semantics.
pub struct MemoryQueueClient {
    state: Mutex<QueueState>,
    visibility_timeout: Duration,
    max_receives: u32,
    dequeue_calls: AtomicUsize,
    ack_calls: AtomicUsize,
    nack_calls: AtomicUsize,
    /// Remaining dequeue calls that should fail with a transient error.
    inject_transient: AtomicUsize,
}

impl MemoryQueueClient {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout,
            max_receives: DEFAULT_MAX_RECEIVES,
            dequeue_calls: AtomicUsize::new(0),
            ack_calls: AtomicUsize::new(0),
            nack_calls: AtomicUsize::new(0),
            inject_transient: AtomicUsize::new(0),
        }
    }

    pub fn with_max_receives(mut self, max_receives: u32) -> Self {
        self.max_receives = max_receives;
        self
    }

    /// Enqueue a payload on the primary queue. Returns the message id.
    pub async fn enqueue(&self, body: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let message = Message::new(id.clone(), String::new(), body);
        self.state.lock().await.ready.push_back(message);
        id
    }

    /// Make the next `count` dequeue calls fail with a transient error.
    pub fn inject_transient_errors(&self, count: usize) {
        self.inject_transient.store(count, Ordering::SeqCst);
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Deliveries currently invisible: dequeued but not yet acked/nacked.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn dead_letter_len(&self) -> usize {
        self.state.lock().await.dead_letter.len()
    }

    pub fn dequeue_calls(&self) -> usize {
        self.dequeue_calls.load(Ordering::SeqCst)
    }

    pub fn ack_calls(&self) -> usize {
        self.ack_calls.load(Ordering::SeqCst)
    }

    pub fn nack_calls(&self) -> usize {
        self.nack_calls.load(Ordering::SeqCst)
    }

    /// Return a delivery to the queue, or dead-letter it once its receive
    /// count is exhausted.
    fn requeue(state: &mut QueueState, message: Message, max_receives: u32) {
        let receives = state.receive_counts.get(&message.id).copied().unwrap_or(0);
        if receives >= max_receives {
            warn!(message_id = %message.id, receives, "receive count exhausted, dead-lettering");
            state.receive_counts.remove(&message.id);
            state.dead_letter.push(message);
        } else {
            let mut message = message;
            message.nack = false;
            message.receipt_handle = String::new();
            state.ready.push_back(message);
        }
    }

    /// Move expired in-flight deliveries back to the ready queue.
    fn requeue_expired(state: &mut QueueState, now: Instant, max_receives: u32) {
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in expired {
            if let Some(flight) = state.in_flight.remove(&handle) {
                debug!(message_id = %flight.message.id, "visibility timeout lapsed, requeueing");
                Self::requeue(state, flight.message, max_receives);
            }
        }
    }
}

impl Default for MemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl QueueClient for MemoryQueueClient {
    async fn connect(
        &self,
        queue_name: &str,
        dl_queue_name: &str,
    ) -> Result<QueueConnection, QueueError> {
        Ok(QueueConnection {
            queue_name: queue_name.to_string(),
            dl_queue_name: dl_queue_name.to_string(),
        })
    }

    async fn dequeue(
        &self,
        _conn: &QueueConnection,
        max_count: usize,
        poll_timeout: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        self.dequeue_calls.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .inject_transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(QueueError::Transient("injected dequeue failure".into()));
        }

        let deadline = Instant::now() + poll_timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                Self::requeue_expired(&mut state, now, self.max_receives);

                if !state.ready.is_empty() {
                    let mut batch = Vec::with_capacity(max_count.min(state.ready.len()));
                    while batch.len() < max_count {
                        let Some(mut message) = state.ready.pop_front() else {
                            break;
                        };
                        message.receipt_handle = Uuid::new_v4().to_string();
                        message.received_at = Utc::now();
                        *state.receive_counts.entry(message.id.clone()).or_insert(0) += 1;
                        state.in_flight.insert(
                            message.receipt_handle.clone(),
                            InFlight {
                                message: message.clone(),
                                visible_at: now + self.visibility_timeout,
                            },
                        );
                        batch.push(message);
                    }
                    return Ok(batch);
                }
            }

            if Instant::now() >= deadline {
                // An empty long poll is a normal outcome.
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, _conn: &QueueConnection, message: &Message) -> Result<(), QueueError> {
        self.ack_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&message.receipt_handle).is_some() {
            state.receive_counts.remove(&message.id);
        } else {
            // Stale handle: the delivery already expired and was requeued.
            // The redelivery will be acked on its own, so this is benign.
            debug!(message_id = %message.id, "ack with stale receipt handle");
        }
        Ok(())
    }

    async fn nack(&self, _conn: &QueueConnection, message: &Message) -> Result<(), QueueError> {
        self.nack_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(flight) = state.in_flight.remove(&message.receipt_handle) {
            Self::requeue(&mut state, flight.message, self.max_receives);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> QueueConnection {
        QueueConnection {
            queue_name: "q".into(),
            dl_queue_name: "q-failed".into(),
        }
    }

    #[tokio::test]
    async fn test_dequeue_batches_up_to_max_count() {
        let client = MemoryQueueClient::new();
        for n in 0..5 {
            client.enqueue(format!("payload-{n}")).await;
        }

        let batch = client
            .dequeue(&conn(), 3, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(client.ready_len().await, 2);
        assert_eq!(client.in_flight_len().await, 3);
        assert!(!batch[0].receipt_handle.is_empty());
    }

    #[tokio::test]
    async fn test_empty_poll_returns_empty_batch() {
        let client = MemoryQueueClient::new();
        let batch = client
            .dequeue(&conn(), 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_ack_removes_delivery() {
        let client = MemoryQueueClient::new();
        client.enqueue("payload").await;
        let batch = client
            .dequeue(&conn(), 1, Duration::from_millis(50))
            .await
            .unwrap();

        client.ack(&conn(), &batch[0]).await.unwrap();
        assert_eq!(client.in_flight_len().await, 0);
        assert_eq!(client.ready_len().await, 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let client = MemoryQueueClient::new();
        client.enqueue("payload").await;
        let batch = client
            .dequeue(&conn(), 1, Duration::from_millis(50))
            .await
            .unwrap();

        client.nack(&conn(), &batch[0]).await.unwrap();
        assert_eq!(client.ready_len().await, 1);

        let again = client
            .dequeue(&conn(), 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(again[0].id, batch[0].id);
        assert_ne!(again[0].receipt_handle, batch[0].receipt_handle);
    }

    #[tokio::test]
    async fn test_visibility_timeout_redelivers() {
        let client = MemoryQueueClient::with_visibility_timeout(Duration::from_millis(30));
        client.enqueue("payload").await;
        let first = client
            .dequeue(&conn(), 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Not acked; after the timeout the message reappears.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = client
            .dequeue(&conn(), 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
    }

    #[tokio::test]
    async fn test_exhausted_receives_dead_letter() {
        let client = MemoryQueueClient::new().with_max_receives(2);
        client.enqueue("payload").await;

        for _ in 0..2 {
            let batch = client
                .dequeue(&conn(), 1, Duration::from_millis(50))
                .await
                .unwrap();
            client.nack(&conn(), &batch[0]).await.unwrap();
        }

        assert_eq!(client.ready_len().await, 0);
        assert_eq!(client.dead_letter_len().await, 1);
    }

    #[tokio::test]
    async fn test_injected_transient_errors() {
        let client = MemoryQueueClient::new();
        client.inject_transient_errors(1);
        let err = client
            .dequeue(&conn(), 1, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(client
            .dequeue(&conn(), 1, Duration::from_millis(10))
            .await
            .is_ok());
    }
}
