//! Ack dispatcher: routes handler completions back to the queue.
//!
//! Consumes the done channel until it is closed and drained. Each
//! completion is acked (or nacked when the handler asked for redelivery)
//! and its in-flight permit is returned, closing the loop opened by the
//! worker that started the invocation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::buffer::MessageBuffer;
use crate::consumer::ConsumerStats;
use crate::message::Message;
use crate::queue::{QueueClient, QueueConnection};

/// Attempts per completion before giving up. Lost acks self-heal: the
/// queue redelivers the message after its visibility timeout.
const MAX_ATTEMPTS: usize = 5;

pub(crate) fn spawn_dispatcher(
    client: Arc<dyn QueueClient>,
    conn: QueueConnection,
    done: MessageBuffer,
    in_flight: Arc<Semaphore>,
    stats: Arc<ConsumerStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = done.recv().await {
            dispatch_one(&*client, &conn, &message, &stats).await;
            // Only now does the invocation stop counting against the
            // in-flight cap.
            in_flight.add_permits(1);
        }
        debug!("ack dispatcher exited");
    })
}

async fn dispatch_one(
    client: &dyn QueueClient,
    conn: &QueueConnection,
    message: &Message,
    stats: &ConsumerStats,
) {
    let mut backoff = Backoff::default();
    for attempt in 1..=MAX_ATTEMPTS {
        let result = if message.nack {
            client.nack(conn, message).await
        } else {
            client.ack(conn, message).await
        };

        match result {
            Ok(()) => {
                if message.nack {
                    stats.nacked.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.acked.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff.next_delay();
                warn!(
                    message_id = %message.id,
                    attempt,
                    ?delay,
                    error = %e,
                    "completion dispatch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    nack = message.nack,
                    error = %e,
                    "giving up on completion, relying on redelivery"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueueClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_routes_by_nack_flag_and_returns_permits() {
        let client = Arc::new(MemoryQueueClient::new());
        let conn = client.connect("q", "q-failed").await.unwrap();
        for _ in 0..3 {
            client.enqueue("payload").await;
        }
        let batch = client
            .dequeue(&conn, 3, Duration::from_millis(50))
            .await
            .unwrap();

        let done = MessageBuffer::new(4);
        let in_flight = Arc::new(Semaphore::new(0));
        let stats = Arc::new(ConsumerStats::default());
        let handle = spawn_dispatcher(
            client.clone(),
            conn,
            done.clone(),
            in_flight.clone(),
            stats.clone(),
        );

        let mut messages = batch.into_iter();
        done.send(messages.next().unwrap()).await.unwrap();
        done.send(messages.next().unwrap().into_nack()).await.unwrap();
        done.send(messages.next().unwrap()).await.unwrap();
        done.close();
        handle.await.unwrap();

        assert_eq!(client.ack_calls(), 2);
        assert_eq!(client.nack_calls(), 1);
        assert_eq!(stats.acked(), 2);
        assert_eq!(stats.nacked(), 1);
        // One permit back per completion.
        assert_eq!(in_flight.available_permits(), 3);
    }
}
