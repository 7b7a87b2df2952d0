//! Listener pool: long-polling fetchers feeding the message buffer.
//!
//! Each listener waits until the buffer can hold a full batch before
//! issuing a dequeue. Without that gate, listeners would consume one
//! buffer slot each and still request full batches, holding the overflow
//! in client memory and defeating backpressure.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backoff::Backoff;
use crate::buffer::MessageBuffer;
use crate::consumer::ConsumerStats;
use crate::error::QueueError;
use crate::queue::{QueueClient, QueueConnection};

/// How often a gated listener re-checks the buffer for room.
const ROOM_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub(crate) struct ListenerContext {
    pub client: Arc<dyn QueueClient>,
    pub conn: QueueConnection,
    pub buffer: MessageBuffer,
    pub dequeue_limit: usize,
    pub poll_timeout: Duration,
    pub stats: Arc<ConsumerStats>,
    /// First fatal client error observed by any listener.
    pub failure: Arc<Mutex<Option<QueueError>>>,
}

/// Spawn `count` symmetric listener tasks.
pub(crate) fn spawn_listeners(
    count: usize,
    ctx: ListenerContext,
    stop: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let ctx = Arc::new(ctx);
    (0..count)
        .map(|listener_id| {
            let ctx = ctx.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                run_listener(listener_id, &ctx, &mut stop).await;
            })
        })
        .collect()
}

async fn run_listener(listener_id: usize, ctx: &ListenerContext, stop: &mut watch::Receiver<bool>) {
    let mut backoff = Backoff::default();

    'poll: loop {
        if !wait_for_room(&ctx.buffer, ctx.dequeue_limit, stop).await {
            break;
        }

        // The long poll races the stop signal; a cancelled dequeue is safe
        // because nothing fetched has been acked, so the remote queue
        // redelivers after the visibility timeout.
        let batch = tokio::select! {
            biased;
            result = ctx.client.dequeue(&ctx.conn, ctx.dequeue_limit, ctx.poll_timeout) => result,
            _ = stop.wait_for(|stopped| *stopped) => break,
        };

        match batch {
            Ok(messages) => {
                backoff.reset();
                if messages.is_empty() {
                    // Normal long-poll expiry.
                    continue;
                }
                debug!(listener_id, count = messages.len(), "dequeued batch");
                ctx.stats.dequeued.fetch_add(messages.len(), Ordering::Relaxed);

                for message in messages {
                    let sent = tokio::select! {
                        biased;
                        result = ctx.buffer.send(message) => result.is_ok(),
                        _ = stop.wait_for(|stopped| *stopped) => false,
                    };
                    if !sent {
                        // Stopping, or the buffer closed under us. The
                        // unsent remainder was never acked and will be
                        // redelivered.
                        break 'poll;
                    }
                }
            }
            Err(e) if e.is_transient() => {
                let delay = backoff.next_delay();
                warn!(listener_id, error = %e, ?delay, "dequeue failed, backing off");
                tokio::select! {
                    biased;
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.wait_for(|stopped| *stopped) => break,
                }
            }
            Err(e) => {
                error!(listener_id, error = %e, "fatal queue error, listener terminating");
                let mut failure = ctx.failure.lock().unwrap_or_else(|p| p.into_inner());
                failure.get_or_insert(e);
                break;
            }
        }
    }
    debug!(listener_id, "listener exited");
}

/// Wait until `buffer` can take a full batch of `needed` messages.
/// Returns false when stopping or the buffer closed.
async fn wait_for_room(
    buffer: &MessageBuffer,
    needed: usize,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *stop.borrow() || buffer.is_closed() {
            return false;
        }
        if buffer.has_room_for(needed) {
            return true;
        }
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return false,
            _ = tokio::time::sleep(ROOM_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueueClient;

    async fn connect(client: &MemoryQueueClient) -> QueueConnection {
        client.connect("q", "q-failed").await.unwrap()
    }

    fn context(
        client: Arc<MemoryQueueClient>,
        conn: QueueConnection,
        buffer: MessageBuffer,
        dequeue_limit: usize,
    ) -> ListenerContext {
        ListenerContext {
            client,
            conn,
            buffer,
            dequeue_limit,
            poll_timeout: Duration::from_millis(50),
            stats: Arc::new(ConsumerStats::default()),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    #[tokio::test]
    async fn test_listener_fills_buffer_and_gates_on_room() {
        let client = Arc::new(MemoryQueueClient::new());
        let conn = connect(&client).await;
        for n in 0..4 {
            client.enqueue(format!("payload-{n}")).await;
        }

        let buffer = MessageBuffer::new(2);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = spawn_listeners(1, context(client.clone(), conn, buffer.clone(), 1), stop_rx);

        // Buffer fills to capacity and holds there: room-for-1 gate blocks
        // further fetches while it is full.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(buffer.is_full());
        assert_eq!(buffer.len(), 2);
        assert_eq!(client.ready_len().await, 2);

        // Consuming one lets the listener fetch the next.
        buffer.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(buffer.len(), 2);
        assert_eq!(client.ready_len().await, 1);

        stop_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retry_with_backoff() {
        let client = Arc::new(MemoryQueueClient::new());
        let conn = connect(&client).await;
        client.enqueue("payload").await;
        client.inject_transient_errors(2);

        let buffer = MessageBuffer::new(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = context(client.clone(), conn, buffer.clone(), 1);
        let failure = ctx.failure.clone();
        let handles = spawn_listeners(1, ctx, stop_rx);

        // Two failed calls, then the message comes through.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(buffer.len(), 1);
        assert!(failure.lock().unwrap().is_none());
        assert!(client.dequeue_calls() >= 3);

        stop_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fatal_error_terminates_listener() {
        struct FatalClient;

        #[async_trait::async_trait]
        impl QueueClient for FatalClient {
            async fn connect(
                &self,
                queue_name: &str,
                dl_queue_name: &str,
            ) -> Result<QueueConnection, QueueError> {
                Ok(QueueConnection {
                    queue_name: queue_name.into(),
                    dl_queue_name: dl_queue_name.into(),
                })
            }
            async fn dequeue(
                &self,
                _conn: &QueueConnection,
                _max_count: usize,
                _poll_timeout: Duration,
            ) -> Result<Vec<crate::message::Message>, QueueError> {
                Err(QueueError::Fatal("bad credentials".into()))
            }
            async fn ack(
                &self,
                _conn: &QueueConnection,
                _message: &crate::message::Message,
            ) -> Result<(), QueueError> {
                Ok(())
            }
            async fn nack(
                &self,
                _conn: &QueueConnection,
                _message: &crate::message::Message,
            ) -> Result<(), QueueError> {
                Ok(())
            }
        }

        let client = Arc::new(FatalClient);
        let conn = client.connect("q", "q-failed").await.unwrap();
        let buffer = MessageBuffer::new(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let ctx = ListenerContext {
            client,
            conn,
            buffer,
            dequeue_limit: 1,
            poll_timeout: Duration::from_millis(50),
            stats: Arc::new(ConsumerStats::default()),
            failure: Arc::new(Mutex::new(None)),
        };
        let failure = ctx.failure.clone();

        for handle in spawn_listeners(1, ctx, stop_rx) {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("listener should terminate on fatal error")
                .unwrap();
        }
        assert!(matches!(
            failure.lock().unwrap().as_ref(),
            Some(QueueError::Fatal(_))
        ));
    }
}
