//! Consumer lifecycle: `start` wires the pipeline, `stop` drains it.
//!
//! Data flows `listeners -> message buffer -> workers -> handler -> done
//! channel -> ack dispatcher`. Shutdown propagates the same direction:
//! the stop signal halts fetching, the message buffer closes and drains
//! through the workers, then the done channel closes and drains through
//! the dispatcher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::info;

use crate::buffer::MessageBuffer;
use crate::config::ConsumerOptions;
use crate::dispatcher::spawn_dispatcher;
use crate::error::{ConsumerError, QueueError};
use crate::listener::{spawn_listeners, ListenerContext};
use crate::queue::{QueueClient, QueueConnection};
use crate::worker::{spawn_workers, Handler};

/// Counters updated by the pipeline tasks.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub(crate) dequeued: AtomicUsize,
    pub(crate) acked: AtomicUsize,
    pub(crate) nacked: AtomicUsize,
}

impl ConsumerStats {
    /// Messages fetched from the queue so far.
    pub fn dequeued(&self) -> usize {
        self.dequeued.load(Ordering::Relaxed)
    }

    /// Completions acked so far.
    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::Relaxed)
    }

    /// Completions nacked so far.
    pub fn nacked(&self) -> usize {
        self.nacked.load(Ordering::Relaxed)
    }
}

/// Handle to a running consumer pipeline.
///
/// Created by [`Consumer::start`], shut down by [`Consumer::stop`]. All
/// pipeline state lives behind this handle; nothing is process-wide.
pub struct Consumer {
    message_buffer: MessageBuffer,
    done_channel: MessageBuffer,
    stop_tx: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    stats: Arc<ConsumerStats>,
    failure: Arc<Mutex<Option<QueueError>>>,
    connection: QueueConnection,
    stopped: bool,
}

impl Consumer {
    /// Connect to `queue_name` and start consuming with `handler`.
    ///
    /// Misconfiguration and connection failures are reported here
    /// synchronously; after a successful return the pipeline only stops
    /// via [`stop`](Consumer::stop).
    pub async fn start(
        client: impl QueueClient,
        queue_name: &str,
        handler: impl Handler,
        options: ConsumerOptions,
    ) -> Result<Consumer, ConsumerError> {
        Self::start_shared(Arc::new(client), queue_name, Arc::new(handler), options).await
    }

    /// Like [`start`](Consumer::start), for callers that already share the
    /// client or handler.
    pub async fn start_shared(
        client: Arc<dyn QueueClient>,
        queue_name: &str,
        handler: Arc<dyn Handler>,
        mut options: ConsumerOptions,
    ) -> Result<Consumer, ConsumerError> {
        options.validate()?;

        let dl_queue_name = options.dl_queue_name_for(queue_name);
        let connection = client.connect(queue_name, &dl_queue_name).await?;
        info!(
            queue = queue_name,
            dl_queue = %dl_queue_name,
            listeners = options.num_listeners,
            workers = options.num_workers,
            in_flight = options.max_concurrent_work,
            buffer = options.message_channel_size,
            "starting consumer"
        );

        let message_buffer = MessageBuffer::new(options.message_channel_size);
        let done_channel = MessageBuffer::new(options.num_workers);
        let (stop_tx, stop_rx) = watch::channel(false);
        let in_flight = Arc::new(Semaphore::new(options.max_concurrent_work));
        let stats = Arc::new(ConsumerStats::default());
        let failure = Arc::new(Mutex::new(None));

        let listeners = spawn_listeners(
            options.num_listeners,
            ListenerContext {
                client: client.clone(),
                conn: connection.clone(),
                buffer: message_buffer.clone(),
                dequeue_limit: options.dequeue_limit,
                poll_timeout: options.poll_timeout(),
                stats: stats.clone(),
                failure: failure.clone(),
            },
            stop_rx.clone(),
        );
        let workers = spawn_workers(
            options.num_workers,
            message_buffer.clone(),
            done_channel.clone(),
            handler,
            in_flight.clone(),
            stop_rx,
        );
        let dispatcher = spawn_dispatcher(
            client,
            connection.clone(),
            done_channel.clone(),
            in_flight,
            stats.clone(),
        );

        Ok(Consumer {
            message_buffer,
            done_channel,
            stop_tx,
            listeners,
            workers,
            dispatcher: Some(dispatcher),
            stats,
            failure,
            connection,
            stopped: false,
        })
    }

    /// Buffer between listeners and workers.
    pub fn message_buffer(&self) -> &MessageBuffer {
        &self.message_buffer
    }

    /// Completion channel between handlers and the ack dispatcher.
    pub fn done_channel(&self) -> &MessageBuffer {
        &self.done_channel
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn connection(&self) -> &QueueConnection {
        &self.connection
    }

    /// First fatal listener error, if any. Taking it clears the slot.
    pub fn take_listener_failure(&self) -> Option<QueueError> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Drain and shut down the pipeline.
    ///
    /// Listeners stop fetching, workers drain the buffered messages
    /// (running handlers complete on their own, never preempted), then
    /// the dispatcher drains pending completions. Completions written by
    /// background work after this point land on a closed channel and are
    /// dropped; the queue redelivers those messages. Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!("stopping consumer");
        let _ = self.stop_tx.send(true);
        self.message_buffer.close();
        for handle in self.listeners.drain(..) {
            let _ = handle.await;
        }
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        // Every worker has returned, so no further completions are coming
        // from worker tasks themselves.
        self.done_channel.close();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.await;
        }
        info!(
            dequeued = self.stats.dequeued(),
            acked = self.stats.acked(),
            nacked = self.stats.nacked(),
            "consumer stopped"
        );
    }
}
