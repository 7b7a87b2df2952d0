//! Worker pool: concurrent handler invocations over the message buffer.
//!
//! Two caps govern the pool. `count` worker slots bound how many handlers
//! run on the runtime at once; the shared in-flight semaphore bounds how
//! many invocations are outstanding in total, including those whose
//! handler already returned but whose completion (written from forked
//! background I/O) has not yet reached the ack dispatcher. A worker
//! forgets its permit after invoking the handler; the dispatcher restores
//! it when the matching done-channel write is consumed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::{DoneSender, MessageBuffer};
use crate::message::Message;

/// Processes one message per invocation.
///
/// An implementation must write the (possibly modified) message to `done`
/// exactly once, either synchronously before returning or later from a
/// forked task. Setting [`Message::nack`] on the written message requests
/// redelivery. An invocation that never completes leaks one in-flight
/// permit; the remote queue's visibility timeout is the backstop.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Message, done: DoneSender);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message, DoneSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, message: Message, done: DoneSender) {
        self(message, done).await;
    }
}

/// Spawn `count` worker tasks draining `buffer` into `handler`.
pub(crate) fn spawn_workers(
    count: usize,
    buffer: MessageBuffer,
    done: MessageBuffer,
    handler: Arc<dyn Handler>,
    in_flight: Arc<Semaphore>,
    stop: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let buffer = buffer.clone();
            let done_tx = done.sender();
            let handler = handler.clone();
            let in_flight = in_flight.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                run_worker(worker_id, buffer, done_tx, handler, in_flight, &mut stop).await;
            })
        })
        .collect()
}

async fn run_worker(
    worker_id: usize,
    buffer: MessageBuffer,
    done_tx: DoneSender,
    handler: Arc<dyn Handler>,
    in_flight: Arc<Semaphore>,
    stop: &mut watch::Receiver<bool>,
) {
    loop {
        // Acquire before reading the buffer so a message is never taken
        // without capacity for its invocation. Biased toward the permit:
        // while permits keep coming a stopping worker continues draining
        // the buffer, and only a permit-starved worker exits early.
        let permit = tokio::select! {
            biased;
            permit = in_flight.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = stop.wait_for(|stopped| *stopped) => break,
        };

        let Some(message) = buffer.recv().await else {
            // Closed and drained.
            drop(permit);
            break;
        };

        debug!(worker_id, message_id = %message.id, "invoking handler");

        // The permit now belongs to the invocation, not the slot; the
        // dispatcher restores it once the completion is consumed.
        permit.forget();

        let invocation =
            AssertUnwindSafe(handler.handle(message.clone(), done_tx.clone())).catch_unwind();
        if invocation.await.is_err() {
            warn!(worker_id, message_id = %message.id, "handler panicked, nacking");
            done_tx.complete(message.into_nack()).await;
        }
    }
    debug!(worker_id, "worker exited");
}
