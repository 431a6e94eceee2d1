//! Batched delivery of result events to the supervisor.
//!
//! Events go into an unbounded queue. A single consumer task takes the
//! first available event and drains whatever else is already queued into the
//! same batch, bounded by the window length, the maximum batch size and the
//! batch byte budget, then pushes the batch as one `Dump` frame. Batches are
//! pushed in enqueue order. Event text is capped on enqueue.
//!
//! Each call brackets its output with a `FlushTask`. `finish` places a
//! marker in the queue and resolves once every event enqueued before it has
//! been pushed, so a call's events always reach the supervisor before its
//! response.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::StreamerConfig;
use crate::ipc::{Push, PushSender};
use crate::result::ResultEvent;

enum QueueItem {
    Event(ResultEvent),
    Flush(oneshot::Sender<()>),
}

/// Producer handle for the result queue.
#[derive(Clone)]
pub struct ResultQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl ResultQueue {
    /// Append an event. Events enqueued after the consumer stopped are dropped.
    pub fn enqueue(&self, event: ResultEvent) {
        if self.tx.send(QueueItem::Event(event.bounded())).is_err() {
            tracing::debug!("Result streamer stopped; dropping event");
        }
    }
}

/// Owns the consumer task for one worker's result queue.
pub struct ResultStreamer {
    queue: ResultQueue,
    consumer: JoinHandle<()>,
}

impl ResultStreamer {
    /// Start the consumer task. Must be called inside a tokio runtime.
    pub fn spawn(config: StreamerConfig, push: PushSender) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(consume(rx, config, push));
        Self {
            queue: ResultQueue { tx },
            consumer,
        }
    }

    pub fn queue(&self) -> ResultQueue {
        self.queue.clone()
    }

    /// Begin a flush scope for one call.
    pub fn begin(&self) -> FlushTask {
        FlushTask {
            queue: self.queue.clone(),
        }
    }
}

impl Drop for ResultStreamer {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

/// Flush scope of one call. See the module docs.
pub struct FlushTask {
    queue: ResultQueue,
}

impl FlushTask {
    /// Wait until everything enqueued so far has been pushed.
    pub async fn finish(self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.tx.send(QueueItem::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    config: StreamerConfig,
    push: PushSender,
) {
    let max_batch = config.max_batch.max(1);
    let max_bytes = config.max_batch_bytes.max(1);

    while let Some(item) = rx.recv().await {
        let first = match item {
            QueueItem::Event(event) => event,
            QueueItem::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let deadline = Instant::now() + config.window;
        let mut bytes = first.payload_len();
        let mut batch = vec![first];
        let mut pending_flush = None;

        while batch.len() < max_batch && bytes < max_bytes && Instant::now() < deadline {
            match rx.try_recv() {
                Ok(QueueItem::Event(event)) => {
                    bytes += event.payload_len();
                    batch.push(event);
                }
                Ok(QueueItem::Flush(done)) => {
                    pending_flush = Some(done);
                    break;
                }
                Err(_) => break,
            }
        }

        send_batch(&push, batch);
        if let Some(done) = pending_flush {
            let _ = done.send(());
        }
    }
}

fn send_batch(push: &PushSender, batch: Vec<ResultEvent>) {
    let count = batch.len();
    if let Err(e) = push.push(Push::Dump(batch)) {
        // Nothing to recover: the supervisor is gone.
        tracing::debug!("Dropping batch of {} result events: {}", count, e);
    }
}
