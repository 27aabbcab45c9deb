use crate::envelope::Envelope;
use flume::{Receiver, Sender};
use tracing::debug;

/// Creates a message queue: an in-process publish/subscribe point between
/// the portal bindings and the connection layer. Publication order is
/// delivery order; there is one consumer per queue.
pub fn queue_pair() -> (QueuePublisher, QueueSubscriber) {
    let (tx, rx) = flume::unbounded();
    (QueuePublisher { tx }, QueueSubscriber { rx })
}

#[derive(Clone, Debug)]
pub struct QueuePublisher {
    tx: Sender<Envelope>,
}

impl QueuePublisher {
    /// Appends a message. Publishing into a queue whose consumer is gone is
    /// a no-op; the binding on the other side was deactivated.
    pub fn publish(&self, envelope: Envelope) {
        if let Err(flume::SendError(dropped)) = self.tx.send(envelope) {
            debug!(kind = %dropped.kind(), "queue consumer is gone, message discarded");
        }
    }
}

#[derive(Debug)]
pub struct QueueSubscriber {
    rx: Receiver<Envelope>,
}

impl QueueSubscriber {
    /// Waits for the next message; `None` once every publisher is dropped.
    pub async fn next(&self) -> Option<Envelope> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_next(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
