/*!
Typed packet queues.

Each queue carries strongly-typed packets of exactly one sublayer, so
consumers never re-discriminate on the wire format. A queue can also
carry a *disconnect marker*: `recv` returns `None` when it reaches one,
which is how shutdown and socket loss travel through the fabric without
an out-of-band signal. Handles are cheap clones sharing one queue;
senders and receivers may live in different tasks.
*/

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

enum Message<T> {
    Payload(T),
    Disconnect,
}

struct Inner<T> {
    tx: UnboundedSender<Message<T>>,
    rx: Mutex<UnboundedReceiver<Message<T>>>,
}

/// Unbounded MPMC queue with a disconnect marker
pub struct Fifo<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Fifo<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Fifo<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(rx),
            }),
        }
    }

    /// Enqueues a packet. Sends after teardown are dropped silently;
    /// the consumer is gone and loss at that point is by protocol.
    pub fn send(&self, value: T) {
        let _ = self.inner.tx.send(Message::Payload(value));
    }

    /// Enqueues the disconnect marker that makes the consumer's next
    /// `recv` return `None`
    pub fn disconnect(&self) {
        let _ = self.inner.tx.send(Message::Disconnect);
    }

    /// Waits for the next packet; `None` means disconnected
    pub async fn recv(&self) -> Option<T> {
        match self.inner.rx.lock().await.recv().await {
            Some(Message::Payload(value)) => Some(value),
            Some(Message::Disconnect) | None => None,
        }
    }

    /// Non-blocking receive: `None` when the queue is currently empty,
    /// `Some(None)` when the queue reached a disconnect marker
    pub async fn try_recv(&self) -> Option<Option<T>> {
        match self.inner.rx.lock().await.try_recv() {
            Ok(Message::Payload(value)) => Some(Some(value)),
            Ok(Message::Disconnect) => Some(None),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(None),
        }
    }

    /// Discards everything queued, stale disconnect markers included.
    /// Used when a link is re-established on existing queues.
    pub async fn drain(&self) {
        let mut rx = self.inner.rx.lock().await;
        while rx.try_recv().is_ok() {}
    }
}

/// A full-duplex queue pair for one sublayer of one link
pub struct FifoPair<T> {
    pub host_to_target: Fifo<T>,
    pub target_to_host: Fifo<T>,
}

impl<T> Clone for FifoPair<T> {
    fn clone(&self) -> Self {
        Self {
            host_to_target: self.host_to_target.clone(),
            target_to_host: self.target_to_host.clone(),
        }
    }
}

impl<T> Default for FifoPair<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FifoPair<T> {
    pub fn new() -> Self {
        Self {
            host_to_target: Fifo::new(),
            target_to_host: Fifo::new(),
        }
    }

    pub fn disconnect_both(&self) {
        self.host_to_target.disconnect();
        self.target_to_host.disconnect();
    }
}
