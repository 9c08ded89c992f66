//! Rendezvous primitives — the one-shot deferred and the controlled stream.
//!
//! Both are thin disciplines over tokio channels. The deferred is a
//! single-resolve/single-reject handle used wherever a chunk-id is
//! referenced before its controller exists; the controlled stream is an
//! in-memory lazy sequence whose controller can observe consumer-side
//! cancellation.

use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

/// Why a [`Deferred`] failed to deliver a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Unresolved {
    /// The resolving side was dropped or explicitly rejected.
    #[error("deferred was rejected before resolution")]
    Rejected,
    /// `wait` was called more than once.
    #[error("deferred already waited on")]
    AlreadyWaited,
}

/// Single-resolve, single-reject rendezvous.
///
/// Resolution is idempotent: after the first `resolve` or `reject`, later
/// calls are silently ignored. Exactly one task may `wait`.
pub struct Deferred<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
    rx: Mutex<Option<oneshot::Receiver<T>>>,
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Deferred {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Deliver the value. No-op if already resolved or rejected.
    pub fn resolve(&self, value: T) {
        if let Some(tx) = self.tx.lock().expect("deferred lock poisoned").take() {
            // Send fails only when the waiter is gone; nothing to do then.
            let _ = tx.send(value);
        }
    }

    /// Drop the sending side without a value; the waiter observes
    /// [`Unresolved::Rejected`]. No-op if already resolved or rejected.
    pub fn reject(&self) {
        drop(self.tx.lock().expect("deferred lock poisoned").take());
    }

    /// Await resolution. Consumes the receiving side: a second call
    /// returns [`Unresolved::AlreadyWaited`] immediately.
    pub async fn wait(&self) -> Result<T, Unresolved> {
        let rx = self
            .rx
            .lock()
            .expect("deferred lock poisoned")
            .take()
            .ok_or(Unresolved::AlreadyWaited)?;
        rx.await.map_err(|_| Unresolved::Rejected)
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an in-memory lazy sequence plus its external controller.
///
/// Items flow `Controller::enqueue` → `ControlledStream::next`. Dropping
/// the stream side without draining is cancellation, observable through
/// `Controller::cancelled`.
pub fn controlled<T>() -> (ControlledStream<T>, Controller<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlledStream { rx }, Controller { tx })
}

/// Consumer half of [`controlled`].
pub struct ControlledStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> ControlledStream<T> {
    /// Next item, or `None` once the controller closed and the buffer
    /// drained.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Poll-based variant of [`next`](Self::next) for manual `Stream`
    /// implementations layered on top.
    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Producer half of [`controlled`].
pub struct Controller<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Controller<T> {
    /// Enqueue an item. Returns false when the consumer cancelled.
    pub fn enqueue(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    /// Close the sequence; buffered items still drain.
    pub fn close(self) {}

    /// True once the consumer dropped the stream without draining it.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer cancels. This is the suspension
    /// primitive producers race user work against.
    pub async fn cancelled(&self) {
        self.tx.closed().await
    }
}

impl<T> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Controller {
            tx: self.tx.clone(),
        }
    }
}
