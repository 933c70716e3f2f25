//! Replay-latest broadcast primitive
//!
//! [`Broadcaster`] fans a sequence of values out to any number of
//! subscribers. Each subscriber gets its own unbounded queue, so no value is
//! lost or reordered, and a new subscriber first receives the latest value.
//! Publishing a value equal to the latest one is a no-op.
//!
//! The connection state machine uses it for `observe_transitions`, and the
//! network signal sources use it for connectivity and WiFi updates.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

struct Inner<T> {
    latest: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

/// Multi-subscriber, replay-latest, unbounded broadcaster
pub struct Broadcaster<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq> Broadcaster<T> {
    /// Create a broadcaster with no value yet
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                latest: None,
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Create a broadcaster seeded with an initial value
    pub fn with_initial(value: T) -> Self {
        let broadcaster = Self::new();
        broadcaster.lock().latest = Some(value);
        broadcaster
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a value to every live subscriber
    ///
    /// Returns `false` when the value was collapsed as a duplicate of the
    /// latest value or the broadcaster is closed.
    pub fn publish(&self, value: T) -> bool {
        let mut inner = self.lock();
        if inner.closed || inner.latest.as_ref() == Some(&value) {
            return false;
        }
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
        inner.latest = Some(value);
        true
    }

    /// Most recently published value
    pub fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    /// Subscribe to future values, starting with a replay of the latest one
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if let Some(latest) = inner.latest.clone() {
            // The receiver is alive, so this cannot fail
            let _ = tx.send(latest);
        }
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// End every subscription; later publishes are ignored
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of subscribers that have not been dropped yet
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|subscriber| !subscriber.is_closed());
        inner.subscribers.len()
    }
}

/// Receiving end of a [`Broadcaster`]
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wait for the next value; `None` once the broadcaster is closed and drained
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next value if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
