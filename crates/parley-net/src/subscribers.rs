//! Fan-out of events to any number of subscriptions.
//!
//! A [`Subscription`] is removed from its [`Subscribers`] when it is
//! cancelled or dropped. Publishing never blocks. With [`Subscribers::new`]
//! a subscriber whose buffer is full misses the event; with
//! [`Subscribers::unbounded`] every event is queued until it is read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

enum Sink<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

enum Source<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

type Registry<T> = Mutex<Vec<(u64, Sink<T>)>>;

pub struct Subscribers<T> {
    registry: Arc<Registry<T>>,
    next_id: AtomicU64,
    // `None` for lossless fan-out.
    capacity: Option<usize>,
}

impl<T: Clone> Subscribers<T> {
    /// Lossy fan-out: each subscriber buffers at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    /// Lossless fan-out: a subscriber only stops receiving once it is gone.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (sink, rx) = match self.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (Sink::Bounded(tx), Source::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Sink::Unbounded(tx), Source::Unbounded(rx))
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut registry) = self.registry.lock() {
            registry.push((id, sink));
        }
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `item` to every live subscriber. Returns how many received it.
    pub fn publish(&self, item: T) -> usize {
        let Ok(mut registry) = self.registry.lock() else {
            return 0;
        };
        let mut delivered = 0;
        registry.retain(|(id, sink)| match sink {
            Sink::Bounded(tx) => match tx.try_send(item.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, "subscriber lagging, event dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
            Sink::Unbounded(tx) => {
                let sent = tx.send(item.clone()).is_ok();
                delivered += usize::from(sent);
                sent
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of a subscription.
pub struct Subscription<T> {
    id: u64,
    rx: Source<T>,
    registry: Weak<Registry<T>>,
}

impl<T> Subscription<T> {
    /// Next event; `None` once the publisher is gone or the subscription was
    /// cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.rx {
            Source::Bounded(rx) => rx.recv().await,
            Source::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match &mut self.rx {
            Source::Bounded(rx) => rx.try_recv().ok(),
            Source::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    /// Stop receiving. Events already buffered remain readable.
    pub fn cancel(&mut self) {
        match &mut self.rx {
            Source::Bounded(rx) => rx.close(),
            Source::Unbounded(rx) => rx.close(),
        }
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
