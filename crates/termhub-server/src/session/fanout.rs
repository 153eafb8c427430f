//! Output fan-out: delivers every PTY output chunk to each live subscriber.
//!
//! Each viewer subscription owns a bounded queue. Publishing never blocks: a
//! subscriber whose queue is full is evicted (its receiver drains what was
//! already queued, then ends). Internal observers that must see the whole
//! stream use an unbounded feed instead, which is never evicted. Dropping a
//! [`Subscription`] unregisters it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// One chunk of decoded process output.
pub type Chunk = Arc<str>;

enum Sink {
    Bounded(mpsc::Sender<Chunk>),
    Unbounded(mpsc::UnboundedSender<Chunk>),
}

enum Feed {
    Bounded(mpsc::Receiver<Chunk>),
    Unbounded(mpsc::UnboundedReceiver<Chunk>),
}

struct HubInner {
    subscribers: HashMap<u64, Sink>,
    next_id: u64,
    capacity: usize,
    closed: bool,
}

/// Fan-out point for one session's output stream.
#[derive(Clone)]
pub struct OutputHub {
    inner: Arc<Mutex<HubInner>>,
}

impl OutputHub {
    /// Create a hub whose subscribers each buffer up to `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                subscribers: HashMap::new(),
                next_id: 1,
                capacity: capacity.max(1),
                closed: false,
            })),
        }
    }

    /// Register a new subscriber. It sees every chunk published from now on.
    ///
    /// Subscribing to a closed hub yields a subscription that ends at once.
    pub fn subscribe(&self) -> Subscription {
        let capacity = lock(&self.inner).capacity;
        let (tx, rx) = mpsc::channel(capacity);
        self.register(Sink::Bounded(tx), Feed::Bounded(rx))
    }

    /// Register a subscriber that is never evicted for lagging.
    ///
    /// Its queue grows with whatever it has not consumed yet, so only
    /// in-process observers that keep up on average should use it.
    pub fn subscribe_unbounded(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(Sink::Unbounded(tx), Feed::Unbounded(rx))
    }

    fn register(&self, sink: Sink, rx: Feed) -> Subscription {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.insert(id, sink);
        }
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a chunk to every subscriber. Returns how many received it.
    pub fn publish(&self, chunk: Chunk) -> usize {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return 0;
        }
        let mut delivered = 0;
        inner.subscribers.retain(|id, sink| {
            let kept = match sink {
                Sink::Bounded(tx) => match tx.try_send(chunk.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(subscriber = id, "output subscriber lagged, evicting");
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                },
                Sink::Unbounded(tx) => tx.send(chunk.clone()).is_ok(),
            };
            if kept {
                delivered += 1;
            }
            kept
        });
        delivered
    }

    /// End the stream. Subscribers drain queued chunks, then see `None`.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        debug!(subscribers = count, "output hub closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

/// A live registration on an [`OutputHub`]. Unregisters on drop.
pub struct Subscription {
    id: u64,
    rx: Feed,
    hub: Weak<Mutex<HubInner>>,
}

impl Subscription {
    /// Next chunk, or `None` once the hub closed or evicted this subscriber.
    pub async fn recv(&mut self) -> Option<Chunk> {
        match &mut self.rx {
            Feed::Bounded(rx) => rx.recv().await,
            Feed::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Next already-queued chunk, without waiting.
    pub fn try_recv(&mut self) -> Option<Chunk> {
        match &mut self.rx {
            Feed::Bounded(rx) => rx.try_recv().ok(),
            Feed::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            lock(&inner).subscribers.remove(&self.id);
        }
    }
}

// Critical sections never panic, so a poisoned lock still holds a consistent map.
fn lock(inner: &Mutex<HubInner>) -> MutexGuard<'_, HubInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(s: &str) -> Chunk {
        Arc::from(s)
    }

    #[tokio::test]
    async fn each_subscriber_gets_ordered_copy() {
        let hub = OutputHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        for part in ["one", "two", "three"] {
            assert_eq!(hub.publish(chunk(part)), 2);
        }
        hub.close();

        for sub in [&mut a, &mut b] {
            let mut seen = Vec::new();
            while let Some(c) = sub.recv().await {
                seen.push(c.to_string());
            }
            assert_eq!(seen, vec!["one", "two", "three"]);
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_new_output() {
        let hub = OutputHub::new(16);
        hub.publish(chunk("before"));
        let mut late = hub.subscribe();
        hub.publish(chunk("after"));
        hub.close();

        assert_eq!(late.recv().await.as_deref(), Some("after"));
        assert_eq!(late.recv().await, None);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let hub = OutputHub::new(4);
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        drop(a);
        assert_eq!(hub.subscriber_count(), 1);
        drop(b);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(chunk("nobody")), 0);
    }

    #[tokio::test]
    async fn full_subscriber_is_evicted_without_blocking_others() {
        let hub = OutputHub::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        hub.publish(chunk("a"));
        assert_eq!(fast.recv().await.as_deref(), Some("a"));
        hub.publish(chunk("b"));
        assert_eq!(fast.recv().await.as_deref(), Some("b"));

        // `slow` holds a and b; the third chunk overflows it.
        assert_eq!(hub.publish(chunk("c")), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(fast.recv().await.as_deref(), Some("c"));

        // The evicted subscriber drains what it had, then ends.
        assert_eq!(slow.recv().await.as_deref(), Some("a"));
        assert_eq!(slow.recv().await.as_deref(), Some("b"));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn unbounded_feed_survives_a_burst() {
        let hub = OutputHub::new(2);
        let mut viewer = hub.subscribe();
        let mut observer = hub.subscribe_unbounded();

        for i in 0..10 {
            hub.publish(chunk(&i.to_string()));
        }
        // The viewer overflowed; the observer did not.
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.publish(chunk("after")), 1);

        let mut seen = Vec::new();
        while let Some(c) = observer.try_recv() {
            seen.push(c.to_string());
        }
        assert_eq!(seen.len(), 11);
        assert_eq!(seen.last().map(String::as_str), Some("after"));

        assert_eq!(viewer.recv().await.as_deref(), Some("0"));
        assert_eq!(viewer.recv().await.as_deref(), Some("1"));
        assert_eq!(viewer.recv().await, None);
    }

    #[tokio::test]
    async fn subscribe_after_close_ends_immediately() {
        let hub = OutputHub::new(4);
        hub.close();
        assert!(hub.is_closed());
        let mut sub = hub.subscribe();
        assert_eq!(sub.recv().await, None);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
