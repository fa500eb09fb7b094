//! In-process topic pub/sub.
//!
//! Each subscriber owns a bounded queue. Publishing is best-effort per
//! subscriber: a slow consumer stalls the publisher only up to the publish
//! budget, after which the message is dropped for that subscriber and
//! counted. Ordering is FIFO per subscriber; nothing is guaranteed across
//! subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

use crate::metrics::{record_bus_drop, BusDropReason};

struct Slot<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

struct Registry<T> {
    topics: RwLock<HashMap<&'static str, Vec<Slot<T>>>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    fn remove(&self, topic: &'static str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(slots) = topics.get_mut(topic) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Topic pub/sub with bounded per-subscriber queues.
pub struct Bus<T> {
    registry: Arc<Registry<T>>,
    queue_capacity: usize,
}

impl<T: Clone + Send + 'static> Bus<T> {
    /// Creates a bus whose subscribers each buffer up to `queue_capacity`
    /// messages.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a new subscriber on `topic`.
    ///
    /// Dropping the returned [`Subscription`] removes the registration and
    /// closes the receive end.
    pub fn subscribe(&self, topic: &'static str) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .topics
            .write()
            .entry(topic)
            .or_default()
            .push(Slot { id, tx });
        Subscription {
            topic,
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Number of live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &'static str) -> usize {
        self.registry
            .topics
            .read()
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Publishes `msg` to every subscriber of `topic`, blocking on an
    /// individual slow subscriber only up to `budget` (or until `cancel`
    /// fires). Returns how many subscribers received the message.
    pub async fn publish(
        &self,
        topic: &'static str,
        msg: T,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> usize {
        // Snapshot senders so the lock is never held across an await.
        let senders: Vec<mpsc::Sender<T>> = {
            let topics = self.registry.topics.read();
            match topics.get(topic) {
                Some(slots) => slots.iter().map(|slot| slot.tx.clone()).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for tx in senders {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::trace!("[Bus] publish on {topic} aborted, publisher context done");
                    record_bus_drop(topic, BusDropReason::ContextDone);
                }
                sent = tx.send_timeout(msg.clone(), budget) => match sent {
                    Ok(()) => delivered += 1,
                    Err(SendTimeoutError::Timeout(_)) => {
                        log::trace!("[Bus] dropped message on {topic} for slow subscriber");
                        record_bus_drop(topic, BusDropReason::Timeout);
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        record_bus_drop(topic, BusDropReason::Canceled);
                    }
                },
            }
        }
        delivered
    }
}

/// Receiving half of one subscription.
pub struct Subscription<T> {
    topic: &'static str,
    id: u64,
    rx: mpsc::Receiver<T>,
    registry: Arc<Registry<T>>,
}

impl<T> Subscription<T> {
    /// Waits for the next message; `None` once the subscription is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Removes the subscription. Equivalent to dropping it.
    pub fn close(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.registry.remove(self.topic, self.id);
    }
}
