//! Subscriber registry.
//!
//! The registry is the single source of truth for who is subscribed. Each
//! member owns the sending half of a bounded channel drained by its
//! connection task, so delivery never blocks on a slow socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Registry-assigned identifier of a subscriber connection.
pub type SubscriberId = u64;

/// One live subscriber.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    remote: String,
    tx: mpsc::Sender<Utf8Bytes>,
}

impl Subscriber {
    pub fn new(id: SubscriberId, remote: impl Into<String>, tx: mpsc::Sender<Utf8Bytes>) -> Self {
        Self {
            id,
            remote: remote.into(),
            tx,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remote address label, used for logging.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Queue one frame without waiting.
    pub fn deliver(&self, frame: &Utf8Bytes) -> Delivery {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Lagged,
            Err(TrySendError::Closed(_)) => Delivery::Failed,
        }
    }
}

/// Outcome of queueing a frame for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Buffer full; this frame is dropped for the subscriber only.
    Lagged,
    /// The connection is gone.
    Failed,
}

/// Per-tick delivery summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub lagged: usize,
    pub removed: usize,
}

/// Concurrent set of live subscribers.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    members: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a new connection.
    pub fn next_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert a subscriber. Returns `false` if the id was already present.
    pub fn add(&self, subscriber: Subscriber) -> bool {
        let mut members = self.members.lock();
        if members.contains_key(&subscriber.id) {
            return false;
        }
        members.insert(subscriber.id, subscriber);
        true
    }

    /// Remove a subscriber, returning it if it was present.
    pub fn remove(&self, id: SubscriberId) -> Option<Subscriber> {
        self.members.lock().remove(&id)
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.members.lock().contains_key(&id)
    }

    /// Point-in-time copy of the membership, in no particular order.
    pub fn enumerate(&self) -> Vec<Subscriber> {
        self.members.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Queue `frame` for every current member and drop those whose
    /// connection has gone away.
    ///
    /// The lock is only held to take the snapshot and to remove failures,
    /// never across a send.
    pub fn broadcast(&self, frame: &Utf8Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for subscriber in self.enumerate() {
            match subscriber.deliver(frame) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Lagged => {
                    tracing::debug!(
                        client = %subscriber.remote,
                        "Subscriber buffer full, skipping frame"
                    );
                    report.lagged += 1;
                }
                Delivery::Failed => {
                    if self.remove(subscriber.id).is_some() {
                        tracing::info!(
                            client = %subscriber.remote,
                            "Removed subscriber after failed delivery"
                        );
                        report.removed += 1;
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(
        registry: &SubscriberRegistry,
        buffer: usize,
    ) -> (Subscriber, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        let id = registry.next_id();
        (Subscriber::new(id, format!("10.0.0.{}:5000", id), tx), rx)
    }

    #[test]
    fn test_add_remove_enumerate() {
        let registry = SubscriberRegistry::new();
        let (a, _rx_a) = subscriber(&registry, 1);
        let (b, _rx_b) = subscriber(&registry, 1);

        assert!(registry.add(a.clone()));
        assert!(registry.add(b.clone()));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a.id()).is_some());
        let remaining: Vec<_> = registry.enumerate().iter().map(Subscriber::id).collect();
        assert_eq!(remaining, vec![b.id()]);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let registry = SubscriberRegistry::new();
        let (a, _rx) = subscriber(&registry, 1);

        assert!(registry.add(a.clone()));
        assert!(!registry.add(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let registry = SubscriberRegistry::new();
        assert!(registry.remove(42).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SubscriberRegistry::new();
        let first = registry.next_id();
        let second = registry.next_id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_one_failed_subscriber_does_not_block_others() {
        let registry = SubscriberRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (sub, rx) = subscriber(&registry, 4);
            registry.add(sub);
            receivers.push(rx);
        }
        let (dead, dead_rx) = subscriber(&registry, 4);
        let dead_id = dead.id();
        registry.add(dead);
        drop(dead_rx);

        let frame = Utf8Bytes::from("{\"tick\":1}");
        let report = registry.broadcast(&frame);

        assert_eq!(report.delivered, 4);
        assert_eq!(report.removed, 1);
        assert!(!registry.contains(dead_id));
        assert_eq!(registry.len(), 4);
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap().as_str(), "{\"tick\":1}");
        }
    }

    #[test]
    fn test_full_buffer_is_skipped_not_removed() {
        let registry = SubscriberRegistry::new();
        let (slow, mut rx) = subscriber(&registry, 1);
        let slow_id = slow.id();
        registry.add(slow);

        let first = registry.broadcast(&Utf8Bytes::from("1"));
        let second = registry.broadcast(&Utf8Bytes::from("2"));

        assert_eq!(first.delivered, 1);
        assert_eq!(second.lagged, 1);
        assert!(registry.contains(slow_id));
        assert_eq!(rx.try_recv().unwrap().as_str(), "1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_membership_under_concurrent_churn() {
        let registry = std::sync::Arc::new(SubscriberRegistry::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let mut kept = Vec::new();
                for i in 0..50 {
                    let (tx, rx) = mpsc::channel(1);
                    let id = registry.next_id();
                    registry.add(Subscriber::new(id, "peer", tx));
                    if i % 2 == 0 {
                        registry.remove(id);
                    } else {
                        kept.push((id, rx));
                    }
                    registry.broadcast(&Utf8Bytes::from("x"));
                }
                kept
            }));
        }

        // Receivers stay alive until membership is checked.
        let kept: Vec<(SubscriberId, mpsc::Receiver<Utf8Bytes>)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let mut expected: Vec<SubscriberId> = kept.iter().map(|(id, _)| *id).collect();
        expected.sort_unstable();

        let mut actual: Vec<_> = registry.enumerate().iter().map(Subscriber::id).collect();
        actual.sort_unstable();
        assert_eq!(actual, expected);
        drop(kept);
    }
}
