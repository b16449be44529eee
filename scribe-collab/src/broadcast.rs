//! Fan-out of server events to document topics and private user queues.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` events; a lagging receiver skips events instead of stalling
//! the publisher or its peers.
//!
//! Send order on one topic is the order of `publish_*` calls on it.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::model::{DocumentId, UserId};
use crate::protocol::ServerEvent;

pub type EventReceiver = broadcast::Receiver<Arc<ServerEvent>>;
type EventSender = broadcast::Sender<Arc<ServerEvent>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub published: u64,
    /// Sum of receivers reached across all publishes
    pub delivered: u64,
    /// Publishes that reached no receiver
    pub undelivered: u64,
    pub document_topics: usize,
    pub user_queues: usize,
}

/// Atomic router stats, lock-free on the hot path.
#[derive(Default)]
struct AtomicRouterStats {
    published: AtomicU64,
    delivered: AtomicU64,
    undelivered: AtomicU64,
}

/// Routes events to per-document topics and per-user queues.
pub struct BroadcastRouter {
    documents: DashMap<DocumentId, EventSender>,
    users: DashMap<UserId, EventSender>,
    /// Events buffered per receiver
    capacity: usize,
    stats: AtomicRouterStats,
}

impl BroadcastRouter {
    /// `capacity` bounds how many events a receiver may fall behind before
    /// it starts skipping.
    pub fn new(capacity: usize) -> Self {
        Self {
            documents: DashMap::new(),
            users: DashMap::new(),
            capacity: capacity.max(1),
            stats: AtomicRouterStats::default(),
        }
    }

    /// Subscribe to every event published on `document_id`.
    pub fn subscribe_document(&self, document_id: &str) -> EventReceiver {
        self.documents
            .entry(document_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to the private queue of `user_id`.
    pub fn subscribe_user(&self, user_id: &str) -> EventReceiver {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send to every subscriber of the document topic.
    ///
    /// Returns the number of receivers reached.
    pub fn publish_to_document(&self, document_id: &str, event: ServerEvent) -> usize {
        let count = match self.documents.get(document_id) {
            Some(sender) => sender.send(Arc::new(event)).unwrap_or(0),
            None => 0,
        };
        self.record(count);
        log::trace!("Published to document {document_id}: {count} receivers");
        count
    }

    /// Send to the private queue of one user.
    pub fn publish_to_user(&self, user_id: &str, event: ServerEvent) -> usize {
        let count = match self.users.get(user_id) {
            Some(sender) => sender.send(Arc::new(event)).unwrap_or(0),
            None => 0,
        };
        self.record(count);
        log::trace!("Published to user {user_id}: {count} receivers");
        count
    }

    fn record(&self, count: usize) {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        if count == 0 {
            self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats
                .delivered
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Drop a document topic nobody listens to.
    pub fn remove_if_idle(&self, document_id: &str) -> bool {
        self.documents
            .remove_if(document_id, |_, sender| sender.receiver_count() == 0)
            .is_some()
    }

    /// Drop a user queue nobody listens to.
    pub fn remove_user_if_idle(&self, user_id: &str) -> bool {
        self.users
            .remove_if(user_id, |_, sender| sender.receiver_count() == 0)
            .is_some()
    }

    /// Current subscriber count of a document topic.
    pub fn document_subscribers(&self, document_id: &str) -> usize {
        self.documents
            .get(document_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            undelivered: self.stats.undelivered.load(Ordering::Relaxed),
            document_topics: self.documents.len(),
            user_queues: self.users.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DocumentUpdateMessage;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn update(doc: &str, content: &str) -> ServerEvent {
        ServerEvent::Update(DocumentUpdateMessage::new(doc, content, "alice", 0))
    }

    #[tokio::test]
    async fn test_fan_out() {
        let router = BroadcastRouter::new(16);
        let mut rx1 = router.subscribe_document("d1");
        let mut rx2 = router.subscribe_document("d1");
        let mut rx3 = router.subscribe_document("d1");

        let count = router.publish_to_document("d1", update("d1", "hello"));
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            assert_eq!(*rx.recv().await.unwrap(), update("d1", "hello"));
        }
    }

    #[tokio::test]
    async fn test_topics_isolated() {
        let router = BroadcastRouter::new(16);
        let mut rx1 = router.subscribe_document("d1");
        let mut rx2 = router.subscribe_document("d2");

        router.publish_to_document("d1", update("d1", "one"));

        assert_eq!(*rx1.recv().await.unwrap(), update("d1", "one"));
        assert!(matches!(rx2.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let router = BroadcastRouter::new(64);
        let mut rx = router.subscribe_document("d1");

        for i in 0..50 {
            router.publish_to_document("d1", update("d1", &i.to_string()));
        }
        for i in 0..50 {
            assert_eq!(*rx.recv().await.unwrap(), update("d1", &i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_private_queue() {
        let router = BroadcastRouter::new(16);
        let mut alice = router.subscribe_user("alice-id");
        let mut bob = router.subscribe_user("bob-id");

        let event = ServerEvent::ActiveUsers {
            document_id: "d1".into(),
            users: vec!["alice-id".into()],
        };
        assert_eq!(router.publish_to_user("alice-id", event.clone()), 1);

        assert_eq!(*alice.recv().await.unwrap(), event);
        assert!(matches!(bob.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let router = BroadcastRouter::new(16);
        assert_eq!(router.publish_to_document("nobody", update("nobody", "x")), 0);
        assert_eq!(router.publish_to_user("nobody", update("nobody", "x")), 0);

        let stats = router.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.undelivered, 2);
        assert_eq!(stats.document_topics, 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips() {
        let router = BroadcastRouter::new(2);
        let mut slow = router.subscribe_document("d1");
        let mut fast = router.subscribe_document("d1");

        for i in 0..5 {
            router.publish_to_document("d1", update("d1", &i.to_string()));
            assert_eq!(*fast.recv().await.unwrap(), update("d1", &i.to_string()));
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(*slow.recv().await.unwrap(), update("d1", "3"));
    }

    #[tokio::test]
    async fn test_remove_if_idle() {
        let router = BroadcastRouter::new(16);
        let rx = router.subscribe_document("d1");

        assert!(!router.remove_if_idle("d1"));
        assert_eq!(router.document_subscribers("d1"), 1);

        drop(rx);
        assert!(router.remove_if_idle("d1"));
        assert_eq!(router.stats().document_topics, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let router = BroadcastRouter::new(16);
        let _rx1 = router.subscribe_document("d1");
        let _rx2 = router.subscribe_document("d1");
        let _user = router.subscribe_user("u1");

        router.publish_to_document("d1", update("d1", "x"));
        router.publish_to_document("d1", update("d1", "y"));

        let stats = router.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.undelivered, 0);
        assert_eq!(stats.document_topics, 1);
        assert_eq!(stats.user_queues, 1);
    }

    #[test]
    fn test_capacity_minimum() {
        assert_eq!(BroadcastRouter::new(0).capacity(), 1);
        assert_eq!(BroadcastRouter::new(32).capacity(), 32);
    }
}
