//! Active-user tracking per document.
//!
//! ## Architecture
//!
//! ```text
//! join / accepted update
//!       │
//!       ▼
//! PresenceTracker::add_active_user()      (idempotent)
//!       │
//!       ▼
//! DashMap<DocumentId, HashMap<UserId, last_seen>>
//!       │
//!       ├── list_active_users()  → sorted snapshot
//!       ├── remove_active_user() (leave; idempotent)
//!       └── reap_idle(timeout)   (optional, server-driven)
//! ```
//!
//! There are no heartbeats. A user stays active until an explicit leave,
//! or until the optional reaper sees no activity for the idle timeout.
//! Presence says nothing about edit rights.

use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::model::{DocumentId, UserId};

/// Tracks which users are active on which documents.
#[derive(Default)]
pub struct PresenceTracker {
    /// document → (user → last seen)
    sessions: DashMap<DocumentId, HashMap<UserId, Instant>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `user_id` active on `document_id` and refresh its last-seen
    /// instant. Returns `true` if the user was not already active.
    pub fn add_active_user(&self, document_id: &str, user_id: &str) -> bool {
        let mut users = self.sessions.entry(document_id.to_string()).or_default();
        users
            .insert(user_id.to_string(), Instant::now())
            .is_none()
    }

    /// Remove `user_id` from `document_id`. A non-member is a no-op.
    /// Returns `true` if the user was active.
    pub fn remove_active_user(&self, document_id: &str, user_id: &str) -> bool {
        let removed = match self.sessions.get_mut(document_id) {
            Some(mut users) => users.remove(user_id).is_some(),
            None => return false,
        };
        self.sessions
            .remove_if(document_id, |_, users| users.is_empty());
        removed
    }

    /// Snapshot of the users active on `document_id`.
    pub fn list_active_users(&self, document_id: &str) -> BTreeSet<UserId> {
        self.sessions
            .get(document_id)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_active(&self, document_id: &str, user_id: &str) -> bool {
        self.sessions
            .get(document_id)
            .is_some_and(|users| users.contains_key(user_id))
    }

    /// Drop the whole session set for a document (used on delete).
    pub fn clear_document(&self, document_id: &str) -> usize {
        self.sessions
            .remove(document_id)
            .map(|(_, users)| users.len())
            .unwrap_or(0)
    }

    /// Remove every user idle for longer than `timeout`.
    ///
    /// Returns the removed `(document, user)` pairs so the caller can
    /// announce them.
    pub fn reap_idle(&self, timeout: Duration) -> Vec<(DocumentId, UserId)> {
        let mut reaped = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let document_id = entry.key().clone();
            entry.value_mut().retain(|user_id, last_seen| {
                let idle = last_seen.elapsed() > timeout;
                if idle {
                    reaped.push((document_id.clone(), user_id.clone()));
                }
                !idle
            });
        }
        self.sessions.retain(|_, users| !users.is_empty());
        reaped
    }

    /// Number of documents with at least one active user.
    pub fn document_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_add_is_idempotent() {
        let presence = PresenceTracker::new();
        assert!(presence.add_active_user("d1", "alice"));
        assert!(!presence.add_active_user("d1", "alice"));

        let users = presence.list_active_users("d1");
        assert_eq!(users.len(), 1);
        assert!(users.contains("alice"));
    }

    #[test]
    fn test_remove_leaves_others() {
        let presence = PresenceTracker::new();
        presence.add_active_user("d1", "alice");
        presence.add_active_user("d1", "bob");

        assert!(presence.remove_active_user("d1", "alice"));
        let users = presence.list_active_users("d1");
        assert_eq!(users.into_iter().collect::<Vec<_>>(), vec!["bob"]);
    }

    #[test]
    fn test_remove_non_member_is_noop() {
        let presence = PresenceTracker::new();
        assert!(!presence.remove_active_user("d1", "ghost"));

        presence.add_active_user("d1", "alice");
        assert!(!presence.remove_active_user("d1", "ghost"));
        assert!(presence.is_active("d1", "alice"));
    }

    #[test]
    fn test_empty_document_dropped() {
        let presence = PresenceTracker::new();
        presence.add_active_user("d1", "alice");
        assert_eq!(presence.document_count(), 1);

        presence.remove_active_user("d1", "alice");
        assert_eq!(presence.document_count(), 0);
        assert!(presence.list_active_users("d1").is_empty());
    }

    #[test]
    fn test_documents_isolated() {
        let presence = PresenceTracker::new();
        presence.add_active_user("d1", "alice");
        presence.add_active_user("d2", "bob");

        assert!(presence.is_active("d1", "alice"));
        assert!(!presence.is_active("d2", "alice"));
        assert_eq!(presence.clear_document("d1"), 1);
        assert!(presence.is_active("d2", "bob"));
    }

    #[test]
    fn test_list_is_sorted() {
        let presence = PresenceTracker::new();
        for user in ["carol", "alice", "bob"] {
            presence.add_active_user("d1", user);
        }
        let users: Vec<_> = presence.list_active_users("d1").into_iter().collect();
        assert_eq!(users, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_reap_idle() {
        let presence = PresenceTracker::new();
        presence.add_active_user("d1", "stale");
        thread::sleep(Duration::from_millis(30));
        presence.add_active_user("d1", "fresh");

        let reaped = presence.reap_idle(Duration::from_millis(15));
        assert_eq!(reaped, vec![("d1".to_string(), "stale".to_string())]);
        assert!(presence.is_active("d1", "fresh"));
        assert!(!presence.is_active("d1", "stale"));
    }

    #[test]
    fn test_reap_refreshed_by_add() {
        let presence = PresenceTracker::new();
        presence.add_active_user("d1", "alice");
        thread::sleep(Duration::from_millis(30));
        presence.add_active_user("d1", "alice");

        assert!(presence.reap_idle(Duration::from_millis(15)).is_empty());
        assert!(presence.is_active("d1", "alice"));
    }

    #[test]
    fn test_reap_drops_empty_documents() {
        let presence = PresenceTracker::new();
        presence.add_active_user("d1", "alice");
        thread::sleep(Duration::from_millis(20));

        assert_eq!(presence.reap_idle(Duration::from_millis(5)).len(), 1);
        assert_eq!(presence.document_count(), 0);
    }

    #[test]
    fn test_concurrent_joins() {
        let presence = std::sync::Arc::new(PresenceTracker::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let presence = presence.clone();
                thread::spawn(move || {
                    presence.add_active_user("d1", &format!("user-{i}"));
                    presence.add_active_user("d1", &format!("user-{i}"));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(presence.list_active_users("d1").len(), 16);
    }
}
