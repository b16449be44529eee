//! Session coordinator: the single entry point for client events.
//!
//! ```text
//! ClientEvent ──► resolve username (UserDirectory)
//!                    │
//!                    ├─ load   ─► ContentCache (read-through DocumentStore) ─► user queue
//!                    ├─ update ─► can_edit? ─► presence + cache + topic ─► PersistenceGate
//!                    ├─ join   ─► presence ─► topic(.join) + user queue(.users, .content)
//!                    └─ leave  ─► presence ─► topic(.leave)
//! ```
//!
//! Handlers never return errors to the transport. Failures and panics are
//! caught here, logged, and reported as [`EventOutcome::Dropped`].
//!
//! Cache writes and topic publishes for one document happen under that
//! document's ordering lock, so subscribers see updates in the same order
//! the cache applied them. Unrelated documents never share a lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::BroadcastRouter;
use crate::cache::ContentCache;
use crate::model::{change_size, now_millis, DocumentId, UserRecord, SYSTEM_SENDER};
use crate::persistence::{PersistenceGate, DEFAULT_PERSIST_PROBABILITY};
use crate::presence::PresenceTracker;
use crate::protocol::{ClientEvent, DocumentUpdateMessage, EventKind, ServerEvent};
use crate::storage::{DocumentStore, StoreError, UserDirectory};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Probability that an accepted edit is persisted (default: 0.8)
    pub persist_probability: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist_probability: DEFAULT_PERSIST_PROBABILITY,
        }
    }
}

impl SessionConfig {
    /// Persist every edit.
    pub fn for_testing() -> Self {
        Self {
            persist_probability: 1.0,
        }
    }
}

/// Why an event had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Username not in the directory
    UnknownUser,
    DocumentNotFound,
    /// Update from a user who is neither owner nor editor
    Forbidden,
    /// Storage failure or panic while handling
    Internal,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::UnknownUser => "unknown user",
            DropReason::DocumentNotFound => "document not found",
            DropReason::Forbidden => "forbidden",
            DropReason::Internal => "internal error",
        })
    }
}

/// Result of handling one client event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Handled; `recipients` counts receivers reached by all emissions
    Delivered { recipients: usize },
    Dropped(DropReason),
}

impl EventOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, EventOutcome::Delivered { .. })
    }

    pub fn recipients(&self) -> usize {
        match self {
            EventOutcome::Delivered { recipients } => *recipients,
            EventOutcome::Dropped(_) => 0,
        }
    }
}

/// Coordinates cache, presence, persistence and fan-out for client events.
pub struct SessionCoordinator {
    users: Arc<dyn UserDirectory>,
    documents: Arc<dyn DocumentStore>,
    cache: ContentCache,
    presence: PresenceTracker,
    gate: PersistenceGate,
    router: Arc<BroadcastRouter>,
    /// Per-document ordering locks
    order_locks: DashMap<DocumentId, Arc<Mutex<()>>>,
}

impl SessionCoordinator {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        documents: Arc<dyn DocumentStore>,
        router: Arc<BroadcastRouter>,
        gate: PersistenceGate,
    ) -> Self {
        Self {
            users,
            documents,
            cache: ContentCache::new(),
            presence: PresenceTracker::new(),
            gate,
            router,
            order_locks: DashMap::new(),
        }
    }

    /// Coordinator with a Bernoulli persistence gate over `documents`.
    pub fn with_config(
        users: Arc<dyn UserDirectory>,
        documents: Arc<dyn DocumentStore>,
        router: Arc<BroadcastRouter>,
        config: &SessionConfig,
    ) -> Self {
        let gate = PersistenceGate::with_probability(documents.clone(), config.persist_probability);
        Self::new(users, documents, router, gate)
    }

    /// Dispatch a decoded client event.
    pub fn handle(&self, event: &ClientEvent) -> EventOutcome {
        match event.kind {
            EventKind::Load => self.load(&event.message),
            EventKind::Update => self.update(&event.message),
            EventKind::Join => self.join(&event.message),
            EventKind::Leave => self.leave(&event.message),
        }
    }

    pub fn load(&self, message: &DocumentUpdateMessage) -> EventOutcome {
        self.guard(EventKind::Load, message, || self.on_load(message))
    }

    pub fn update(&self, message: &DocumentUpdateMessage) -> EventOutcome {
        self.guard(EventKind::Update, message, || self.on_update(message))
    }

    pub fn join(&self, message: &DocumentUpdateMessage) -> EventOutcome {
        self.guard(EventKind::Join, message, || self.on_join(message))
    }

    pub fn leave(&self, message: &DocumentUpdateMessage) -> EventOutcome {
        self.guard(EventKind::Leave, message, || self.on_leave(message))
    }

    /// Failure boundary: store errors and panics become `Dropped(Internal)`.
    fn guard<F>(&self, kind: EventKind, message: &DocumentUpdateMessage, handler: F) -> EventOutcome
    where
        F: FnOnce() -> Result<EventOutcome, StoreError>,
    {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(handler)) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                log::error!(
                    "Error processing {kind} for document {} from {}: {e}",
                    message.document_id,
                    message.user_id
                );
                EventOutcome::Dropped(DropReason::Internal)
            }
            Err(_) => {
                log::error!(
                    "Panic while processing {kind} for document {} from {}",
                    message.document_id,
                    message.user_id
                );
                EventOutcome::Dropped(DropReason::Internal)
            }
        };
        if let EventOutcome::Dropped(reason) = outcome {
            log::debug!("Dropped {kind} for document {}: {reason}", message.document_id);
        }
        outcome
    }

    fn resolve(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        match self.users.find_by_username(username) {
            Ok(user) => Ok(Some(user)),
            Err(StoreError::UserNotFound(_)) => {
                log::warn!("Event from unknown user {username}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn order_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        self.order_locks
            .entry(document_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the ordering lock entry if nobody holds a handle to it.
    fn release_order_lock(&self, document_id: &str) {
        self.order_locks
            .remove_if(document_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Run `f` under the document's ordering lock, serialized with
    /// session updates, joins and leaves on that document.
    pub fn ordered<R>(&self, document_id: &str, f: impl FnOnce() -> R) -> R {
        let lock = self.order_lock(document_id);
        let _order = lock.lock();
        f()
    }

    /// Number of documents with a live ordering lock entry.
    pub fn order_lock_count(&self) -> usize {
        self.order_locks.len()
    }

    fn on_load(&self, message: &DocumentUpdateMessage) -> Result<EventOutcome, StoreError> {
        let Some(user) = self.resolve(&message.user_id)? else {
            return Ok(EventOutcome::Dropped(DropReason::UnknownUser));
        };
        let document_id = message.document_id.as_str();
        log::debug!("User {} requested to load document {document_id}", user.id);

        let content = match self.cache.get(document_id) {
            Some(content) => content,
            None => {
                let lock = self.order_lock(document_id);
                let _order = lock.lock();
                // An update may have filled the slot while we waited
                match self.cache.get(document_id) {
                    Some(content) => content,
                    None => match self.documents.get_by_id(document_id) {
                        Ok(doc) => {
                            self.cache.put(document_id, doc.content.clone());
                            doc.content
                        }
                        Err(StoreError::DocumentNotFound(_)) => {
                            return Ok(EventOutcome::Dropped(DropReason::DocumentNotFound))
                        }
                        Err(e) => return Err(e),
                    },
                }
            }
        };

        let reply = ServerEvent::Content(DocumentUpdateMessage::new(
            document_id,
            content,
            SYSTEM_SENDER,
            now_millis(),
        ));
        let recipients = self.router.publish_to_user(&user.id, reply);
        log::debug!("Sent document content to user {} for document {document_id}", user.id);
        Ok(EventOutcome::Delivered { recipients })
    }

    fn on_update(&self, message: &DocumentUpdateMessage) -> Result<EventOutcome, StoreError> {
        let Some(user) = self.resolve(&message.user_id)? else {
            return Ok(EventOutcome::Dropped(DropReason::UnknownUser));
        };
        let document_id = message.document_id.as_str();
        log::debug!("Received update for document {document_id} from user {}", user.id);

        let document = match self.documents.get_by_id(document_id) {
            Ok(doc) => doc,
            Err(StoreError::DocumentNotFound(_)) => {
                return Ok(EventOutcome::Dropped(DropReason::DocumentNotFound))
            }
            Err(e) => return Err(e),
        };

        if !document.can_edit(&user.id) {
            log::warn!(
                "User {} attempted to edit document {document_id} without permission",
                user.id
            );
            return Ok(EventOutcome::Dropped(DropReason::Forbidden));
        }

        self.presence.add_active_user(document_id, &user.id);

        let lock = self.order_lock(document_id);
        let _order = lock.lock();

        let previous = self.cache.get(document_id).unwrap_or(document.content);
        self.cache.put(document_id, message.content.clone());
        let recipients = self
            .router
            .publish_to_document(document_id, ServerEvent::Update(message.clone()));
        log::trace!(
            "Document {document_id} changed by {} characters",
            change_size(&previous, &message.content)
        );

        // Persisting under the ordering lock keeps the version log in
        // broadcast order. A failure leaves cache and broadcast in place.
        match self.gate.maybe_persist(document_id, &message.content, &user.id) {
            Ok(true) => log::debug!("Saved document {document_id} to storage"),
            Ok(false) => {}
            Err(failure) => log::error!("{failure}"),
        }

        Ok(EventOutcome::Delivered { recipients })
    }

    fn on_join(&self, message: &DocumentUpdateMessage) -> Result<EventOutcome, StoreError> {
        let Some(user) = self.resolve(&message.user_id)? else {
            return Ok(EventOutcome::Dropped(DropReason::UnknownUser));
        };
        let document_id = message.document_id.as_str();
        log::debug!("User {} joined document {document_id}", user.id);

        self.presence.add_active_user(document_id, &user.id);

        let (mut recipients, cached) = {
            let lock = self.order_lock(document_id);
            let _order = lock.lock();
            let joined = ServerEvent::Joined {
                document_id: document_id.to_string(),
                user_id: user.id.clone(),
            };
            (
                self.router.publish_to_document(document_id, joined),
                self.cache.get(document_id),
            )
        };

        let users = self.presence.list_active_users(document_id);
        recipients += self.router.publish_to_user(
            &user.id,
            ServerEvent::ActiveUsers {
                document_id: document_id.to_string(),
                users: users.into_iter().collect(),
            },
        );

        if let Some(content) = cached {
            recipients += self.router.publish_to_user(
                &user.id,
                ServerEvent::Content(DocumentUpdateMessage::new(
                    document_id,
                    content,
                    SYSTEM_SENDER,
                    now_millis(),
                )),
            );
            log::debug!("Sent cached content to user {} for document {document_id}", user.id);
        }

        Ok(EventOutcome::Delivered { recipients })
    }

    fn on_leave(&self, message: &DocumentUpdateMessage) -> Result<EventOutcome, StoreError> {
        let Some(user) = self.resolve(&message.user_id)? else {
            return Ok(EventOutcome::Dropped(DropReason::UnknownUser));
        };
        let document_id = message.document_id.as_str();
        log::debug!("User {} left document {document_id}", user.id);

        self.presence.remove_active_user(document_id, &user.id);
        let recipients = self.announce_left(document_id, &user.id);
        Ok(EventOutcome::Delivered { recipients })
    }

    fn announce_left(&self, document_id: &str, user_id: &str) -> usize {
        let recipients = self.ordered(document_id, || {
            self.router.publish_to_document(
                document_id,
                ServerEvent::Left {
                    document_id: document_id.to_string(),
                    user_id: user_id.to_string(),
                },
            )
        });
        self.release_order_lock(document_id);
        recipients
    }

    /// Remove users idle longer than `timeout` and announce each as left.
    pub fn reap_idle_sessions(&self, timeout: Duration) -> usize {
        let reaped = self.presence.reap_idle(timeout);
        for (document_id, user_id) in &reaped {
            log::info!("Presence: {user_id} timed out on document {document_id}");
            self.announce_left(document_id, user_id);
        }
        reaped.len()
    }

    /// Forget all session state for a deleted document.
    pub fn evict_document(&self, document_id: &str) {
        self.cache.evict(document_id);
        let cleared = self.presence.clear_document(document_id);
        // An in-flight update keeps its entry; dropping it would let a
        // second lock be created for the same document.
        self.release_order_lock(document_id);
        log::debug!("Evicted document {document_id} ({cleared} active users cleared)");
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn gate(&self) -> &PersistenceGate {
        &self.gate
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }
}
