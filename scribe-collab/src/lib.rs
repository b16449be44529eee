//! # scribe-collab: Live collaboration sessions for shared text documents
//!
//! Tracks who is active on a document, caches its latest content, fans out
//! edits to every connected viewer and decides when content is written back
//! to durable storage. Conflict resolution is last-write-wins.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │ (per user)   │    JSON frames     │ (JWT auth)   │
//! └──────────────┘                    └──────┬───────┘
//!                                            │ ClientEvent
//!                                            ▼
//!                                  ┌────────────────────┐
//!                                  │ SessionCoordinator │
//!                                  └─┬──────┬──────┬──┬─┘
//!                                    │      │      │  │
//!                      ┌─────────────┘      │      │  └──────────────┐
//!                      ▼                    ▼      ▼                 ▼
//!               ┌──────────────┐ ┌───────────────┐ ┌───────────────┐ ┌─────────────────┐
//!               │ ContentCache │ │PresenceTracker│ │PersistenceGate│ │ BroadcastRouter │
//!               └──────────────┘ └───────────────┘ └───────┬───────┘ └─────────────────┘
//!                                                          ▼
//!                                                   ┌──────────────┐
//!                                                   │DocumentStore │ ◄── DocumentService
//!                                                   │UserDirectory │     (request/response)
//!                                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Documents, versions, users and access roles
//! - [`storage`]: Store traits with in-memory and RocksDB backends
//! - [`cache`]: Last-known content per document
//! - [`presence`]: Active users per document
//! - [`persistence`]: Throttled write-back of edits
//! - [`broadcast`]: Document topics and private user queues
//! - [`coordinator`]: Load, update, join and leave handling
//! - [`documents`]: Create, share, delete and version history
//! - [`protocol`]: JSON wire frames
//! - [`auth`]: HS256 bearer tokens
//! - [`server`]: WebSocket transport
//! - [`client`]: WebSocket client

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod coordinator;
pub mod documents;
pub mod model;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{bearer_token, Claims, Hs256Issuer, Hs256Verifier, TokenVerifier};
pub use broadcast::{BroadcastRouter, EventReceiver, RouterStats};
pub use cache::{CachedContent, ContentCache};
pub use client::{CollabClient, ConnectionState, SessionEvent, DEFAULT_CONNECT_TIMEOUT};
pub use coordinator::{DropReason, EventOutcome, SessionConfig, SessionCoordinator};
pub use documents::{DocumentService, ServiceError, ServiceResult};
pub use model::{
    AccessRole, DocumentId, DocumentRecord, DocumentVersion, InvalidRole, UserId, UserRecord,
    SYSTEM_SENDER,
};
pub use persistence::{
    AlwaysPersist, BernoulliPolicy, FnPolicy, NeverPersist, PersistAttempt, PersistPolicy,
    PersistStats, PersistenceFailure, PersistenceGate, DEFAULT_PERSIST_PROBABILITY,
};
pub use presence::PresenceTracker;
pub use protocol::{ClientEvent, DocumentUpdateMessage, EventKind, ProtocolError, ServerEvent};
pub use server::{CollabServer, ServerConfig, ServerError, ServerStats};
pub use storage::{
    DocumentStore, MemoryDocumentStore, MemoryUserDirectory, RocksDocumentStore, StoreConfig,
    StoreError, UserDirectory,
};
