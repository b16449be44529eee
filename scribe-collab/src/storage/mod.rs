//! Persistence collaborators consumed by the session layer.
//!
//! Architecture:
//! ```text
//! ┌────────────────────┐   append_version   ┌─────────────────────┐
//! │ PersistenceGate    │ ─────────────────► │ DocumentStore       │
//! │ DocumentService    │   get / save       │  ├─ Memory (DashMap)│
//! └────────────────────┘                    │  └─ Rocks (CFs)     │
//!                                           └─────────────────────┘
//! ┌────────────────────┐  find_by_username  ┌─────────────────────┐
//! │ SessionCoordinator │ ─────────────────► │ UserDirectory       │
//! └────────────────────┘                    └─────────────────────┘
//! ```
//!
//! Both traits are synchronous. Implementations must make
//! `append_version` atomic: the version append and the live content update
//! either both land or neither does. `set_title` and `set_role` touch only
//! their own field, so they never race a concurrent append.

pub mod memory;
pub mod rocks;

use std::collections::BTreeSet;

use crate::model::{AccessRole, DocumentId, DocumentRecord, DocumentVersion, UserRecord};

pub use memory::{MemoryDocumentStore, MemoryUserDirectory};
pub use rocks::{RocksDocumentStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Document absent from the store
    #[error("Document not found: {0}")]
    DocumentNotFound(String),
    /// User absent from the directory
    #[error("User not found: {0}")]
    UserNotFound(String),
    /// Backend failure
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::DocumentNotFound(_) | StoreError::UserNotFound(_))
    }
}

/// Document-metadata and content collaborator.
pub trait DocumentStore: Send + Sync {
    /// Load a document with its full version log.
    fn get_by_id(&self, id: &str) -> Result<DocumentRecord, StoreError>;

    /// Upsert title, content, owner and roles.
    ///
    /// Versions already stored are never rewritten; versions in `record`
    /// beyond the stored count are appended. Overwrites the live content, so
    /// edits to an existing document go through `append_version`.
    fn save(&self, record: DocumentRecord) -> Result<DocumentRecord, StoreError>;

    /// Replace the title only.
    fn set_title(&self, id: &str, title: &str) -> Result<(), StoreError>;

    /// Grant `role` to `user_id`, leaving content and versions untouched.
    fn set_role(&self, id: &str, user_id: &str, role: AccessRole) -> Result<(), StoreError>;

    /// Remove a document and its version log.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Atomically append `version` and set the live content to its snapshot.
    ///
    /// Returns the insertion index of the new version.
    fn append_version(&self, id: &str, version: DocumentVersion) -> Result<u64, StoreError>;

    /// Documents owned by `owner_id`.
    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Documents with the given IDs; unknown IDs are skipped.
    fn find_by_ids(&self, ids: &BTreeSet<DocumentId>) -> Result<Vec<DocumentRecord>, StoreError>;

    /// All stored document IDs.
    fn list_ids(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// User-directory collaborator.
pub trait UserDirectory: Send + Sync {
    fn find_by_username(&self, username: &str) -> Result<UserRecord, StoreError>;

    fn find_by_id(&self, id: &str) -> Result<UserRecord, StoreError>;

    /// Upsert a user, keeping the username index current.
    fn save_user(&self, user: UserRecord) -> Result<UserRecord, StoreError>;
}
