//! Request/response document operations: create, read, edit, delete,
//! share, listings and version history.
//!
//! Unlike the event path, every failure surfaces as a [`ServiceError`].
//! Callers pass the authenticated username; it is resolved through the
//! directory before any ownership or role check.

use std::sync::Arc;
use uuid::Uuid;

use crate::coordinator::SessionCoordinator;
use crate::model::{change_size, AccessRole, DocumentRecord, DocumentVersion, InvalidRole, UserRecord};
use crate::storage::{DocumentStore, StoreError, UserDirectory};

/// Request-path errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Document not found with ID: {0}")]
    DocumentNotFound(String),
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    InvalidRole(#[from] InvalidRole),
    #[error("Version {index} not found for document {document_id}")]
    VersionNotFound { document_id: String, index: usize },
    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DocumentNotFound(id) => ServiceError::DocumentNotFound(id),
            StoreError::UserNotFound(id) => ServiceError::UserNotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Document operations over the store and directory collaborators.
pub struct DocumentService {
    documents: Arc<dyn DocumentStore>,
    users: Arc<dyn UserDirectory>,
    /// Live sessions to keep in step with edits and deletes
    sessions: Option<Arc<SessionCoordinator>>,
}

impl DocumentService {
    pub fn new(documents: Arc<dyn DocumentStore>, users: Arc<dyn UserDirectory>) -> Self {
        Self {
            documents,
            users,
            sessions: None,
        }
    }

    /// Refresh the session cache on edits and evict session state on delete.
    pub fn with_sessions(mut self, sessions: Arc<SessionCoordinator>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    fn user(&self, username: &str) -> ServiceResult<UserRecord> {
        Ok(self.users.find_by_username(username)?)
    }

    /// Create a document owned by `username` with its initial version.
    pub fn create(&self, username: &str, title: &str, content: &str) -> ServiceResult<DocumentRecord> {
        let owner = self.user(username)?;
        let id = Uuid::new_v4().simple().to_string();
        let record = DocumentRecord::new(id, title, content, owner.id);
        let saved = self.documents.save(record)?;
        log::info!("Created document {} for {username}", saved.id);
        Ok(saved)
    }

    /// Unchecked lookup by ID.
    pub fn get_document_by_id(&self, document_id: &str) -> ServiceResult<DocumentRecord> {
        Ok(self.documents.get_by_id(document_id)?)
    }

    /// Fetch a document the user may view (owner or any shared role).
    pub fn get(&self, username: &str, document_id: &str) -> ServiceResult<DocumentRecord> {
        let user = self.user(username)?;
        let document = self.get_document_by_id(document_id)?;
        if !document.can_view(&user.id) {
            return Err(ServiceError::Forbidden(format!(
                "user {username} cannot view document {document_id}"
            )));
        }
        Ok(document)
    }

    /// Replace content (and optionally the title), appending a version.
    ///
    /// The version goes through `append_version`, so concurrent session
    /// persists are never overwritten. With live sessions attached, the
    /// append and the cache refresh run under the document's ordering lock.
    pub fn update(
        &self,
        username: &str,
        document_id: &str,
        title: Option<&str>,
        content: &str,
    ) -> ServiceResult<DocumentRecord> {
        let user = self.user(username)?;
        let document = self.get_document_by_id(document_id)?;
        if !document.can_edit(&user.id) {
            return Err(ServiceError::Forbidden(format!(
                "user {username} does not have edit access to document {document_id}"
            )));
        }

        log::debug!(
            "Document {document_id} edited by {username}: {} characters changed",
            change_size(&document.content, content)
        );
        if let Some(title) = title {
            self.documents.set_title(document_id, title)?;
        }
        let version = DocumentVersion::new(content, user.id);
        let index = match &self.sessions {
            Some(sessions) => sessions.ordered(document_id, || {
                let index = self.documents.append_version(document_id, version)?;
                sessions.cache().put(document_id, content);
                Ok::<_, StoreError>(index)
            })?,
            None => self.documents.append_version(document_id, version)?,
        };
        log::trace!("Document {document_id} now at version {index}");

        self.get_document_by_id(document_id)
    }

    /// Owner-only delete. Clears sharing entries and live session state.
    pub fn delete(&self, username: &str, document_id: &str) -> ServiceResult<()> {
        let user = self.user(username)?;
        let document = self.get_document_by_id(document_id)?;
        if !document.is_owner(&user.id) {
            return Err(ServiceError::Forbidden(
                "only the document owner can delete it".into(),
            ));
        }

        self.documents.delete(document_id)?;
        for shared_with in document.access_roles.keys() {
            match self.users.find_by_id(shared_with) {
                Ok(mut target) => {
                    if target.shared_document_ids.remove(document_id) {
                        self.users.save_user(target)?;
                    }
                }
                Err(StoreError::UserNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(sessions) = &self.sessions {
            sessions.evict_document(document_id);
        }
        log::info!("Deleted document {document_id}");
        Ok(())
    }

    /// Owner-only share with `target_username` as `role`.
    pub fn share(
        &self,
        username: &str,
        document_id: &str,
        target_username: &str,
        role: &str,
    ) -> ServiceResult<DocumentRecord> {
        let role: AccessRole = role.parse()?;
        let owner = self.user(username)?;
        let document = self.get_document_by_id(document_id)?;
        if !document.is_owner(&owner.id) {
            return Err(ServiceError::Forbidden(
                "only the document owner can share it".into(),
            ));
        }

        // Only the role map is written; content and versions stay as
        // whatever concurrent sessions last stored.
        let mut target = self.user(target_username)?;
        self.documents.set_role(document_id, &target.id, role)?;
        target.shared_document_ids.insert(document_id.to_string());
        self.users.save_user(target)?;

        log::info!("Shared document {document_id} with {target_username} as {role}");
        self.get_document_by_id(document_id)
    }

    /// Store a fully formed record, as used for seeding a server.
    ///
    /// Returns `false` without touching anything if a document with the
    /// same ID exists. The owner must be in the directory; sharers that are
    /// get the ID added to their shared set. A record without versions gets
    /// an initial one from its content.
    pub fn import(&self, mut record: DocumentRecord) -> ServiceResult<bool> {
        match self.documents.get_by_id(&record.id) {
            Ok(_) => {
                log::warn!("Document {} already exists, skipping import", record.id);
                return Ok(false);
            }
            Err(StoreError::DocumentNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.users.find_by_id(&record.owner_id)?;

        if record.versions.is_empty() {
            record.versions.push(DocumentVersion::new(
                record.content.clone(),
                record.owner_id.clone(),
            ));
        }
        let saved = self.documents.save(record)?;
        for shared_with in saved.access_roles.keys() {
            match self.users.find_by_id(shared_with) {
                Ok(mut target) => {
                    if target.shared_document_ids.insert(saved.id.clone()) {
                        self.users.save_user(target)?;
                    }
                }
                Err(StoreError::UserNotFound(_)) => {
                    log::warn!("Document {} shared with unknown user {shared_with}", saved.id)
                }
                Err(e) => return Err(e.into()),
            }
        }
        log::info!("Imported document {} owned by {}", saved.id, saved.owner_id);
        Ok(true)
    }

    pub fn documents_owned_by(&self, username: &str) -> ServiceResult<Vec<DocumentRecord>> {
        let user = self.user(username)?;
        Ok(self.documents.find_by_owner(&user.id)?)
    }

    pub fn documents_shared_with(&self, username: &str) -> ServiceResult<Vec<DocumentRecord>> {
        let user = self.user(username)?;
        Ok(self.documents.find_by_ids(&user.shared_document_ids)?)
    }

    /// Versions ordered by timestamp, ties in insertion order.
    pub fn version_history(&self, username: &str, document_id: &str) -> ServiceResult<Vec<DocumentVersion>> {
        Ok(self.get(username, document_id)?.sorted_versions())
    }

    pub fn latest_version(&self, username: &str, document_id: &str) -> ServiceResult<DocumentVersion> {
        let document = self.get(username, document_id)?;
        document
            .latest_version()
            .cloned()
            .ok_or_else(|| ServiceError::VersionNotFound {
                document_id: document_id.to_string(),
                index: 0,
            })
    }

    /// Version at `index` in timestamp order; 0 is the oldest.
    pub fn version_at(&self, username: &str, document_id: &str, index: usize) -> ServiceResult<DocumentVersion> {
        self.get(username, document_id)?
            .version_at(index)
            .ok_or_else(|| ServiceError::VersionNotFound {
                document_id: document_id.to_string(),
                index,
            })
    }

    /// Character positions that would change if `new_content` replaced the
    /// stored content.
    pub fn change_size(&self, document_id: &str, new_content: &str) -> ServiceResult<usize> {
        let document = self.get_document_by_id(document_id)?;
        Ok(change_size(&document.content, new_content))
    }
}
