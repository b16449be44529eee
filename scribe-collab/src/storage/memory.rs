//! In-memory collaborators backed by sharded concurrent maps.
//!
//! Used by tests and by servers started without a data directory.
//! Each document lives in one map slot, so `append_version` is atomic
//! under that slot's shard lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;

use super::{DocumentStore, StoreError, UserDirectory};
use crate::model::{AccessRole, DocumentId, DocumentRecord, DocumentVersion, UserId, UserRecord};

/// Document store held entirely in memory.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<DocumentId, DocumentRecord>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get_by_id(&self, id: &str) -> Result<DocumentRecord, StoreError> {
        self.documents
            .get(id)
            .map(|doc| doc.value().clone())
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))
    }

    fn save(&self, record: DocumentRecord) -> Result<DocumentRecord, StoreError> {
        match self.documents.entry(record.id.clone()) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                let known = stored.versions.len();
                stored.title = record.title;
                stored.content = record.content;
                stored.owner_id = record.owner_id;
                stored.access_roles = record.access_roles;
                stored.versions.extend(record.versions.into_iter().skip(known));
                Ok(stored.clone())
            }
            Entry::Vacant(slot) => Ok(slot.insert(record).value().clone()),
        }
    }

    fn set_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let mut doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
        doc.title = title.to_string();
        Ok(())
    }

    fn set_role(&self, id: &str, user_id: &str, role: AccessRole) -> Result<(), StoreError> {
        let mut doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
        doc.access_roles.insert(user_id.to_string(), role);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.documents.remove(id);
        Ok(())
    }

    fn append_version(&self, id: &str, version: DocumentVersion) -> Result<u64, StoreError> {
        let mut doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
        doc.content = version.content_snapshot.clone();
        doc.versions.push(version);
        Ok(doc.versions.len() as u64 - 1)
    }

    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<DocumentRecord>, StoreError> {
        Ok(self
            .documents
            .iter()
            .filter(|doc| doc.owner_id == owner_id)
            .map(|doc| doc.value().clone())
            .collect())
    }

    fn find_by_ids(&self, ids: &BTreeSet<DocumentId>) -> Result<Vec<DocumentRecord>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.documents.get(id).map(|doc| doc.value().clone()))
            .collect())
    }

    fn list_ids(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.documents.iter().map(|doc| doc.key().clone()).collect())
    }
}

/// User directory held entirely in memory.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: DashMap<UserId, UserRecord>,
    /// username → user id
    usernames: DashMap<String, UserId>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from a list of users.
    pub fn with_users(users: impl IntoIterator<Item = UserRecord>) -> Self {
        let directory = Self::new();
        for user in users {
            directory.usernames.insert(user.username.clone(), user.id.clone());
            directory.users.insert(user.id.clone(), user);
        }
        directory
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn find_by_username(&self, username: &str) -> Result<UserRecord, StoreError> {
        let id = self
            .usernames
            .get(username)
            .map(|id| id.value().clone())
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        self.find_by_id(&id)
    }

    fn find_by_id(&self, id: &str) -> Result<UserRecord, StoreError> {
        self.users
            .get(id)
            .map(|user| user.value().clone())
            .ok_or_else(|| StoreError::UserNotFound(id.to_string()))
    }

    fn save_user(&self, user: UserRecord) -> Result<UserRecord, StoreError> {
        if let Some(previous) = self.users.insert(user.id.clone(), user.clone()) {
            if previous.username != user.username {
                self.usernames.remove(&previous.username);
            }
        }
        self.usernames.insert(user.username.clone(), user.id.clone());
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_document() {
        let store = MemoryDocumentStore::new();
        assert_eq!(
            store.get_by_id("nope"),
            Err(StoreError::DocumentNotFound("nope".into()))
        );
    }

    #[test]
    fn test_append_version_updates_content() {
        let store = MemoryDocumentStore::new();
        store.save(DocumentRecord::new("d1", "t", "hello", "alice")).unwrap();

        let idx = store
            .append_version("d1", DocumentVersion::new("hello world", "alice"))
            .unwrap();
        assert_eq!(idx, 1);

        let doc = store.get_by_id("d1").unwrap();
        assert_eq!(doc.content, "hello world");
        assert_eq!(doc.versions.len(), 2);
        assert_eq!(doc.versions[1].content_snapshot, "hello world");
    }

    #[test]
    fn test_set_role_keeps_content_and_versions() {
        let store = MemoryDocumentStore::new();
        store.save(DocumentRecord::new("d1", "t", "v0", "alice")).unwrap();
        store.append_version("d1", DocumentVersion::new("v1", "alice")).unwrap();

        store.set_role("d1", "bob", AccessRole::Editor).unwrap();
        store.set_title("d1", "renamed").unwrap();

        let doc = store.get_by_id("d1").unwrap();
        assert_eq!(doc.role_of("bob"), Some(AccessRole::Editor));
        assert_eq!(doc.title, "renamed");
        assert_eq!(doc.content, "v1");
        assert_eq!(doc.versions.len(), 2);
        assert!(store.set_title("nope", "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_append_version_missing_document() {
        let store = MemoryDocumentStore::new();
        let result = store.append_version("ghost", DocumentVersion::new("x", "u"));
        assert!(matches!(result, Err(StoreError::DocumentNotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_never_rewrites_versions() {
        let store = MemoryDocumentStore::new();
        store.save(DocumentRecord::new("d1", "t", "v0", "alice")).unwrap();
        store.append_version("d1", DocumentVersion::new("v1", "alice")).unwrap();

        // Stale copy with a tampered first version and a new role
        let mut stale = DocumentRecord::new("d1", "renamed", "v0", "alice");
        stale.versions[0].content_snapshot = "tampered".into();
        stale.access_roles.insert("bob".into(), AccessRole::Viewer);
        let saved = store.save(stale).unwrap();

        assert_eq!(saved.title, "renamed");
        assert_eq!(saved.versions.len(), 2);
        assert_eq!(saved.versions[0].content_snapshot, "v0");
        assert_eq!(saved.role_of("bob"), Some(AccessRole::Viewer));
    }

    #[test]
    fn test_find_by_owner_and_ids() {
        let store = MemoryDocumentStore::new();
        store.save(DocumentRecord::new("a", "t", "", "alice")).unwrap();
        store.save(DocumentRecord::new("b", "t", "", "alice")).unwrap();
        store.save(DocumentRecord::new("c", "t", "", "bob")).unwrap();

        assert_eq!(store.find_by_owner("alice").unwrap().len(), 2);
        let ids: BTreeSet<_> = ["c".to_string(), "zzz".to_string()].into();
        let found = store.find_by_ids(&ids).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "c");

        store.delete("a").unwrap();
        assert_eq!(store.list_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_directory_lookup() {
        let dir = MemoryUserDirectory::with_users([UserRecord::new("u1", "alice")]);
        assert_eq!(dir.find_by_username("alice").unwrap().id, "u1");
        assert_eq!(dir.find_by_id("u1").unwrap().username, "alice");
        assert!(matches!(
            dir.find_by_username("bob"),
            Err(StoreError::UserNotFound(_))
        ));
    }

    #[test]
    fn test_directory_rename_updates_index() {
        let dir = MemoryUserDirectory::with_users([UserRecord::new("u1", "alice")]);
        dir.save_user(UserRecord::new("u1", "alicia")).unwrap();
        assert!(dir.find_by_username("alice").is_err());
        assert_eq!(dir.find_by_username("alicia").unwrap().id, "u1");
        assert_eq!(dir.len(), 1);
    }
}
