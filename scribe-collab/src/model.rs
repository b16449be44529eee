//! Document and user records shared by the session layer and its collaborators.
//!
//! Identifiers are opaque strings. The session layer never interprets them;
//! it only keys caches, presence sets and broadcast topics by them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// Opaque document identifier.
pub type DocumentId = String;

/// Opaque user identifier (resolved from a username by the directory).
pub type UserId = String;

/// Sender used for content pushed by the server rather than by a user.
pub const SYSTEM_SENDER: &str = "system";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-document access role granted through sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRole {
    Viewer,
    Editor,
}

impl AccessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessRole::Viewer => "viewer",
            AccessRole::Editor => "editor",
        }
    }
}

impl fmt::Display for AccessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a role string is neither `viewer` nor `editor`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("role must be either 'viewer' or 'editor', got '{0}'")]
pub struct InvalidRole(pub String);

impl FromStr for AccessRole {
    type Err = InvalidRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(AccessRole::Viewer),
            "editor" => Ok(AccessRole::Editor),
            other => Err(InvalidRole(other.to_string())),
        }
    }
}

/// Immutable snapshot appended each time an edit is durably persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentVersion {
    pub content_snapshot: String,
    pub edited_by_user_id: UserId,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl DocumentVersion {
    pub fn new(content: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        Self {
            content_snapshot: content.into(),
            edited_by_user_id: user_id.into(),
            timestamp: now_millis(),
        }
    }
}

/// A persisted document: live content, ownership, sharing and version log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: DocumentId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub owner_id: UserId,
    #[serde(default)]
    pub access_roles: BTreeMap<UserId, AccessRole>,
    /// Append-only, in insertion order
    #[serde(default)]
    pub versions: Vec<DocumentVersion>,
}

impl DocumentRecord {
    /// Create a document owned by `owner_id` with its initial version.
    pub fn new(
        id: impl Into<DocumentId>,
        title: impl Into<String>,
        content: impl Into<String>,
        owner_id: impl Into<UserId>,
    ) -> Self {
        let content = content.into();
        let owner_id = owner_id.into();
        let initial = DocumentVersion::new(content.clone(), owner_id.clone());
        Self {
            id: id.into(),
            title: title.into(),
            content,
            owner_id,
            access_roles: BTreeMap::new(),
            versions: vec![initial],
        }
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn role_of(&self, user_id: &str) -> Option<AccessRole> {
        self.access_roles.get(user_id).copied()
    }

    /// Owner or editor.
    pub fn can_edit(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.role_of(user_id) == Some(AccessRole::Editor)
    }

    /// Owner or any shared role.
    pub fn can_view(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.access_roles.contains_key(user_id)
    }

    /// Version history ordered by timestamp; equal timestamps keep insertion order.
    pub fn sorted_versions(&self) -> Vec<DocumentVersion> {
        let mut versions = self.versions.clone();
        versions.sort_by_key(|v| v.timestamp);
        versions
    }

    /// Most recent version by timestamp (last inserted on ties).
    pub fn latest_version(&self) -> Option<&DocumentVersion> {
        self.versions
            .iter()
            .enumerate()
            .max_by_key(|(idx, v)| (v.timestamp, *idx))
            .map(|(_, v)| v)
    }

    /// Version at `index` in timestamp order (0 is the oldest).
    pub fn version_at(&self, index: usize) -> Option<DocumentVersion> {
        self.sorted_versions().into_iter().nth(index)
    }
}

/// Directory entry for a user. Credentials live with the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub shared_document_ids: BTreeSet<DocumentId>,
}

impl UserRecord {
    pub fn new(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: String::new(),
            shared_document_ids: BTreeSet::new(),
        }
    }
}

/// Number of character positions that differ between two contents.
///
/// Positions past the end of the shorter string count as differences.
pub fn change_size(old: &str, new: &str) -> usize {
    let mut old_chars = old.chars();
    let mut new_chars = new.chars();
    let mut differences = 0;
    loop {
        match (old_chars.next(), new_chars.next()) {
            (None, None) => break,
            (Some(a), Some(b)) if a == b => {}
            _ => differences += 1,
        }
    }
    differences
}
