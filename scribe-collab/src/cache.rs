//! Last-known document content, keyed by document ID.
//!
//! One unversioned slot per document. Writes overwrite unconditionally
//! (last writer wins); reads never touch storage. A miss is not an error:
//! the caller reads through the store and populates the slot.

use dashmap::DashMap;

use crate::model::{now_millis, DocumentId};

/// Cached content plus the time it was last written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
}

/// Sharded in-memory content cache.
#[derive(Default)]
pub struct ContentCache {
    entries: DashMap<DocumentId, CachedContent>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest cached content, if any.
    pub fn get(&self, document_id: &str) -> Option<String> {
        self.entries
            .get(document_id)
            .map(|entry| entry.content.clone())
    }

    /// Latest cached content with its last-write timestamp.
    pub fn entry(&self, document_id: &str) -> Option<CachedContent> {
        self.entries.get(document_id).map(|entry| entry.value().clone())
    }

    /// Overwrite the slot for `document_id`.
    pub fn put(&self, document_id: impl Into<DocumentId>, content: impl Into<String>) {
        self.entries.insert(
            document_id.into(),
            CachedContent {
                content: content.into(),
                updated_at: now_millis(),
            },
        );
    }

    /// Drop the slot for `document_id`. Returns whether one existed.
    pub fn evict(&self, document_id: &str) -> bool {
        self.entries.remove(document_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_miss_then_put() {
        let cache = ContentCache::new();
        assert_eq!(cache.get("d1"), None);

        cache.put("d1", "hello");
        assert_eq!(cache.get("d1").as_deref(), Some("hello"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_overwrites() {
        let cache = ContentCache::new();
        cache.put("d1", "a");
        cache.put("d1", "b");
        cache.put("d1", "");
        assert_eq!(cache.get("d1").as_deref(), Some(""));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_entry_has_timestamp() {
        let cache = ContentCache::new();
        let before = now_millis();
        cache.put("d1", "x");
        let entry = cache.entry("d1").unwrap();
        assert_eq!(entry.content, "x");
        assert!(entry.updated_at >= before);
    }

    #[test]
    fn test_evict() {
        let cache = ContentCache::new();
        cache.put("d1", "x");
        assert!(cache.evict("d1"));
        assert!(!cache.evict("d1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_documents_isolated() {
        let cache = Arc::new(ContentCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        cache.put(format!("doc-{i}"), format!("{i}:{n}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cache.len(), 8);
        for i in 0..8 {
            assert_eq!(cache.get(&format!("doc-{i}")), Some(format!("{i}:99")));
        }
    }
}
