//! RocksDB-backed document store and user directory.
//!
//! Column families:
//! - `documents`: Document headers with title, live content, owner, roles
//!   and version count (bincode, LZ4 compressed)
//! - `versions`: Append-only version log (bincode, LZ4 compressed),
//!   keyed by `<id_len:4 BE><doc_id><seq:8 BE>`
//! - `users`: User records (bincode), keyed by user id
//! - `usernames`: Username → user id index
//!
//! Every mutation is a single `WriteBatch`, so a persisted edit writes the
//! new version and the updated header together or not at all.

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::{DocumentStore, StoreError, UserDirectory};
use crate::model::{
    now_millis, AccessRole, DocumentId, DocumentRecord, DocumentVersion, UserId, UserRecord,
};

const CF_DOCUMENTS: &str = "documents";
const CF_VERSIONS: &str = "versions";
const CF_USERS: &str = "users";
const CF_USERNAMES: &str = "usernames";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_VERSIONS, CF_USERS, CF_USERNAMES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Document header as stored; the version log lives in its own CF.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    id: DocumentId,
    title: String,
    content: String,
    owner_id: UserId,
    access_roles: BTreeMap<UserId, AccessRole>,
    version_count: u64,
    created_at: u64,
    updated_at: u64,
}

impl StoredDocument {
    fn into_record(self, versions: Vec<DocumentVersion>) -> DocumentRecord {
        DocumentRecord {
            id: self.id,
            title: self.title,
            content: self.content,
            owner_id: self.owner_id,
            access_roles: self.access_roles,
            versions,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed store implementing both collaborator traits.
pub struct RocksDocumentStore {
    /// RocksDB instance (single-threaded mode, writes serialized by `write_lock`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write cycles on document headers
    write_lock: Mutex<()>,
}

impl RocksDocumentStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_USERS | CF_USERNAMES => {
                // Point lookups by id
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                // Append-heavy, prefix-scanned per document; values are already LZ4
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of versions stored for a document.
    pub fn version_count(&self, id: &str) -> Result<u64, StoreError> {
        Ok(self.load_header(id)?.version_count)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Documents ────────────────────────────────────────────────────

    fn load_header(&self, id: &str) -> Result<StoredDocument, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode_compressed(&bytes),
            None => Err(StoreError::DocumentNotFound(id.to_string())),
        }
    }

    /// Read-modify-write of one header under the write lock.
    fn update_header<F>(&self, id: &str, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoredDocument),
    {
        let _guard = self.write_lock.lock();
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let mut header = self.load_header(id)?;
        change(&mut header);
        header.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, id.as_bytes(), encode_compressed(&header)?);
        self.write(batch)
    }

    fn load_versions(&self, id: &str) -> Result<Vec<DocumentVersion>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let prefix = version_prefix(id);

        let mut versions = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            versions.push(decode_compressed(&value)?);
        }
        Ok(versions)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl DocumentStore for RocksDocumentStore {
    fn get_by_id(&self, id: &str) -> Result<DocumentRecord, StoreError> {
        let header = self.load_header(id)?;
        let versions = self.load_versions(id)?;
        Ok(header.into_record(versions))
    }

    fn save(&self, record: DocumentRecord) -> Result<DocumentRecord, StoreError> {
        let _guard = self.write_lock.lock();
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_versions = self.cf(CF_VERSIONS)?;

        let now = now_millis();
        let (known, created_at) = match self.load_header(&record.id) {
            Ok(existing) => (existing.version_count, existing.created_at),
            Err(StoreError::DocumentNotFound(_)) => (0, now),
            Err(e) => return Err(e),
        };

        let mut batch = WriteBatch::default();
        let mut version_count = known;
        for version in record.versions.iter().skip(known as usize) {
            batch.put_cf(
                cf_versions,
                version_key(&record.id, version_count),
                encode_compressed(version)?,
            );
            version_count += 1;
        }

        let header = StoredDocument {
            id: record.id.clone(),
            title: record.title,
            content: record.content,
            owner_id: record.owner_id,
            access_roles: record.access_roles,
            version_count,
            created_at,
            updated_at: now,
        };
        batch.put_cf(cf_docs, record.id.as_bytes(), encode_compressed(&header)?);
        self.write(batch)?;

        let versions = self.load_versions(&record.id)?;
        Ok(header.into_record(versions))
    }

    fn set_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        self.update_header(id, |header| header.title = title.to_string())
    }

    fn set_role(&self, id: &str, user_id: &str, role: AccessRole) -> Result<(), StoreError> {
        self.update_header(id, |header| {
            header.access_roles.insert(user_id.to_string(), role);
        })
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_versions = self.cf(CF_VERSIONS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, id.as_bytes());

        let prefix = version_prefix(id);
        let iter = self
            .db
            .iterator_cf(cf_versions, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf_versions, &key);
        }

        self.write(batch)
    }

    fn append_version(&self, id: &str, version: DocumentVersion) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock();
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_versions = self.cf(CF_VERSIONS)?;

        let mut header = self.load_header(id)?;
        let seq = header.version_count;
        header.content = version.content_snapshot.clone();
        header.version_count += 1;
        header.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_versions, version_key(id, seq), encode_compressed(&version)?);
        batch.put_cf(cf_docs, id.as_bytes(), encode_compressed(&header)?);
        self.write(batch)?;

        Ok(seq)
    }

    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut owned = Vec::new();
        for id in self.list_ids()? {
            let header = self.load_header(&id)?;
            if header.owner_id == owner_id {
                let versions = self.load_versions(&id)?;
                owned.push(header.into_record(versions));
            }
        }
        Ok(owned)
    }

    fn find_by_ids(&self, ids: &BTreeSet<DocumentId>) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_by_id(id) {
                Ok(doc) => found.push(doc),
                Err(StoreError::DocumentNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    fn list_ids(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }
}

impl UserDirectory for RocksDocumentStore {
    fn find_by_username(&self, username: &str) -> Result<UserRecord, StoreError> {
        let cf = self.cf(CF_USERNAMES)?;
        let id = match self.db.get_cf(cf, username.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?,
            None => return Err(StoreError::UserNotFound(username.to_string())),
        };
        self.find_by_id(&id)
    }

    fn find_by_id(&self, id: &str) -> Result<UserRecord, StoreError> {
        let cf = self.cf(CF_USERS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::UserNotFound(id.to_string())),
        }
    }

    fn save_user(&self, user: UserRecord) -> Result<UserRecord, StoreError> {
        let _guard = self.write_lock.lock();
        let cf_users = self.cf(CF_USERS)?;
        let cf_names = self.cf(CF_USERNAMES)?;

        let mut batch = WriteBatch::default();
        match self.find_by_id(&user.id) {
            Ok(previous) if previous.username != user.username => {
                batch.delete_cf(cf_names, previous.username.as_bytes());
            }
            Ok(_) | Err(StoreError::UserNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        batch.put_cf(cf_users, user.id.as_bytes(), encode(&user)?);
        batch.put_cf(cf_names, user.username.as_bytes(), user.id.as_bytes());
        self.write(batch)?;

        Ok(user)
    }
}

/// Key prefix shared by every version of a document.
///
/// The length prefix keeps one document's keys from matching another
/// document whose id merely starts with the same bytes.
fn version_prefix(id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + id.len());
    prefix.extend_from_slice(&(id.len() as u32).to_be_bytes());
    prefix.extend_from_slice(id.as_bytes());
    prefix
}

/// Version key: prefix + sequence (8 bytes big-endian) for insertion order.
fn version_key(id: &str, seq: u64) -> Vec<u8> {
    let mut key = version_prefix(id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(value)?))
}

fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    decode(&raw)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
