//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — one row per document: the latest whole-state snapshot,
//!   LZ4 compressed, with version/author/type alongside
//! - `metadata`  — per-document bookkeeping (version, sizes, timestamps)
//!
//! The row is last-writer-wins by design: any client with write access may
//! save, and a snapshot only needs to reconstruct *a* valid prior state —
//! the CRDT merge resolves conflicts, not the store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use crate::codec::{SnapshotPayload, SnapshotRecord, SnapshotType};
use crate::persistence::SnapshotStore;
use crate::storage::StoreError;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vellum_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksStoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored alongside the snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub document_id: String,
    /// Version of the current snapshot row.
    pub version: u64,
    /// Number of snapshots ever written for this document.
    pub snapshot_count: u64,
    /// Uncompressed state size in bytes.
    pub state_size: u64,
    /// Compressed state size in bytes.
    pub compressed_size: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(document_id: &str) -> Self {
        let now = unix_now();
        Self {
            document_id: document_id.to_string(),
            version: 0,
            snapshot_count: 0,
            state_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// The stored snapshot row (state LZ4-compressed).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    version: u64,
    created_by: String,
    snapshot_type: SnapshotType,
    created_at: u64,
    state_size: u64,
    compressed: Vec<u8>,
}

/// RocksDB-backed snapshot store.
pub struct RocksSnapshotStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksStoreConfig,
    /// Last assigned snapshot version, recovered on open.
    version: AtomicU64,
}

impl RocksSnapshotStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: RocksStoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let version = Self::recover_version(&db);

        Ok(Self {
            db,
            config,
            version: AtomicU64::new(version),
        })
    }

    fn cf_options(config: &RocksStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4-compressed; skip double compression.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Recover the highest assigned version from the metadata rows.
    fn recover_version(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_METADATA) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut max = 0u64;
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            if let Ok((_, value)) = item {
                if let Ok(meta) = SnapshotMetadata::decode(&value) {
                    max = max.max(meta.version);
                }
            }
        }
        max
    }

    /// Write a whole-state snapshot row; returns the assigned version.
    pub fn put_snapshot(
        &self,
        document_id: &str,
        payload: &SnapshotPayload,
        snapshot_type: SnapshotType,
        created_by: &str,
    ) -> Result<u64, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let state = payload
            .decode()
            .map_err(|e| StoreError::CodecError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&state);
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let now = unix_now();

        let row = StoredSnapshot {
            version,
            created_by: created_by.to_string(),
            snapshot_type,
            created_at: now,
            state_size: state.len() as u64,
            compressed,
        };
        let row_bytes = bincode::serde::encode_to_vec(&row, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut meta = self
            .load_metadata(document_id)
            .unwrap_or_else(|_| SnapshotMetadata::new(document_id));
        meta.version = version;
        meta.snapshot_count += 1;
        meta.state_size = row.state_size;
        meta.compressed_size = row.compressed.len() as u64;
        meta.updated_at = now;

        // Atomic batch write: snapshot row + metadata.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, document_id.as_bytes(), &row_bytes);
        batch.put_cf(&cf_meta, document_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(version)
    }

    /// Load the latest snapshot row for a document, if any.
    pub fn latest_snapshot(
        &self,
        document_id: &str,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;

        let Some(bytes) = self.db.get_cf(&cf, document_id.as_bytes())? else {
            return Ok(None);
        };
        let (row, _): (StoredSnapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        let state = lz4_flex::decompress_size_prepended(&row.compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;

        Ok(Some(SnapshotRecord {
            document_id: document_id.to_string(),
            state: SnapshotPayload::from_state(&state),
            version: row.version,
            created_by: row.created_by,
            snapshot_type: row.snapshot_type,
            created_at: row.created_at,
        }))
    }

    pub fn load_metadata(&self, document_id: &str) -> Result<SnapshotMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id.to_string())),
        }
    }

    pub fn document_exists(&self, document_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, document_id.as_bytes())?.is_some())
    }

    /// List all document ids with stored snapshots.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    /// Delete a document's snapshot and metadata.
    pub fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snap, document_id.as_bytes());
        batch.delete_cf(&cf_meta, document_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Force a flush to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Last assigned snapshot version.
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

#[async_trait::async_trait]
impl SnapshotStore for RocksSnapshotStore {
    async fn insert_snapshot(
        &self,
        document_id: &str,
        state: &SnapshotPayload,
        snapshot_type: SnapshotType,
        created_by: &str,
    ) -> Result<u64, StoreError> {
        self.put_snapshot(document_id, state, snapshot_type, created_by)
    }

    async fn get_latest_snapshot(
        &self,
        document_id: &str,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        self.latest_snapshot(document_id)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
