//! Durable snapshot storage.
//!
//! The engine core only depends on the [`SnapshotStore`](crate::persistence::SnapshotStore)
//! trait — an opaque keyed store with two operations, insert and
//! latest-by-version read. This module provides the RocksDB-backed
//! implementation:
//!
//! ```text
//! ┌──────────────────┐   whole-state rows   ┌────────────────────┐
//! │ PersistenceMgr   │ ───────────────────► │ RocksSnapshotStore │
//! │ (debounced save) │                      │ (RocksDB)          │
//! └──────────────────┘                      └─────────┬──────────┘
//!                                                     │ column families
//!                                                     ▼
//!                                     ┌───────────────────────────────┐
//!                                     │ CF "snapshots" — LZ4 rows     │
//!                                     │ CF "metadata"  — doc metadata │
//!                                     └───────────────────────────────┘
//! ```
//!
//! Snapshots are whole-state and last-writer-wins per document row; the CRDT
//! merge, not the snapshot row, is the true source of conflict resolution.

#[cfg(feature = "rocks")]
pub mod rocks;

#[cfg(feature = "rocks")]
pub use rocks::{RocksSnapshotStore, RocksStoreConfig, SnapshotMetadata};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (database, network, ...).
    DatabaseError(String),
    /// No snapshot stored for this document.
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// The snapshot payload could not be decoded before writing.
    CodecError(String),
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::CodecError(e) => write!(f, "Codec error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(feature = "rocks")]
impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
