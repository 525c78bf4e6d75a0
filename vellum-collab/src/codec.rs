//! Snapshot codec: the durable byte representation of document state.
//!
//! A snapshot is a whole-state, self-describing encoding of the CRDT
//! document at a point in time. The read side never replays an update log —
//! it only ever loads "latest full state" — so every snapshot must be
//! applicable to a fresh document and complete on its own.
//!
//! Depending on the transport, snapshot state historically arrived either as
//! raw binary or as a base64 string. [`SnapshotPayload`] is the single
//! explicit envelope for both shapes, and [`SnapshotPayload::decode`] is the
//! one canonical decode function used everywhere a snapshot is read.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// How a snapshot came to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotType {
    /// Written by the debounced auto-save loop.
    Auto,
    /// Written by an explicit user-triggered save.
    Manual,
}

impl SnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

/// Binary-or-base64 envelope for opaque CRDT state bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotPayload {
    Binary(Vec<u8>),
    Base64(String),
}

impl SnapshotPayload {
    /// Wrap raw CRDT state bytes in the canonical transport form (base64).
    pub fn from_state(state: &[u8]) -> Self {
        Self::Base64(BASE64.encode(state))
    }

    /// Decode to raw CRDT state bytes.
    ///
    /// This is the only decode path for snapshot payloads; corrupt base64 is
    /// reported as a [`CodecError`] for the caller to log and skip.
    pub fn decode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Binary(bytes) => Ok(bytes.clone()),
            Self::Base64(text) => BASE64
                .decode(text.trim())
                .map_err(|e| CodecError::InvalidBase64(e.to_string())),
        }
    }

    /// The base64 transport form, encoding binary payloads on demand.
    pub fn to_base64(&self) -> String {
        match self {
            Self::Binary(bytes) => BASE64.encode(bytes),
            Self::Base64(text) => text.clone(),
        }
    }

    /// Decoded state size in bytes, if the payload is well-formed.
    pub fn state_len(&self) -> Result<usize, CodecError> {
        Ok(self.decode()?.len())
    }
}

/// A durable snapshot row as stored and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub document_id: String,
    pub state: SnapshotPayload,
    /// Monotonic version assigned by the store; loads pick the highest.
    pub version: u64,
    pub created_by: String,
    pub snapshot_type: SnapshotType,
    /// Seconds since epoch.
    pub created_at: u64,
}

/// Codec errors.
#[derive(Debug, Clone)]
pub enum CodecError {
    InvalidBase64(String),
    /// The decoded bytes are not a well-formed CRDT state blob.
    ForeignFormat(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBase64(e) => write!(f, "Invalid base64 payload: {e}"),
            Self::ForeignFormat(e) => write!(f, "Foreign snapshot format: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}
