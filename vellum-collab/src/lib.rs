//! # vellum-collab — collaborative document synchronization engine
//!
//! Lets multiple clients edit the same rich-text document concurrently and
//! converge without a central lock, and keeps that state durable across
//! disconnects and restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   room = f(document id)   ┌──────────────┐
//! │ SessionController│ ─────────────────────────► │ SyncProvider │
//! │ (lifecycle)      │                            │ (WebSocket)  │
//! └───────┬──────────┘                            └──────┬───────┘
//!         │ owns                                         │ CRDT merge
//!         ▼                                              ▼
//! ┌──────────────────┐    update notifications   ┌──────────────┐
//! │ CollabDocument   │ ─────────────────────────► │ RelayServer  │
//! │ (yrs CRDT)       │                            │ (room peer)  │
//! └───────┬──────────┘                            └──────────────┘
//!         │ debounced whole-state snapshots
//!         ▼
//! ┌──────────────────┐      base64 envelope      ┌──────────────────┐
//! │ PersistenceMgr   │ ─────────────────────────► │ SnapshotStore    │
//! │ (load + save)    │                            │ (Rocks / memory) │
//! └──────────────────┘                            └──────────────────┘
//! ```
//!
//! Awareness (presence, cursors) rides the same connection but is ephemeral:
//! never persisted, wiped on disconnect.
//!
//! ## Modules
//!
//! - [`room`] — deterministic room id derivation from document ids
//! - [`identity`] — user identity shape and stable display colors
//! - [`document`] — the in-memory CRDT document state
//! - [`codec`] — whole-state snapshot envelope (binary or base64)
//! - [`protocol`] — binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`provider`] — per-room WebSocket sync provider with reconnect
//! - [`awareness`] — ephemeral presence channel
//! - [`persistence`] — debounced snapshot manager + store trait
//! - [`storage`] — RocksDB-backed snapshot store
//! - [`session`] — lifecycle controller and session registry
//! - [`server`] — room-relay WebSocket server
//! - [`broadcast`] — room fan-out primitives

pub mod awareness;
pub mod broadcast;
pub mod codec;
pub mod document;
pub mod identity;
pub mod persistence;
pub mod protocol;
pub mod provider;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessChannel, CursorSelection, PresenceState, PresenceUpdate};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use codec::{CodecError, SnapshotPayload, SnapshotRecord, SnapshotType};
pub use document::{CollabDocument, DocUpdate, DocumentError, UpdateOrigin};
pub use identity::{ParticipantColor, ParticipantProfile, UserIdentity};
pub use persistence::{
    MemorySnapshotStore, PersistenceError, PersistenceManager, SnapshotStore, DEFAULT_DEBOUNCE,
};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use provider::{ConnectionStatus, ProviderConfig, SyncProvider};
pub use room::RoomId;
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{
    ActiveSession, InitOutcome, SessionController, SessionError, SessionPhase, SessionRegistry,
};
pub use storage::StoreError;
#[cfg(feature = "rocks")]
pub use storage::{RocksSnapshotStore, RocksStoreConfig, SnapshotMetadata};
