//! Binary wire protocol for room synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ msg_type │ client_id │ room         │ payload  │
//! │ 1 byte   │ 16 bytes  │ len-prefixed │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! The payload is opaque per message type: yrs state vectors and updates
//! for the sync handshake, bincode-encoded presence for awareness, and a
//! participant profile for join notifications.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::PresenceUpdate;
use crate::identity::ParticipantProfile;
use crate::room::RoomId;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector — "tell me what I am missing".
    SyncStep1 = 1,
    /// State diff answering a SyncStep1.
    SyncStep2 = 2,
    /// Incremental CRDT update.
    Update = 3,
    /// Ephemeral presence payload.
    Awareness = 4,
    /// Client joined the room.
    PeerJoined = 5,
    /// Client left the room.
    PeerLeft = 6,
    /// Heartbeat ping.
    Ping = 7,
    /// Heartbeat pong.
    Pong = 8,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Ephemeral per-connection sender id.
    pub client_id: Uuid,
    pub room: RoomId,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// State vector request for the handshake.
    pub fn sync_step1(client_id: Uuid, room: RoomId, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            client_id,
            room,
            payload: state_vector,
        }
    }

    /// State diff answering a SyncStep1.
    pub fn sync_step2(client_id: Uuid, room: RoomId, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            client_id,
            room,
            payload: state_diff,
        }
    }

    /// Incremental CRDT update.
    pub fn update(client_id: Uuid, room: RoomId, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            client_id,
            room,
            payload: update,
        }
    }

    /// Ephemeral presence update.
    pub fn awareness(client_id: Uuid, room: RoomId, update: &PresenceUpdate) -> Self {
        let payload = bincode::serde::encode_to_vec(update, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Awareness,
            client_id,
            room,
            payload,
        }
    }

    /// Join notification carrying the sender's profile.
    pub fn peer_joined(client_id: Uuid, room: RoomId, profile: &ParticipantProfile) -> Self {
        let payload = bincode::serde::encode_to_vec(profile, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::PeerJoined,
            client_id,
            room,
            payload,
        }
    }

    /// Leave notification.
    pub fn peer_left(client_id: Uuid, room: RoomId) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            client_id,
            room,
            payload: Vec::new(),
        }
    }

    pub fn ping(client_id: Uuid, room: RoomId) -> Self {
        Self {
            msg_type: MessageType::Ping,
            client_id,
            room,
            payload: Vec::new(),
        }
    }

    pub fn pong(client_id: Uuid, room: RoomId) -> Self {
        Self {
            msg_type: MessageType::Pong,
            client_id,
            room,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an awareness payload.
    pub fn presence_update(&self) -> Result<PresenceUpdate, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (update, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }

    /// Parse a join payload.
    pub fn profile(&self) -> Result<ParticipantProfile, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (profile, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(profile)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
