//! Room key derivation.
//!
//! A room is the logical channel that scopes which clients synchronize
//! together. The room identifier is a pure, deterministic function of the
//! caller-supplied document id: two clients opening "the same document id"
//! always land in the same room, regardless of client implementation.
//!
//! Derivation: `"doc-" + sanitize(document_id)`, where sanitize maps every
//! character outside `[A-Za-z0-9_-]` to `-`. The namespace prefix keeps
//! document rooms from colliding with unrelated channel namespaces, and the
//! restricted character set keeps arbitrary ids from injecting URL- or
//! protocol-breaking characters.

use serde::{Deserialize, Serialize};

/// Namespace prefix for document rooms.
const ROOM_NAMESPACE: &str = "doc-";

/// A derived room identifier.
///
/// Constructed via [`RoomId::for_document`] on the client side; on the wire
/// it travels as-is and is trusted to already be in derived form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Derive the room id for a document id.
    pub fn for_document(document_id: &str) -> Self {
        Self(format!("{ROOM_NAMESPACE}{}", sanitize(document_id)))
    }

    /// Wrap an already-derived room id received from the wire.
    pub fn from_wire(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Restrict to `[A-Za-z0-9_-]`, mapping everything else to `-`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_deterministic() {
        let a = RoomId::for_document("press-release-42");
        let b = RoomId::for_document("press-release-42");
        assert_eq!(a, b);
    }

    #[test]
    fn test_room_id_namespaced() {
        let room = RoomId::for_document("alpha");
        assert_eq!(room.as_str(), "doc-alpha");
    }

    #[test]
    fn test_room_id_sanitizes_protocol_breaking_chars() {
        let room = RoomId::for_document("a/b?c=d&e#f g");
        assert_eq!(room.as_str(), "doc-a-b-c-d-e-f-g");
    }

    #[test]
    fn test_room_id_preserves_allowed_chars() {
        let room = RoomId::for_document("A-z_09");
        assert_eq!(room.as_str(), "doc-A-z_09");
    }

    #[test]
    fn test_room_id_unicode_flattened() {
        let room = RoomId::for_document("héllo wörld");
        assert_eq!(room.as_str(), "doc-h-llo-w-rld");
    }

    #[test]
    fn test_room_id_empty_document_id() {
        let room = RoomId::for_document("");
        assert_eq!(room.as_str(), "doc-");
    }

    #[test]
    fn test_room_id_display() {
        let room = RoomId::for_document("x");
        assert_eq!(format!("{room}"), "doc-x");
    }

    #[test]
    fn test_from_wire_round_trip() {
        let room = RoomId::for_document("demo-1");
        let wire = RoomId::from_wire(room.as_str());
        assert_eq!(room, wire);
    }
}
