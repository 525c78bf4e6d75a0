//! Room-relay WebSocket server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (RoomId) ── yrs Doc ── BroadcastGroup
//! Client B ──┘        │                             │
//!                handshake diffs              fan-out to N-1
//! ```
//!
//! Each room keeps an in-memory yrs document whose only job is answering
//! sync handshakes: a joining client sends its state vector and receives
//! the diff it is missing, while the server learns the client's offline
//! edits the same way. Updates and awareness messages are fanned out to the
//! other clients in the room.
//!
//! The server persists nothing. Durable snapshots are written by clients
//! through the snapshot store; an empty room's document is simply dropped
//! and rebuilt from whichever client connects next, which the CRDT merge
//! makes safe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::broadcast::BroadcastGroup;
use crate::identity::ParticipantProfile;
use crate::protocol::{MessageType, SyncMessage};
use crate::room::RoomId;

/// Environment variable resolving the bind address.
pub const BIND_ADDR_ENV: &str = "VELLUM_BIND_ADDR";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Resolve the bind address from `VELLUM_BIND_ADDR`, falling back to
    /// the localhost default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(BIND_ADDR_ENV) {
            if !addr.trim().is_empty() {
                config.bind_addr = addr.trim().to_string();
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// One room: handshake document + fan-out group.
struct DocumentRoom {
    doc: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    /// Merge a client's update into the room document.
    fn apply_update(&self, payload: &[u8], room: &RoomId) {
        match Update::decode_v1(payload) {
            Ok(update) => {
                let mut txn = self.doc.transact_mut();
                if let Err(e) = txn.apply_update(update) {
                    log::warn!("Room {room}: update rejected: {e}");
                }
            }
            Err(e) => log::warn!("Room {room}: malformed update: {e}"),
        }
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_diff(&self, state_vector: &[u8]) -> Option<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector).ok()?;
        let txn = self.doc.transact();
        Some(txn.encode_diff_v1(&sv))
    }
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<RoomId, DocumentRoom>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and run the accept loop.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);
        self.run_on(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn run_on(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<RoomId, DocumentRoom>>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Connection state, filled in by the first PeerJoined.
        let mut client_id: Option<Uuid> = None;
        let mut joined_room: Option<RoomId> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let msg = match SyncMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match msg.msg_type {
                                MessageType::PeerJoined => {
                                    let profile = msg.profile().unwrap_or_else(|_| {
                                        ParticipantProfile::new(
                                            msg.client_id,
                                            &crate::identity::UserIdentity::new("unknown", "Anonymous"),
                                        )
                                    });

                                    let mut rooms_w = rooms.write().await;
                                    let room_entry = rooms_w
                                        .entry(msg.room.clone())
                                        .or_insert_with(|| DocumentRoom::new(config.broadcast_capacity));

                                    if room_entry.broadcast.peer_count().await >= config.max_peers_per_room {
                                        log::warn!(
                                            "Room {} full ({} peers); rejecting {addr}",
                                            msg.room,
                                            config.max_peers_per_room
                                        );
                                        break;
                                    }

                                    client_id = Some(msg.client_id);
                                    joined_room = Some(msg.room.clone());
                                    broadcast_rx = Some(room_entry.broadcast.add_peer(profile.clone()).await);

                                    // Ask the joiner for what the room is missing,
                                    // and announce the join to everyone else.
                                    let server_sv = room_entry.state_vector();
                                    let join_broadcast = SyncMessage::peer_joined(
                                        msg.client_id,
                                        msg.room.clone(),
                                        &profile,
                                    );
                                    let broadcast = room_entry.broadcast.clone();
                                    let room_count = rooms_w.len();
                                    drop(rooms_w);

                                    let step1 = SyncMessage::sync_step1(Uuid::nil(), msg.room.clone(), server_sv);
                                    ws_sender.send(Message::Binary(step1.encode()?.into())).await?;
                                    let _ = broadcast.broadcast(&join_broadcast);

                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = room_count;
                                    }

                                    log::info!(
                                        "Client {} ({}) joined room {}",
                                        profile.display_name,
                                        msg.client_id,
                                        msg.room
                                    );
                                }

                                MessageType::SyncStep1 => {
                                    // Joiner wants the diff against its state vector.
                                    if let Some(ref room) = joined_room {
                                        let diff = {
                                            let rooms_r = rooms.read().await;
                                            rooms_r.get(room).and_then(|r| r.encode_diff(&msg.payload))
                                        };
                                        match diff {
                                            Some(diff) => {
                                                let step2 = SyncMessage::sync_step2(Uuid::nil(), room.clone(), diff);
                                                ws_sender.send(Message::Binary(step2.encode()?.into())).await?;
                                            }
                                            None => log::warn!("Room {room}: bad state vector from {addr}"),
                                        }
                                    }
                                }

                                MessageType::SyncStep2 | MessageType::Update => {
                                    // Merge into the room doc, then relay to the others.
                                    if let Some(ref room) = joined_room {
                                        let broadcast = {
                                            let rooms_r = rooms.read().await;
                                            match rooms_r.get(room) {
                                                Some(r) => {
                                                    r.apply_update(&msg.payload, room);
                                                    Some(r.broadcast.clone())
                                                }
                                                None => None,
                                            }
                                        };
                                        if let Some(bc) = broadcast {
                                            let relay = SyncMessage::update(msg.client_id, room.clone(), msg.payload);
                                            let _ = bc.broadcast(&relay);
                                        }
                                    }
                                }

                                MessageType::Awareness => {
                                    // Ephemeral: relay only, never stored.
                                    if let Some(ref room) = joined_room {
                                        let broadcast = {
                                            let rooms_r = rooms.read().await;
                                            rooms_r.get(room).map(|r| r.broadcast.clone())
                                        };
                                        if let Some(bc) = broadcast {
                                            let _ = bc.broadcast(&msg);
                                        }
                                    }
                                }

                                MessageType::Ping => {
                                    if let Some(ref room) = joined_room {
                                        let pong = SyncMessage::pong(Uuid::nil(), room.clone());
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }
                                }

                                _ => {
                                    log::debug!("Unhandled message type from {addr}: {:?}", msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                fanned = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not joined yet — wait forever.
                        None => std::future::pending().await,
                    }
                } => {
                    match fanned {
                        Ok(data) => {
                            // Don't echo a client's own messages back.
                            if let Ok(fanned_msg) = SyncMessage::decode(&data) {
                                if Some(fanned_msg.client_id) == client_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Client {client_id:?} lagged by {n} messages");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: drop the peer, tell the room, drop the room if empty.
        if let (Some(cid), Some(room)) = (client_id, joined_room) {
            let mut rooms_w = rooms.write().await;
            if let Some(room_entry) = rooms_w.get_mut(&room) {
                room_entry.broadcast.remove_peer(&cid).await;

                // Clients wipe the departed peer's presence on this signal.
                let leave = SyncMessage::peer_left(cid, room.clone());
                let _ = room_entry.broadcast.broadcast(&leave);

                if room_entry.broadcast.peer_count().await == 0 {
                    rooms_w.remove(&room);
                    log::info!("Room {room} removed (empty)");
                }
            }

            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms_w.len();
        } else {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9400");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9400");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_document_room_handshake_diff() {
        let room = DocumentRoom::new(64);

        // Seed the room doc with content.
        {
            let mut txn = room.doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "room state");
        }

        // A fresh client's state vector yields the full diff.
        let fresh = yrs::Doc::new();
        let fresh_sv = {
            let txn = fresh.transact();
            txn.state_vector().encode_v1()
        };
        let diff = room.encode_diff(&fresh_sv).unwrap();

        let update = Update::decode_v1(&diff).unwrap();
        {
            let mut txn = fresh.transact_mut();
            txn.apply_update(update).unwrap();
        }
        let txn = fresh.transact();
        let text = txn.get_text("content").unwrap();
        assert_eq!(text.get_string(&txn), "room state");
    }

    #[tokio::test]
    async fn test_document_room_rejects_garbage() {
        let room_id = RoomId::for_document("demo-1");
        let room = DocumentRoom::new(64);

        // Neither call may panic.
        room.apply_update(&[0xFF, 0x00, 0x13], &room_id);
        assert!(room.encode_diff(&[0xFF, 0x00]).is_none());
    }
}
