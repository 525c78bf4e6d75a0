//! Room-scoped fan-out to N-1 peers with backpressure.
//!
//! Each room shares one tokio broadcast channel; every connected client gets
//! an independent receiver buffering up to `capacity` messages. Slow peers
//! lag and drop rather than stalling the room. Sender filtering (not echoing
//! a message back to its author) is the receiving loop's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::identity::ParticipantProfile;
use crate::protocol::{ProtocolError, SyncMessage};
use crate::room::RoomId;

/// Snapshot of broadcast health counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected clients, keyed by ephemeral client id.
    peers: Arc<RwLock<HashMap<Uuid, ParticipantProfile>>>,
    capacity: usize,
    /// Lock-free counter; the send path never takes a lock.
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a client and return its receiver.
    pub async fn add_peer(&self, profile: ParticipantProfile) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(profile.client_id, profile);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, client_id: &Uuid) -> Option<ParticipantProfile> {
        let mut peers = self.peers.write().await;
        peers.remove(client_id)
    }

    /// Encode and fan a message out to every subscriber.
    ///
    /// Returns the number of receivers the message reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Fan pre-encoded bytes out directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<ParticipantProfile> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, client_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Maps room ids to broadcast groups, isolating traffic per room.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, room: &RoomId) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return group.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Re-check after lock upgrade.
        if let Some(group) = rooms.get(room) {
            return group.clone();
        }
        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room.clone(), group.clone());
        group
    }

    pub async fn remove_if_empty(&self, room: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.peer_count().await == 0 {
                rooms.remove(room);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
