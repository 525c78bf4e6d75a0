//! Ephemeral presence ("who is in this room, and where is their cursor").
//!
//! Presence piggybacks on the sync connection but is logically independent
//! of document content: a presence-only client that never edits still
//! appears to others. Nothing here is persisted and nothing is replayed —
//! a late joiner sees only the current state of currently-connected peers,
//! and a peer's record vanishes when its connection goes away.
//!
//! Records are keyed by the per-connection ephemeral client id, not the
//! stable user id, because one user may reconnect with a fresh connection.
//! The "others" view always excludes the local client's own record.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::identity::{ParticipantColor, UserIdentity};

/// Minimum interval between cursor broadcasts (~30 Hz).
///
/// Join/leave and non-cursor changes are never throttled.
const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

/// A cursor/selection range in the shared text field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSelection {
    pub anchor: u32,
    pub head: u32,
}

impl CursorSelection {
    pub fn caret(position: u32) -> Self {
        Self { anchor: position, head: position }
    }
}

/// One connected client's presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub color: ParticipantColor,
    pub cursor: Option<CursorSelection>,
    /// Per-client monotonic counter; most recent wins, stale is dropped.
    pub updated_at: u64,
}

/// Presence payload carried in `Awareness` protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceUpdate {
    /// A client set or refreshed its presence.
    Announce { client_id: Uuid, state: PresenceState },
    /// A client explicitly left (clean disconnect).
    Clear { client_id: Uuid },
}

impl PresenceUpdate {
    pub fn client_id(&self) -> Uuid {
        match self {
            Self::Announce { client_id, .. } => *client_id,
            Self::Clear { client_id } => *client_id,
        }
    }
}

/// Presence bookkeeping for one room, from the local client's viewpoint.
pub struct AwarenessChannel {
    local_client: Uuid,
    local_state: Option<PresenceState>,
    /// Remote records, keyed by ephemeral client id.
    peers: HashMap<Uuid, PresenceState>,
    /// Monotonic counter stamped onto outgoing local updates.
    seq: u64,
    last_cursor_broadcast: Instant,
    cursor_interval: Duration,
    others_tx: watch::Sender<Vec<PresenceState>>,
}

impl AwarenessChannel {
    pub fn new(local_client: Uuid) -> Self {
        let (others_tx, _) = watch::channel(Vec::new());
        Self {
            local_client,
            local_state: None,
            peers: HashMap::new(),
            seq: 0,
            // Allow an immediate first cursor broadcast.
            last_cursor_broadcast: Instant::now() - Duration::from_secs(1),
            cursor_interval: CURSOR_BROADCAST_INTERVAL,
            others_tx,
        }
    }

    /// Custom throttle interval, for tests.
    pub fn with_cursor_interval(local_client: Uuid, interval: Duration) -> Self {
        let mut channel = Self::new(local_client);
        channel.cursor_interval = interval;
        channel
    }

    pub fn local_client_id(&self) -> Uuid {
        self.local_client
    }

    /// Set the local presence from the user identity.
    ///
    /// Returns the announcement to broadcast. The color comes from the
    /// stable user id, so it never changes mid-session.
    pub fn announce(&mut self, identity: &UserIdentity) -> PresenceUpdate {
        self.seq += 1;
        let cursor = self.local_state.as_ref().and_then(|s| s.cursor);
        let state = PresenceState {
            user_id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            avatar_ref: identity.avatar_ref.clone(),
            color: ParticipantColor::from_user_id(&identity.id),
            cursor,
            updated_at: self.seq,
        };
        self.local_state = Some(state.clone());
        PresenceUpdate::Announce { client_id: self.local_client, state }
    }

    /// Re-announcement of the current local presence, if any.
    ///
    /// Sent when a new peer joins, so late joiners see current peers
    /// without any server-side replay.
    pub fn local_announcement(&self) -> Option<PresenceUpdate> {
        self.local_state.as_ref().map(|state| PresenceUpdate::Announce {
            client_id: self.local_client,
            state: state.clone(),
        })
    }

    /// Move the local cursor. Returns a broadcast message unless throttled.
    ///
    /// The local record is updated either way; only the broadcast is
    /// rate-limited. Returns `None` before the first [`announce`](Self::announce).
    pub fn update_cursor(&mut self, cursor: Option<CursorSelection>) -> Option<PresenceUpdate> {
        let state = self.local_state.as_mut()?;
        state.cursor = cursor;

        if self.last_cursor_broadcast.elapsed() < self.cursor_interval {
            return None;
        }
        self.last_cursor_broadcast = Instant::now();
        self.seq += 1;
        state.updated_at = self.seq;
        Some(PresenceUpdate::Announce {
            client_id: self.local_client,
            state: state.clone(),
        })
    }

    /// The Clear message for a clean local leave.
    pub fn clear_message(&self) -> PresenceUpdate {
        PresenceUpdate::Clear { client_id: self.local_client }
    }

    /// Apply an incoming presence update from the network.
    ///
    /// Our own echoes are ignored; per-client stale updates (lower
    /// `updated_at`) are silently superseded by what we already hold.
    pub fn handle_update(&mut self, update: &PresenceUpdate) {
        if update.client_id() == self.local_client {
            return;
        }
        match update {
            PresenceUpdate::Announce { client_id, state } => {
                if let Some(existing) = self.peers.get(client_id) {
                    if existing.updated_at > state.updated_at {
                        return;
                    }
                }
                self.peers.insert(*client_id, state.clone());
            }
            PresenceUpdate::Clear { client_id } => {
                self.peers.remove(client_id);
            }
        }
        self.notify();
    }

    /// Drop a peer whose connection went away without a Clear.
    pub fn peer_left(&mut self, client_id: Uuid) {
        if self.peers.remove(&client_id).is_some() {
            self.notify();
        }
    }

    /// All known presences minus our own.
    pub fn others(&self) -> Vec<PresenceState> {
        let mut list: Vec<PresenceState> = self.peers.values().cloned().collect();
        list.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        list
    }

    /// Observe changes to the others-view.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceState>> {
        self.others_tx.subscribe()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop every remote record (connection lost), keeping the local
    /// presence so it can be re-announced after a reconnect.
    pub fn clear_peers(&mut self) {
        self.peers.clear();
        self.notify();
    }

    /// Wipe all presence state (disconnect/teardown). Safe to call twice.
    pub fn clear(&mut self) {
        self.peers.clear();
        self.local_state = None;
        self.notify();
    }

    fn notify(&self) {
        self.others_tx.send_replace(self.others());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn identity(name: &str) -> UserIdentity {
        UserIdentity::new(format!("user-{name}"), name)
    }

    fn remote_state(name: &str, updated_at: u64) -> PresenceState {
        PresenceState {
            user_id: format!("user-{name}"),
            display_name: name.into(),
            avatar_ref: None,
            color: ParticipantColor::from_user_id(name),
            cursor: None,
            updated_at,
        }
    }

    #[test]
    fn test_announce_sets_local_state() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        let update = channel.announce(&identity("alice"));
        match update {
            PresenceUpdate::Announce { client_id, state } => {
                assert_eq!(client_id, channel.local_client_id());
                assert_eq!(state.display_name, "alice");
            }
            _ => panic!("Expected Announce"),
        }
        assert!(channel.local_announcement().is_some());
    }

    #[test]
    fn test_own_record_excluded_from_others() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        channel.announce(&identity("me"));

        // Echo of our own announcement must not appear in others().
        let echo = channel.local_announcement().unwrap();
        channel.handle_update(&echo);
        assert!(channel.others().is_empty());
        assert_eq!(channel.peer_count(), 0);
    }

    #[test]
    fn test_remote_announce_and_clear() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        let peer = Uuid::new_v4();

        channel.handle_update(&PresenceUpdate::Announce {
            client_id: peer,
            state: remote_state("bob", 1),
        });
        assert_eq!(channel.others().len(), 1);
        assert_eq!(channel.others()[0].display_name, "bob");

        channel.handle_update(&PresenceUpdate::Clear { client_id: peer });
        assert!(channel.others().is_empty());
    }

    #[test]
    fn test_stale_update_superseded() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        let peer = Uuid::new_v4();

        let mut newer = remote_state("bob", 5);
        newer.cursor = Some(CursorSelection::caret(7));
        channel.handle_update(&PresenceUpdate::Announce { client_id: peer, state: newer });

        let older = remote_state("bob", 3);
        channel.handle_update(&PresenceUpdate::Announce { client_id: peer, state: older });

        assert_eq!(channel.others()[0].cursor, Some(CursorSelection::caret(7)));
    }

    #[test]
    fn test_cursor_updates_throttled() {
        let mut channel =
            AwarenessChannel::with_cursor_interval(Uuid::new_v4(), Duration::from_millis(33));
        channel.announce(&identity("me"));

        assert!(channel.update_cursor(Some(CursorSelection::caret(1))).is_some());
        // Immediate follow-up is throttled but still recorded locally.
        assert!(channel.update_cursor(Some(CursorSelection::caret(2))).is_none());
        let reannounce = channel.local_announcement().unwrap();
        match reannounce {
            PresenceUpdate::Announce { state, .. } => {
                assert_eq!(state.cursor, Some(CursorSelection::caret(2)));
            }
            _ => panic!("Expected Announce"),
        }
    }

    #[test]
    fn test_cursor_update_after_interval() {
        let mut channel =
            AwarenessChannel::with_cursor_interval(Uuid::new_v4(), Duration::from_millis(5));
        channel.announce(&identity("me"));
        let _ = channel.update_cursor(Some(CursorSelection::caret(1)));
        thread::sleep(Duration::from_millis(10));
        assert!(channel.update_cursor(Some(CursorSelection::caret(2))).is_some());
    }

    #[test]
    fn test_cursor_before_announce_is_noop() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        assert!(channel.update_cursor(Some(CursorSelection::caret(3))).is_none());
    }

    #[test]
    fn test_peer_left_removes_record() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        channel.handle_update(&PresenceUpdate::Announce {
            client_id: peer,
            state: remote_state("bob", 1),
        });
        channel.peer_left(peer);
        assert!(channel.others().is_empty());
        // Unknown peer: no-op.
        channel.peer_left(Uuid::new_v4());
    }

    #[test]
    fn test_clear_wipes_everything() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        channel.announce(&identity("me"));
        channel.handle_update(&PresenceUpdate::Announce {
            client_id: Uuid::new_v4(),
            state: remote_state("bob", 1),
        });

        channel.clear();
        channel.clear(); // idempotent
        assert!(channel.others().is_empty());
        assert!(channel.local_announcement().is_none());
    }

    #[test]
    fn test_subscribe_observes_changes() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        let rx = channel.subscribe();
        assert!(rx.borrow().is_empty());

        channel.handle_update(&PresenceUpdate::Announce {
            client_id: Uuid::new_v4(),
            state: remote_state("bob", 1),
        });
        assert_eq!(rx.borrow().len(), 1);
    }

    #[test]
    fn test_same_user_two_connections() {
        // One user on two devices: two ephemeral client ids, two records.
        let mut channel = AwarenessChannel::new(Uuid::new_v4());
        channel.handle_update(&PresenceUpdate::Announce {
            client_id: Uuid::new_v4(),
            state: remote_state("bob", 1),
        });
        channel.handle_update(&PresenceUpdate::Announce {
            client_id: Uuid::new_v4(),
            state: remote_state("bob", 1),
        });
        assert_eq!(channel.others().len(), 2);
    }
}
