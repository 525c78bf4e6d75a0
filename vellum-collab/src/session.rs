//! Session lifecycle orchestration.
//!
//! The controller maps a logical document id to a room and owns every
//! per-session resource (document, provider, awareness, persistence) with an
//! explicit state machine instead of incidental flags:
//!
//! ```text
//! Idle ──► Initializing ──► Active ──► TearingDown ──► Idle
//! ```
//!
//! Rules the controller enforces:
//! - initialization defers until the local user identity is known; it is
//!   retried once the identity resolves, never started with a synthetic one
//! - re-initializing the same room is a no-op; initializing a different
//!   room first tears the old session down completely (overlapping sessions
//!   would leave stale listeners firing into a destroyed document)
//! - teardown is deterministic and idempotent: watchdog first, then
//!   listeners, then transport, then the document, then observable state
//!
//! Sessions live in an explicit [`SessionRegistry`] keyed by room id, so
//! multi-document concurrent editing and test isolation need no globals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use uuid::Uuid;

use crate::awareness::{AwarenessChannel, CursorSelection, PresenceState};
use crate::document::CollabDocument;
use crate::identity::{ParticipantProfile, UserIdentity};
use crate::persistence::{PersistenceError, PersistenceManager, SnapshotStore, DEFAULT_DEBOUNCE};
use crate::provider::{ConnectionStatus, ProviderConfig, SyncProvider};
use crate::room::RoomId;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Initializing,
    Active,
    TearingDown,
}

/// What `initialize` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// A new session was built and is connecting.
    Started,
    /// The same room was already active; nothing changed.
    AlreadyActive,
    /// Identity is unresolved; initialization retries on `identity_resolved`.
    Deferred,
}

/// Session errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    DocumentInit(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentInit(e) => write!(f, "Document initialization failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One live editing session and everything it owns.
pub struct ActiveSession {
    room: RoomId,
    document_id: String,
    document: Arc<CollabDocument>,
    provider: SyncProvider,
    persistence: PersistenceManager,
    awareness: Arc<StdMutex<AwarenessChannel>>,
    phase: SessionPhase,
}

impl ActiveSession {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn document(&self) -> &Arc<CollabDocument> {
        &self.document
    }

    pub fn provider(&self) -> &SyncProvider {
        &self.provider
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Everyone else currently present in the room.
    pub fn others(&self) -> Vec<PresenceState> {
        lock(&self.awareness).others()
    }

    /// Move the local cursor, broadcasting unless throttled.
    pub fn set_cursor(&self, cursor: Option<CursorSelection>) {
        let update = lock(&self.awareness).update_cursor(cursor);
        if let Some(update) = update {
            self.provider.send_presence(&update);
        }
    }

    /// Write a manual whole-state snapshot now.
    pub async fn save_now(&self) -> Result<u64, PersistenceError> {
        self.persistence.manual_save().await
    }
}

/// Explicit room-keyed registry of live sessions.
///
/// Owned by the controller and passed by reference to whatever needs to
/// inspect sessions — deliberately not a module-level singleton.
pub struct SessionRegistry {
    sessions: HashMap<RoomId, ActiveSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: HashMap::new() }
    }

    pub fn get(&self, room: &RoomId) -> Option<&ActiveSession> {
        self.sessions.get(room)
    }

    pub fn contains(&self, room: &RoomId) -> bool {
        self.sessions.contains_key(room)
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn insert(&mut self, session: ActiveSession) {
        self.sessions.insert(session.room.clone(), session);
    }

    fn drain(&mut self) -> Vec<ActiveSession> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The session lifecycle controller.
pub struct SessionController {
    provider_config: ProviderConfig,
    store: Arc<dyn SnapshotStore>,
    save_debounce: std::time::Duration,
    registry: SessionRegistry,
    identity: Option<UserIdentity>,
    /// Document waiting for identity resolution.
    pending_document: Option<String>,
}

impl SessionController {
    pub fn new(provider_config: ProviderConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            provider_config,
            store,
            save_debounce: DEFAULT_DEBOUNCE,
            registry: SessionRegistry::new(),
            identity: None,
            pending_document: None,
        }
    }

    /// Override the auto-save quiet period.
    pub fn with_save_debounce(mut self, debounce: std::time::Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        self.identity.as_ref()
    }

    /// The active session, if any (single-session usage).
    pub fn active(&self) -> Option<&ActiveSession> {
        self.registry.sessions.values().next()
    }

    /// Session for a specific room (multi-session usage).
    pub fn session(&self, room: &RoomId) -> Option<&ActiveSession> {
        self.registry.get(room)
    }

    /// Connection status of the active session, `Disconnected` when idle.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.active()
            .map(|s| s.provider.status())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Presence of everyone else, empty when idle.
    pub fn others(&self) -> Vec<PresenceState> {
        self.active().map(|s| s.others()).unwrap_or_default()
    }

    /// Supply (or replace) the local identity, retrying a deferred init.
    pub async fn identity_resolved(
        &mut self,
        identity: UserIdentity,
    ) -> Result<Option<InitOutcome>, SessionError> {
        self.identity = Some(identity);
        match self.pending_document.take() {
            Some(document_id) => Ok(Some(self.initialize(&document_id).await?)),
            None => Ok(None),
        }
    }

    /// Start a collaborative session for `document_id`.
    ///
    /// Idempotent for the already-active room; any other live session is
    /// fully torn down first. Defers when identity is unresolved.
    pub async fn initialize(&mut self, document_id: &str) -> Result<InitOutcome, SessionError> {
        let Some(identity) = self.identity.clone() else {
            log::info!("Deferring session init for {document_id} until identity resolves");
            self.pending_document = Some(document_id.to_string());
            return Ok(InitOutcome::Deferred);
        };

        let room = RoomId::for_document(document_id);
        if let Some(existing) = self.registry.get(&room) {
            if existing.phase == SessionPhase::Active {
                log::debug!("Session for room {room} already active");
                return Ok(InitOutcome::AlreadyActive);
            }
        }

        // Never let two sessions overlap, even for different rooms.
        self.teardown().await;

        log::info!("Initializing session for document {document_id} (room {room})");
        let document = CollabDocument::create(document_id, &identity.id)
            .map_err(|e| SessionError::DocumentInit(e.to_string()))?;

        let client_id = Uuid::new_v4();
        let awareness = Arc::new(StdMutex::new(AwarenessChannel::new(client_id)));
        let profile = ParticipantProfile::new(client_id, &identity);

        // Load-before-save ordering: the durable snapshot lands in the
        // document before the auto-save listener exists.
        let persistence =
            PersistenceManager::with_debounce(self.store.clone(), document_id, self.save_debounce);
        persistence.load_latest(&document).await;
        persistence.attach(&document, &identity.id);

        // Local presence is set before connect so the handshake announces it.
        lock(&awareness).announce(&identity);

        let provider = SyncProvider::new(
            self.provider_config.clone(),
            room.clone(),
            document.clone(),
            awareness.clone(),
            profile,
        );
        provider.connect();

        self.registry.insert(ActiveSession {
            room,
            document_id: document_id.to_string(),
            document,
            provider,
            persistence,
            awareness,
            phase: SessionPhase::Active,
        });

        Ok(InitOutcome::Started)
    }

    /// Tear down every live session.
    ///
    /// Deterministic ordering per session: watchdog and connection tasks are
    /// cancelled (no listener can fire into freed state), the transport is
    /// released, the auto-save loop stops, the document is destroyed, and
    /// presence/status observables are cleared. Safe to call repeatedly and
    /// with nothing active.
    pub async fn teardown(&mut self) {
        for mut session in self.registry.drain() {
            session.phase = SessionPhase::TearingDown;
            // Cancels the watchdog and the relay tasks, flips status to
            // Disconnected synchronously, wipes presence.
            session.provider.disconnect();
            session.persistence.detach();
            session.document.destroy();
            session.phase = SessionPhase::Idle;
            log::info!("Session for room {} torn down", session.room);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemorySnapshotStore;

    fn controller() -> (SessionController, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        // Unroutable port: providers spin without a server, which these
        // lifecycle tests do not need.
        let config = ProviderConfig::with_base_url("ws://127.0.0.1:1");
        let controller = SessionController::new(config, store.clone() as Arc<dyn SnapshotStore>);
        (controller, store)
    }

    #[tokio::test]
    async fn test_initialize_defers_without_identity() {
        let (mut controller, _store) = controller();

        let outcome = controller.initialize("demo-1").await.unwrap();
        assert_eq!(outcome, InitOutcome::Deferred);
        assert!(controller.registry().is_empty());

        // Identity arrives: the deferred init runs.
        let outcome = controller
            .identity_resolved(UserIdentity::new("user-1", "Alice"))
            .await
            .unwrap();
        assert_eq!(outcome, Some(InitOutcome::Started));
        assert_eq!(controller.registry().len(), 1);

        controller.teardown().await;
    }

    #[tokio::test]
    async fn test_identity_resolved_without_pending_init() {
        let (mut controller, _store) = controller();
        let outcome = controller
            .identity_resolved(UserIdentity::new("user-1", "Alice"))
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_double_initialize_same_room_is_noop() {
        let (mut controller, _store) = controller();
        controller
            .identity_resolved(UserIdentity::new("user-1", "Alice"))
            .await
            .unwrap();

        assert_eq!(controller.initialize("demo-1").await.unwrap(), InitOutcome::Started);
        let first_room = controller.active().unwrap().room().clone();

        assert_eq!(
            controller.initialize("demo-1").await.unwrap(),
            InitOutcome::AlreadyActive
        );
        assert_eq!(controller.registry().len(), 1);
        assert_eq!(controller.active().unwrap().room(), &first_room);

        controller.teardown().await;
    }

    #[tokio::test]
    async fn test_initialize_other_document_replaces_session() {
        let (mut controller, _store) = controller();
        controller
            .identity_resolved(UserIdentity::new("user-1", "Alice"))
            .await
            .unwrap();

        controller.initialize("demo-1").await.unwrap();
        controller.initialize("demo-2").await.unwrap();

        // Never overlapping: exactly one session, the new room.
        assert_eq!(controller.registry().len(), 1);
        assert_eq!(
            controller.active().unwrap().room(),
            &RoomId::for_document("demo-2")
        );

        controller.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_idempotent() {
        let (mut controller, _store) = controller();
        controller
            .identity_resolved(UserIdentity::new("user-1", "Alice"))
            .await
            .unwrap();
        controller.initialize("demo-1").await.unwrap();

        controller.teardown().await;
        assert!(controller.registry().is_empty());
        assert_eq!(controller.connection_status(), ConnectionStatus::Disconnected);
        assert!(controller.others().is_empty());

        // Second teardown: no error, observable state unchanged.
        controller.teardown().await;
        assert!(controller.registry().is_empty());
        assert_eq!(controller.connection_status(), ConnectionStatus::Disconnected);
        assert!(controller.others().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_with_nothing_active() {
        let (mut controller, _store) = controller();
        controller.teardown().await;
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_session_loads_snapshot_before_going_live() {
        use crate::codec::{SnapshotPayload, SnapshotType};

        let (mut controller, store) = controller();
        let seed = CollabDocument::create("demo-1", "author").unwrap();
        seed.append("persisted earlier");
        store
            .insert_snapshot(
                "demo-1",
                &SnapshotPayload::from_state(&seed.encode_state()),
                SnapshotType::Manual,
                "author",
            )
            .await
            .unwrap();

        controller
            .identity_resolved(UserIdentity::new("user-1", "Alice"))
            .await
            .unwrap();
        controller.initialize("demo-1").await.unwrap();

        let session = controller.active().unwrap();
        assert_eq!(session.document().content(), "persisted earlier");
        assert!(session.persistence().is_loaded());

        controller.teardown().await;
    }

    #[tokio::test]
    async fn test_set_cursor_without_connection_is_silent() {
        let (mut controller, _store) = controller();
        controller
            .identity_resolved(UserIdentity::new("user-1", "Alice"))
            .await
            .unwrap();
        controller.initialize("demo-1").await.unwrap();

        let session = controller.active().unwrap();
        session.set_cursor(Some(CursorSelection::caret(4)));
        assert!(session.others().is_empty());

        controller.teardown().await;
    }
}
