//! WebSocket synchronization provider.
//!
//! One provider owns one connection per (room, client). It performs the
//! initial state exchange, relays incremental updates in both directions,
//! piggybacks awareness traffic, and exposes connection-status transitions:
//!
//! ```text
//! connect()                      dial + handshake
//!   │  (deferred one tick, so        │
//!   │   listeners register first)    ▼
//!   ▼                        ┌───────────────┐   drop while desired
//! Disconnected ─► Connecting │   Connected   │ ────────────────────┐
//!        ▲                   └───────┬───────┘                     │
//!        │      disconnect()         │                     backoff + redial
//!        └───────────────────────────┴─────────────────────────────┘
//! ```
//!
//! The handshake reconciles local and remote state through CRDT merge, not
//! overwrite: each side sends its state vector (`SyncStep1`) and answers the
//! other's with a diff (`SyncStep2`), so a client rejoining after being
//! offline recovers missed updates without clobbering concurrent edits.
//!
//! The 15 s connection watchdog is a pure observability signal: it flags
//! "not ready" if no `Connected` transition arrives in time, but never
//! cancels the in-flight attempt — the reconnect loop governs that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::{AwarenessChannel, PresenceUpdate};
use crate::document::{CollabDocument, DocUpdate, UpdateOrigin};
use crate::identity::ParticipantProfile;
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::room::RoomId;

/// Environment variable resolving the sync endpoint host.
pub const SYNC_URL_ENV: &str = "VELLUM_SYNC_URL";

/// Connection status as signalled by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// WebSocket base URL; the room id becomes the path segment.
    pub base_url: String,
    /// Watchdog window before the provider flags "not ready".
    pub connect_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:9400".to_string(),
            connect_timeout: Duration::from_secs(15),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl ProviderConfig {
    /// Resolve the endpoint from `VELLUM_SYNC_URL`, falling back to the
    /// localhost default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(SYNC_URL_ENV) {
            if !url.trim().is_empty() {
                config.base_url = url.trim().to_string();
            }
        }
        config
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Shared context for the connection tasks.
struct ConnectionCtx {
    config: ProviderConfig,
    room: RoomId,
    profile: ParticipantProfile,
    document: Arc<CollabDocument>,
    awareness: Arc<StdMutex<AwarenessChannel>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    ready_tx: Arc<watch::Sender<bool>>,
    desired: Arc<AtomicBool>,
    doc_updates: Arc<Mutex<mpsc::UnboundedReceiver<DocUpdate>>>,
    outgoing_rx: Arc<Mutex<mpsc::UnboundedReceiver<SyncMessage>>>,
}

/// The synchronization provider.
pub struct SyncProvider {
    config: ProviderConfig,
    room: RoomId,
    profile: ParticipantProfile,
    document: Arc<CollabDocument>,
    awareness: Arc<StdMutex<AwarenessChannel>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    ready_tx: Arc<watch::Sender<bool>>,
    ready_rx: watch::Receiver<bool>,
    desired: Arc<AtomicBool>,
    doc_updates: Arc<Mutex<mpsc::UnboundedReceiver<DocUpdate>>>,
    outgoing_tx: mpsc::UnboundedSender<SyncMessage>,
    outgoing_rx: Arc<Mutex<mpsc::UnboundedReceiver<SyncMessage>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncProvider {
    /// Build a provider. Performs no I/O: nothing is dialed until
    /// [`connect`](Self::connect), and even that defers one tick so local
    /// listeners are registered before any data can arrive.
    pub fn new(
        config: ProviderConfig,
        room: RoomId,
        document: Arc<CollabDocument>,
        awareness: Arc<StdMutex<AwarenessChannel>>,
        profile: ParticipantProfile,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let doc_updates = document.subscribe_updates();

        Self {
            config,
            room,
            profile,
            document,
            awareness,
            status_tx: Arc::new(status_tx),
            status_rx,
            ready_tx: Arc::new(ready_tx),
            ready_rx,
            desired: Arc::new(AtomicBool::new(false)),
            doc_updates: Arc::new(Mutex::new(doc_updates)),
            outgoing_tx,
            outgoing_rx: Arc::new(Mutex::new(outgoing_rx)),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn client_id(&self) -> Uuid {
        self.profile.client_id
    }

    pub fn profile(&self) -> &ParticipantProfile {
        &self.profile
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Observe status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Whether the connection is currently ready (watchdog signal).
    pub fn ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Observe the watchdog's readiness signal.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Start (and keep) connecting. Idempotent while a connection is desired.
    pub fn connect(&self) {
        if self.desired.swap(true, Ordering::SeqCst) {
            log::debug!("Provider for room {} already active", self.room);
            return;
        }
        self.status_tx.send_replace(ConnectionStatus::Connecting);

        let ctx = ConnectionCtx {
            config: self.config.clone(),
            room: self.room.clone(),
            profile: self.profile.clone(),
            document: self.document.clone(),
            awareness: self.awareness.clone(),
            status_tx: self.status_tx.clone(),
            ready_tx: self.ready_tx.clone(),
            desired: self.desired.clone(),
            doc_updates: self.doc_updates.clone(),
            outgoing_rx: self.outgoing_rx.clone(),
        };

        let watchdog = tokio::spawn(watchdog(
            self.config.connect_timeout,
            self.status_tx.subscribe(),
            self.ready_tx.clone(),
            self.room.clone(),
        ));
        let supervisor = tokio::spawn(supervisor(ctx));

        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(watchdog);
        tasks.push(supervisor);
    }

    /// Queue a presence update on the live connection.
    ///
    /// Presence is best-effort and ephemeral: while disconnected the update
    /// is silently dropped (the current state is re-announced on reconnect).
    pub fn send_presence(&self, update: &PresenceUpdate) {
        if self.status() != ConnectionStatus::Connected {
            return;
        }
        let msg = SyncMessage::awareness(self.profile.client_id, self.room.clone(), update);
        let _ = self.outgoing_tx.send(msg);
    }

    /// Caller-requested disconnect: no reconnection is attempted.
    ///
    /// Status flips to `Disconnected` synchronously, before the underlying
    /// socket teardown completes, so callers never observe a false "still
    /// connecting" window. The watchdog is cancelled and presence is wiped.
    pub fn disconnect(&self) {
        self.desired.store(false, Ordering::SeqCst);
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
        self.ready_tx.send_replace(false);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.awareness).clear();
    }

    /// Release the transport. Safe after (or instead of) `disconnect`.
    pub fn destroy(&self) {
        self.disconnect();
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl ConnectionCtx {
    /// WebSocket URL: environment-resolved host + room path segment, with
    /// identity fields as connection parameters for the remote peer's
    /// benefit (authorization happens before the upgrade, elsewhere).
    fn endpoint_url(&self) -> String {
        format!(
            "{}/{}?user={}&name={}",
            self.config.base_url.trim_end_matches('/'),
            self.room,
            query_escape(&self.profile.user_id),
            query_escape(&self.profile.display_name),
        )
    }
}

/// Connection supervisor: dial, relay, and re-dial with backoff while the
/// session is still desired.
async fn supervisor(ctx: ConnectionCtx) {
    // Deferred dial: give the caller one tick to register listeners.
    tokio::task::yield_now().await;

    let mut attempt: u32 = 0;
    while ctx.desired.load(Ordering::SeqCst) {
        ctx.status_tx.send_replace(ConnectionStatus::Connecting);
        let url = ctx.endpoint_url();

        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => {
                attempt = 0;
                ctx.status_tx.send_replace(ConnectionStatus::Connected);
                ctx.ready_tx.send_replace(true);
                log::info!("Connected to room {}", ctx.room);

                match relay(ws, &ctx).await {
                    Ok(()) => {
                        // Document destroyed or channels closed: we are done.
                        break;
                    }
                    Err(e) => log::warn!("Connection to room {} dropped: {e}", ctx.room),
                }

                ctx.ready_tx.send_replace(false);
                // Remote presence is connection-scoped.
                lock(&ctx.awareness).clear_peers();
            }
            Err(e) => log::warn!("Failed to connect to room {}: {e}", ctx.room),
        }

        if !ctx.desired.load(Ordering::SeqCst) {
            break;
        }
        ctx.status_tx.send_replace(ConnectionStatus::Disconnected);
        let delay = backoff_delay(attempt, &ctx.config);
        attempt = attempt.saturating_add(1);
        log::debug!("Reconnecting to room {} in {delay:?}", ctx.room);
        tokio::time::sleep(delay).await;
    }

    ctx.status_tx.send_replace(ConnectionStatus::Disconnected);
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Run one connection: handshake, then bidirectional relay until the socket
/// drops (`Err`) or the session ends (`Ok`).
async fn relay(
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ctx: &ConnectionCtx,
) -> Result<(), ProtocolError> {
    let (mut sink, mut stream) = ws.split();
    let client_id = ctx.profile.client_id;

    // Exactly one handshake per connect: announce, then exchange state
    // vectors so both sides converge through merge.
    send(&mut sink, SyncMessage::peer_joined(client_id, ctx.room.clone(), &ctx.profile)).await?;
    send(
        &mut sink,
        SyncMessage::sync_step1(client_id, ctx.room.clone(), ctx.document.state_vector()),
    )
    .await?;
    let local_presence = lock(&ctx.awareness).local_announcement();
    if let Some(update) = local_presence {
        send(&mut sink, SyncMessage::awareness(client_id, ctx.room.clone(), &update)).await?;
    }

    let mut doc_updates = ctx.doc_updates.lock().await;
    let mut outgoing = ctx.outgoing_rx.lock().await;
    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    heartbeat.tick().await; // the first tick fires immediately; skip it

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match SyncMessage::decode(&bytes) {
                        Ok(msg) => {
                            if let Some(reply) = handle_incoming(msg, ctx) {
                                send(&mut sink, reply).await?;
                            }
                        }
                        Err(e) => log::warn!("Undecodable message in room {}: {e}", ctx.room),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    sink.send(Message::Pong(data))
                        .await
                        .map_err(|_| ProtocolError::ConnectionClosed)?;
                }
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Err(_)) => return Err(ProtocolError::ConnectionClosed),
                _ => {}
            },
            update = doc_updates.recv() => match update {
                Some(u) => {
                    if u.origin == UpdateOrigin::Local {
                        send(&mut sink, SyncMessage::update(client_id, ctx.room.clone(), u.bytes))
                            .await?;
                    }
                }
                // Document destroyed: the session is over.
                None => return Ok(()),
            },
            queued = outgoing.recv() => match queued {
                Some(msg) => send(&mut sink, msg).await?,
                None => return Ok(()),
            },
            _ = heartbeat.tick() => {
                send(&mut sink, SyncMessage::ping(client_id, ctx.room.clone())).await?;
            }
        }
    }
}

/// Process one incoming protocol message; returns an optional reply.
fn handle_incoming(msg: SyncMessage, ctx: &ConnectionCtx) -> Option<SyncMessage> {
    // Our own messages can come back through the room fan-out.
    if msg.client_id == ctx.profile.client_id {
        return None;
    }
    let client_id = ctx.profile.client_id;

    match msg.msg_type {
        MessageType::SyncStep1 => match ctx.document.encode_diff(&msg.payload) {
            Ok(diff) => Some(SyncMessage::sync_step2(client_id, ctx.room.clone(), diff)),
            Err(e) => {
                log::warn!("Bad state vector in room {}: {e}", ctx.room);
                None
            }
        },
        MessageType::SyncStep2 | MessageType::Update => {
            if let Err(e) = ctx.document.apply_remote_update(&msg.payload) {
                log::warn!("Rejected remote update in room {}: {e}", ctx.room);
            }
            None
        }
        MessageType::Awareness => {
            match msg.presence_update() {
                Ok(update) => lock(&ctx.awareness).handle_update(&update),
                Err(e) => log::debug!("Undecodable presence in room {}: {e}", ctx.room),
            }
            None
        }
        MessageType::PeerJoined => {
            // Re-announce so the late joiner sees our current presence
            // (presence has no replay).
            let reannounce = lock(&ctx.awareness).local_announcement();
            reannounce.map(|u| SyncMessage::awareness(client_id, ctx.room.clone(), &u))
        }
        MessageType::PeerLeft => {
            lock(&ctx.awareness).peer_left(msg.client_id);
            None
        }
        MessageType::Ping => Some(SyncMessage::pong(client_id, ctx.room.clone())),
        MessageType::Pong => None,
    }
}

async fn send(sink: &mut WsSink, msg: SyncMessage) -> Result<(), ProtocolError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

/// Not-ready watchdog: observability only, never cancels the dial.
async fn watchdog(
    timeout: Duration,
    status_rx: watch::Receiver<ConnectionStatus>,
    ready_tx: Arc<watch::Sender<bool>>,
    room: RoomId,
) {
    tokio::time::sleep(timeout).await;
    if *status_rx.borrow() != ConnectionStatus::Connected {
        ready_tx.send_replace(false);
        log::warn!("Room {room}: no connection within {timeout:?}, flagging not ready");
    }
}

/// Bounded exponential backoff.
fn backoff_delay(attempt: u32, config: &ProviderConfig) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(6));
    config
        .reconnect_initial_delay
        .saturating_mul(factor)
        .min(config.reconnect_max_delay)
}

/// Restrict query parameter values to a URL-safe character set.
fn query_escape(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UserIdentity;

    fn build_provider(base_url: &str) -> SyncProvider {
        let document = CollabDocument::create("demo-1", "user-1").unwrap();
        let client_id = Uuid::new_v4();
        let awareness = Arc::new(StdMutex::new(AwarenessChannel::new(client_id)));
        let profile = ParticipantProfile::new(client_id, &UserIdentity::new("user-1", "Alice"));
        SyncProvider::new(
            ProviderConfig::with_base_url(base_url),
            RoomId::for_document("demo-1"),
            document,
            awareness,
            profile,
        )
    }

    #[tokio::test]
    async fn test_construction_does_not_dial() {
        let provider = build_provider("ws://127.0.0.1:1");
        // No connect() call: nothing happens, status stays put.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_desired() {
        let provider = build_provider("ws://127.0.0.1:1");
        provider.connect();
        provider.connect();
        provider.connect();
        // One watchdog + one supervisor, not three of each.
        assert_eq!(lock(&provider.tasks).len(), 2);
        provider.disconnect();
    }

    #[tokio::test]
    async fn test_requested_disconnect_flips_status_synchronously() {
        let provider = build_provider("ws://127.0.0.1:1");
        provider.connect();
        assert_eq!(provider.status(), ConnectionStatus::Connecting);
        provider.disconnect();
        // No await between the call and the observation.
        assert_eq!(provider.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let provider = build_provider("ws://127.0.0.1:1");
        provider.disconnect();
        provider.disconnect();
        assert_eq!(provider.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_presence_dropped_while_offline() {
        let provider = build_provider("ws://127.0.0.1:1");
        let update = {
            let mut channel = lock(&provider.awareness);
            channel.announce(&UserIdentity::new("user-1", "Alice"))
        };
        // Best-effort: no error, no queueing while disconnected.
        provider.send_presence(&update);
    }

    #[tokio::test]
    async fn test_failed_dial_keeps_retrying_until_disconnect() {
        let provider = build_provider("ws://127.0.0.1:1");
        provider.connect();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Still trying (or between attempts); never Connected.
        assert_ne!(provider.status(), ConnectionStatus::Connected);
        provider.disconnect();
        assert_eq!(provider.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = ProviderConfig::default();
        let mut last = Duration::ZERO;
        for attempt in 0..20 {
            let delay = backoff_delay(attempt, &config);
            assert!(delay >= last);
            assert!(delay <= config.reconnect_max_delay);
            last = delay;
        }
        assert_eq!(backoff_delay(0, &config), config.reconnect_initial_delay);
        assert_eq!(backoff_delay(19, &config), config.reconnect_max_delay);
    }

    #[test]
    fn test_endpoint_url_shape() {
        let document = CollabDocument::create("demo 1", "user-1").unwrap();
        let client_id = Uuid::new_v4();
        let ctx = ConnectionCtx {
            config: ProviderConfig::with_base_url("ws://host:9400/"),
            room: RoomId::for_document("demo 1"),
            profile: ParticipantProfile::new(
                client_id,
                &UserIdentity::new("user one", "Ada Lovelace"),
            ),
            document: document.clone(),
            awareness: Arc::new(StdMutex::new(AwarenessChannel::new(client_id))),
            status_tx: Arc::new(watch::channel(ConnectionStatus::Disconnected).0),
            ready_tx: Arc::new(watch::channel(false).0),
            desired: Arc::new(AtomicBool::new(false)),
            doc_updates: Arc::new(Mutex::new(document.subscribe_updates())),
            outgoing_rx: Arc::new(Mutex::new(mpsc::unbounded_channel().1)),
        };
        assert_eq!(
            ctx.endpoint_url(),
            "ws://host:9400/doc-demo-1?user=user-one&name=Ada-Lovelace"
        );
    }

    #[test]
    fn test_config_default_values() {
        let config = ProviderConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert!(config.reconnect_initial_delay < config.reconnect_max_delay);
    }
}
