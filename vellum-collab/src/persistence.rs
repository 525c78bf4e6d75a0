//! Debounced durable snapshots.
//!
//! The persistence manager observes document mutations and coalesces bursts
//! of local edits into periodic whole-state snapshot writes:
//!
//! ```text
//! local edit ──► update notification (origin = Local)
//!                     │ re-arms the quiet-period timer
//!                     ▼
//!            debounce window elapses
//!                     │
//!                     ▼
//!            encode whole state ──► SnapshotStore::insert_snapshot
//! ```
//!
//! Two invariants keep a bad save from destroying good data:
//! - **Load-before-save**: auto-save stays suppressed until `load_latest`
//!   has completed, so an empty just-created document can never overwrite a
//!   durable snapshot that was about to be loaded into it.
//! - **Local-only scheduling**: `Remote` and `Load` origin updates never
//!   arm the timer; replaying history or receiving peer edits is not a
//!   reason to write.
//!
//! Save failures are logged and retried on the next debounce window; load
//! failures leave the document fresh and editing unblocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{SnapshotPayload, SnapshotRecord, SnapshotType};
use crate::document::{CollabDocument, DocUpdate, UpdateOrigin};
use crate::storage::StoreError;

/// Default quiet period between the last local edit and the auto-save.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(3);

/// The opaque durable snapshot store the engine calls out to.
///
/// Both operations are asynchronous, fallible, and idempotent-safe to
/// retry. The store is multi-writer; last-writer-wins at the row level is
/// acceptable because the CRDT merge is the true conflict resolver.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a whole-state snapshot; returns the assigned monotonic version.
    async fn insert_snapshot(
        &self,
        document_id: &str,
        state: &SnapshotPayload,
        snapshot_type: SnapshotType,
        created_by: &str,
    ) -> Result<u64, StoreError>;

    /// Fetch the most recent snapshot by version, if any.
    async fn get_latest_snapshot(
        &self,
        document_id: &str,
    ) -> Result<Option<SnapshotRecord>, StoreError>;
}

/// Persistence errors surfaced to callers of `manual_save`.
#[derive(Debug, Clone)]
pub enum PersistenceError {
    /// `attach` has not been called yet.
    NotAttached,
    Store(StoreError),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAttached => write!(f, "Persistence manager is not attached to a document"),
            Self::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

struct Attached {
    document: Arc<CollabDocument>,
    created_by: String,
    task: JoinHandle<()>,
}

/// Debounced snapshot writer for one document.
pub struct PersistenceManager {
    store: Arc<dyn SnapshotStore>,
    document_id: String,
    debounce: Duration,
    /// Guards the first `load_latest` call (idempotency).
    load_started: AtomicBool,
    /// Flips once `load_latest` has completed; auto-save waits for it.
    loaded: Arc<AtomicBool>,
    attached: Mutex<Option<Attached>>,
}

impl PersistenceManager {
    pub fn new(store: Arc<dyn SnapshotStore>, document_id: impl Into<String>) -> Self {
        Self::with_debounce(store, document_id, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(
        store: Arc<dyn SnapshotStore>,
        document_id: impl Into<String>,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            document_id: document_id.into(),
            debounce,
            load_started: AtomicBool::new(false),
            loaded: Arc::new(AtomicBool::new(false)),
            attached: Mutex::new(None),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Whether the initial load has completed (auto-save enabled).
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Load the latest durable snapshot into the document.
    ///
    /// Idempotent, call-once-at-start. A store error or a corrupt/foreign
    /// snapshot is logged and leaves the document at its fresh in-memory
    /// state; editing is never blocked.
    pub async fn load_latest(&self, document: &CollabDocument) {
        if self.load_started.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.store.get_latest_snapshot(&self.document_id).await {
            Ok(Some(record)) => match record.state.decode() {
                Ok(state) => match document.apply_loaded_snapshot(&state) {
                    Ok(()) => log::info!(
                        "Loaded snapshot v{} for document {}",
                        record.version,
                        self.document_id
                    ),
                    Err(e) => log::warn!(
                        "Skipping foreign-format snapshot for document {}: {e}",
                        self.document_id
                    ),
                },
                Err(e) => log::warn!(
                    "Skipping corrupt snapshot payload for document {}: {e}",
                    self.document_id
                ),
            },
            Ok(None) => log::debug!("No durable snapshot for document {}", self.document_id),
            Err(e) => log::warn!(
                "Snapshot load failed for document {}: {e}; starting fresh",
                self.document_id
            ),
        }

        self.loaded.store(true, Ordering::SeqCst);
    }

    /// Install the debounced auto-save loop.
    ///
    /// Repeated calls are a no-op. The loop exits on its own when the
    /// document is destroyed.
    pub fn attach(&self, document: &Arc<CollabDocument>, created_by: impl Into<String>) {
        let mut guard = lock(&self.attached);
        if guard.is_some() {
            log::debug!("Persistence already attached for document {}", self.document_id);
            return;
        }

        let created_by = created_by.into();
        let updates = document.subscribe_updates();
        let task = tokio::spawn(auto_save_loop(
            self.store.clone(),
            document.clone(),
            self.document_id.clone(),
            created_by.clone(),
            self.loaded.clone(),
            self.debounce,
            updates,
        ));

        *guard = Some(Attached {
            document: document.clone(),
            created_by,
            task,
        });
    }

    /// Write a `Manual` whole-state snapshot immediately.
    pub async fn manual_save(&self) -> Result<u64, PersistenceError> {
        let (document, created_by) = {
            let guard = lock(&self.attached);
            let attached = guard.as_ref().ok_or(PersistenceError::NotAttached)?;
            (attached.document.clone(), attached.created_by.clone())
        };

        let payload = SnapshotPayload::from_state(&document.encode_state());
        self.store
            .insert_snapshot(&self.document_id, &payload, SnapshotType::Manual, &created_by)
            .await
            .map_err(PersistenceError::Store)
    }

    /// Stop the auto-save loop. Safe to call twice or when never attached.
    pub fn detach(&self) {
        if let Some(attached) = lock(&self.attached).take() {
            attached.task.abort();
        }
    }
}

impl Drop for PersistenceManager {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn auto_save_loop(
    store: Arc<dyn SnapshotStore>,
    document: Arc<CollabDocument>,
    document_id: String,
    created_by: String,
    loaded: Arc<AtomicBool>,
    debounce: Duration,
    mut updates: mpsc::UnboundedReceiver<DocUpdate>,
) {
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            maybe = updates.recv() => match maybe {
                Some(update) => {
                    // Only local edits after the initial load arm the timer.
                    if update.origin == UpdateOrigin::Local && loaded.load(Ordering::SeqCst) {
                        deadline = Some(tokio::time::Instant::now() + debounce);
                    }
                }
                // Document destroyed: the session is over, stop saving.
                None => break,
            },
            _ = debounce_tick(deadline) => {
                let payload = SnapshotPayload::from_state(&document.encode_state());
                match store
                    .insert_snapshot(&document_id, &payload, SnapshotType::Auto, &created_by)
                    .await
                {
                    Ok(version) => {
                        log::debug!("Auto-saved snapshot v{version} for document {document_id}");
                        deadline = None;
                    }
                    Err(e) => {
                        log::warn!(
                            "Auto-save failed for document {document_id}: {e}; retrying next window"
                        );
                        deadline = Some(tokio::time::Instant::now() + debounce);
                    }
                }
            }
        }
    }
}

async fn debounce_tick(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// In-memory snapshot store for tests and single-process use.
pub struct MemorySnapshotStore {
    rows: Mutex<HashMap<String, Vec<SnapshotRecord>>>,
    version: AtomicU64,
    insert_attempts: AtomicU64,
    fail_inserts: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
            insert_attempts: AtomicU64::new(0),
            fail_inserts: AtomicBool::new(false),
        }
    }

    /// Number of insert calls, including failed ones.
    pub fn insert_attempts(&self) -> u64 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    /// Number of snapshots actually stored.
    pub fn stored_count(&self) -> usize {
        lock(&self.rows).values().map(Vec::len).sum()
    }

    /// Make subsequent inserts fail until cleared (failure injection).
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Synchronous latest-row peek for assertions.
    pub fn latest(&self, document_id: &str) -> Option<SnapshotRecord> {
        lock(&self.rows)
            .get(document_id)
            .and_then(|rows| rows.iter().max_by_key(|r| r.version).cloned())
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn insert_snapshot(
        &self,
        document_id: &str,
        state: &SnapshotPayload,
        snapshot_type: SnapshotType,
        created_by: &str,
    ) -> Result<u64, StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("injected insert failure".into()));
        }

        // Round-trip through the canonical decode so corrupt payloads are
        // rejected here just like a real backend would.
        let bytes = state
            .decode()
            .map_err(|e| StoreError::CodecError(e.to_string()))?;

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let record = SnapshotRecord {
            document_id: document_id.to_string(),
            state: SnapshotPayload::from_state(&bytes),
            version,
            created_by: created_by.to_string(),
            snapshot_type,
            created_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        lock(&self.rows)
            .entry(document_id.to_string())
            .or_default()
            .push(record);
        Ok(version)
    }

    async fn get_latest_snapshot(
        &self,
        document_id: &str,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(self.latest(document_id))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
