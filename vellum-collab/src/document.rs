//! In-memory CRDT document state.
//!
//! `CollabDocument` wraps a `yrs::Doc` holding the shared rich-content field
//! (`"content"`) and a small metadata map (`"meta"`). All mutation goes
//! through this contract — local edits, remote updates, snapshot loads —
//! and every successful mutation fires an origin-tagged update notification
//! consumed by the persistence manager and the synchronization provider.
//!
//! Merge semantics are delegated to yrs: updates are commutative,
//! associative and idempotent, so two replicas of the same room converge
//! regardless of arrival order. Duplicated or out-of-order updates are safe;
//! updates with missing dependencies are buffered by yrs and integrated once
//! their predecessors arrive.

use std::sync::Mutex;
use std::time::SystemTime;

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Map, Origin, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Shared text field name.
const FIELD_CONTENT: &str = "content";
/// Metadata map name.
const FIELD_META: &str = "meta";

/// Transaction origins used to tag update notifications.
const ORIGIN_LOCAL: &str = "local-edit";
const ORIGIN_REMOTE: &str = "sync-remote";
const ORIGIN_LOAD: &str = "snapshot-load";

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A local mutation through [`CollabDocument::insert`]/[`delete`](CollabDocument::delete).
    Local,
    /// A peer's update applied via [`CollabDocument::apply_remote_update`].
    Remote,
    /// Historic state applied via [`CollabDocument::apply_loaded_snapshot`].
    /// Never triggers auto-save or network relay.
    Load,
}

/// An origin-tagged incremental update notification.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub origin: UpdateOrigin,
    /// yrs v1-encoded incremental update.
    pub bytes: Vec<u8>,
}

/// Document state errors.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// The payload is not a well-formed yrs update/state blob.
    MalformedUpdate(String),
    /// yrs rejected the update during integration.
    MergeFailed(String),
    /// Update observer could not be registered.
    Observer(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedUpdate(e) => write!(f, "Malformed update: {e}"),
            Self::MergeFailed(e) => write!(f, "Merge failed: {e}"),
            Self::Observer(e) => write!(f, "Observer registration failed: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// The shared collaborative document.
pub struct CollabDocument {
    doc: Doc,
    document_id: String,
    created_by: String,
    /// Update fan-out: one sender per subscriber, pruned as receivers drop.
    taps: Mutex<Vec<mpsc::UnboundedSender<DocUpdate>>>,
    /// Held to keep the yrs observer alive; dropped on destroy.
    subscription: Mutex<Option<yrs::Subscription>>,
}

impl CollabDocument {
    /// Create a fresh document for `document_id`.
    ///
    /// A new document id always produces a fresh CRDT instance; any durable
    /// snapshot is applied afterwards by the persistence manager.
    pub fn create(
        document_id: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Result<std::sync::Arc<Self>, DocumentError> {
        let document_id = document_id.into();
        let created_by = created_by.into();
        let doc = Doc::new();

        let this = std::sync::Arc::new(Self {
            doc,
            document_id: document_id.clone(),
            created_by: created_by.clone(),
            taps: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
        });

        // Observer fans origin-tagged updates out to all subscribers.
        let weak = std::sync::Arc::downgrade(&this);
        let sub = this
            .doc
            .observe_update_v1(move |txn, event| {
                let Some(document) = weak.upgrade() else {
                    return;
                };
                let origin = match txn.origin() {
                    Some(o) if o == &Origin::from(ORIGIN_REMOTE) => UpdateOrigin::Remote,
                    Some(o) if o == &Origin::from(ORIGIN_LOAD) => UpdateOrigin::Load,
                    _ => UpdateOrigin::Local,
                };
                let update = DocUpdate {
                    origin,
                    bytes: event.update.clone(),
                };
                let mut senders = lock(&document.taps);
                senders.retain(|tx| tx.send(update.clone()).is_ok());
            })
            .map_err(|e| DocumentError::Observer(e.to_string()))?;
        *lock(&this.subscription) = Some(sub);

        this.seed_metadata();
        Ok(this)
    }

    /// Write `createdAt`/`createdBy`/`documentId` into the metadata map.
    ///
    /// Each replica seeds independently; concurrent seeds converge through
    /// the CRDT's deterministic per-key conflict resolution.
    fn seed_metadata(&self) {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut txn = self.doc.transact_mut_with(ORIGIN_LOCAL);
        let meta = txn.get_or_insert_map(FIELD_META);
        meta.insert(&mut txn, "createdAt", now as f64);
        meta.insert(&mut txn, "createdBy", self.created_by.clone());
        meta.insert(&mut txn, "documentId", self.document_id.clone());
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    /// Insert text at a character index (clamped to the current length).
    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut_with(ORIGIN_LOCAL);
        let text = txn.get_or_insert_text(FIELD_CONTENT);
        let len = text.len(&txn);
        text.insert(&mut txn, index.min(len), chunk);
    }

    /// Append text at the end of the content field.
    pub fn append(&self, chunk: &str) {
        let mut txn = self.doc.transact_mut_with(ORIGIN_LOCAL);
        let text = txn.get_or_insert_text(FIELD_CONTENT);
        let len = text.len(&txn);
        text.insert(&mut txn, len, chunk);
    }

    /// Delete `len` characters starting at `index` (clamped to bounds).
    pub fn delete(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut_with(ORIGIN_LOCAL);
        let text = txn.get_or_insert_text(FIELD_CONTENT);
        let total = text.len(&txn);
        if index >= total {
            return;
        }
        text.remove_range(&mut txn, index, len.min(total - index));
    }

    /// Current content of the shared text field.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        match txn.get_text(FIELD_CONTENT) {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    /// Read a metadata entry as a string, if present.
    pub fn meta_string(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        let map = txn.get_map(FIELD_META)?;
        match map.get(&txn, key) {
            Some(yrs::Out::Any(yrs::Any::String(s))) => Some(s.to_string()),
            _ => None,
        }
    }

    /// Apply an update received from a peer.
    ///
    /// Safe with duplicated, out-of-order, or overlapping updates; malformed
    /// or foreign-format blobs are rejected without touching the last-good
    /// state. Callers log the error and keep the session alive.
    pub fn apply_remote_update(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(ORIGIN_REMOTE);
        txn.apply_update(update)
            .map_err(|e| DocumentError::MergeFailed(e.to_string()))
    }

    /// Apply a decoded durable snapshot during session start.
    ///
    /// Tagged `Load`, so the initial historic replay never triggers a
    /// spurious auto-save of an as-yet-incomplete document.
    pub fn apply_loaded_snapshot(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(ORIGIN_LOAD);
        txn.apply_update(update)
            .map_err(|e| DocumentError::MergeFailed(e.to_string()))
    }

    /// Whole-state v1 encoding (the snapshot write form).
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector for the sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Diff of local state against a peer's encoded state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Subscribe to origin-tagged update notifications.
    ///
    /// May be called multiple times; each subscriber gets every update that
    /// occurs after subscription. Receivers see `None` after [`destroy`](Self::destroy).
    pub fn subscribe_updates(&self) -> mpsc::UnboundedReceiver<DocUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.taps).push(tx);
        rx
    }

    /// Release the observer and all subscriber channels.
    ///
    /// Safe to call multiple times; further mutations fire no notifications.
    pub fn destroy(&self) {
        lock(&self.subscription).take();
        lock(&self.taps).clear();
    }
}

/// Poison-tolerant mutex lock.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_fresh_document() {
        let doc = CollabDocument::create("demo-1", "user-1").unwrap();
        assert_eq!(doc.document_id(), "demo-1");
        assert_eq!(doc.content(), "");
        assert_eq!(doc.meta_string("documentId").as_deref(), Some("demo-1"));
        assert_eq!(doc.meta_string("createdBy").as_deref(), Some("user-1"));
    }

    #[test]
    fn test_local_insert_and_delete() {
        let doc = CollabDocument::create("demo-1", "user-1").unwrap();
        doc.insert(0, "hello world");
        doc.delete(5, 6);
        assert_eq!(doc.content(), "hello");
    }

    #[test]
    fn test_insert_index_clamped() {
        let doc = CollabDocument::create("demo-1", "user-1").unwrap();
        doc.insert(999, "end");
        assert_eq!(doc.content(), "end");
    }

    #[test]
    fn test_delete_out_of_bounds_is_noop() {
        let doc = CollabDocument::create("demo-1", "user-1").unwrap();
        doc.insert(0, "ab");
        doc.delete(10, 5);
        doc.delete(1, 100);
        assert_eq!(doc.content(), "a");
    }

    #[test]
    fn test_state_round_trip() {
        let a = CollabDocument::create("demo-1", "user-1").unwrap();
        a.append("snapshot me");
        let state = a.encode_state();

        let b = CollabDocument::create("demo-1", "user-2").unwrap();
        b.apply_loaded_snapshot(&state).unwrap();
        assert_eq!(b.content(), "snapshot me");
    }

    #[test]
    fn test_merge_commutes() {
        // A then B and B then A converge to the same content.
        let a = CollabDocument::create("demo-1", "alice").unwrap();
        let b = CollabDocument::create("demo-1", "bob").unwrap();
        a.append("hello");
        b.append(" world");

        let ua = a.encode_state();
        let ub = b.encode_state();

        let ab = CollabDocument::create("demo-1", "x").unwrap();
        ab.apply_remote_update(&ua).unwrap();
        ab.apply_remote_update(&ub).unwrap();

        let ba = CollabDocument::create("demo-1", "y").unwrap();
        ba.apply_remote_update(&ub).unwrap();
        ba.apply_remote_update(&ua).unwrap();

        assert_eq!(ab.content(), ba.content());
        assert!(ab.content().contains("hello"));
        assert!(ab.content().contains(" world"));
    }

    #[test]
    fn test_merge_converges_over_random_op_sequences() {
        // Deterministic LCG so the "random" edit streams are reproducible.
        let mut seed: u64 = 0x5eed_cafe;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            seed >> 33
        };

        let a = CollabDocument::create("demo-1", "alice").unwrap();
        let b = CollabDocument::create("demo-1", "bob").unwrap();

        for i in 0..50 {
            let (doc, word) = if next() % 2 == 0 { (&a, "a") } else { (&b, "b") };
            let len = doc.content().chars().count() as u64;
            match next() % 3 {
                0 => doc.insert((next() % (len + 1)) as u32, word),
                1 if len > 0 => doc.delete((next() % len) as u32, 1),
                _ => doc.append(&format!("{word}{i}")),
            }
        }

        // Exchange full states in opposite orders; both replicas converge.
        let ua = a.encode_state();
        let ub = b.encode_state();
        a.apply_remote_update(&ub).unwrap();
        b.apply_remote_update(&ua).unwrap();
        assert_eq!(a.content(), b.content());
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        let a = CollabDocument::create("demo-1", "alice").unwrap();
        a.append("once");
        let update = a.encode_state();

        let b = CollabDocument::create("demo-1", "bob").unwrap();
        b.apply_remote_update(&update).unwrap();
        b.apply_remote_update(&update).unwrap();
        b.apply_remote_update(&update).unwrap();
        assert_eq!(b.content(), "once");
    }

    #[test]
    fn test_malformed_update_rejected_without_state_loss() {
        let doc = CollabDocument::create("demo-1", "user-1").unwrap();
        doc.append("keep me");
        let err = doc.apply_remote_update(&[0xFF, 0xFE, 0x01]);
        assert!(err.is_err());
        assert_eq!(doc.content(), "keep me");
    }

    #[tokio::test]
    async fn test_update_notifications_tagged_by_origin() {
        let doc = CollabDocument::create("demo-1", "user-1").unwrap();
        let mut updates = doc.subscribe_updates();

        doc.append("local");
        let local = updates.recv().await.unwrap();
        assert_eq!(local.origin, UpdateOrigin::Local);

        let other = CollabDocument::create("demo-1", "user-2").unwrap();
        other.append("remote");
        doc.apply_remote_update(&other.encode_state()).unwrap();
        let remote = updates.recv().await.unwrap();
        assert_eq!(remote.origin, UpdateOrigin::Remote);

        let seed = CollabDocument::create("demo-1", "user-3").unwrap();
        seed.append("loaded");
        doc.apply_loaded_snapshot(&seed.encode_state()).unwrap();
        let loaded = updates.recv().await.unwrap();
        assert_eq!(loaded.origin, UpdateOrigin::Load);
    }

    #[tokio::test]
    async fn test_destroy_closes_subscribers() {
        let doc = CollabDocument::create("demo-1", "user-1").unwrap();
        let mut updates = doc.subscribe_updates();
        doc.destroy();
        doc.destroy(); // second call is a no-op
        assert!(updates.recv().await.is_none());
    }

    #[test]
    fn test_diff_covers_missed_updates() {
        let a = CollabDocument::create("demo-1", "alice").unwrap();
        let b = CollabDocument::create("demo-1", "bob").unwrap();

        a.append("offline edit");
        // B asks for what it is missing relative to A.
        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_remote_update(&diff).unwrap();
        assert_eq!(b.content(), a.content());
    }

    #[test]
    fn test_encode_diff_rejects_garbage_state_vector() {
        let doc = CollabDocument::create("demo-1", "user-1").unwrap();
        assert!(doc.encode_diff(&[0xFF, 0x00, 0xAB]).is_err());
    }
}
