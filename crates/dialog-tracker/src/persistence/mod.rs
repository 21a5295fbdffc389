//! Dialog persistence
//!
//! The tracker never talks to storage while a bucket lock is held. Writes
//! are described as [`StoreOp`]s and queued on an unbounded channel that a
//! single writer task drains in order:
//!
//! ```text
//! dispatch (under bucket lock)     capture snapshot
//!         │
//!         ▼ (lock released)
//!   StoreQueue::push ──mpsc──► run_store_writer ──► DialogStore
//! ```
//!
//! Bulk modes (`Delayed`, `Shutdown`) bypass the queue and write directly
//! from [`DialogTracker::flush_changed`] and [`DialogTracker::flush_all`].
//! At startup [`DialogTracker::rehydrate`] rebuilds the registry from
//! [`DialogStore::load_all`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::DbMode;
use crate::dialog::{Dialog, DialogFlags, DialogId, DialogSnapshot, DialogState};
use crate::dispatch::DialogTracker;
use crate::errors::{DialogError, DialogResult};

/// Storage backend for dialog snapshots
#[async_trait]
pub trait DialogStore: Send + Sync {
    /// Insert or replace the record with the snapshot's identity
    async fn insert_or_update(&self, snapshot: &DialogSnapshot) -> DialogResult<()>;

    /// Delete a record; deleting a missing record is not an error
    async fn delete(&self, id: DialogId) -> DialogResult<()>;

    /// Every stored record
    async fn load_all(&self) -> DialogResult<Vec<DialogSnapshot>>;
}

/// In-process store backed by a `DashMap`
#[derive(Debug, Default)]
pub struct MemoryDialogStore {
    records: DashMap<DialogId, DialogSnapshot>,
}

impl MemoryDialogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record for an identity
    pub fn get(&self, id: DialogId) -> Option<DialogSnapshot> {
        self.records.get(&id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DialogStore for MemoryDialogStore {
    async fn insert_or_update(&self, snapshot: &DialogSnapshot) -> DialogResult<()> {
        self.records.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn delete(&self, id: DialogId) -> DialogResult<()> {
        self.records.remove(&id);
        Ok(())
    }

    async fn load_all(&self) -> DialogResult<Vec<DialogSnapshot>> {
        let mut all: Vec<DialogSnapshot> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        Ok(all)
    }
}

/// Queued storage write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Upsert(Box<DialogSnapshot>),
    Delete(DialogId),
}

/// Sending half of the writer queue, plus the receiver until the writer starts
#[derive(Debug, Default)]
pub(crate) struct StoreQueue {
    tx: RwLock<Option<mpsc::UnboundedSender<StoreOp>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<StoreOp>>>,
}

impl StoreQueue {
    pub fn open(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.write() = Some(tx);
        *self.rx.lock() = Some(rx);
    }

    pub fn is_open(&self) -> bool {
        self.tx.read().is_some()
    }

    pub fn push(&self, op: StoreOp) {
        if let Some(tx) = self.tx.read().as_ref() {
            if tx.send(op).is_err() {
                warn!("dialog store writer is gone, dropping write");
            }
        }
    }

    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<StoreOp>> {
        self.rx.lock().take()
    }

    /// Drop the sender so the writer drains and exits
    pub fn close(&self) {
        self.tx.write().take();
    }
}

/// Drain queued writes into `store` until the queue is closed
pub async fn run_store_writer(store: Arc<dyn DialogStore>, mut rx: mpsc::UnboundedReceiver<StoreOp>) {
    debug!("dialog store writer started");
    while let Some(op) = rx.recv().await {
        let result = match &op {
            StoreOp::Upsert(snapshot) => store.insert_or_update(snapshot).await,
            StoreOp::Delete(id) => store.delete(*id).await,
        };
        if let Err(e) = result {
            warn!(error = %e, ?op, "dialog store write failed");
        }
    }
    debug!("dialog store writer stopped");
}

/// Outcome of [`DialogTracker::rehydrate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RehydrateReport {
    /// Records linked back into the registry
    pub loaded: usize,
    /// Records dropped because they no longer hash to their stored bucket
    /// or could not be linked
    pub discarded: usize,
    /// Terminated records that were not restored
    pub skipped: usize,
}

impl DialogTracker {
    /// Attach a store; realtime writes are queued until the writer starts
    pub fn attach_store(&self, store: Arc<dyn DialogStore>) {
        *self.store.write() = Some(store);
        if !self.store_queue.is_open() {
            self.store_queue.open();
        }
    }

    /// Attached store, if any
    pub fn store(&self) -> Option<Arc<dyn DialogStore>> {
        self.store.read().clone()
    }

    /// Queue an upsert when running in realtime mode
    pub(crate) fn persist_realtime(&self, snapshot: Option<DialogSnapshot>) {
        if self.config.db_mode != DbMode::Realtime {
            return;
        }
        if let Some(snapshot) = snapshot {
            if !snapshot.flags.contains(DialogFlags::REPLICATED) {
                self.store_queue.push(StoreOp::Upsert(Box::new(snapshot)));
            }
        }
    }

    /// Write every dialog flagged CHANGED and clear the flag.
    ///
    /// A record keeps its flags until its write succeeds. A failed write
    /// does not stop the batch; the first error is returned once every
    /// record has been tried.
    pub async fn flush_changed(&self) -> DialogResult<usize> {
        let Some(store) = self.store() else {
            return Ok(0);
        };

        let ids = self
            .registry
            .ids_where(|d| d.flags.contains(DialogFlags::CHANGED) && is_persistable(d));

        let mut written = 0;
        let mut first_error = None;
        for id in ids {
            let Some(snapshot) = self.registry.snapshot(id) else {
                continue;
            };
            if let Err(e) = store.insert_or_update(&snapshot).await {
                warn!(dialog = %id, error = %e, "dialog write failed, kept for the next flush");
                first_error.get_or_insert(e);
                continue;
            }
            self.registry.with_dialog_mut(id, |d| {
                d.flags.remove(DialogFlags::CHANGED);
                d.flags.remove(DialogFlags::NEW);
            });
            written += 1;
        }

        if written > 0 {
            debug!(written, "flushed changed dialogs");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Write every locally owned dialog that has been answered or is ringing
    pub async fn flush_all(&self) -> DialogResult<usize> {
        let Some(store) = self.store() else {
            return Ok(0);
        };

        let snapshots = self.registry.snapshots_where(is_persistable);
        for snapshot in &snapshots {
            store.insert_or_update(snapshot).await?;
        }

        info!(written = snapshots.len(), "flushed all dialogs");
        Ok(snapshots.len())
    }

    /// Rebuild the registry from `store`.
    ///
    /// Records whose Call-ID no longer hashes to the stored bucket are
    /// discarded and counted; rehydration carries on with the next record.
    pub async fn rehydrate(&self, store: &dyn DialogStore) -> DialogResult<RehydrateReport> {
        let records = store.load_all().await?;
        let mut report = RehydrateReport::default();

        for snapshot in records {
            if snapshot.state == DialogState::Deleted {
                report.skipped += 1;
                continue;
            }
            match self.restore(&snapshot) {
                Ok(_) => report.loaded += 1,
                Err(e @ DialogError::HashMismatch { .. }) => {
                    error!(dialog = %snapshot.id, error = %e, "discarding stored dialog");
                    report.discarded += 1;
                }
                Err(e) => {
                    error!(dialog = %snapshot.id, error = %e, "failed to restore stored dialog");
                    report.discarded += 1;
                }
            }
        }

        info!(
            loaded = report.loaded,
            discarded = report.discarded,
            skipped = report.skipped,
            "dialogs rehydrated"
        );
        Ok(report)
    }

    fn restore(&self, snapshot: &DialogSnapshot) -> DialogResult<DialogId> {
        let now = self.registry.now();
        let mut dialog = Dialog::from_snapshot(snapshot, now);
        dialog.flags.remove(DialogFlags::NEW);
        dialog.flags.remove(DialogFlags::CHANGED);

        let id = self.registry.link_with_id(dialog, snapshot.id, 0)?;

        // No transaction survives a restart, so every restored record needs
        // a timer to end it
        let remaining = snapshot
            .remaining_lifetime(Utc::now())
            .map(|secs| secs.clamp(1, i64::from(u32::MAX)) as u32)
            .unwrap_or(snapshot.lifetime.max(1));
        self.arm_timer(id, remaining);

        if snapshot.state.is_answered() {
            self.metrics.record_answered(false);
            if self.config.keepalive_interval.is_some() && snapshot.state != DialogState::ConfirmedPendingAck {
                self.schedule_keepalive(id);
            }
        } else if snapshot.state == DialogState::Early {
            self.metrics.record_early();
        }

        for link in &snapshot.profiles {
            if let Err(e) = self.set_profile(id, &link.profile, link.value.as_deref()) {
                warn!(dialog = %id, profile = %link.profile, error = %e, "stored profile membership dropped");
            }
        }

        debug!(dialog = %id, state = %snapshot.state, "dialog restored");
        Ok(id)
    }
}

/// Unconfirmed dialogs are never written; they end with their transaction
fn is_persistable(dialog: &Dialog) -> bool {
    !dialog.is_replicated() && !matches!(dialog.state(), DialogState::Unconfirmed | DialogState::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryDialogStore::new();
        assert!(store.load_all().await.unwrap().is_empty());

        let dialog = Dialog::new(
            0,
            "cid".to_string(),
            "sip:a@x".to_string(),
            "sip:b@x".to_string(),
            "ftag".to_string(),
            "sip:b@x".to_string(),
            0,
        );
        let mut snapshot = dialog.snapshot(0);
        snapshot.id = DialogId::new(0, 5);

        store.insert_or_update(&snapshot).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(snapshot.id).unwrap().call_id, "cid");

        store.delete(snapshot.id).await.unwrap();
        store.delete(snapshot.id).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_writer_applies_ops_in_order() {
        let store = Arc::new(MemoryDialogStore::new());
        let queue = StoreQueue::default();
        queue.open();
        let rx = queue.take_receiver().unwrap();

        let dialog = Dialog::new(
            0,
            "cid".to_string(),
            "a".to_string(),
            "b".to_string(),
            "t".to_string(),
            "r".to_string(),
            0,
        );
        let mut snapshot = dialog.snapshot(0);
        snapshot.id = DialogId::new(0, 9);

        queue.push(StoreOp::Upsert(Box::new(snapshot.clone())));
        queue.push(StoreOp::Delete(snapshot.id));
        let mut kept = snapshot.clone();
        kept.id = DialogId::new(0, 10);
        queue.push(StoreOp::Upsert(Box::new(kept)));
        queue.close();

        run_store_writer(store.clone(), rx).await;
        assert_eq!(store.len(), 1);
        assert!(store.get(DialogId::new(0, 10)).is_some());
    }
}
