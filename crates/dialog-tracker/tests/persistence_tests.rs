//! Persistence modes, rehydration and background services

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use rvoip_dialog_tracker::{
    DbMode, DialogError, DialogEvent, DialogFlags, DialogId, DialogResult, DialogSnapshot, DialogState, DialogStore,
    MemoryDialogStore, TrackerConfig, TransactionEvent,
};
use serial_test::serial;

/// Store whose next write fails once when armed
#[derive(Default)]
struct FlakyStore {
    inner: MemoryDialogStore,
    fail_next: AtomicBool,
}

#[async_trait]
impl DialogStore for FlakyStore {
    async fn insert_or_update(&self, snapshot: &DialogSnapshot) -> DialogResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DialogError::storage_error("connection reset"));
        }
        self.inner.insert_or_update(snapshot).await
    }

    async fn delete(&self, id: DialogId) -> DialogResult<()> {
        self.inner.delete(id).await
    }

    async fn load_all(&self) -> DialogResult<Vec<DialogSnapshot>> {
        self.inner.load_all().await
    }
}

fn config(mode: DbMode) -> TrackerConfig {
    TrackerConfig::default()
        .with_hash_size(16)
        .with_db_mode(mode)
        .with_db_update_period(Duration::from_secs(60))
}

#[tokio::test]
#[serial]
async fn test_realtime_mode_writes_through_queue() {
    let h = Harness::new(config(DbMode::Realtime));
    let store = Arc::new(MemoryDialogStore::new());
    h.tracker.attach_store(store.clone());

    let call_id = "store-realtime@atlanta";
    let (id, token) = h.confirmed(call_id);
    let (gone, gone_token) = h.confirmed("store-realtime-gone@atlanta");
    h.tracker
        .on_in_dialog_request(&bye_from_caller("store-realtime-gone@atlanta", &gone_token))
        .unwrap();

    let tasks = h.tracker.start();
    assert_eq!(tasks.loop_count(), 2);
    tasks.shutdown().await.unwrap();

    let stored = store.get(id).unwrap();
    assert_eq!(stored.state, DialogState::Confirmed);
    assert_eq!(stored.call_id, call_id);
    assert_eq!(h.tracker.decode_route_token(&token).unwrap(), stored.id);
    assert!(store.get(gone).is_none());
}

#[tokio::test]
#[serial]
async fn test_shutdown_mode_flushes_everything() {
    let h = Harness::new(config(DbMode::Shutdown));
    let store = Arc::new(MemoryDialogStore::new());
    h.tracker.attach_store(store.clone());

    let (first, _) = h.confirmed("store-shutdown-1@atlanta");
    let (second, _) = h.answered("store-shutdown-2@atlanta");

    let tasks = h.tracker.start();
    assert!(store.is_empty());
    tasks.shutdown().await.unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(store.get(first).unwrap().state, DialogState::Confirmed);
    assert_eq!(store.get(second).unwrap().state, DialogState::ConfirmedPendingAck);
}

#[tokio::test]
async fn test_delayed_mode_writes_changed_dialogs_once() {
    let h = Harness::new(config(DbMode::Delayed));
    let store = Arc::new(MemoryDialogStore::new());
    h.tracker.attach_store(store.clone());

    let (id, _) = h.confirmed("store-delayed@atlanta");
    assert_eq!(h.tracker.flush_changed().await.unwrap(), 1);
    assert_eq!(h.tracker.flush_changed().await.unwrap(), 0);

    h.tracker.set_var(id, "account", Some("4711")).unwrap();
    assert_eq!(h.tracker.flush_changed().await.unwrap(), 1);
    assert_eq!(
        store.get(id).unwrap().vars.get("account").map(String::as_str),
        Some("4711")
    );
}

#[tokio::test]
async fn test_failed_write_is_retried_on_next_flush() {
    let h = Harness::new(config(DbMode::Delayed));
    let store = Arc::new(FlakyStore::default());
    h.tracker.attach_store(store.clone());

    let (first, _) = h.confirmed("store-flaky-1@atlanta");
    let (second, _) = h.confirmed("store-flaky-2@atlanta");
    store.fail_next.store(true, Ordering::SeqCst);

    assert!(matches!(
        h.tracker.flush_changed().await,
        Err(DialogError::Storage { .. })
    ));
    // The other dialog was still written
    let written = [first, second].iter().filter(|id| store.inner.get(**id).is_some()).count();
    assert_eq!(written, 1);
    let failed = if store.inner.get(first).is_some() { second } else { first };
    assert!(h
        .tracker
        .snapshot(failed)
        .unwrap()
        .flags
        .contains(DialogFlags::CHANGED));

    assert_eq!(h.tracker.flush_changed().await.unwrap(), 1);
    assert_eq!(store.inner.get(failed).unwrap().state, DialogState::Confirmed);
    assert_eq!(h.tracker.flush_changed().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unconfirmed_dialogs_are_not_written() {
    let h = Harness::new(config(DbMode::Delayed));
    let store = Arc::new(MemoryDialogStore::new());
    h.tracker.attach_store(store.clone());

    let (pending, _) = h.invite("store-unconfirmed@atlanta");
    let (ringing, _) = h.invite("store-ringing@atlanta");
    h.respond(&ringing, 180, Some(BOB_TAG));
    h.tracker.set_var(pending.dialog(), "note", Some("x")).unwrap();
    h.tracker.set_var(ringing.dialog(), "note", Some("y")).unwrap();

    assert_eq!(h.tracker.flush_all().await.unwrap(), 1);
    assert!(store.get(pending.dialog()).is_none());
    assert_eq!(store.get(ringing.dialog()).unwrap().state, DialogState::Early);
    assert_eq!(h.tracker.flush_changed().await.unwrap(), 1);
    assert!(store.get(pending.dialog()).is_none());

    h.tracker.release_binding(pending);
    h.tracker.release_binding(ringing);
}

#[tokio::test]
async fn test_rehydrated_early_dialog_expires() {
    let lifetime = Duration::from_secs(30);
    let before = Harness::new(config(DbMode::Shutdown).with_default_lifetime(lifetime));
    let store = Arc::new(MemoryDialogStore::new());
    before.tracker.attach_store(store.clone());

    let (binding, _) = before.invite("store-early@atlanta");
    let id = binding.dialog();
    before.respond(&binding, 180, Some(BOB_TAG));
    assert_eq!(before.tracker.flush_all().await.unwrap(), 1);

    let after = Harness::new(config(DbMode::Shutdown).with_default_lifetime(lifetime));
    let report = after.tracker.rehydrate(store.as_ref()).await.unwrap();
    assert_eq!(report.loaded, 1);

    let restored = after.tracker.snapshot(id).unwrap();
    assert_eq!(restored.state, DialogState::Early);
    // linkage and timer
    assert_eq!(restored.ref_count, 2);
    assert!(after.tracker.timers().contains(id));
    assert_eq!(after.tracker.metrics().snapshot().early, 1);

    after.clock.advance(29);
    assert_eq!(after.tracker.tick(), 0);
    after.clock.advance(1);
    assert_eq!(after.tracker.tick(), 1);

    assert!(after.tracker.snapshot(id).is_none());
    assert!(!after.tracker.timers().contains(id));
    assert!(after.recorder.events().contains(&DialogEvent::Expired { id }));
    let metrics = after.tracker.metrics().snapshot();
    assert_eq!((metrics.early, metrics.failed, metrics.active), (0, 1, 0));

    before.tracker.on_transaction_event(&binding, TransactionEvent::Destroyed);
    before.tracker.release_binding(binding);
}

#[tokio::test]
async fn test_flush_without_store_is_noop() {
    let h = Harness::new(config(DbMode::Delayed));
    h.confirmed("store-none@atlanta");
    assert_eq!(h.tracker.flush_changed().await.unwrap(), 0);
    assert_eq!(h.tracker.flush_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rehydrate_restores_routable_dialogs() {
    let before = Harness::new(config(DbMode::Shutdown));
    before.tracker.define_profile("caller", true).unwrap();
    let store = Arc::new(MemoryDialogStore::new());
    before.tracker.attach_store(store.clone());

    let call_id = "store-rehydrate@atlanta";
    let (id, token) = before.confirmed(call_id);
    before.tracker.set_profile(id, "caller", Some("alice")).unwrap();
    assert_eq!(before.tracker.flush_all().await.unwrap(), 1);

    let after = Harness::new(config(DbMode::Shutdown));
    after.tracker.define_profile("caller", true).unwrap();
    let report = after.tracker.rehydrate(store.as_ref()).await.unwrap();
    assert_eq!((report.loaded, report.discarded, report.skipped), (1, 0, 0));

    let restored = after.tracker.snapshot(id).unwrap();
    assert_eq!(restored.state, DialogState::Confirmed);
    assert_eq!(restored.to_tag.as_deref(), Some(BOB_TAG));
    assert!(after.tracker.timers().contains(id));
    assert_eq!(after.tracker.profile_size("caller", Some("alice")).unwrap(), 1);
    assert_eq!(after.tracker.metrics().snapshot().active, 1);

    let outcome = after
        .tracker
        .on_in_dialog_request(&bye_from_callee(call_id, &token))
        .unwrap()
        .unwrap();
    assert_eq!(outcome.dialog, id);
    assert!(outcome.destroyed);
    assert_eq!(after.tracker.profile_size("caller", Some("alice")).unwrap(), 0);
}

#[tokio::test]
async fn test_rehydrate_discards_records_in_wrong_bucket() {
    let before = Harness::new(config(DbMode::Shutdown));
    let (id, _) = before.confirmed("store-mismatch@atlanta");
    let mut moved = before.tracker.snapshot(id).unwrap();
    moved.id = DialogId::new((id.bucket + 1) % 16, id.seq);

    let mut deleted = before.tracker.snapshot(id).unwrap();
    deleted.state = DialogState::Deleted;

    let (kept_id, _) = before.confirmed("store-kept@atlanta");
    let kept = before.tracker.snapshot(kept_id).unwrap();

    let store = MemoryDialogStore::new();
    store.insert_or_update(&moved).await.unwrap();
    store.insert_or_update(&deleted).await.unwrap();
    store.insert_or_update(&kept).await.unwrap();

    let after = Harness::new(config(DbMode::Shutdown));
    let report = after.tracker.rehydrate(&store).await.unwrap();
    assert_eq!((report.loaded, report.discarded, report.skipped), (1, 1, 1));
    assert_eq!(after.tracker.dialog_count(), 1);
    assert!(after.tracker.snapshot(kept_id).is_some());
}

#[tokio::test]
#[serial]
async fn test_background_timer_loop_expires_dialogs() {
    let h = Harness::new(
        config(DbMode::None)
            .with_timer_interval(Duration::from_millis(10))
            .with_default_lifetime(Duration::from_secs(5)),
    );
    let (id, _) = h.confirmed("store-loop@atlanta");

    let tasks = h.tracker.start();
    h.clock.advance(5);

    let mut expired = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if h.tracker.snapshot(id).is_none() {
            expired = true;
            break;
        }
    }
    tasks.shutdown().await.unwrap();
    assert!(expired, "timer loop never fired");
}
