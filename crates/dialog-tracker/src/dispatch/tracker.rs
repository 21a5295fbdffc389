//! The dialog tracker instance
//!
//! [`DialogTracker`] owns one registry, one timer engine and every
//! collaborator handle. Its operations are split by caller across the
//! sibling modules:
//!
//! - [`transaction`](super::transaction): initial requests and transaction callbacks
//! - [`route`](super::route): record-route tokens and in-dialog requests
//! - [`expiry`](super::expiry): timer expiry, stale sweep and keep-alive
//!
//! Persistence, replication and administration add further `impl` blocks in
//! their own modules.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::config::{DbMode, TrackerConfig};
use crate::dialog::{Dialog, DialogFlags, DialogId, DialogSnapshot, ProfileIndex, ProfileLink};
use crate::errors::DialogResult;
use crate::events::{notify, CallbackRegistration, DialogEvent, DialogObserver};
use crate::metrics::DialogMetrics;
use crate::persistence::{DialogStore, StoreOp, StoreQueue};
use crate::registry::{DestroyHook, DialogRegistry};
use crate::replication::ReplicationEvent;
use crate::timer::{Clock, KeepAliveList, KeepAliveSender, SystemClock, TimerEngine, TimerRemoval};

/// Global observers shared with the destroy hook
pub(crate) type ObserverList = Arc<RwLock<Vec<Arc<dyn DialogObserver>>>>;

/// Dialog tracking for one proxy instance
pub struct DialogTracker {
    pub(crate) config: TrackerConfig,
    pub(crate) registry: Arc<DialogRegistry>,
    pub(crate) timers: TimerEngine,
    pub(crate) profiles: Arc<ProfileIndex>,
    pub(crate) keepalives: Arc<KeepAliveList>,
    pub(crate) metrics: DialogMetrics,
    pub(crate) observers: ObserverList,
    pub(crate) keepalive_sender: RwLock<Option<Arc<dyn KeepAliveSender>>>,
    pub(crate) store: RwLock<Option<Arc<dyn DialogStore>>>,
    pub(crate) store_queue: Arc<StoreQueue>,
    pub(crate) replication_tx: broadcast::Sender<ReplicationEvent>,
}

impl DialogTracker {
    /// Create a tracker driven by the system clock
    pub fn new(config: TrackerConfig) -> DialogResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a tracker reading time from `clock`
    pub fn with_clock(config: TrackerConfig, clock: Arc<dyn Clock>) -> DialogResult<Self> {
        config.validate()?;

        let registry = Arc::new(DialogRegistry::from_config(&config, clock.clone())?);
        let timers = TimerEngine::new(clock);
        let profiles = Arc::new(ProfileIndex::new());
        let keepalives = Arc::new(KeepAliveList::new());
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));
        let store_queue = Arc::new(StoreQueue::default());
        let (replication_tx, _) = broadcast::channel(config.replication_capacity);

        registry.add_destroy_hook(Arc::new(LifecycleHook {
            profiles: profiles.clone(),
            keepalives: keepalives.clone(),
            observers: observers.clone(),
            store_queue: store_queue.clone(),
            replication_tx: replication_tx.clone(),
            persist: config.db_mode != DbMode::None,
        }));

        debug!(
            hash_size = config.hash_size,
            tracking_mode = ?config.tracking_mode,
            db_mode = ?config.db_mode,
            "dialog tracker created"
        );

        Ok(Self {
            config,
            registry,
            timers,
            profiles,
            keepalives,
            metrics: DialogMetrics::new(),
            observers,
            keepalive_sender: RwLock::new(None),
            store: RwLock::new(None),
            store_queue,
            replication_tx,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Underlying registry
    pub fn registry(&self) -> &Arc<DialogRegistry> {
        &self.registry
    }

    /// Underlying timer engine
    pub fn timers(&self) -> &TimerEngine {
        &self.timers
    }

    /// Gauges and counters
    pub fn metrics(&self) -> &DialogMetrics {
        &self.metrics
    }

    /// Profile index
    pub fn profiles(&self) -> &ProfileIndex {
        &self.profiles
    }

    /// Install the collaborator that sends keep-alive probes
    pub fn set_keepalive_sender(&self, sender: Arc<dyn KeepAliveSender>) {
        *self.keepalive_sender.write() = Some(sender);
    }

    /// Deliver an event to per-dialog registrations, then to global observers.
    ///
    /// Must be called with no bucket or timer lock held.
    pub(crate) fn emit(&self, registrations: &[CallbackRegistration], event: DialogEvent) {
        notify(registrations, &event);
        let observers: Vec<Arc<dyn DialogObserver>> = self.observers.read().clone();
        for observer in observers {
            observer.on_dialog_event(&event);
        }
    }

    /// Arm the dialog's timer under its bucket lock and take the timer reference
    pub(crate) fn arm_timer(&self, id: DialogId, lifetime: u32) -> bool {
        self.registry
            .with_dialog_mut(id, |dialog| arm_timer_locked(&self.timers, dialog, lifetime))
            .unwrap_or(false)
    }

    pub(crate) fn schedule_keepalive(&self, id: DialogId) {
        if let Some(interval) = self.config.keepalive_interval {
            let flagged = self
                .registry
                .with_dialog_mut(id, |dialog| {
                    if dialog.is_replicated() {
                        return false;
                    }
                    dialog.flags.insert(DialogFlags::KEEPALIVE);
                    true
                })
                .unwrap_or(false);
            if flagged {
                self.keepalives.add(id, self.timers.now() + interval.as_secs());
            }
        }
    }

    pub(crate) fn unlink_profiles(&self, links: &[ProfileLink]) {
        for link in links {
            self.profiles.unlink(link);
        }
    }

    /// Broadcast an event about a locally owned dialog
    pub(crate) fn replicate(&self, event: ReplicationEvent) {
        if self.replication_tx.receiver_count() == 0 {
            return;
        }
        if let Err(e) = self.replication_tx.send(event) {
            debug!(error = %e, "replication event dropped");
        }
    }

    pub(crate) fn replicate_state(&self, snapshot: Option<DialogSnapshot>) {
        if let Some(snapshot) = snapshot {
            if !snapshot.flags.contains(DialogFlags::REPLICATED) {
                self.replicate(ReplicationEvent::StateChanged { snapshot });
            }
        }
    }

    /// Release references, logging when the dialog is already gone
    pub(crate) fn release(&self, id: DialogId, count: u32) -> bool {
        if count == 0 {
            return false;
        }
        self.registry.unref(id, count)
    }
}

impl std::fmt::Debug for DialogTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogTracker")
            .field("registry", &self.registry)
            .field("timers", &self.timers)
            .field("keepalives", &self.keepalives.len())
            .finish_non_exhaustive()
    }
}

/// Insert the timer for a dialog whose bucket lock is held.
///
/// Takes one reference for the entry. A timer that is already armed is
/// re-armed instead and keeps its reference.
pub(crate) fn arm_timer_locked(timers: &TimerEngine, dialog: &mut Dialog, lifetime: u32) -> bool {
    let id = dialog.id();
    if timers.update(id, lifetime) == TimerRemoval::Removed {
        dialog.deadline = timers.deadline_of(id);
        return true;
    }
    match timers.insert(id, lifetime) {
        Ok(deadline) => {
            dialog.ref_count += 1;
            dialog.deadline = Some(deadline);
            true
        }
        Err(e) => {
            error!(dialog = %id, error = %e, "failed to arm dialog timer");
            false
        }
    }
}

/// Remove the timer for a dialog whose bucket lock is held.
///
/// Returns whether an entry was removed; its reference is released by the
/// caller once the lock is dropped.
pub(crate) fn disarm_timer_locked(timers: &TimerEngine, dialog: &mut Dialog) -> bool {
    dialog.deadline = None;
    match timers.remove(dialog.id()) {
        TimerRemoval::Removed => true,
        TimerRemoval::NotPresent => false,
        TimerRemoval::Invalid => {
            error!(dialog = %dialog.id(), "timer removal on unlinked dialog");
            false
        }
    }
}

/// Facts captured under the bucket lock during a transition and acted on
/// after it is released
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub callbacks: Vec<CallbackRegistration>,
    pub profiles: Vec<ProfileLink>,
    pub snapshot: Option<DialogSnapshot>,
    pub timer_removed: bool,
    pub lifetime: u32,
    pub replicated: bool,
}

impl Captured {
    /// Copy what every transition needs from the record
    pub fn from_dialog(dialog: &Dialog) -> Self {
        Self {
            callbacks: dialog.callbacks.clone(),
            lifetime: dialog.lifetime,
            replicated: dialog.is_replicated(),
            ..Self::default()
        }
    }
}

/// Cleans up tracker-side state when the registry destroys a record
struct LifecycleHook {
    profiles: Arc<ProfileIndex>,
    keepalives: Arc<KeepAliveList>,
    observers: ObserverList,
    store_queue: Arc<StoreQueue>,
    replication_tx: broadcast::Sender<ReplicationEvent>,
    persist: bool,
}

impl DestroyHook for LifecycleHook {
    fn on_destroy(&self, dialog: &Dialog) {
        for link in dialog.profiles() {
            self.profiles.unlink(link);
        }
        if dialog.flags.contains(DialogFlags::KEEPALIVE) {
            self.keepalives.remove(dialog.id());
        }
        if dialog.deadline().is_some() {
            warn!(dialog = %dialog.id(), "dialog destroyed with a deadline still recorded");
        }

        if !dialog.is_replicated() {
            if self.persist {
                self.store_queue.push(StoreOp::Delete(dialog.id()));
            }
            if self.replication_tx.receiver_count() > 0 {
                let _ = self.replication_tx.send(ReplicationEvent::Removed { id: dialog.id() });
            }
        }

        let event = DialogEvent::Destroyed {
            id: dialog.id(),
            call_id: dialog.call_id.clone(),
        };
        let observers: Vec<Arc<dyn DialogObserver>> = self.observers.read().clone();
        for observer in observers {
            observer.on_dialog_event(&event);
        }
    }
}

