//! The dialog registry
//!
//! A fixed array of independently locked buckets. A dialog lives in the
//! bucket its Call-ID hashes to and is identified by `(bucket, seq)`.
//!
//! ## Reference counting
//!
//! Every linked dialog carries an explicit reference count:
//!
//! - the registry linkage itself holds one reference,
//! - every armed timer holds one,
//! - every successful lookup hands one to the caller,
//! - collaborators (transaction bindings, keep-alive, ...) take their own
//!   with [`DialogRegistry::ref_dialog`].
//!
//! The record is unlinked exactly when the count drops to zero, under the
//! bucket lock, and destroyed after the lock is released so destroy hooks
//! and callbacks may call back into the registry.
//!
//! ## Reserve-on-miss
//!
//! ```text
//! find_by_sip_identity(.., reserve = true)
//!     ├── Found { id }            +1 ref, lock released
//!     ├── NotFound                 lock released
//!     └── Reserved(reservation)    lock still held
//!             ├── reservation.link(dialog, extra)   link, then release
//!             └── reservation.release() / drop       release only
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, error, warn};

use crate::branch::BranchHandle;
use crate::config::{TrackerConfig, TrackingMode};
use crate::dialog::{Dialog, DialogFlags, DialogId, DialogSnapshot};
use crate::errors::{DialogError, DialogResult};
use crate::events::{notify, CallbackRegistration, DialogEvent};
use crate::registry::bucket::{Bucket, BucketGuard};
use crate::registry::matching::{match_identity, Direction};
use crate::state_machine::{next_state, Transition, TransitionContext, TransitionEvent};
use crate::timer::Clock;

/// Identity handed out by `link` and lookups.
///
/// Every handle returned by a lookup carries one reference that the holder
/// must give back with [`DialogRegistry::unref`].
pub type DialogHandle = DialogId;

/// Hook run once for every destroyed record, with no bucket lock held
pub trait DestroyHook: Send + Sync {
    /// The record is about to be dropped
    fn on_destroy(&self, dialog: &Dialog);
}

/// Outcome of [`DialogRegistry::find_by_sip_identity`]
pub enum SipLookup<'r> {
    /// A dialog matched; one reference was taken for the caller
    Found { id: DialogHandle, direction: Direction },
    /// Nothing matched and the bucket lock was released
    NotFound,
    /// Nothing matched and the bucket lock is still held
    Reserved(BucketReservation<'r>),
}

impl std::fmt::Debug for SipLookup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipLookup::Found { id, direction } => write!(f, "Found({}, {})", id, direction),
            SipLookup::NotFound => write!(f, "NotFound"),
            SipLookup::Reserved(r) => write!(f, "Reserved(bucket {})", r.bucket()),
        }
    }
}

/// Bucket lock held across a failed lookup.
///
/// Dropping the reservation releases the lock.
pub struct BucketReservation<'r> {
    registry: &'r DialogRegistry,
    guard: BucketGuard<'r>,
}

impl<'r> BucketReservation<'r> {
    /// Reserved bucket
    pub fn bucket(&self) -> u32 {
        self.guard.bucket()
    }

    /// Lock depth held by this thread
    pub fn depth(&self) -> usize {
        self.guard.depth()
    }

    /// Link a new dialog under the held lock, then release it
    pub fn link(self, dialog: Dialog, extra_refs: u32) -> DialogResult<DialogHandle> {
        self.registry.link_locked(&self.guard, dialog, extra_refs)
    }

    /// Release the lock without linking
    pub fn release(self) {}
}

/// Result of applying a state machine event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransition<R> {
    /// Table result
    pub transition: Transition,
    /// The transition's own reference change destroyed the record
    pub destroyed: bool,
    /// Value returned by the transition hook
    pub value: Option<R>,
}

/// Sharded, reference-counted dialog table
pub struct DialogRegistry {
    buckets: Box<[Bucket]>,
    mask: u32,
    mode: TrackingMode,
    max_dialogs: Option<usize>,
    linked: AtomicUsize,
    clock: Arc<dyn Clock>,
    destroy_hooks: RwLock<Vec<Arc<dyn DestroyHook>>>,
}

impl DialogRegistry {
    /// Create a registry with `hash_size` buckets (a power of two)
    pub fn new(hash_size: u32, clock: Arc<dyn Clock>) -> DialogResult<Self> {
        if hash_size == 0 || !hash_size.is_power_of_two() {
            return Err(DialogError::config_error(format!(
                "hash_size must be a power of two, got {}",
                hash_size
            )));
        }

        let mut rng = rand::thread_rng();
        let seed_range = u64::from(hash_size) * 3;
        let buckets: Vec<Bucket> = (0..hash_size)
            .map(|index| {
                let seed = (rng.gen_range(0..seed_range) % u64::from(u32::MAX)) as u32;
                Bucket::new(index, seed)
            })
            .collect();

        debug!(hash_size, "dialog registry created");

        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            mask: hash_size - 1,
            mode: TrackingMode::Single,
            max_dialogs: None,
            linked: AtomicUsize::new(0),
            clock,
            destroy_hooks: RwLock::new(Vec::new()),
        })
    }

    /// Create a registry from the tracker configuration
    pub fn from_config(config: &TrackerConfig, clock: Arc<dyn Clock>) -> DialogResult<Self> {
        let mut registry = Self::new(config.hash_size, clock)?;
        registry.mode = config.tracking_mode;
        registry.max_dialogs = config.max_dialogs;
        Ok(registry)
    }

    /// Select single or forking transitions
    pub fn with_tracking_mode(mut self, mode: TrackingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Limit the number of linked dialogs
    pub fn with_max_dialogs(mut self, max: usize) -> Self {
        self.max_dialogs = Some(max);
        self
    }

    /// Run `hook` for every destroyed record
    pub fn add_destroy_hook(&self, hook: Arc<dyn DestroyHook>) {
        self.destroy_hooks.write().push(hook);
    }

    /// Tracking mode in use
    pub fn tracking_mode(&self) -> TrackingMode {
        self.mode
    }

    /// Number of buckets
    pub fn hash_size(&self) -> u32 {
        self.mask + 1
    }

    /// Current engine time
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Bucket a Call-ID hashes to (32-bit FNV-1a, stable across restarts)
    pub fn bucket_index(&self, call_id: &str) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in call_id.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash & self.mask
    }

    /// Number of linked dialogs
    pub fn len(&self) -> usize {
        self.linked.load(Ordering::SeqCst)
    }

    /// Whether no dialog is linked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket(&self, index: u32) -> Option<&Bucket> {
        self.buckets.get(index as usize)
    }

    fn check_capacity(&self) -> DialogResult<()> {
        if let Some(max) = self.max_dialogs {
            if self.len() >= max {
                return Err(DialogError::allocation_failed(format!("dialog limit of {} reached", max)));
            }
        }
        Ok(())
    }

    /// Allocate an unlinked record owned by the caller
    pub fn create(
        &self,
        call_id: &str,
        from_uri: &str,
        to_uri: &str,
        from_tag: &str,
        request_uri: &str,
    ) -> DialogResult<Dialog> {
        self.check_capacity()?;
        Ok(Dialog::new(
            self.bucket_index(call_id),
            call_id.to_string(),
            from_uri.to_string(),
            to_uri.to_string(),
            from_tag.to_string(),
            request_uri.to_string(),
            self.clock.now(),
        ))
    }

    /// Link a record, giving it an identity and `1 + extra_refs` references
    pub fn link(&self, dialog: Dialog, extra_refs: u32) -> DialogResult<DialogHandle> {
        let bucket = self
            .bucket(dialog.id.bucket)
            .ok_or_else(|| DialogError::invariant(format!("bucket {} out of range", dialog.id.bucket)))?;
        let guard = bucket.lock();
        self.link_locked(&guard, dialog, extra_refs)
    }

    pub(crate) fn link_locked(&self, guard: &BucketGuard<'_>, mut dialog: Dialog, extra_refs: u32) -> DialogResult<DialogHandle> {
        if dialog.id.bucket != guard.bucket() {
            error!(expected = guard.bucket(), actual = dialog.id.bucket, "linking dialog into foreign bucket");
            return Err(DialogError::invariant(format!(
                "dialog for bucket {} linked under bucket {}",
                dialog.id.bucket,
                guard.bucket()
            )));
        }
        if dialog.id.is_set() {
            return Err(DialogError::invariant(format!("dialog {} is already linked", dialog.id)));
        }
        self.check_capacity()?;

        let mut entries = guard.entries_mut()?;
        let seq = entries.allocate_seq();
        dialog.id = DialogId::new(guard.bucket(), seq);
        dialog.ref_count = 1 + i64::from(extra_refs);
        let id = dialog.id;
        entries.dialogs.push(dialog);
        self.linked.fetch_add(1, Ordering::SeqCst);

        debug!(dialog = %id, refs = 1 + extra_refs, "dialog linked");
        Ok(id)
    }

    /// Link a record under a previously assigned identity (rehydration, replication)
    pub fn link_with_id(&self, mut dialog: Dialog, id: DialogId, extra_refs: u32) -> DialogResult<DialogHandle> {
        let computed = self.bucket_index(&dialog.call_id);
        if computed != id.bucket {
            return Err(DialogError::HashMismatch {
                call_id: dialog.call_id.clone(),
                stored_bucket: id.bucket,
                computed_bucket: computed,
            });
        }
        if !id.is_set() {
            return Err(DialogError::invariant("cannot link with an unset identity"));
        }
        self.check_capacity()?;

        let bucket = self
            .bucket(id.bucket)
            .ok_or_else(|| DialogError::invariant(format!("bucket {} out of range", id.bucket)))?;
        let guard = bucket.lock();
        let mut entries = guard.entries_mut()?;
        if entries.position(id.seq).is_some() {
            return Err(DialogError::invariant(format!("identity {} already linked", id)));
        }
        if entries.next_id < id.seq {
            entries.next_id = id.seq;
        }

        dialog.id = id;
        dialog.ref_count = 1 + i64::from(extra_refs);
        entries.dialogs.push(dialog);
        self.linked.fetch_add(1, Ordering::SeqCst);

        debug!(dialog = %id, "dialog linked with stored identity");
        Ok(id)
    }

    /// Look a dialog up by identity, taking one reference on a hit
    pub fn find_by_id(&self, bucket: u32, seq: u32) -> Option<DialogHandle> {
        if seq == 0 {
            return None;
        }
        let guard = self.bucket(bucket)?.lock();
        let mut entries = guard.entries_mut().ok()?;
        let index = entries.position(seq)?;
        let dialog = &mut entries.dialogs[index];
        dialog.ref_count += 1;
        Some(dialog.id)
    }

    /// Look a dialog up by Call-ID and tags, taking one reference on a hit.
    ///
    /// With `reserve` set and no to-tag, a miss keeps the bucket locked and
    /// returns [`SipLookup::Reserved`].
    pub fn find_by_sip_identity(&self, call_id: &str, from_tag: &str, to_tag: Option<&str>, reserve: bool) -> SipLookup<'_> {
        let index = self.bucket_index(call_id);
        let Some(bucket) = self.bucket(index) else {
            return SipLookup::NotFound;
        };
        let guard = bucket.lock();

        let found = match guard.entries_mut() {
            Ok(mut entries) => {
                let mut candidate: Option<(usize, Direction)> = None;
                for (i, dialog) in entries.dialogs.iter().enumerate() {
                    if let Some(direction) = match_identity(dialog, call_id, from_tag, to_tag) {
                        let live = !dialog.state.is_terminated();
                        if live || candidate.is_none() {
                            candidate = Some((i, direction));
                        }
                        if live {
                            break;
                        }
                    }
                }
                candidate.map(|(i, direction)| {
                    let dialog = &mut entries.dialogs[i];
                    dialog.ref_count += 1;
                    (dialog.id, direction)
                })
            }
            Err(_) => return SipLookup::NotFound,
        };

        match found {
            Some((id, direction)) => SipLookup::Found { id, direction },
            None if reserve && to_tag.map_or(true, str::is_empty) => SipLookup::Reserved(BucketReservation {
                registry: self,
                guard,
            }),
            None => SipLookup::NotFound,
        }
    }

    /// Take `count` additional references
    pub fn ref_dialog(&self, id: DialogHandle, count: u32) -> bool {
        let found = self.with_dialog_mut(id, |dialog| {
            dialog.ref_count += i64::from(count);
        });
        if found.is_none() {
            warn!(dialog = %id, count, "ref on unknown dialog");
        }
        found.is_some()
    }

    /// Release `count` references; returns true when the record was destroyed
    pub fn unref(&self, id: DialogHandle, count: u32) -> bool {
        let Some(bucket) = self.bucket(id.bucket) else {
            error!(dialog = %id, "unref on out-of-range bucket");
            return false;
        };

        let removed = {
            let guard = bucket.lock();
            let Ok(mut entries) = guard.entries_mut() else {
                return false;
            };
            let Some(index) = entries.position(id.seq) else {
                warn!(dialog = %id, count, "unref on unknown dialog");
                return false;
            };

            let dialog = &mut entries.dialogs[index];
            dialog.ref_count -= i64::from(count);
            if dialog.ref_count < 0 {
                error!(dialog = %id, refs = dialog.ref_count, "reference count dropped below zero");
            }
            if dialog.ref_count <= 0 {
                self.linked.fetch_sub(1, Ordering::SeqCst);
                Some(entries.dialogs.remove(index))
            } else {
                None
            }
        };

        match removed {
            Some(dialog) => {
                self.destroy(dialog);
                true
            }
            None => false,
        }
    }

    /// Unlink and destroy a record regardless of its references
    pub fn force_remove(&self, id: DialogHandle) -> bool {
        let Some(bucket) = self.bucket(id.bucket) else {
            return false;
        };
        let removed = {
            let guard = bucket.lock();
            let Ok(mut entries) = guard.entries_mut() else {
                return false;
            };
            entries.position(id.seq).map(|index| entries.dialogs.remove(index))
        };

        match removed {
            Some(dialog) => {
                self.linked.fetch_sub(1, Ordering::SeqCst);
                warn!(dialog = %id, refs = dialog.ref_count, "dialog removed with outstanding references");
                self.destroy(dialog);
                true
            }
            None => false,
        }
    }

    fn destroy(&self, dialog: Dialog) {
        debug!(dialog = %dialog.id, call_id = %dialog.call_id, "destroying dialog");
        let hooks: Vec<Arc<dyn DestroyHook>> = self.destroy_hooks.read().clone();
        for hook in hooks {
            hook.on_destroy(&dialog);
        }
        let event = DialogEvent::Destroyed {
            id: dialog.id,
            call_id: dialog.call_id.clone(),
        };
        notify(&dialog.callbacks, &event);
    }

    /// Read a dialog under its bucket lock
    pub fn with_dialog<R>(&self, id: DialogHandle, f: impl FnOnce(&Dialog) -> R) -> Option<R> {
        let guard = self.bucket(id.bucket)?.lock();
        let entries = guard.entries().ok()?;
        let index = entries.position(id.seq)?;
        Some(f(&entries.dialogs[index]))
    }

    /// Mutate a dialog under its bucket lock
    pub fn with_dialog_mut<R>(&self, id: DialogHandle, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        if !id.is_set() {
            return None;
        }
        let guard = self.bucket(id.bucket)?.lock();
        let mut entries = guard.entries_mut().ok()?;
        let index = entries.position(id.seq)?;
        Some(f(&mut entries.dialogs[index]))
    }

    /// Snapshot of one dialog
    pub fn snapshot(&self, id: DialogHandle) -> Option<DialogSnapshot> {
        let now = self.clock.now();
        self.with_dialog(id, |dialog| dialog.snapshot(now))
    }

    /// Per-dialog registrations, copied out so they can run unlocked
    pub fn callbacks_of(&self, id: DialogHandle) -> Vec<CallbackRegistration> {
        self.with_dialog(id, |dialog| dialog.callbacks.clone()).unwrap_or_default()
    }

    /// Register a per-dialog observer
    pub fn register_callback(&self, id: DialogHandle, registration: CallbackRegistration) -> bool {
        self.with_dialog_mut(id, |dialog| dialog.add_callback(registration)).is_some()
    }

    /// Evaluate the state machine for a dialog under its bucket lock.
    ///
    /// The transition's state, flag, branch and reference effects are
    /// applied, then `hook` runs on the updated record while the lock is
    /// still held. Invalid transitions are logged and leave the record
    /// untouched; the hook does not run for them. Returns `None` when the
    /// dialog is not linked.
    pub fn apply_event<R>(
        &self,
        id: DialogHandle,
        event: TransitionEvent,
        to_tag: Option<&str>,
        hook: impl FnOnce(&mut Dialog, &Transition) -> R,
    ) -> Option<AppliedTransition<R>> {
        self.apply_event_if(id, event, to_tag, |_| true, hook)
    }

    /// Like [`apply_event`](Self::apply_event), but only when `guard`
    /// accepts the record as found under the lock.
    ///
    /// A rejected record is left untouched: the returned transition stays
    /// in the current state and carries no value.
    pub fn apply_event_if<R>(
        &self,
        id: DialogHandle,
        event: TransitionEvent,
        to_tag: Option<&str>,
        guard: impl FnOnce(&Dialog) -> bool,
        hook: impl FnOnce(&mut Dialog, &Transition) -> R,
    ) -> Option<AppliedTransition<R>> {
        let to_tag = to_tag.filter(|t| !t.is_empty());
        let bucket = self.bucket(id.bucket)?;

        let (applied, removed) = {
            let lock = bucket.lock();
            let mut entries = lock.entries_mut().ok()?;
            let index = entries.position(id.seq)?;
            let dialog = &mut entries.dialogs[index];

            if !guard(&*dialog) {
                return Some(AppliedTransition {
                    transition: Transition::stay(dialog.state),
                    destroyed: false,
                    value: None,
                });
            }

            let mut ctx = match self.mode {
                TrackingMode::Single => TransitionContext::single(),
                TrackingMode::Forking => TransitionContext::forking(),
            }
            .with_bye(dialog.flags.contains(DialogFlags::HAS_BYE));

            if self.mode == TrackingMode::Forking {
                if let Some(tag) = to_tag {
                    let is_response = matches!(
                        event,
                        TransitionEvent::Provisional | TransitionEvent::Final2xx | TransitionEvent::Final3xxPlus
                    );
                    if is_response && dialog.branches.get(tag).is_none() {
                        let to_uri = dialog.to_uri.clone();
                        dialog.branches.add(tag, &to_uri);
                    }
                }
                let tag_confirmed = to_tag
                    .map(|tag| dialog.branches.is_confirmed(tag) || dialog.to_tag.as_deref() == Some(tag))
                    .unwrap_or(false);
                ctx = ctx.with_branches(tag_confirmed, dialog.branches.active_except(to_tag));
            }

            let transition = next_state(dialog.state, event, &ctx);
            if transition.violation {
                error!(
                    dialog = %id,
                    state = %dialog.state,
                    event = %event,
                    "invalid dialog transition ignored"
                );
                return Some(AppliedTransition {
                    transition,
                    destroyed: false,
                    value: None,
                });
            }

            let effects = transition.effects;
            if effects.set_has_bye {
                dialog.flags.insert(DialogFlags::HAS_BYE);
            }
            if effects.mark_all_branches {
                dialog.branches.mark_all_for_deletion();
            }
            if let Some(tag) = to_tag {
                if effects.mark_event_branch {
                    dialog.branches.mark_for_deletion(tag);
                }
                if effects.confirm_event_branch {
                    if let Some(branch) = dialog.branches.get_mut(tag) {
                        branch.confirmed = true;
                        branch.deleted = false;
                    }
                }
                if effects.mark_other_branches {
                    dialog.branches.mark_others_for_deletion(tag);
                }
            }

            if transition.changed() {
                debug!(
                    dialog = %id,
                    from = %transition.old_state,
                    to = %transition.new_state,
                    event = %event,
                    "dialog state changed"
                );
            }
            dialog.set_state(transition.new_state);
            dialog.ref_count += i64::from(transition.ref_delta);

            let value = hook(dialog, &transition);

            let removed = if dialog.ref_count <= 0 {
                if dialog.ref_count < 0 {
                    error!(dialog = %id, refs = dialog.ref_count, "reference count dropped below zero");
                }
                self.linked.fetch_sub(1, Ordering::SeqCst);
                Some(entries.dialogs.remove(index))
            } else {
                None
            };

            (
                AppliedTransition {
                    transition,
                    destroyed: removed.is_some(),
                    value: Some(value),
                },
                removed,
            )
        };

        if let Some(dialog) = removed {
            self.destroy(dialog);
        }
        Some(applied)
    }

    /// Add a branch to a dialog
    pub fn add_branch(&self, id: DialogHandle, to_tag: &str, to_uri: &str) -> Option<BranchHandle> {
        if to_tag.is_empty() {
            return None;
        }
        self.with_dialog_mut(id, |dialog| {
            dialog.branches.add(to_tag, to_uri);
            BranchHandle {
                dialog: id,
                to_tag: to_tag.to_string(),
            }
        })
    }

    /// Record the remote routing information carried by a branch's response
    pub fn update_branch_leg(
        &self,
        branch: &BranchHandle,
        contact: Option<&str>,
        route_set: &[String],
        cseq: Option<u32>,
    ) -> bool {
        self.with_dialog_mut(branch.dialog, |dialog| match dialog.branches.get_mut(&branch.to_tag) {
            Some(entry) => {
                if let Some(contact) = contact {
                    entry.contact = Some(contact.to_string());
                }
                if !route_set.is_empty() {
                    entry.route_set = route_set.to_vec();
                }
                if cseq.is_some() {
                    entry.cseq = cseq;
                }
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    /// Flag a branch as obsolete
    pub fn mark_for_deletion(&self, branch: &BranchHandle) -> bool {
        self.with_dialog_mut(branch.dialog, |dialog| dialog.branches.mark_for_deletion(&branch.to_tag))
            .unwrap_or(false)
    }

    /// Drop every flagged branch of a dialog
    pub fn reap_marked(&self, id: DialogHandle) -> usize {
        self.with_dialog_mut(id, |dialog| dialog.branches.reap_marked()).unwrap_or(0)
    }

    /// Identities of every dialog satisfying `predicate`, one bucket locked at a time
    pub fn ids_where(&self, mut predicate: impl FnMut(&Dialog) -> bool) -> Vec<DialogId> {
        let mut ids = Vec::new();
        for bucket in self.buckets.iter() {
            let guard = bucket.lock();
            let Ok(entries) = guard.entries() else {
                continue;
            };
            ids.extend(entries.dialogs.iter().filter(|d| predicate(d)).map(|d| d.id));
        }
        ids
    }

    /// Snapshots of every dialog satisfying `predicate`, one bucket locked at a time
    pub fn snapshots_where(&self, mut predicate: impl FnMut(&Dialog) -> bool) -> Vec<DialogSnapshot> {
        let now = self.clock.now();
        let mut snapshots = Vec::new();
        for bucket in self.buckets.iter() {
            let guard = bucket.lock();
            let Ok(entries) = guard.entries() else {
                continue;
            };
            snapshots.extend(entries.dialogs.iter().filter(|d| predicate(d)).map(|d| d.snapshot(now)));
        }
        snapshots
    }

    /// Lock the bucket a Call-ID hashes to; used to observe reentrancy
    pub fn lock_bucket_for(&self, call_id: &str) -> Option<BucketGuard<'_>> {
        self.bucket(self.bucket_index(call_id)).map(|b| b.lock())
    }
}

impl std::fmt::Debug for DialogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogRegistry")
            .field("hash_size", &self.hash_size())
            .field("mode", &self.mode)
            .field("linked", &self.len())
            .finish()
    }
}
