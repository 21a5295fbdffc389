//! Inspection and administration
//!
//! Read-only enumeration, forced termination, dialog variables, profile
//! membership and observer registration. Everything here is built on the
//! registry operations and copies records out under their bucket lock.

use std::sync::Arc;

use tracing::{debug, info};

use crate::dialog::{DialogFlags, DialogId, DialogSnapshot, DialogState, ProfileLink};
use crate::dispatch::DialogTracker;
use crate::errors::{DialogError, DialogResult};
use crate::events::{CallbackMask, CallbackRegistration, DialogObserver, TerminationReason};
use crate::replication::ReplicationEvent;

/// Selection of dialogs for [`DialogTracker::list_dialogs`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialogFilter {
    pub id: Option<DialogId>,
    pub call_id: Option<String>,
    pub state: Option<DialogState>,
    /// Profile name and optional value
    pub profile: Option<(String, Option<String>)>,
}

impl DialogFilter {
    /// Matches every dialog
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: DialogId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_call_id(call_id: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..Self::default()
        }
    }

    pub fn in_state(mut self, state: DialogState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn in_profile(mut self, profile: impl Into<String>, value: Option<&str>) -> Self {
        self.profile = Some((profile.into(), value.map(str::to_string)));
        self
    }
}

impl DialogTracker {
    /// Snapshots of the dialogs selected by `filter`, ordered by identity
    pub fn list_dialogs(&self, filter: &DialogFilter) -> DialogResult<Vec<DialogSnapshot>> {
        let members = match &filter.profile {
            Some((name, value)) => Some(self.profiles.members(name, value.as_deref())?),
            None => None,
        };

        let mut snapshots = self.registry.snapshots_where(|d| {
            filter.id.map_or(true, |id| d.id() == id)
                && filter.call_id.as_deref().map_or(true, |c| d.call_id == c)
                && filter.state.map_or(true, |s| d.state() == s)
                && members.as_ref().map_or(true, |m| m.binary_search(&d.id()).is_ok())
        });
        snapshots.sort_by_key(|s| s.id);
        Ok(snapshots)
    }

    /// Number of linked dialogs
    pub fn dialog_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of one dialog
    pub fn snapshot(&self, id: DialogId) -> Option<DialogSnapshot> {
        self.registry.snapshot(id)
    }

    /// Terminate an answered dialog as if a BYE had been routed.
    ///
    /// Returns `Ok(false)` when the dialog exists but is not answered.
    pub fn terminate(&self, id: DialogId, reason: TerminationReason) -> DialogResult<bool> {
        info!(dialog = %id, reason = %reason, "terminate requested");
        self.end_dialog(id, reason)
    }

    /// Live dialogs split off from `id` for concurrently answering branches
    pub fn siblings(&self, id: DialogId) -> Vec<DialogId> {
        let recorded = self
            .registry
            .with_dialog(id, |d| d.siblings().to_vec())
            .unwrap_or_default();
        // the parent keeps ids of siblings that have since been destroyed
        recorded
            .into_iter()
            .filter(|sibling| self.registry.with_dialog(*sibling, |_| ()).is_some())
            .collect()
    }

    /// Set (`Some`) or delete (`None`) a dialog variable
    pub fn set_var(&self, id: DialogId, key: &str, value: Option<&str>) -> DialogResult<()> {
        let now = self.registry.now();
        let snapshot = self
            .registry
            .with_dialog_mut(id, |dialog| {
                match value {
                    Some(value) => {
                        dialog.vars.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        dialog.vars.remove(key);
                    }
                }
                dialog.flags.insert(DialogFlags::CHANGED);
                dialog.snapshot(now)
            })
            .ok_or_else(|| DialogError::not_found(id))?;

        if !snapshot.flags.contains(DialogFlags::REPLICATED) {
            self.replicate(ReplicationEvent::Updated { snapshot });
        }
        Ok(())
    }

    /// Value of a dialog variable
    pub fn get_var(&self, id: DialogId, key: &str) -> Option<String> {
        self.registry.with_dialog(id, |d| d.vars.get(key).cloned()).flatten()
    }

    /// Declare a profile
    pub fn define_profile(&self, name: &str, has_value: bool) -> DialogResult<()> {
        self.profiles.define(name, has_value)
    }

    /// Add a dialog to a profile
    pub fn set_profile(&self, id: DialogId, profile: &str, value: Option<&str>) -> DialogResult<()> {
        if self.registry.with_dialog(id, |_| ()).is_none() {
            return Err(DialogError::not_found(id));
        }

        let link = self.profiles.link(id, profile, value)?;
        let attached = self
            .registry
            .with_dialog_mut(id, |dialog| {
                dialog.profiles.push(link.clone());
                dialog.flags.insert(DialogFlags::CHANGED);
            })
            .is_some();

        if !attached {
            // Destroyed between the two steps
            self.profiles.unlink(&link);
            return Err(DialogError::not_found(id));
        }
        debug!(dialog = %id, profile, "dialog added to profile");
        Ok(())
    }

    /// Remove a dialog from a profile; `None` removes every value
    pub fn unset_profile(&self, id: DialogId, profile: &str, value: Option<&str>) -> DialogResult<bool> {
        let removed = self
            .registry
            .with_dialog_mut(id, |dialog| {
                let (removed, kept): (Vec<ProfileLink>, Vec<ProfileLink>) = std::mem::take(&mut dialog.profiles)
                    .into_iter()
                    .partition(|l| l.profile == profile && (value.is_none() || l.value.as_deref() == value));
                dialog.profiles = kept;
                removed
            })
            .ok_or_else(|| DialogError::not_found(id))?;

        self.unlink_profiles(&removed);
        Ok(!removed.is_empty())
    }

    /// Whether a dialog belongs to a profile, optionally with a given value
    pub fn is_in_profile(&self, id: DialogId, profile: &str, value: Option<&str>) -> bool {
        self.registry
            .with_dialog(id, |dialog| {
                dialog
                    .profiles()
                    .iter()
                    .any(|l| l.profile == profile && (value.is_none() || l.value.as_deref() == value))
            })
            .unwrap_or(false)
    }

    /// Number of dialogs in a profile
    pub fn profile_size(&self, profile: &str, value: Option<&str>) -> DialogResult<usize> {
        self.profiles.size(profile, value)
    }

    /// Register an observer for one dialog
    pub fn register_callback(
        &self,
        id: DialogId,
        mask: CallbackMask,
        observer: Arc<dyn DialogObserver>,
    ) -> DialogResult<()> {
        if self
            .registry
            .register_callback(id, CallbackRegistration::new(mask, observer))
        {
            Ok(())
        } else {
            Err(DialogError::not_found(id))
        }
    }

    /// Register an observer for every dialog
    pub fn add_observer(&self, observer: Arc<dyn DialogObserver>) {
        self.observers.write().push(observer);
    }
}
