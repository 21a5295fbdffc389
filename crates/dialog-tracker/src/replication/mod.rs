//! Dialog replication between proxy instances
//!
//! Locally owned dialogs publish a [`ReplicationEvent`] on every lifecycle
//! change through a `tokio::sync::broadcast` channel. Transport to peers is
//! the subscriber's concern; events round-trip through JSON.
//!
//! Inbound events are applied with [`DialogTracker::apply_replication`].
//! Records created that way are flagged `REPLICATED`: they keep their
//! timers but are never persisted, probed or re-broadcast locally, and no
//! SIP side effect runs for them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::dialog::{Dialog, DialogFlags, DialogId, DialogSnapshot, DialogState};
use crate::dispatch::tracker::{disarm_timer_locked, DialogTracker};
use crate::errors::{DialogError, DialogResult};

/// Lifecycle change of a dialog, as exchanged with peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationEvent {
    Created { snapshot: DialogSnapshot },
    Updated { snapshot: DialogSnapshot },
    StateChanged { snapshot: DialogSnapshot },
    Removed { id: DialogId },
}

impl ReplicationEvent {
    /// Dialog the event is about
    pub fn dialog_id(&self) -> DialogId {
        match self {
            ReplicationEvent::Created { snapshot }
            | ReplicationEvent::Updated { snapshot }
            | ReplicationEvent::StateChanged { snapshot } => snapshot.id,
            ReplicationEvent::Removed { id } => *id,
        }
    }

    pub fn to_json(&self) -> DialogResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(input: &str) -> DialogResult<Self> {
        Ok(serde_json::from_str(input)?)
    }
}

impl DialogTracker {
    /// Subscribe to events about locally owned dialogs
    pub fn subscribe_replication(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.replication_tx.subscribe()
    }

    /// Apply an event received from a peer
    pub fn apply_replication(&self, event: ReplicationEvent) -> DialogResult<()> {
        match event {
            ReplicationEvent::Removed { id } => {
                self.remove_replicated(id);
                Ok(())
            }
            ReplicationEvent::Created { snapshot }
            | ReplicationEvent::Updated { snapshot }
            | ReplicationEvent::StateChanged { snapshot } => {
                if snapshot.state == DialogState::Deleted {
                    self.remove_replicated(snapshot.id);
                    Ok(())
                } else {
                    self.upsert_replicated(&snapshot)
                }
            }
        }
    }

    fn upsert_replicated(&self, snapshot: &DialogSnapshot) -> DialogResult<()> {
        let id = snapshot.id;
        let now = self.registry.now();

        let existing = self.registry.with_dialog_mut(id, |dialog| {
            if !dialog.is_replicated() {
                return Err(DialogError::replication_error(format!(
                    "dialog {} is owned locally",
                    id
                )));
            }
            if dialog.call_id != snapshot.call_id {
                return Err(DialogError::replication_error(format!(
                    "dialog {} belongs to another call",
                    id
                )));
            }
            dialog.to_tag = snapshot.to_tag.clone();
            dialog.caller = snapshot.caller.clone();
            dialog.callee = snapshot.callee.clone();
            dialog.lifetime = snapshot.lifetime;
            dialog.start_ts = snapshot.start_ts;
            dialog.vars = snapshot.vars.clone();
            dialog.branches = snapshot.branches.clone();
            dialog.siblings = snapshot.siblings.clone();
            if snapshot.state.rank() >= dialog.state().rank() {
                dialog.set_state(snapshot.state);
            }
            if dialog.state().is_answered() && dialog.answered_tick.is_none() {
                dialog.answered_tick = Some(now);
            }
            Ok(dialog.state())
        });

        let state = match existing {
            Some(result) => result?,
            None => {
                let mut dialog = Dialog::from_snapshot(snapshot, now);
                dialog.flags = snapshot.flags;
                dialog.flags.insert(DialogFlags::REPLICATED);
                dialog.flags.remove(DialogFlags::KEEPALIVE);
                self.registry.link_with_id(dialog, id, 0)?;
                debug!(dialog = %id, "replicated dialog created");
                snapshot.state
            }
        };

        if state.is_answered() && !self.timers.contains(id) {
            let lifetime = snapshot
                .remaining_lifetime(chrono::Utc::now())
                .map(|secs| secs.clamp(1, i64::from(u32::MAX)) as u32)
                .unwrap_or(snapshot.lifetime.max(1));
            self.arm_timer(id, lifetime);
        }
        Ok(())
    }

    fn remove_replicated(&self, id: DialogId) {
        let removed = self.registry.with_dialog_mut(id, |dialog| {
            if !dialog.is_replicated() {
                return None;
            }
            dialog.set_state(DialogState::Deleted);
            Some(disarm_timer_locked(&self.timers, dialog))
        });

        match removed {
            Some(Some(timer_removed)) => {
                debug!(dialog = %id, "replicated dialog removed");
                self.release(id, 1 + u32::from(timer_removed));
            }
            Some(None) => warn!(dialog = %id, "ignoring removal of locally owned dialog"),
            None => debug!(dialog = %id, "removal for unknown replicated dialog"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_roundtrip() {
        let event = ReplicationEvent::Removed {
            id: DialogId::new(3, 17),
        };
        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"removed\""));
        let decoded = ReplicationEvent::from_json(&json).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.dialog_id(), DialogId::new(3, 17));
    }

    #[test]
    fn test_malformed_event_is_serialization_error() {
        assert!(matches!(
            ReplicationEvent::from_json("{\"type\":\"bogus\"}"),
            Err(DialogError::Serialization { .. })
        ));
    }
}
