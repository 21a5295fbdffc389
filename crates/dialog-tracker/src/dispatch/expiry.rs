//! Timer expiry, stale sweep and keep-alive
//!
//! Expiry honours the timer lock order: the engine removes due entries and
//! releases its lock, and only then is each dialog's bucket locked to run
//! the forced BYE.

use tracing::{debug, info, warn};

use crate::dialog::{Dialog, DialogFlags, DialogId, DialogState};
use crate::dispatch::tracker::{disarm_timer_locked, Captured, DialogTracker};
use crate::errors::{DialogError, DialogResult};
use crate::events::{DialogEvent, TerminationReason};
use crate::state_machine::TransitionEvent;
use crate::timer::{TimerEntry, TimerRemoval};

/// Outcome of one stale-dialog sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Unconfirmed dialogs removed
    pub removed: usize,
    /// Answered dialogs still waiting for ACK whose timer was shortened
    pub ack_timeouts: usize,
}

impl DialogTracker {
    /// Fire every due timer; returns how many fired
    pub fn tick(&self) -> usize {
        self.timers.tick_with(|entry| self.on_timer_expired(entry))
    }

    /// Handle one expired timer entry, which carried one reference.
    ///
    /// An entry whose deadline no longer matches the record was re-armed
    /// after it was taken from the wheel; only its reference is released.
    /// A dialog that never got past the answer cannot be ended by BYE, so
    /// it is torn down directly.
    pub fn on_timer_expired(&self, entry: TimerEntry) {
        let id = entry.dialog;
        let due = |dialog: &Dialog| dialog.deadline == Some(entry.deadline);

        let abandoned = self.registry.with_dialog_mut(id, |dialog| {
            if !due(&*dialog) || !dialog.state().is_pre_answer() {
                return None;
            }
            let old_state = dialog.state();
            let mut captured = Captured::from_dialog(dialog);
            dialog.deadline = None;
            dialog.set_state(DialogState::Deleted);
            captured.profiles = std::mem::take(&mut dialog.profiles);
            dialog.flags.insert(DialogFlags::CHANGED);
            captured.snapshot = Some(dialog.snapshot(self.registry.now()));
            Some((old_state, captured))
        });
        if let Some(Some((old_state, captured))) = abandoned {
            warn!(dialog = %id, state = %old_state, "unanswered dialog timed out");
            self.metrics.record_failed(old_state == DialogState::Early);
            self.unlink_profiles(&captured.profiles);
            self.replicate_state(captured.snapshot.clone());
            self.emit(&captured.callbacks, DialogEvent::Expired { id });
            // linkage and timer
            self.release(id, 2);
            return;
        }

        let applied = self.registry.apply_event_if(
            id,
            TransitionEvent::RequestBye,
            None,
            due,
            |dialog, transition| {
                let mut captured = Captured::from_dialog(dialog);
                dialog.deadline = None;
                if transition.deleted() {
                    captured.profiles = std::mem::take(&mut dialog.profiles);
                    dialog.flags.insert(DialogFlags::CHANGED);
                    captured.snapshot = Some(dialog.snapshot(self.registry.now()));
                }
                captured
            },
        );

        let Some(applied) = applied else {
            warn!(dialog = %id, "timer fired for unknown dialog");
            return;
        };
        let transition = applied.transition;
        let Some(captured) = applied.value else {
            if !transition.violation {
                debug!(dialog = %id, deadline = entry.deadline, "timer re-armed before expiry ran");
            }
            self.release(id, 1);
            return;
        };

        if transition.deleted() {
            warn!(dialog = %id, lifetime = captured.lifetime, "dialog timed out");
            self.metrics.record_expired();
            self.unlink_profiles(&captured.profiles);
            self.keepalives.remove(id);
            self.replicate_state(captured.snapshot.clone());
            self.emit(&captured.callbacks, DialogEvent::Expired { id });
            self.release(id, transition.release + 1);
        } else {
            debug!(dialog = %id, state = %transition.new_state, "timer fired without teardown");
            self.release(id, 1);
        }
    }

    /// Tear an answered dialog down as if a BYE had been routed.
    ///
    /// Returns false when the dialog is not in a state a BYE ends.
    pub(crate) fn end_dialog(&self, id: DialogId, reason: TerminationReason) -> DialogResult<bool> {
        let held = self
            .registry
            .find_by_id(id.bucket, id.seq)
            .ok_or_else(|| DialogError::not_found(id))?;

        let applied = self
            .registry
            .apply_event(held, TransitionEvent::RequestBye, None, |dialog, transition| {
                let mut captured = Captured::from_dialog(dialog);
                if transition.deleted() {
                    captured.timer_removed = disarm_timer_locked(&self.timers, dialog);
                    captured.profiles = std::mem::take(&mut dialog.profiles);
                    dialog.flags.insert(DialogFlags::CHANGED);
                    captured.snapshot = Some(dialog.snapshot(self.registry.now()));
                }
                captured
            });

        let Some(applied) = applied else {
            return Err(DialogError::not_found(id));
        };
        let transition = applied.transition;
        let captured = applied.value.unwrap_or_default();

        let mut to_release = 1;
        let ended = transition.deleted();
        if ended {
            info!(dialog = %id, reason = %reason, "dialog terminated");
            self.metrics.record_terminated();
            self.unlink_profiles(&captured.profiles);
            self.keepalives.remove(id);
            if !captured.replicated {
                self.replicate_state(captured.snapshot.clone());
            }
            self.emit(&captured.callbacks, DialogEvent::Terminated { id, reason });
            to_release += transition.release + u32::from(captured.timer_removed);
        }
        self.release(held, to_release);
        Ok(ended)
    }

    /// Remove dialogs stuck before answer and shorten the wait for lost ACKs
    pub fn sweep_stale(&self) -> SweepReport {
        let now = self.registry.now();
        let unconfirmed_grace = self.config.unconfirmed_grace.as_secs();
        let ack_wait_grace = self.config.ack_wait_grace.as_secs();
        let ack_wait_lifetime = u32::try_from(self.config.ack_wait_lifetime.as_secs()).unwrap_or(u32::MAX);

        let mut report = SweepReport::default();

        let stale = self.registry.ids_where(|d| {
            d.state() == DialogState::Unconfirmed && now.saturating_sub(d.created_tick) >= unconfirmed_grace
        });
        for id in stale {
            self.registry
                .with_dialog_mut(id, |dialog| disarm_timer_locked(&self.timers, dialog));
            if self.registry.force_remove(id) {
                warn!(dialog = %id, "removed dialog stuck in unconfirmed state");
                report.removed += 1;
            }
        }

        let waiting = self.registry.ids_where(|d| {
            d.state() == DialogState::ConfirmedPendingAck
                && d.answered_tick
                    .map(|t| now.saturating_sub(t) >= ack_wait_grace)
                    .unwrap_or(false)
        });
        for id in waiting {
            let shortened = self
                .registry
                .with_dialog_mut(id, |dialog| {
                    if self.timers.update(id, ack_wait_lifetime) == TimerRemoval::Removed {
                        dialog.deadline = self.timers.deadline_of(id);
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if shortened {
                debug!(dialog = %id, "no ACK seen, lifetime shortened");
                report.ack_timeouts += 1;
            }
        }

        if report.removed > 0 || report.ack_timeouts > 0 {
            info!(removed = report.removed, ack_timeouts = report.ack_timeouts, "stale dialog sweep");
        }
        report
    }

    /// Probe every dialog due for keep-alive; returns how many probes were sent
    pub fn run_keepalives(&self) -> usize {
        let Some(interval) = self.config.keepalive_interval else {
            return 0;
        };
        let Some(sender) = self.keepalive_sender.read().clone() else {
            return 0;
        };

        let due = self.keepalives.take_due(self.timers.now(), interval.as_secs());
        let mut sent = 0;
        for id in due {
            match self.registry.snapshot(id) {
                Some(snapshot) if matches!(snapshot.state, DialogState::Confirmed | DialogState::ConcurrentlyConfirmed) => {
                    sender.send_keepalive(&snapshot);
                    sent += 1;
                }
                Some(_) | None => {
                    self.keepalives.remove(id);
                }
            }
        }
        sent
    }

    /// Record the outcome of a keep-alive probe.
    ///
    /// Returns true when the failure limit was reached and the dialog was
    /// terminated.
    pub fn report_keepalive(&self, id: DialogId, reachable: bool) -> DialogResult<bool> {
        let limit = self.config.keepalive_failure_limit;
        let failures = self
            .registry
            .with_dialog_mut(id, |dialog| {
                if reachable {
                    dialog.keepalive_failures = 0;
                } else {
                    dialog.keepalive_failures += 1;
                }
                dialog.keepalive_failures
            })
            .ok_or_else(|| DialogError::not_found(id))?;

        if reachable || failures < limit {
            return Ok(false);
        }

        warn!(dialog = %id, failures, "keep-alive failure limit reached");
        self.end_dialog(id, TerminationReason::KeepAliveFailed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::TrackerConfig;
    use crate::dispatch::{InDialogRequest, InitialRequest, RequestInOutcome, ResponseInfo, TransactionEvent};
    use crate::timer::ManualClock;

    fn confirmed(tracker: &DialogTracker, call_id: &str) -> DialogId {
        let invite = InitialRequest::new(call_id, "alice-tag", "sip:a@x", "sip:b@y", "sip:b@10.0.0.2");
        let RequestInOutcome::Created { binding, token } = tracker.on_request_in(&invite).unwrap() else {
            panic!("dialog not created");
        };
        let ok = ResponseInfo::new(200).with_to_tag("bob-tag");
        tracker.on_transaction_event(&binding, TransactionEvent::ResponseReady(ok));
        tracker.on_transaction_event(&binding, TransactionEvent::Destroyed);
        let id = binding.dialog();
        tracker.release_binding(binding);

        let ack = InDialogRequest::new("ACK", call_id, "alice-tag")
            .with_to_tag("bob-tag")
            .with_token(&token);
        tracker.on_in_dialog_request(&ack).unwrap();
        id
    }

    #[test]
    fn test_rearmed_timer_survives_stale_entry() {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = TrackerConfig::default()
            .with_hash_size(16)
            .with_default_lifetime(Duration::from_secs(30));
        let tracker = DialogTracker::with_clock(config, clock.clone()).unwrap();
        let id = confirmed(&tracker, "expiry-rearm@atlanta");

        clock.advance(30);
        let due = tracker.timers().tick();
        assert_eq!(due.len(), 1);

        // Armed again between taking the entry and handling it
        assert!(tracker.arm_timer(id, 30));
        tracker.on_timer_expired(due[0]);

        let snapshot = tracker.snapshot(id).unwrap();
        assert_eq!(snapshot.state, DialogState::Confirmed);
        assert_eq!(snapshot.ref_count, 2);
        assert_eq!(tracker.timers().deadline_of(id), Some(1_060));
        assert_eq!(tracker.metrics().snapshot().expired, 0);

        clock.advance(30);
        assert_eq!(tracker.tick(), 1);
        assert!(tracker.snapshot(id).is_none());
        assert_eq!(tracker.metrics().snapshot().expired, 1);
    }
}
