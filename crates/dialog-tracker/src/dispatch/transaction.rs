//! Transaction-layer glue
//!
//! ```text
//! INVITE in ──► on_request_in ──► reserve-on-miss lookup
//!                                   ├── hit, live    ──► Spiraled / Existing
//!                                   └── miss (locked) ──► link(extra = 1) ──► TransactionBinding
//!
//! response ──► on_transaction_event(binding, ResponseReady | ResponseForwarded)
//!                    └── next_state(...) under the bucket lock, side effects after
//!
//! transaction gone ──► on_transaction_event(binding, Destroyed) ──► release_binding(binding)
//! ```
//!
//! The binding stands for the reference the transaction layer holds on the
//! dialog. It is not `Clone` and [`DialogTracker::release_binding`] consumes
//! it, so the reference is given back exactly once.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::TrackingMode;
use crate::dialog::{Dialog, DialogFlags, DialogId, DialogState};
use crate::dispatch::tracker::{arm_timer_locked, Captured, DialogTracker};
use crate::errors::{DialogError, DialogResult};
use crate::events::DialogEvent;
use crate::registry::SipLookup;
use crate::replication::ReplicationEvent;
use crate::state_machine::TransitionEvent;

/// Dialog-creating request as seen by the proxy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialRequest {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
    pub from_uri: String,
    pub to_uri: String,
    pub request_uri: String,
    pub contact: Option<String>,
    pub route_set: Vec<String>,
    pub cseq: Option<u32>,
    /// Lifetime override in seconds
    pub lifetime: Option<u32>,
}

impl InitialRequest {
    pub fn new(
        call_id: impl Into<String>,
        from_tag: impl Into<String>,
        from_uri: impl Into<String>,
        to_uri: impl Into<String>,
        request_uri: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from_tag: from_tag.into(),
            from_uri: from_uri.into(),
            to_uri: to_uri.into(),
            request_uri: request_uri.into(),
            ..Self::default()
        }
    }

    pub fn with_to_tag(mut self, to_tag: impl Into<String>) -> Self {
        self.to_tag = Some(to_tag.into());
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn with_route_set(mut self, route_set: Vec<String>) -> Self {
        self.route_set = route_set;
        self
    }

    pub fn with_cseq(mut self, cseq: u32) -> Self {
        self.cseq = Some(cseq);
        self
    }

    pub fn with_lifetime(mut self, lifetime: u32) -> Self {
        self.lifetime = Some(lifetime);
        self
    }
}

/// Response to the initial request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    pub to_tag: Option<String>,
    pub contact: Option<String>,
    pub route_set: Vec<String>,
    pub cseq: Option<u32>,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_to_tag(mut self, to_tag: impl Into<String>) -> Self {
        self.to_tag = Some(to_tag.into());
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn with_route_set(mut self, route_set: Vec<String>) -> Self {
        self.route_set = route_set;
        self
    }

    pub fn with_cseq(mut self, cseq: u32) -> Self {
        self.cseq = Some(cseq);
        self
    }

    fn tag(&self) -> Option<&str> {
        self.to_tag.as_deref().filter(|t| !t.is_empty())
    }
}

/// Callback delivered by the transaction layer for a bound dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// A response arrived from downstream
    ResponseIn(ResponseInfo),
    /// A response is about to be sent upstream
    ResponseReady(ResponseInfo),
    /// A response was forwarded upstream
    ResponseForwarded(ResponseInfo),
    /// A branch failed
    OnFailure(ResponseInfo),
    /// The transaction was destroyed
    Destroyed,
}

/// The transaction layer's handle on a dialog, holding one reference
#[must_use = "a binding holds a dialog reference; pass it to release_binding"]
#[derive(Debug, PartialEq, Eq)]
pub struct TransactionBinding {
    dialog: DialogId,
}

impl TransactionBinding {
    /// Dialog this binding refers to
    pub fn dialog(&self) -> DialogId {
        self.dialog
    }
}

/// Result of [`DialogTracker::on_request_in`]
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub enum RequestInOutcome {
    /// A new dialog was linked and bound to the transaction
    Created {
        binding: TransactionBinding,
        /// Record-route token for the new dialog
        token: String,
    },
    /// The request looped back through the proxy for a live dialog
    Spiraled(DialogId),
    /// A dialog with this identity already exists
    Existing(DialogId),
}

impl DialogTracker {
    /// Handle a dialog-creating request.
    ///
    /// The lookup keeps the bucket locked on a miss so a retransmission
    /// racing on another thread cannot create a second dialog.
    pub fn on_request_in(&self, request: &InitialRequest) -> DialogResult<RequestInOutcome> {
        if request.call_id.is_empty() || request.from_tag.is_empty() {
            return Err(DialogError::invariant("initial request without Call-ID or From tag"));
        }

        let lookup = self.registry.find_by_sip_identity(
            &request.call_id,
            &request.from_tag,
            request.to_tag.as_deref(),
            true,
        );

        let reservation = match lookup {
            SipLookup::Found { id, .. } => {
                let state = self.registry.with_dialog(id, |d| d.state());
                match state {
                    Some(DialogState::Deleted) => {
                        // Only a terminated record matched; start a fresh dialog
                        self.release(id, 1);
                        None
                    }
                    Some(_) => return Ok(self.on_existing(id)),
                    None => None,
                }
            }
            SipLookup::NotFound => None,
            SipLookup::Reserved(reservation) => Some(reservation),
        };

        let mut dialog = self.registry.create(
            &request.call_id,
            &request.from_uri,
            &request.to_uri,
            &request.from_tag,
            &request.request_uri,
        )?;
        dialog.lifetime = request.lifetime.unwrap_or_else(|| self.config.default_lifetime_secs());
        dialog.caller.contact = request.contact.clone();
        dialog.caller.route_set = request.route_set.clone();
        dialog.caller.cseq = request.cseq;
        dialog.flags.insert(DialogFlags::NEW);

        let id = match reservation {
            Some(reservation) => reservation.link(dialog, 1)?,
            None => self.registry.link(dialog, 1)?,
        };

        self.metrics.record_processed();
        info!(dialog = %id, call_id = %request.call_id, "dialog created");

        if let Some(snapshot) = self.registry.snapshot(id) {
            self.replicate(ReplicationEvent::Created { snapshot });
        }
        self.emit(
            &[],
            DialogEvent::Created {
                id,
                call_id: request.call_id.clone(),
            },
        );

        Ok(RequestInOutcome::Created {
            binding: TransactionBinding { dialog: id },
            token: self.route_token(id),
        })
    }

    fn on_existing(&self, id: DialogId) -> RequestInOutcome {
        let outcome = if self.config.detect_spirals {
            let callbacks = self.registry.with_dialog_mut(id, |dialog| {
                dialog.flags.insert(DialogFlags::SPIRALED);
                dialog.callbacks.clone()
            });
            debug!(dialog = %id, "spiraled request detected");
            self.emit(&callbacks.unwrap_or_default(), DialogEvent::Spiraled { id });
            RequestInOutcome::Spiraled(id)
        } else {
            debug!(dialog = %id, "initial request for existing dialog");
            RequestInOutcome::Existing(id)
        };
        self.release(id, 1);
        outcome
    }

    /// Handle a transaction callback for a bound dialog
    pub fn on_transaction_event(&self, binding: &TransactionBinding, event: TransactionEvent) {
        let id = binding.dialog;
        match event {
            TransactionEvent::ResponseIn(response) => self.on_response_in(id, &response),
            TransactionEvent::ResponseReady(response) => self.on_response(id, &response),
            TransactionEvent::ResponseForwarded(response) => self.on_response_forwarded(id, &response),
            TransactionEvent::OnFailure(response) => self.on_failure(id, &response),
            TransactionEvent::Destroyed => self.on_transaction_destroyed(id),
        }
    }

    /// Give back the binding's reference
    pub fn release_binding(&self, binding: TransactionBinding) {
        debug!(dialog = %binding.dialog, "transaction binding released");
        self.release(binding.dialog, 1);
    }

    fn on_response_in(&self, id: DialogId, response: &ResponseInfo) {
        if self.config.tracking_mode != TrackingMode::Forking || response.status < 101 {
            return;
        }
        let Some(tag) = response.tag() else {
            return;
        };
        let to_uri = self.registry.with_dialog(id, |d| d.to_uri.clone()).unwrap_or_default();
        if let Some(branch) = self.registry.add_branch(id, tag, &to_uri) {
            self.registry
                .update_branch_leg(&branch, response.contact.as_deref(), &response.route_set, response.cseq);
        }
    }

    fn on_failure(&self, id: DialogId, response: &ResponseInfo) {
        if self.config.tracking_mode != TrackingMode::Forking {
            return;
        }
        if let Some(tag) = response.tag() {
            let handle = crate::branch::BranchHandle {
                dialog: id,
                to_tag: tag.to_string(),
            };
            if self.registry.mark_for_deletion(&handle) {
                debug!(dialog = %id, to_tag = tag, "failed branch marked for deletion");
            }
        }
    }

    /// The state machine already saw this response as ready; only notify
    fn on_response_forwarded(&self, id: DialogId, response: &ResponseInfo) {
        let Some(callbacks) = self.registry.with_dialog(id, |dialog| dialog.callbacks.clone()) else {
            debug!(dialog = %id, status = response.status, "forwarded response for unknown dialog");
            return;
        };
        self.emit(
            &callbacks,
            DialogEvent::ResponseForwarded {
                id,
                status: response.status,
            },
        );
    }

    fn on_response(&self, id: DialogId, response: &ResponseInfo) {
        let Some(event) = TransitionEvent::from_status(response.status) else {
            return;
        };
        let tag = response.tag();
        let now = self.registry.now();
        let forking = self.config.tracking_mode == TrackingMode::Forking;

        let applied = self.registry.apply_event(id, event, tag, |dialog, transition| {
            let mut captured = Captured::from_dialog(dialog);
            if transition.answered() {
                if let Some(tag) = tag {
                    dialog.to_tag = Some(tag.to_string());
                }
                dialog.callee.contact = response.contact.clone();
                dialog.callee.route_set = response.route_set.clone();
                dialog.callee.cseq = response.cseq;
                dialog.start_ts = Some(Utc::now());
                dialog.answered_tick = Some(now);
                dialog.flags.insert(DialogFlags::NEW | DialogFlags::CHANGED);
                let lifetime = dialog.lifetime;
                arm_timer_locked(&self.timers, dialog, lifetime);
                captured.snapshot = Some(dialog.snapshot(now));
            } else if transition.deleted() {
                captured.profiles = std::mem::take(&mut dialog.profiles);
                dialog.flags.insert(DialogFlags::CHANGED);
            }
            captured
        });

        let Some(applied) = applied else {
            debug!(dialog = %id, status = response.status, "response for unknown dialog");
            return;
        };
        let transition = applied.transition;
        let captured = applied.value.unwrap_or_default();

        if !transition.violation {
            if transition.changed() && transition.new_state == DialogState::Early {
                self.metrics.record_early();
                self.emit(&captured.callbacks, DialogEvent::Early { id });
            }

            if transition.answered() {
                self.metrics
                    .record_answered(transition.old_state == DialogState::Early);
                info!(dialog = %id, state = %transition.new_state, "dialog answered");
                self.persist_realtime(captured.snapshot.clone());
                self.replicate_state(captured.snapshot.clone());
                self.emit(
                    &captured.callbacks,
                    DialogEvent::ConfirmedPendingAck {
                        id,
                        to_tag: tag.map(str::to_string),
                    },
                );
                if forking {
                    self.schedule_keepalive(id);
                }
            }

            if transition.effects.mint_sibling {
                if let Some(tag) = tag {
                    self.mint_sibling(id, tag, response);
                }
            }

            if transition.deleted() {
                self.metrics
                    .record_failed(transition.old_state == DialogState::Early);
                self.unlink_profiles(&captured.profiles);
                info!(dialog = %id, status = response.status, "dialog failed");
                self.emit(
                    &captured.callbacks,
                    DialogEvent::Failed {
                        id,
                        status: Some(response.status),
                    },
                );
                self.release(id, transition.release);
            }
        }
    }

    fn on_transaction_destroyed(&self, id: DialogId) {
        let applied = self
            .registry
            .apply_event(id, TransitionEvent::TransactionDestroyed, None, |dialog, transition| {
                let mut captured = Captured::from_dialog(dialog);
                if transition.deleted() {
                    captured.profiles = std::mem::take(&mut dialog.profiles);
                }
                captured
            });

        let Some(applied) = applied else {
            return;
        };
        let transition = applied.transition;
        if transition.deleted() {
            let captured = applied.value.unwrap_or_default();
            self.metrics
                .record_failed(transition.old_state == DialogState::Early);
            self.unlink_profiles(&captured.profiles);
            info!(dialog = %id, "transaction destroyed before answer");
            self.emit(&captured.callbacks, DialogEvent::Failed { id, status: None });
        }

        if !applied.destroyed {
            let reaped = self.registry.reap_marked(id);
            if reaped > 0 {
                debug!(dialog = %id, reaped, "reaped obsolete branches");
            }
        }
    }

    /// Split a second answering branch off into its own confirmed dialog
    fn mint_sibling(&self, parent: DialogId, to_tag: &str, response: &ResponseInfo) {
        let now = self.registry.now();
        let Some(mut sibling) = self.registry.with_dialog(parent, |p| {
            let mut sibling = Dialog::new(
                p.bucket(),
                p.call_id.clone(),
                p.from_uri.clone(),
                p.to_uri.clone(),
                p.from_tag.clone(),
                p.request_uri.clone(),
                now,
            );
            sibling.caller = p.caller.clone();
            sibling.lifetime = p.lifetime;
            sibling.vars = p.vars.clone();
            sibling
        }) else {
            return;
        };

        sibling.to_tag = Some(to_tag.to_string());
        sibling.callee.contact = response.contact.clone();
        sibling.callee.route_set = response.route_set.clone();
        sibling.callee.cseq = response.cseq;
        sibling.parent = Some(parent);
        sibling.start_ts = Some(Utc::now());
        sibling.answered_tick = Some(now);
        sibling.flags.insert(DialogFlags::NEW | DialogFlags::CHANGED);
        sibling.set_state(DialogState::Confirmed);
        let lifetime = sibling.lifetime;

        let sibling_id = match self.registry.link(sibling, 0) {
            Ok(id) => id,
            Err(e) => {
                warn!(dialog = %parent, to_tag, error = %e, "could not create dialog for concurrent branch");
                return;
            }
        };

        let snapshot = self.registry.with_dialog_mut(sibling_id, |dialog| {
            arm_timer_locked(&self.timers, dialog, lifetime);
            dialog.snapshot(now)
        });
        let callbacks = self
            .registry
            .with_dialog_mut(parent, |p| {
                p.siblings.push(sibling_id);
                p.flags.insert(DialogFlags::CHANGED);
                p.callbacks.clone()
            })
            .unwrap_or_default();

        self.metrics.record_answered(false);
        self.schedule_keepalive(sibling_id);
        info!(dialog = %parent, sibling = %sibling_id, to_tag, "concurrent branch confirmed");

        if let Some(snapshot) = snapshot {
            self.persist_realtime(Some(snapshot.clone()));
            self.replicate(ReplicationEvent::Created { snapshot });
        }
        self.emit(
            &callbacks,
            DialogEvent::ConcurrentBranch {
                parent,
                sibling: sibling_id,
                to_tag: to_tag.to_string(),
            },
        );
    }
}
