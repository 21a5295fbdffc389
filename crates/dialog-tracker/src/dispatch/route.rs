//! Record-route tokens and in-dialog requests
//!
//! The proxy embeds the dialog identity in its Record-Route header as a
//! token (`<bucket>.<seq>`, both reverse hex). In-dialog requests carry it
//! back, which makes the lookup a direct bucket scan. The token is never
//! trusted alone: the Call-ID and tags must still match the record.

use tracing::{debug, warn};

use crate::config::{MatchMode, TrackingMode};
use crate::dialog::{DialogFlags, DialogId, DialogState};
use crate::dispatch::tracker::{disarm_timer_locked, Captured, DialogTracker};
use crate::errors::{DialogError, DialogResult};
use crate::events::{DialogEvent, TerminationReason};
use crate::registry::{match_identity, Direction, SipLookup};
use crate::state_machine::{Transition, TransitionEvent};
use crate::timer::TimerRemoval;

/// In-dialog request as seen by the proxy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InDialogRequest {
    pub method: String,
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
    /// Token found in the request's Route header
    pub token: Option<String>,
    pub cseq: Option<u32>,
    pub contact: Option<String>,
}

impl InDialogRequest {
    pub fn new(method: impl Into<String>, call_id: impl Into<String>, from_tag: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            call_id: call_id.into(),
            from_tag: from_tag.into(),
            ..Self::default()
        }
    }

    pub fn with_to_tag(mut self, to_tag: impl Into<String>) -> Self {
        self.to_tag = Some(to_tag.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_cseq(mut self, cseq: u32) -> Self {
        self.cseq = Some(cseq);
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }
}

/// Result of routing an in-dialog request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Dialog the request belongs to
    pub dialog: DialogId,
    /// Direction relative to the initial request
    pub direction: Direction,
    /// State machine result
    pub transition: Transition,
    /// The request tore the dialog down and its record is gone
    pub destroyed: bool,
}

impl RouteOutcome {
    /// State after the request
    pub fn state(&self) -> DialogState {
        self.transition.new_state
    }
}

impl DialogTracker {
    /// Record-route token for a dialog
    pub fn route_token(&self, id: DialogId) -> String {
        id.to_token()
    }

    /// Parse a record-route token
    pub fn decode_route_token(&self, token: &str) -> DialogResult<DialogId> {
        DialogId::from_token(token)
    }

    /// Handle a request inside an existing dialog.
    ///
    /// Returns `Ok(None)` when no dialog matches. A malformed token is an
    /// error only in [`MatchMode::TokenOnly`]; otherwise identity matching
    /// is tried instead.
    pub fn on_in_dialog_request(&self, request: &InDialogRequest) -> DialogResult<Option<RouteOutcome>> {
        let Some((id, direction)) = self.resolve(request)? else {
            debug!(call_id = %request.call_id, method = %request.method, "no dialog for in-dialog request");
            return Ok(None);
        };

        let event = TransitionEvent::from_method(&request.method);
        let refresh = matches!(
            event,
            TransitionEvent::RequestAck | TransitionEvent::RequestOther | TransitionEvent::RequestPrack
        );

        let applied = self.registry.apply_event(id, event, None, |dialog, transition| {
            let mut captured = Captured::from_dialog(dialog);
            let leg = match direction {
                Direction::Downstream => &mut dialog.caller,
                Direction::Upstream => &mut dialog.callee,
            };
            if let Some(cseq) = request.cseq {
                leg.cseq = Some(cseq);
            }
            if let Some(contact) = &request.contact {
                leg.contact = Some(contact.clone());
            }

            if transition.deleted() {
                captured.timer_removed = disarm_timer_locked(&self.timers, dialog);
                captured.profiles = std::mem::take(&mut dialog.profiles);
                dialog.flags.insert(DialogFlags::CHANGED);
            } else if refresh
                && matches!(
                    transition.new_state,
                    DialogState::Early | DialogState::Confirmed | DialogState::ConcurrentlyConfirmed
                )
                && !dialog.flags.contains(DialogFlags::TIMEOUT_NORESET)
            {
                let lifetime = dialog.lifetime;
                if self.timers.update(dialog.id(), lifetime) == TimerRemoval::Removed {
                    dialog.deadline = self.timers.deadline_of(dialog.id());
                }
            }

            if transition.changed() {
                dialog.flags.insert(DialogFlags::CHANGED);
                captured.snapshot = Some(dialog.snapshot(self.registry.now()));
            }
            captured
        });

        let Some(applied) = applied else {
            return Ok(None);
        };
        let transition = applied.transition;
        let captured = applied.value.unwrap_or_default();

        // lookup reference
        let mut to_release = 1;

        if transition.violation {
            warn!(dialog = %id, method = %request.method, "request not valid in current dialog state");
        } else if transition.deleted() {
            self.metrics.record_terminated();
            self.unlink_profiles(&captured.profiles);
            self.keepalives.remove(id);
            self.replicate_state(captured.snapshot.clone());
            debug!(dialog = %id, direction = %direction, "dialog terminated by BYE");
            self.emit(
                &captured.callbacks,
                DialogEvent::Terminated {
                    id,
                    reason: TerminationReason::Bye,
                },
            );
            to_release += transition.release + u32::from(captured.timer_removed);
        } else if transition.changed() && transition.new_state == DialogState::Confirmed {
            self.persist_realtime(captured.snapshot.clone());
            self.replicate_state(captured.snapshot.clone());
            self.schedule_keepalive(id);
            if self.config.tracking_mode == TrackingMode::Forking {
                self.registry.reap_marked(id);
            }
            self.emit(&captured.callbacks, DialogEvent::Confirmed { id });
        } else {
            if event == TransitionEvent::RequestAck && self.config.tracking_mode == TrackingMode::Forking {
                self.registry.reap_marked(id);
            }
            self.emit(
                &captured.callbacks,
                DialogEvent::RequestWithin {
                    id,
                    method: request.method.clone(),
                    direction,
                },
            );
        }

        let destroyed = self.release(id, to_release);
        Ok(Some(RouteOutcome {
            dialog: id,
            direction,
            transition,
            destroyed,
        }))
    }

    /// Find the dialog for a request, taking one reference on success
    fn resolve(&self, request: &InDialogRequest) -> DialogResult<Option<(DialogId, Direction)>> {
        let mode = self.config.match_mode;

        if mode != MatchMode::IdentityOnly {
            if let Some(token) = request.token.as_deref() {
                match self.decode_route_token(token) {
                    Ok(id) => {
                        if let Some(found) = self.resolve_token(id, request) {
                            return Ok(Some(found));
                        }
                    }
                    Err(e) if mode == MatchMode::TokenOnly => return Err(e),
                    Err(e) => {
                        warn!(token, error = %e, "ignoring malformed dialog token");
                    }
                }
            }
            if mode == MatchMode::TokenOnly {
                return Ok(None);
            }
        }

        match self.registry.find_by_sip_identity(
            &request.call_id,
            &request.from_tag,
            request.to_tag.as_deref(),
            false,
        ) {
            SipLookup::Found { id, direction } => Ok(Some((id, direction))),
            SipLookup::NotFound => Ok(None),
            SipLookup::Reserved(reservation) => {
                reservation.release();
                Err(DialogError::internal_error("unexpected bucket reservation"))
            }
        }
    }

    /// Look up by token and verify the tags, following concurrent-branch siblings
    fn resolve_token(&self, id: DialogId, request: &InDialogRequest) -> Option<(DialogId, Direction)> {
        let found = self.registry.find_by_id(id.bucket, id.seq)?;

        let (direction, siblings) = self.registry.with_dialog(found, |dialog| {
            (
                match_identity(dialog, &request.call_id, &request.from_tag, request.to_tag.as_deref()),
                dialog.siblings().to_vec(),
            )
        })?;
        if let Some(direction) = direction {
            return Some((found, direction));
        }

        let sibling = siblings.into_iter().find_map(|sibling| {
            self.registry
                .with_dialog(sibling, |dialog| {
                    match_identity(dialog, &request.call_id, &request.from_tag, request.to_tag.as_deref())
                })
                .flatten()
                .map(|direction| (sibling, direction))
        });
        self.release(found, 1);

        let (sibling, direction) = sibling?;
        let held = self.registry.find_by_id(sibling.bucket, sibling.seq)?;
        debug!(dialog = %id, sibling = %held, "request redirected to concurrent branch");
        Some((held, direction))
    }
}
