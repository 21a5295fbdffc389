//! Transition table
//!
//! [`next_state`] is a pure function: it looks at the current state, the
//! event and a small [`TransitionContext`] computed from the record, and
//! describes what should happen. Applying the result (moving the state,
//! adjusting references, flagging branches) is done by the registry under
//! the bucket lock; arming timers and firing callbacks is done by dispatch.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::TrackingMode;
use crate::dialog::DialogState;

/// Input event of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionEvent {
    /// The initial transaction was destroyed
    TransactionDestroyed,
    /// 101-199 response
    Provisional,
    /// 2xx response
    Final2xx,
    /// 300-699 response
    Final3xxPlus,
    /// In-dialog PRACK
    RequestPrack,
    /// In-dialog ACK
    RequestAck,
    /// In-dialog BYE
    RequestBye,
    /// Any other in-dialog request
    RequestOther,
}

impl TransitionEvent {
    /// Event for a response status; `100 Trying` and invalid codes yield `None`
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            101..=199 => Some(TransitionEvent::Provisional),
            200..=299 => Some(TransitionEvent::Final2xx),
            300..=699 => Some(TransitionEvent::Final3xxPlus),
            _ => None,
        }
    }

    /// Event for an in-dialog request method
    pub fn from_method(method: &str) -> Self {
        match method {
            "PRACK" => TransitionEvent::RequestPrack,
            "ACK" => TransitionEvent::RequestAck,
            "BYE" => TransitionEvent::RequestBye,
            _ => TransitionEvent::RequestOther,
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionEvent::TransactionDestroyed => "TransactionDestroyed",
            TransitionEvent::Provisional => "Provisional",
            TransitionEvent::Final2xx => "Final2xx",
            TransitionEvent::Final3xxPlus => "Final3xxPlus",
            TransitionEvent::RequestPrack => "RequestPrack",
            TransitionEvent::RequestAck => "RequestAck",
            TransitionEvent::RequestBye => "RequestBye",
            TransitionEvent::RequestOther => "RequestOther",
        };
        f.write_str(name)
    }
}

/// Facts about the record the table depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    /// Single or forking tracking
    pub mode: TrackingMode,
    /// A BYE was already seen
    pub has_bye: bool,
    /// The event's to-tag belongs to a branch the dialog already accepted
    pub tag_confirmed: bool,
    /// Active branches other than the one the event came from
    pub other_active_branches: usize,
}

impl TransitionContext {
    /// Context for the non-forking table
    pub fn single() -> Self {
        Self {
            mode: TrackingMode::Single,
            has_bye: false,
            tag_confirmed: false,
            other_active_branches: 0,
        }
    }

    /// Context for the forking table
    pub fn forking() -> Self {
        Self {
            mode: TrackingMode::Forking,
            ..Self::single()
        }
    }

    /// Set the BYE-seen fact
    pub fn with_bye(mut self, has_bye: bool) -> Self {
        self.has_bye = has_bye;
        self
    }

    /// Set the branch facts
    pub fn with_branches(mut self, tag_confirmed: bool, other_active_branches: usize) -> Self {
        self.tag_confirmed = tag_confirmed;
        self.other_active_branches = other_active_branches;
        self
    }
}

/// Record mutations requested by a transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionEffects {
    /// Set the HAS_BYE flag
    pub set_has_bye: bool,
    /// Accept the event's branch as confirmed
    pub confirm_event_branch: bool,
    /// Mark the event's branch for deletion
    pub mark_event_branch: bool,
    /// Mark every branch except the event's for deletion
    pub mark_other_branches: bool,
    /// Mark every branch for deletion
    pub mark_all_branches: bool,
    /// Split the event's branch off into its own dialog
    pub mint_sibling: bool,
}

/// Result of evaluating the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the event
    pub old_state: DialogState,
    /// State after the event
    pub new_state: DialogState,
    /// Reference change applied together with the state change
    pub ref_delta: i32,
    /// References the caller must release after the transition
    pub release: u32,
    /// Record mutations
    pub effects: TransitionEffects,
    /// The pair is not in the table; the state is left unchanged
    pub violation: bool,
}

impl Transition {
    pub(crate) fn stay(state: DialogState) -> Self {
        Self {
            old_state: state,
            new_state: state,
            ref_delta: 0,
            release: 0,
            effects: TransitionEffects::default(),
            violation: false,
        }
    }

    fn invalid(state: DialogState) -> Self {
        Self {
            violation: true,
            ..Self::stay(state)
        }
    }

    fn to(state: DialogState, new_state: DialogState) -> Self {
        Self {
            new_state,
            ..Self::stay(state)
        }
    }

    fn with_delta(mut self, ref_delta: i32) -> Self {
        self.ref_delta = ref_delta;
        self
    }

    fn with_release(mut self, release: u32) -> Self {
        self.release = release;
        self
    }

    fn with_effects(mut self, effects: TransitionEffects) -> Self {
        self.effects = effects;
        self
    }

    /// Whether the state changed
    pub fn changed(&self) -> bool {
        self.old_state != self.new_state
    }

    /// Whether the dialog just received its first accepted 2xx
    pub fn answered(&self) -> bool {
        self.new_state.is_answered() && !self.old_state.is_answered()
    }

    /// Whether the dialog just reached `Deleted`
    pub fn deleted(&self) -> bool {
        self.new_state == DialogState::Deleted && self.old_state != DialogState::Deleted
    }
}

/// State a 2xx moves a pre-answer dialog to
fn answered_state(mode: TrackingMode) -> DialogState {
    match mode {
        TrackingMode::Single => DialogState::ConfirmedPendingAck,
        TrackingMode::Forking => DialogState::Confirmed,
    }
}

fn answer_effects(mode: TrackingMode) -> TransitionEffects {
    match mode {
        TrackingMode::Single => TransitionEffects::default(),
        TrackingMode::Forking => TransitionEffects {
            confirm_event_branch: true,
            mark_other_branches: true,
            ..TransitionEffects::default()
        },
    }
}

/// Evaluate the transition table
pub fn next_state(state: DialogState, event: TransitionEvent, ctx: &TransitionContext) -> Transition {
    use DialogState::*;
    use TransitionEvent::*;

    let forking = ctx.mode == TrackingMode::Forking;

    match (state, event) {
        // Transaction gave up without a final answer
        (Unconfirmed | Early, TransactionDestroyed) => {
            let effects = TransitionEffects {
                mark_all_branches: forking,
                ..TransitionEffects::default()
            };
            Transition::to(state, Deleted).with_delta(-1).with_effects(effects)
        }
        (ConfirmedPendingAck | Confirmed | ConcurrentlyConfirmed | Deleted, TransactionDestroyed) => {
            Transition::stay(state)
        }

        (Unconfirmed | Early, Provisional) => Transition::to(state, Early),

        (Unconfirmed | Early, Final3xxPlus) => {
            if forking {
                let effects = TransitionEffects {
                    mark_event_branch: true,
                    ..TransitionEffects::default()
                };
                if ctx.other_active_branches > 0 {
                    Transition::stay(state).with_effects(effects)
                } else {
                    Transition::to(state, Deleted).with_release(1).with_effects(effects)
                }
            } else {
                Transition::to(state, Deleted).with_release(1)
            }
        }

        // Late 200 after teardown: take a reference to absorb it
        (Deleted, Final2xx) if !ctx.has_bye => Transition::to(state, answered_state(ctx.mode))
            .with_delta(1)
            .with_effects(answer_effects(ctx.mode)),
        (Deleted, Final2xx) => Transition::invalid(state),

        (Unconfirmed | Early, Final2xx) => {
            Transition::to(state, answered_state(ctx.mode)).with_effects(answer_effects(ctx.mode))
        }

        (ConfirmedPendingAck, Final2xx) => Transition::stay(state),
        (Confirmed | ConcurrentlyConfirmed, Final2xx) => {
            if !forking {
                if state == Confirmed {
                    Transition::stay(state)
                } else {
                    Transition::invalid(state)
                }
            } else if ctx.tag_confirmed {
                Transition::stay(state)
            } else {
                let effects = TransitionEffects {
                    confirm_event_branch: true,
                    mint_sibling: true,
                    ..TransitionEffects::default()
                };
                Transition::to(state, ConcurrentlyConfirmed).with_effects(effects)
            }
        }

        (ConfirmedPendingAck, RequestAck) => Transition::to(state, Confirmed),
        (Confirmed | ConcurrentlyConfirmed | Deleted, RequestAck) => Transition::stay(state),

        (ConfirmedPendingAck | Confirmed | ConcurrentlyConfirmed, RequestBye) => {
            let effects = TransitionEffects {
                set_has_bye: true,
                ..TransitionEffects::default()
            };
            Transition::to(state, Deleted).with_release(1).with_effects(effects)
        }
        (Early | Deleted, RequestBye) => Transition::stay(state),

        (_, RequestOther | RequestPrack) => Transition::stay(state),

        _ => Transition::invalid(state),
    }
}
