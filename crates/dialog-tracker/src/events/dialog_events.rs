//! Dialog lifecycle notifications
//!
//! The set of notifications is closed: every observer sees the same
//! [`DialogEvent`] enum, and per-dialog registrations select the kinds they
//! care about with a [`CallbackMask`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dialog::DialogId;
use crate::registry::Direction;

/// Why a confirmed dialog was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// A BYE was routed through the proxy
    Bye,
    /// Terminated through the administration surface
    Admin,
    /// Keep-alive probes kept failing
    KeepAliveFailed,
    /// A peer instance reported the dialog gone
    Replicated,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Bye => write!(f, "bye"),
            TerminationReason::Admin => write!(f, "admin"),
            TerminationReason::KeepAliveFailed => write!(f, "keepalive-failed"),
            TerminationReason::Replicated => write!(f, "replicated"),
        }
    }
}

/// Dialog lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogEvent {
    /// A dialog was created for an initial request
    Created { id: DialogId, call_id: String },

    /// An initial request for an existing dialog looped back through the proxy
    Spiraled { id: DialogId },

    /// First provisional response
    Early { id: DialogId },

    /// 2xx received; the callee leg is now known
    ConfirmedPendingAck { id: DialogId, to_tag: Option<String> },

    /// ACK received for the 2xx
    Confirmed { id: DialogId },

    /// In-dialog request routed through the proxy
    RequestWithin {
        id: DialogId,
        method: String,
        direction: Direction,
    },

    /// A response for the initial transaction was forwarded
    ResponseForwarded { id: DialogId, status: u16 },

    /// The initial transaction failed before any 2xx
    Failed { id: DialogId, status: Option<u16> },

    /// A confirmed dialog was torn down
    Terminated { id: DialogId, reason: TerminationReason },

    /// The dialog lifetime ran out
    Expired { id: DialogId },

    /// A second forked branch answered and got its own dialog
    ConcurrentBranch {
        parent: DialogId,
        sibling: DialogId,
        to_tag: String,
    },

    /// The record was released; fires exactly once per dialog
    Destroyed { id: DialogId, call_id: String },
}

impl DialogEvent {
    /// Dialog the event is about
    pub fn dialog_id(&self) -> DialogId {
        match self {
            DialogEvent::Created { id, .. }
            | DialogEvent::Spiraled { id }
            | DialogEvent::Early { id }
            | DialogEvent::ConfirmedPendingAck { id, .. }
            | DialogEvent::Confirmed { id }
            | DialogEvent::RequestWithin { id, .. }
            | DialogEvent::ResponseForwarded { id, .. }
            | DialogEvent::Failed { id, .. }
            | DialogEvent::Terminated { id, .. }
            | DialogEvent::Expired { id }
            | DialogEvent::Destroyed { id, .. } => *id,
            DialogEvent::ConcurrentBranch { parent, .. } => *parent,
        }
    }

    /// Callback kind used for mask filtering
    pub fn callback_type(&self) -> DialogCallbackType {
        match self {
            DialogEvent::Created { .. } => DialogCallbackType::Created,
            DialogEvent::Spiraled { .. } => DialogCallbackType::Spiraled,
            DialogEvent::Early { .. } => DialogCallbackType::Early,
            DialogEvent::ConfirmedPendingAck { .. } => DialogCallbackType::ConfirmedPendingAck,
            DialogEvent::Confirmed { .. } => DialogCallbackType::Confirmed,
            DialogEvent::RequestWithin { .. } => DialogCallbackType::RequestWithin,
            DialogEvent::ResponseForwarded { .. } => DialogCallbackType::ResponseForwarded,
            DialogEvent::Failed { .. } => DialogCallbackType::Failed,
            DialogEvent::Terminated { .. } => DialogCallbackType::Terminated,
            DialogEvent::Expired { .. } => DialogCallbackType::Expired,
            DialogEvent::ConcurrentBranch { .. } => DialogCallbackType::ConcurrentBranch,
            DialogEvent::Destroyed { .. } => DialogCallbackType::Destroyed,
        }
    }
}

/// Kind of a dialog notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogCallbackType {
    Created,
    Spiraled,
    Early,
    ConfirmedPendingAck,
    Confirmed,
    RequestWithin,
    ResponseForwarded,
    Failed,
    Terminated,
    Expired,
    ConcurrentBranch,
    Destroyed,
}

impl DialogCallbackType {
    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Set of callback kinds a registration fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallbackMask(u32);

impl CallbackMask {
    /// Fires on every kind
    pub const ALL: CallbackMask = CallbackMask(u32::MAX);

    /// Empty mask
    pub const fn empty() -> Self {
        CallbackMask(0)
    }

    /// Mask selecting the given kinds
    pub fn of(types: &[DialogCallbackType]) -> Self {
        types.iter().fold(CallbackMask::empty(), |mask, t| mask.with(*t))
    }

    /// Add a kind to the mask
    pub fn with(self, callback_type: DialogCallbackType) -> Self {
        CallbackMask(self.0 | callback_type.bit())
    }

    /// Whether the mask selects the kind
    pub fn contains(&self, callback_type: DialogCallbackType) -> bool {
        self.0 & callback_type.bit() != 0
    }
}

impl From<DialogCallbackType> for CallbackMask {
    fn from(callback_type: DialogCallbackType) -> Self {
        CallbackMask::empty().with(callback_type)
    }
}

/// Receiver of dialog notifications.
///
/// Observers are always invoked with no registry or timer lock held, so
/// they may call back into the tracker.
pub trait DialogObserver: Send + Sync {
    /// Handle one notification
    fn on_dialog_event(&self, event: &DialogEvent);
}

/// Per-dialog observer registration
#[derive(Clone)]
pub struct CallbackRegistration {
    /// Kinds this registration fires on
    pub mask: CallbackMask,
    /// Receiver
    pub observer: Arc<dyn DialogObserver>,
}

impl CallbackRegistration {
    /// Create a registration
    pub fn new(mask: CallbackMask, observer: Arc<dyn DialogObserver>) -> Self {
        Self { mask, observer }
    }

    /// Whether the registration fires for the event
    pub fn wants(&self, event: &DialogEvent) -> bool {
        self.mask.contains(event.callback_type())
    }
}

impl fmt::Debug for CallbackRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistration")
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

/// Deliver an event to the registrations whose mask selects it
pub fn notify(registrations: &[CallbackRegistration], event: &DialogEvent) {
    for registration in registrations.iter().filter(|r| r.wants(event)) {
        registration.observer.on_dialog_event(event);
    }
}
