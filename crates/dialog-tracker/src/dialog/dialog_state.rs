//! Dialog lifecycle states
//!
//! ```text
//!  Unconfirmed ──1xx──▶ Early
//!       │                 │
//!       └──────2xx────────┴──▶ ConfirmedPendingAck ──ACK──▶ Confirmed
//!                                       │                      │
//!  (forking) second branch 2xx ─────────┼──────────────▶ ConcurrentlyConfirmed
//!                                       │                      │
//!       any failure / BYE / expiry ─────┴──────────▶ Deleted ◀─┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Initial request seen, no response yet
    Unconfirmed,
    /// Provisional response received
    Early,
    /// 2xx received, ACK still outstanding
    ConfirmedPendingAck,
    /// 2xx and ACK exchanged
    Confirmed,
    /// A second forked branch answered after the dialog already confirmed
    ConcurrentlyConfirmed,
    /// Terminated; the record lingers until its last reference is released
    Deleted,
}

impl DialogState {
    /// Whether no final answer has been seen yet
    pub fn is_pre_answer(&self) -> bool {
        matches!(self, DialogState::Unconfirmed | DialogState::Early)
    }

    /// Whether a 2xx has been seen and the dialog is not terminated
    pub fn is_answered(&self) -> bool {
        matches!(
            self,
            DialogState::ConfirmedPendingAck | DialogState::Confirmed | DialogState::ConcurrentlyConfirmed
        )
    }

    /// Whether the dialog is still alive
    pub fn is_active(&self) -> bool {
        !self.is_terminated()
    }

    /// Whether the dialog reached its terminal state
    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Deleted)
    }

    /// Position along the lifecycle.
    ///
    /// `Confirmed` and `ConcurrentlyConfirmed` share a rank because they are
    /// parallel, not successive.
    pub fn rank(&self) -> u8 {
        match self {
            DialogState::Unconfirmed => 0,
            DialogState::Early => 1,
            DialogState::ConfirmedPendingAck => 2,
            DialogState::Confirmed | DialogState::ConcurrentlyConfirmed => 3,
            DialogState::Deleted => 4,
        }
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Unconfirmed => write!(f, "Unconfirmed"),
            DialogState::Early => write!(f, "Early"),
            DialogState::ConfirmedPendingAck => write!(f, "ConfirmedPendingAck"),
            DialogState::Confirmed => write!(f, "Confirmed"),
            DialogState::ConcurrentlyConfirmed => write!(f, "ConcurrentlyConfirmed"),
            DialogState::Deleted => write!(f, "Deleted"),
        }
    }
}
