//! Call-ID / tag identity matching
//!
//! Only the Call-ID and the two tags are ever compared. A request travelling
//! from caller to callee carries `(from = caller tag, to = callee tag)`
//! ([`Direction::Downstream`]); one travelling the other way carries them
//! swapped ([`Direction::Upstream`]).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dialog::Dialog;

/// Direction of a message relative to the initial request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Caller to callee
    Downstream,
    /// Callee to caller
    Upstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downstream => write!(f, "downstream"),
            Direction::Upstream => write!(f, "upstream"),
        }
    }
}

/// Match a message's identity against a dialog.
///
/// When either the dialog's callee tag or the message's to-tag is unknown,
/// only the tag known on both sides is compared and the direction is
/// inferred from where it appears.
pub fn match_identity(dialog: &Dialog, call_id: &str, from_tag: &str, to_tag: Option<&str>) -> Option<Direction> {
    if dialog.call_id != call_id {
        return None;
    }

    let to_tag = to_tag.filter(|t| !t.is_empty());
    let callee_tag = dialog.to_tag.as_deref().filter(|t| !t.is_empty());

    match (callee_tag, to_tag) {
        (Some(callee), Some(to)) => {
            if from_tag == dialog.from_tag && to == callee {
                Some(Direction::Downstream)
            } else if from_tag == callee && to == dialog.from_tag {
                Some(Direction::Upstream)
            } else {
                None
            }
        }
        _ => {
            if from_tag == dialog.from_tag {
                Some(Direction::Downstream)
            } else if to_tag == Some(dialog.from_tag.as_str()) {
                Some(Direction::Upstream)
            } else {
                None
            }
        }
    }
}
