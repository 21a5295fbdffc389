//! Dialog record
//!
//! A [`Dialog`] is owned by exactly one registry bucket once linked. All of
//! its mutable fields are only touched while that bucket's lock is held;
//! outside the registry the record is observed through [`DialogSnapshot`]
//! copies.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::Branches;
use crate::dialog::profile::ProfileLink;
use crate::dialog::{DialogFlags, DialogId, DialogState};
use crate::events::CallbackRegistration;

/// Routing information of one side of the dialog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogLeg {
    /// Contact URI
    pub contact: Option<String>,
    /// Route set learned from Record-Route
    pub route_set: Vec<String>,
    /// Last CSeq seen from this side
    pub cseq: Option<u32>,
}

/// One tracked SIP dialog
#[derive(Debug, Clone)]
pub struct Dialog {
    pub(crate) id: DialogId,

    /// Call-ID of the dialog
    pub call_id: String,

    /// Tag of the caller (From tag of the initial request)
    pub from_tag: String,

    /// Tag of the callee, known once a response carried one
    pub to_tag: Option<String>,

    /// From URI of the initial request
    pub from_uri: String,

    /// To URI of the initial request
    pub to_uri: String,

    /// Request URI of the initial request
    pub request_uri: String,

    /// Caller side routing information
    pub caller: DialogLeg,

    /// Callee side routing information
    pub callee: DialogLeg,

    pub(crate) state: DialogState,

    pub(crate) ref_count: i64,

    /// Lifetime in seconds applied when the dialog is answered
    pub lifetime: u32,

    /// Absolute expiry in engine ticks while a timer is armed
    pub(crate) deadline: Option<u64>,

    /// Engine tick at creation
    pub(crate) created_tick: u64,

    /// Engine tick at which the dialog was answered
    pub(crate) answered_tick: Option<u64>,

    /// Wall-clock creation time
    pub init_ts: DateTime<Utc>,

    /// Wall-clock answer time
    pub start_ts: Option<DateTime<Utc>>,

    /// Internal flags
    pub flags: DialogFlags,

    /// Free-form dialog variables
    pub vars: BTreeMap<String, String>,

    pub(crate) profiles: Vec<ProfileLink>,

    pub(crate) callbacks: Vec<CallbackRegistration>,

    pub(crate) branches: Branches,

    pub(crate) parent: Option<DialogId>,

    pub(crate) siblings: Vec<DialogId>,

    pub(crate) keepalive_failures: u32,
}

impl Dialog {
    pub(crate) fn new(
        bucket: u32,
        call_id: String,
        from_uri: String,
        to_uri: String,
        from_tag: String,
        request_uri: String,
        created_tick: u64,
    ) -> Self {
        Self {
            id: DialogId::unset(bucket),
            call_id,
            from_tag,
            to_tag: None,
            from_uri,
            to_uri,
            request_uri,
            caller: DialogLeg::default(),
            callee: DialogLeg::default(),
            state: DialogState::Unconfirmed,
            ref_count: 0,
            lifetime: 0,
            deadline: None,
            created_tick,
            answered_tick: None,
            init_ts: Utc::now(),
            start_ts: None,
            flags: DialogFlags::empty(),
            vars: BTreeMap::new(),
            profiles: Vec::new(),
            callbacks: Vec::new(),
            branches: Branches::default(),
            parent: None,
            siblings: Vec::new(),
            keepalive_failures: 0,
        }
    }

    /// Identity; unset until the record is linked
    pub fn id(&self) -> DialogId {
        self.id
    }

    /// Bucket the record hashes to
    pub fn bucket(&self) -> u32 {
        self.id.bucket
    }

    /// Current state
    pub fn state(&self) -> DialogState {
        self.state
    }

    /// Outstanding references
    pub fn ref_count(&self) -> i64 {
        self.ref_count
    }

    /// Absolute deadline in engine ticks, if a timer is armed
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Forked branches
    pub fn branches(&self) -> &Branches {
        &self.branches
    }

    /// Dialog this one was split from, for concurrent branches
    pub fn parent(&self) -> Option<DialogId> {
        self.parent
    }

    /// Dialogs split from this one
    pub fn siblings(&self) -> &[DialogId] {
        &self.siblings
    }

    /// Profile memberships
    pub fn profiles(&self) -> &[ProfileLink] {
        &self.profiles
    }

    /// Whether the record is owned by a peer instance
    pub fn is_replicated(&self) -> bool {
        self.flags.contains(DialogFlags::REPLICATED)
    }

    /// Register an observer for this dialog
    pub fn add_callback(&mut self, registration: CallbackRegistration) {
        self.callbacks.push(registration);
    }

    pub(crate) fn set_state(&mut self, state: DialogState) {
        self.state = state;
    }

    /// Copy every attribute into a snapshot; `now_tick` converts the deadline to wall time
    pub fn snapshot(&self, now_tick: u64) -> DialogSnapshot {
        let expires_at = self.deadline.map(|deadline| {
            let remaining = deadline.saturating_sub(now_tick);
            Utc::now() + ChronoDuration::seconds(remaining.min(u64::from(u32::MAX)) as i64)
        });

        DialogSnapshot {
            id: self.id,
            call_id: self.call_id.clone(),
            from_tag: self.from_tag.clone(),
            to_tag: self.to_tag.clone(),
            from_uri: self.from_uri.clone(),
            to_uri: self.to_uri.clone(),
            request_uri: self.request_uri.clone(),
            caller: self.caller.clone(),
            callee: self.callee.clone(),
            state: self.state,
            ref_count: self.ref_count,
            lifetime: self.lifetime,
            init_ts: self.init_ts,
            start_ts: self.start_ts,
            expires_at,
            flags: self.flags,
            vars: self.vars.clone(),
            profiles: self.profiles.clone(),
            branches: self.branches.clone(),
            parent: self.parent,
            siblings: self.siblings.clone(),
        }
    }

    /// Rebuild an unlinked record from a snapshot; callbacks are not restored
    pub(crate) fn from_snapshot(snapshot: &DialogSnapshot, created_tick: u64) -> Self {
        Self {
            id: DialogId::unset(snapshot.id.bucket),
            call_id: snapshot.call_id.clone(),
            from_tag: snapshot.from_tag.clone(),
            to_tag: snapshot.to_tag.clone(),
            from_uri: snapshot.from_uri.clone(),
            to_uri: snapshot.to_uri.clone(),
            request_uri: snapshot.request_uri.clone(),
            caller: snapshot.caller.clone(),
            callee: snapshot.callee.clone(),
            state: snapshot.state,
            ref_count: 0,
            lifetime: snapshot.lifetime,
            deadline: None,
            created_tick,
            answered_tick: snapshot.start_ts.map(|_| created_tick),
            init_ts: snapshot.init_ts,
            start_ts: snapshot.start_ts,
            flags: snapshot.flags,
            vars: snapshot.vars.clone(),
            profiles: Vec::new(),
            callbacks: Vec::new(),
            branches: snapshot.branches.clone(),
            parent: snapshot.parent,
            siblings: snapshot.siblings.clone(),
            keepalive_failures: 0,
        }
    }
}

/// Serializable copy of a dialog record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogSnapshot {
    pub id: DialogId,
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
    pub from_uri: String,
    pub to_uri: String,
    pub request_uri: String,
    pub caller: DialogLeg,
    pub callee: DialogLeg,
    pub state: DialogState,
    pub ref_count: i64,
    pub lifetime: u32,
    pub init_ts: DateTime<Utc>,
    pub start_ts: Option<DateTime<Utc>>,
    /// Wall-clock time at which the armed timer fires
    pub expires_at: Option<DateTime<Utc>>,
    pub flags: DialogFlags,
    pub vars: BTreeMap<String, String>,
    pub profiles: Vec<ProfileLink>,
    pub branches: Branches,
    pub parent: Option<DialogId>,
    pub siblings: Vec<DialogId>,
}

impl DialogSnapshot {
    /// Seconds left before the armed timer fires, measured against `now`
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|at| (at - now).num_seconds())
    }
}
