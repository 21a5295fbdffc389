//! # RVoIP Dialog Tracker
//!
//! Dialog tracking for a stateful SIP proxy.
//!
//! The tracker follows every INVITE-initiated dialog that crosses the proxy
//! from the initial request until teardown. It observes transactions and
//! in-dialog requests; it never originates SIP traffic itself apart from the
//! optional keep-alive probes handed to a [`KeepAliveSender`].
//!
//! ## Features
//!
//! - **Sharded registry**: dialogs hashed by Call-ID into buckets with
//!   reentrant per-bucket locks, lookup by identity or by record-route token
//! - **Reference counting**: a dialog is destroyed exactly once, when the
//!   last holder (registry linkage, transaction binding, timer, lookup)
//!   lets go
//! - **State machine**: Unconfirmed → Early → ConfirmedPendingAck →
//!   Confirmed → Deleted, plus ConcurrentlyConfirmed for forked calls
//! - **Timer engine**: lifetime timers with refresh on in-dialog traffic,
//!   stale sweep for dialogs that never got answered or never saw an ACK
//! - **Observers**: per-dialog and global [`DialogObserver`] callbacks
//! - **Persistence and replication**: pluggable [`DialogStore`] and a
//!   broadcast channel of [`ReplicationEvent`]s
//!
//! ## Architecture
//!
//! ```text
//!  transaction layer          in-dialog requests          background tasks
//!        │                           │                          │
//!        ▼                           ▼                          ▼
//!  ┌───────────────────────────────────────────────────────────────────┐
//!  │                         DialogTracker                             │
//!  │   dispatch::transaction   dispatch::route   dispatch::expiry      │
//!  └──────────┬──────────────────────┬──────────────────────┬──────────┘
//!             │                      │                      │
//!   ┌─────────▼────────┐   ┌─────────▼────────┐   ┌─────────▼────────┐
//!   │  DialogRegistry  │◄──│  state_machine   │   │   TimerEngine    │
//!   │ (buckets, refs)  │   │  (next_state)    │   │  (deadlines)     │
//!   └──────────────────┘   └──────────────────┘   └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rvoip_dialog_tracker::{DialogTracker, InitialRequest, RequestInOutcome, TrackerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tracker = DialogTracker::new(TrackerConfig::default())?;
//!
//! let invite = InitialRequest::new("a84b4c76e66710", "1928301774", "sip:alice@atlanta.com", "sip:bob@biloxi.com", "sip:bob@192.0.2.4");
//! if let RequestInOutcome::Created { binding, token } = tracker.on_request_in(&invite)? {
//!     println!("record-route token {}", token);
//!     tracker.release_binding(binding);
//! }
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod branch;
pub mod config;
pub mod dialog;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod replication;
pub mod service;
pub mod state_machine;
pub mod timer;

// Re-export key types
pub use admin::DialogFilter;
pub use config::{DbMode, MatchMode, TrackerConfig, TrackingMode};
pub use dialog::{DialogFlags, DialogId, DialogLeg, DialogSnapshot, DialogState};
pub use dispatch::{
    DialogTracker, InDialogRequest, InitialRequest, RequestInOutcome, ResponseInfo, RouteOutcome, SweepReport,
    TransactionBinding, TransactionEvent,
};
pub use errors::{DialogError, DialogResult};
pub use events::{CallbackMask, DialogCallbackType, DialogEvent, DialogObserver, TerminationReason};
pub use metrics::{DialogMetrics, DialogMetricsSnapshot};
pub use persistence::{DialogStore, MemoryDialogStore, RehydrateReport};
pub use registry::{DialogRegistry, Direction, SipLookup};
pub use replication::ReplicationEvent;
pub use service::TrackerTasks;
pub use timer::{Clock, KeepAliveSender, ManualClock, SystemClock};

/// Commonly used types
pub mod prelude {
    pub use crate::{
        CallbackMask, DialogCallbackType, DialogError, DialogEvent, DialogFilter, DialogId, DialogObserver,
        DialogResult, DialogSnapshot, DialogState, DialogTracker, InDialogRequest, InitialRequest,
        RequestInOutcome, ResponseInfo, TerminationReason, TrackerConfig, TransactionEvent,
    };
}
