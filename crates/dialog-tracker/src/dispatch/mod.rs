//! Event dispatch
//!
//! Binds transaction-layer and routing-layer callbacks to the state machine
//! and owns creation and destruction of dialog records. Every entry point is
//! synchronous; observers run after the bucket lock is released.

pub mod expiry;
pub mod route;
pub mod tracker;
pub mod transaction;

pub use expiry::SweepReport;
pub use route::{InDialogRequest, RouteOutcome};
pub use tracker::DialogTracker;
pub use transaction::{InitialRequest, RequestInOutcome, ResponseInfo, TransactionBinding, TransactionEvent};
