//! Sharded dialog registry
//!
//! ```text
//!            call_id ──FNV-1a──► bucket = hash & (N - 1)
//!
//!   ┌──────────┐ ┌──────────┐        ┌──────────┐
//!   │ bucket 0 │ │ bucket 1 │  ...   │ bucket N-1│   each behind a reentrant lock
//!   │ next_id  │ │ next_id  │        │ next_id  │
//!   │ [dialog] │ │ [dialog] │        │ [dialog] │
//!   └──────────┘ └──────────┘        └──────────┘
//! ```
//!
//! Operations on different buckets never contend. A dialog is identified by
//! `(bucket, seq)`; `seq` is unique among the dialogs currently linked in the
//! bucket and never 0.

mod bucket;
pub mod matching;
pub mod table;

pub use bucket::BucketGuard;
pub use matching::{match_identity, Direction};
pub use table::{AppliedTransition, BucketReservation, DestroyHook, DialogHandle, DialogRegistry, SipLookup};
