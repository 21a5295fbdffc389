//! Dialog state machine
//!
//! The table is evaluated by [`next_state`] and only ever under the bucket
//! lock of the dialog it applies to, which makes transitions atomic with
//! respect to concurrent events on the same dialog. Rows that leave the state
//! unchanged make duplicate and reordered delivery idempotent.

pub mod transitions;

pub use transitions::{next_state, Transition, TransitionContext, TransitionEffects, TransitionEvent};
