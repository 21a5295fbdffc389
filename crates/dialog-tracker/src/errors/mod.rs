//! Error types for dialog-tracker
//!
//! This module defines the error type shared by the registry, the timer
//! engine, the dispatch layer and the persistence/replication collaborators.
//!
//! A lookup miss is never an error: lookups return `Option`. Errors are
//! reserved for conditions the caller has to act on, such as a failed
//! allocation that should turn into a 5xx for the triggering request.

pub mod dialog_errors;

// Re-export main error types
pub use dialog_errors::{DialogError, DialogResult};
