//! Dialog records and their identity
//!
//! This module contains the data model shared by every other component:
//!
//! - [`DialogId`]: the `(bucket, seq)` identity and its route token codec
//! - [`DialogState`]: lifecycle states
//! - [`Dialog`]: the record owned by a registry bucket
//! - [`DialogSnapshot`]: serializable copy used by persistence, replication
//!   and inspection
//! - [`ProfileIndex`]: named dialog groupings

pub mod dialog_id;
pub mod dialog_impl;
pub mod dialog_state;
pub mod flags;
pub mod profile;

pub use dialog_id::{DialogId, MAX_TOKEN_LEN, TOKEN_SEPARATOR};
pub use dialog_impl::{Dialog, DialogLeg, DialogSnapshot};
pub use dialog_state::DialogState;
pub use flags::DialogFlags;
pub use profile::{DialogProfile, ProfileIndex, ProfileLink};
