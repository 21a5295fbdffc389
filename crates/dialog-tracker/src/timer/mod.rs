//! Timer engine, time sources and keep-alive scheduling
//!
//! # Overview
//!
//! ```text
//! ┌───────────────┐   now()   ┌──────────────┐   expired entries   ┌───────────────┐
//! │ Clock         │──────────▶│ TimerEngine  │────────────────────▶│ DialogTracker │
//! │ System/Manual │           │ (one lock)   │   (lock released)   │ forced BYE    │
//! └───────────────┘           └──────────────┘                     └───────────────┘
//! ```
//!
//! - [`TimerEngine`]: armed dialog deadlines; one entry per dialog
//! - [`Clock`]: seconds source shared by the engine and the registry
//! - [`KeepAliveList`]: probe schedule for confirmed dialogs

pub mod clock;
pub mod engine;
pub mod keepalive;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{TimerEngine, TimerEntry, TimerRemoval};
pub use keepalive::{KeepAliveList, KeepAliveSender};
