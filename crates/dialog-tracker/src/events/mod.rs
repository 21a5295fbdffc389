//! Dialog notifications and observer registration

pub mod dialog_events;

pub use dialog_events::{
    notify, CallbackMask, CallbackRegistration, DialogCallbackType, DialogEvent, DialogObserver,
    TerminationReason,
};
