//! Listing, termination, variables, profiles and per-dialog callbacks

mod common;

use common::*;
use rvoip_dialog_tracker::admin::DialogFilter;
use rvoip_dialog_tracker::{
    CallbackMask, DialogCallbackType, DialogError, DialogEvent, DialogId, DialogState, TerminationReason,
};

#[test]
fn test_list_dialogs_filters() {
    let h = Harness::single();
    let (confirmed, _) = h.confirmed("admin-list-1@atlanta");
    let (pending, _) = h.answered("admin-list-2@atlanta");
    let (binding, _) = h.invite("admin-list-3@atlanta");
    let unconfirmed = binding.dialog();

    let all = h.tracker.list_dialogs(&DialogFilter::all()).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));

    let by_call = h
        .tracker
        .list_dialogs(&DialogFilter::by_call_id("admin-list-2@atlanta"))
        .unwrap();
    assert_eq!(by_call.len(), 1);
    assert_eq!(by_call[0].id, pending);

    let by_state = h
        .tracker
        .list_dialogs(&DialogFilter::all().in_state(DialogState::Unconfirmed))
        .unwrap();
    assert_eq!(by_state.len(), 1);
    assert_eq!(by_state[0].id, unconfirmed);

    let by_id = h.tracker.list_dialogs(&DialogFilter::by_id(confirmed)).unwrap();
    assert_eq!(by_id[0].state, DialogState::Confirmed);

    h.tracker.define_profile("trunk", true).unwrap();
    h.tracker.set_profile(confirmed, "trunk", Some("carrier-a")).unwrap();
    h.tracker.set_profile(pending, "trunk", Some("carrier-b")).unwrap();
    let in_profile = h
        .tracker
        .list_dialogs(&DialogFilter::all().in_profile("trunk", Some("carrier-b")))
        .unwrap();
    assert_eq!(in_profile.len(), 1);
    assert_eq!(in_profile[0].id, pending);

    assert!(h
        .tracker
        .list_dialogs(&DialogFilter::all().in_profile("missing", None))
        .is_err());

    h.tracker.release_binding(binding);
}

#[test]
fn test_profile_membership() {
    let h = Harness::single();
    h.tracker.define_profile("inbound", false).unwrap();
    h.tracker.define_profile("caller", true).unwrap();
    // Redefining with the same shape is fine, a different shape is not
    h.tracker.define_profile("inbound", false).unwrap();
    assert!(h.tracker.define_profile("inbound", true).is_err());

    let call_id = "admin-profile@atlanta";
    let (id, token) = h.confirmed(call_id);

    h.tracker.set_profile(id, "inbound", None).unwrap();
    h.tracker.set_profile(id, "caller", Some("alice")).unwrap();
    assert!(h.tracker.is_in_profile(id, "inbound", None));
    assert!(h.tracker.is_in_profile(id, "caller", Some("alice")));
    assert!(!h.tracker.is_in_profile(id, "caller", Some("carol")));
    assert_eq!(h.tracker.profile_size("inbound", None).unwrap(), 1);
    assert_eq!(h.tracker.profile_size("caller", Some("alice")).unwrap(), 1);

    assert!(matches!(
        h.tracker.set_profile(id, "undefined", None),
        Err(DialogError::Configuration { .. })
    ));
    assert!(h.tracker.set_profile(id, "caller", None).is_err());
    assert!(h.tracker.set_profile(DialogId::new(1, 999), "inbound", None).is_err());

    assert!(h.tracker.unset_profile(id, "inbound", None).unwrap());
    assert!(!h.tracker.unset_profile(id, "inbound", None).unwrap());
    assert_eq!(h.tracker.profile_size("inbound", None).unwrap(), 0);

    // Destruction unlinks what is left
    h.tracker.on_in_dialog_request(&bye_from_caller(call_id, &token)).unwrap();
    assert_eq!(h.tracker.profile_size("caller", Some("alice")).unwrap(), 0);
}

#[test]
fn test_dialog_variables() {
    let h = Harness::single();
    let (id, _) = h.confirmed("admin-vars@atlanta");

    assert!(h.tracker.get_var(id, "account").is_none());
    h.tracker.set_var(id, "account", Some("4711")).unwrap();
    assert_eq!(h.tracker.get_var(id, "account").as_deref(), Some("4711"));
    h.tracker.set_var(id, "account", Some("4712")).unwrap();
    assert_eq!(h.tracker.get_var(id, "account").as_deref(), Some("4712"));
    h.tracker.set_var(id, "account", None).unwrap();
    assert!(h.tracker.get_var(id, "account").is_none());

    assert!(matches!(
        h.tracker.set_var(DialogId::new(0, 999), "account", Some("1")),
        Err(DialogError::NotFound { .. })
    ));
}

#[test]
fn test_terminate() {
    let h = Harness::single();
    let (answered, _) = h.confirmed("admin-kill@atlanta");
    let (binding, _) = h.invite("admin-kill-early@atlanta");
    let early = binding.dialog();
    h.respond(&binding, 180, Some(BOB_TAG));

    assert!(h.tracker.terminate(answered, TerminationReason::Admin).unwrap());
    assert!(h.tracker.snapshot(answered).is_none());
    assert!(h.recorder.events().iter().any(|e| matches!(
        e,
        DialogEvent::Terminated { id, reason: TerminationReason::Admin } if *id == answered
    )));
    assert_eq!(h.tracker.metrics().snapshot().active, 0);

    assert!(!h.tracker.terminate(early, TerminationReason::Admin).unwrap());
    assert_eq!(h.tracker.snapshot(early).unwrap().state, DialogState::Early);

    assert!(matches!(
        h.tracker.terminate(answered, TerminationReason::Admin),
        Err(DialogError::NotFound { .. })
    ));

    h.tracker.on_transaction_event(&binding, rvoip_dialog_tracker::TransactionEvent::Destroyed);
    h.tracker.release_binding(binding);
    assert_eq!(h.tracker.dialog_count(), 0);
}

#[test]
fn test_per_dialog_callbacks_respect_mask() {
    let h = Harness::single();
    let call_id = "admin-callback@atlanta";
    let (id, token) = h.answered(call_id);

    let watcher = Recorder::new();
    h.tracker
        .register_callback(id, CallbackMask::of(&[DialogCallbackType::Terminated]), watcher.clone())
        .unwrap();

    h.tracker.on_in_dialog_request(&ack(call_id, &token)).unwrap();
    h.tracker.on_in_dialog_request(&bye_from_caller(call_id, &token)).unwrap();

    assert_eq!(watcher.count(DialogCallbackType::Confirmed), 0);
    assert_eq!(watcher.count(DialogCallbackType::RequestWithin), 0);
    assert_eq!(watcher.count_for(id, DialogCallbackType::Terminated), 1);
    assert_eq!(watcher.events().len(), 1);

    assert!(h
        .tracker
        .register_callback(id, CallbackMask::ALL, watcher)
        .is_err());
}
