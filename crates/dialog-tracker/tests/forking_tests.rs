//! Forked INVITE handling
//!
//! In forking mode every to-tag gets its own branch. The first 2xx confirms
//! the dialog; a 2xx from another branch splits off a sibling dialog.

mod common;

use common::*;
use rvoip_dialog_tracker::{
    DialogCallbackType, DialogEvent, DialogState, InDialogRequest, ResponseInfo, TrackerConfig, TrackingMode,
    TransactionEvent,
};

const BRANCH_A: &str = "branch-a";
const BRANCH_B: &str = "branch-b";

fn forking() -> Harness {
    Harness::new(
        TrackerConfig::default()
            .with_hash_size(32)
            .with_tracking_mode(TrackingMode::Forking),
    )
}

fn response_in(h: &Harness, binding: &rvoip_dialog_tracker::TransactionBinding, status: u16, tag: &str) {
    h.tracker.on_transaction_event(
        binding,
        TransactionEvent::ResponseIn(ResponseInfo::new(status).with_to_tag(tag).with_contact(format!("sip:{}@host", tag))),
    );
}

fn bye(call_id: &str, token: &str, callee_tag: &str) -> InDialogRequest {
    InDialogRequest::new("BYE", call_id, ALICE_TAG)
        .with_to_tag(callee_tag)
        .with_token(token)
}

#[test]
fn test_each_tag_gets_a_branch() {
    let h = forking();
    let (binding, _token) = h.invite("fork-branches@atlanta");
    let id = binding.dialog();

    response_in(&h, &binding, 180, BRANCH_A);
    response_in(&h, &binding, 183, BRANCH_B);
    response_in(&h, &binding, 180, BRANCH_A);

    let snapshot = h.tracker.snapshot(id).unwrap();
    assert_eq!(snapshot.branches.len(), 2);
    let a = snapshot.branches.get(BRANCH_A).unwrap();
    assert_eq!(a.contact.as_deref(), Some("sip:branch-a@host"));
    assert!(a.is_active());

    h.tracker.on_transaction_event(&binding, TransactionEvent::Destroyed);
    h.tracker.release_binding(binding);
    assert_eq!(h.tracker.dialog_count(), 0);
}

#[test]
fn test_first_answer_confirms_and_obsoletes_other_branches() {
    let h = forking();
    let call_id = "fork-first-answer@atlanta";
    let (binding, token) = h.invite(call_id);
    let id = binding.dialog();

    response_in(&h, &binding, 180, BRANCH_A);
    response_in(&h, &binding, 180, BRANCH_B);
    h.respond(&binding, 180, Some(BRANCH_A));
    assert_eq!(h.tracker.snapshot(id).unwrap().state, DialogState::Early);

    response_in(&h, &binding, 200, BRANCH_A);
    h.respond(&binding, 200, Some(BRANCH_A));
    let snapshot = h.tracker.snapshot(id).unwrap();
    assert_eq!(snapshot.state, DialogState::Confirmed);
    assert_eq!(snapshot.to_tag.as_deref(), Some(BRANCH_A));
    assert!(snapshot.branches.get(BRANCH_A).unwrap().confirmed);
    assert!(snapshot.branches.get(BRANCH_B).unwrap().deleted);

    h.tracker.on_transaction_event(&binding, TransactionEvent::Destroyed);
    h.tracker.release_binding(binding);
    let snapshot = h.tracker.snapshot(id).unwrap();
    assert_eq!(snapshot.branches.len(), 1);

    let outcome = h
        .tracker
        .on_in_dialog_request(&bye(call_id, &token, BRANCH_A))
        .unwrap()
        .unwrap();
    assert!(outcome.destroyed);
    assert_eq!(h.tracker.dialog_count(), 0);
}

#[test]
fn test_failure_waits_for_remaining_branches() {
    let h = forking();
    let (binding, _token) = h.invite("fork-failure@atlanta");
    let id = binding.dialog();

    response_in(&h, &binding, 180, BRANCH_A);
    response_in(&h, &binding, 180, BRANCH_B);

    h.tracker.on_transaction_event(
        &binding,
        TransactionEvent::OnFailure(ResponseInfo::new(486).with_to_tag(BRANCH_A)),
    );
    h.respond(&binding, 486, Some(BRANCH_A));
    assert_eq!(h.tracker.snapshot(id).unwrap().state, DialogState::Unconfirmed);
    assert_eq!(h.recorder.count(DialogCallbackType::Failed), 0);

    h.respond(&binding, 603, Some(BRANCH_B));
    assert_eq!(h.tracker.snapshot(id).unwrap().state, DialogState::Deleted);
    assert!(h.recorder.events().contains(&DialogEvent::Failed { id, status: Some(603) }));

    h.tracker.on_transaction_event(&binding, TransactionEvent::Destroyed);
    h.tracker.release_binding(binding);
    assert_eq!(h.tracker.dialog_count(), 0);
}

#[test]
fn test_second_answer_creates_sibling_dialog() {
    let h = forking();
    let call_id = "fork-concurrent@atlanta";
    let (binding, token) = h.invite(call_id);
    let parent = binding.dialog();

    response_in(&h, &binding, 180, BRANCH_A);
    response_in(&h, &binding, 180, BRANCH_B);
    h.respond(&binding, 200, Some(BRANCH_A));
    h.respond(&binding, 200, Some(BRANCH_B));

    assert_eq!(h.tracker.snapshot(parent).unwrap().state, DialogState::ConcurrentlyConfirmed);
    let siblings = h.tracker.siblings(parent);
    assert_eq!(siblings.len(), 1);
    let sibling = siblings[0];
    assert_ne!(sibling, parent);
    assert_eq!(sibling.bucket, parent.bucket);

    let snapshot = h.tracker.snapshot(sibling).unwrap();
    assert_eq!(snapshot.state, DialogState::Confirmed);
    assert_eq!(snapshot.to_tag.as_deref(), Some(BRANCH_B));
    assert_eq!(snapshot.parent, Some(parent));
    assert!(h.tracker.timers().contains(sibling));
    assert!(h.recorder.events().contains(&DialogEvent::ConcurrentBranch {
        parent,
        sibling,
        to_tag: BRANCH_B.to_string(),
    }));

    // A retransmitted 200 from the same branch changes nothing
    h.respond(&binding, 200, Some(BRANCH_B));
    assert_eq!(h.tracker.siblings(parent).len(), 1);
    assert_eq!(h.tracker.dialog_count(), 2);

    h.tracker.on_transaction_event(&binding, TransactionEvent::Destroyed);
    h.tracker.release_binding(binding);

    // The parent's token reaches the sibling when the tags say so
    let outcome = h
        .tracker
        .on_in_dialog_request(&bye(call_id, &token, BRANCH_B))
        .unwrap()
        .unwrap();
    assert_eq!(outcome.dialog, sibling);
    assert!(outcome.destroyed);
    assert_eq!(h.tracker.snapshot(parent).unwrap().state, DialogState::ConcurrentlyConfirmed);
    assert!(h.tracker.siblings(parent).is_empty());

    let outcome = h
        .tracker
        .on_in_dialog_request(&bye(call_id, &token, BRANCH_A))
        .unwrap()
        .unwrap();
    assert_eq!(outcome.dialog, parent);
    assert!(outcome.destroyed);

    assert_eq!(h.tracker.dialog_count(), 0);
    assert_eq!(h.recorder.count(DialogCallbackType::Destroyed), 2);
}

#[test]
fn test_transaction_gone_marks_every_branch() {
    let h = forking();
    let (binding, _token) = h.invite("fork-cancel@atlanta");
    let id = binding.dialog();

    response_in(&h, &binding, 180, BRANCH_A);
    response_in(&h, &binding, 180, BRANCH_B);
    h.tracker.on_transaction_event(&binding, TransactionEvent::Destroyed);

    let snapshot = h.tracker.snapshot(id).unwrap();
    assert_eq!(snapshot.state, DialogState::Deleted);
    assert!(snapshot.branches.is_empty());

    h.tracker.release_binding(binding);
    assert_eq!(h.tracker.dialog_count(), 0);
}
