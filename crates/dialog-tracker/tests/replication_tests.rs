//! Replication of dialog state between two tracker instances

mod common;

use std::time::Duration;

use common::*;
use rvoip_dialog_tracker::{
    DialogCallbackType, DialogError, DialogFlags, DialogState, ReplicationEvent, TrackerConfig,
};
use tokio::sync::broadcast;

fn config() -> TrackerConfig {
    TrackerConfig::default()
        .with_hash_size(32)
        .with_default_lifetime(Duration::from_secs(30))
}

fn drain(rx: &mut broadcast::Receiver<ReplicationEvent>) -> Vec<ReplicationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Ship events to a peer the way a transport would, through JSON
fn ship(events: &[ReplicationEvent], peer: &Harness) {
    for event in events {
        let json = event.to_json().unwrap();
        peer.tracker
            .apply_replication(ReplicationEvent::from_json(&json).unwrap())
            .unwrap();
    }
}

#[tokio::test]
async fn test_confirmed_dialog_is_mirrored() {
    let a = Harness::new(config());
    let b = Harness::new(config());
    let mut rx = a.tracker.subscribe_replication();

    let (id, _token) = a.confirmed("repl-mirror@atlanta");
    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(ReplicationEvent::Created { .. })));
    assert!(events.iter().all(|e| e.dialog_id() == id));
    match events.last() {
        Some(ReplicationEvent::StateChanged { snapshot }) => assert_eq!(snapshot.state, DialogState::Confirmed),
        other => panic!("unexpected last event {:?}", other),
    }

    ship(&events, &b);

    let mirrored = b.tracker.snapshot(id).unwrap();
    assert_eq!(mirrored.state, DialogState::Confirmed);
    assert!(mirrored.flags.contains(DialogFlags::REPLICATED));
    assert_eq!(mirrored.call_id, "repl-mirror@atlanta");
    assert_eq!(mirrored.to_tag.as_deref(), Some(BOB_TAG));
    assert!(b.tracker.timers().contains(id));
    assert_eq!(mirrored.ref_count, 2);

    // No SIP side effect or event fan-out on the mirror
    assert_eq!(b.recorder.count(DialogCallbackType::Created), 0);
}

#[tokio::test]
async fn test_removal_follows_peer() {
    let a = Harness::new(config());
    let b = Harness::new(config());
    let mut rx = a.tracker.subscribe_replication();

    let call_id = "repl-remove@atlanta";
    let (id, token) = a.confirmed(call_id);
    ship(&drain(&mut rx), &b);
    assert_eq!(b.tracker.dialog_count(), 1);

    a.tracker.on_in_dialog_request(&bye_from_caller(call_id, &token)).unwrap();
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, ReplicationEvent::Removed { id: removed } if *removed == id)));

    ship(&events, &b);
    assert_eq!(b.tracker.dialog_count(), 0);
    assert!(!b.tracker.timers().contains(id));
}

#[tokio::test]
async fn test_locally_owned_dialog_is_not_overwritten() {
    let a = Harness::new(config());
    let mut rx = a.tracker.subscribe_replication();

    let (id, _) = a.confirmed("repl-own@atlanta");
    let created = drain(&mut rx).remove(0);

    assert!(matches!(
        a.tracker.apply_replication(created),
        Err(DialogError::Replication { .. })
    ));
    assert_eq!(a.tracker.snapshot(id).unwrap().state, DialogState::Confirmed);

    // A removal for a local dialog is ignored
    a.tracker
        .apply_replication(ReplicationEvent::Removed { id })
        .unwrap();
    assert!(a.tracker.snapshot(id).is_some());
}

#[tokio::test]
async fn test_mirror_does_not_rebroadcast() {
    let a = Harness::new(config());
    let b = Harness::new(config());
    let mut from_a = a.tracker.subscribe_replication();
    let mut from_b = b.tracker.subscribe_replication();

    let (id, _) = a.confirmed("repl-quiet@atlanta");
    ship(&drain(&mut from_a), &b);
    b.tracker.set_var(id, "note", Some("mirrored")).unwrap();

    assert!(drain(&mut from_b).is_empty());
}

#[tokio::test]
async fn test_variable_update_carries_vars() {
    let a = Harness::new(config());
    let b = Harness::new(config());
    let mut rx = a.tracker.subscribe_replication();

    let (id, _) = a.confirmed("repl-vars@atlanta");
    ship(&drain(&mut rx), &b);

    a.tracker.set_var(id, "billing", Some("prepaid")).unwrap();
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        ReplicationEvent::Updated { snapshot } => {
            assert_eq!(snapshot.vars.get("billing").map(String::as_str), Some("prepaid"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    ship(&events, &b);
    assert_eq!(b.tracker.get_var(id, "billing").as_deref(), Some("prepaid"));
}

#[tokio::test]
async fn test_mirrored_dialog_expires_silently() {
    let a = Harness::new(config());
    let b = Harness::new(config());
    let mut from_a = a.tracker.subscribe_replication();
    let mut from_b = b.tracker.subscribe_replication();

    let (id, _) = a.confirmed("repl-expire@atlanta");
    ship(&drain(&mut from_a), &b);

    b.clock.advance(31);
    assert_eq!(b.tracker.tick(), 1);
    assert!(b.tracker.snapshot(id).is_none());
    assert!(drain(&mut from_b).is_empty());

    // The owner still holds it
    assert!(a.tracker.snapshot(id).is_some());
}

#[tokio::test]
async fn test_no_events_without_subscribers() {
    let a = Harness::new(config());
    a.confirmed("repl-nobody@atlanta");

    // Subscribing late sees nothing from before
    let mut rx = a.tracker.subscribe_replication();
    assert!(drain(&mut rx).is_empty());
}
