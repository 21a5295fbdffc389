//! Shared helpers for the dialog tracker integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_dialog_tracker::{
    DialogCallbackType, DialogEvent, DialogId, DialogObserver, DialogTracker, InDialogRequest, InitialRequest,
    ManualClock, RequestInOutcome, ResponseInfo, TrackerConfig, TransactionBinding, TransactionEvent,
};

pub const ALICE_TAG: &str = "alice-tag";
pub const BOB_TAG: &str = "bob-tag";

/// Install a subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Observer recording every event it sees
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<DialogEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<DialogEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: DialogCallbackType) -> usize {
        self.events.lock().iter().filter(|e| e.callback_type() == kind).count()
    }

    pub fn count_for(&self, id: DialogId, kind: DialogCallbackType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.callback_type() == kind && e.dialog_id() == id)
            .count()
    }
}

impl DialogObserver for Recorder {
    fn on_dialog_event(&self, event: &DialogEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Tracker on a manual clock with a recorder attached
pub struct Harness {
    pub tracker: Arc<DialogTracker>,
    pub clock: Arc<ManualClock>,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub fn new(config: TrackerConfig) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(1_000));
        let tracker = Arc::new(DialogTracker::with_clock(config, clock.clone()).unwrap());
        let recorder = Recorder::new();
        tracker.add_observer(recorder.clone());
        Self {
            tracker,
            clock,
            recorder,
        }
    }

    pub fn single() -> Self {
        Self::new(TrackerConfig::default().with_hash_size(64))
    }

    /// Send an INVITE and expect a new dialog
    pub fn invite(&self, call_id: &str) -> (TransactionBinding, String) {
        match self.tracker.on_request_in(&invite(call_id)).unwrap() {
            RequestInOutcome::Created { binding, token } => (binding, token),
            other => panic!("expected a new dialog, got {:?}", other),
        }
    }

    /// Report a response the way the transaction layer does: ready, then forwarded
    pub fn respond(&self, binding: &TransactionBinding, status: u16, to_tag: Option<&str>) {
        let mut response = ResponseInfo::new(status);
        if let Some(tag) = to_tag {
            response = response.with_to_tag(tag);
        }
        self.tracker
            .on_transaction_event(binding, TransactionEvent::ResponseReady(response.clone()));
        self.tracker
            .on_transaction_event(binding, TransactionEvent::ResponseForwarded(response));
    }

    /// INVITE, 180, 200, transaction end: an answered dialog waiting for ACK
    pub fn answered(&self, call_id: &str) -> (DialogId, String) {
        let (binding, token) = self.invite(call_id);
        let id = binding.dialog();
        self.respond(&binding, 180, Some(BOB_TAG));
        self.respond(&binding, 200, Some(BOB_TAG));
        self.tracker.on_transaction_event(&binding, TransactionEvent::Destroyed);
        self.tracker.release_binding(binding);
        (id, token)
    }

    /// Answered and acknowledged dialog
    pub fn confirmed(&self, call_id: &str) -> (DialogId, String) {
        let (id, token) = self.answered(call_id);
        self.tracker.on_in_dialog_request(&ack(call_id, &token)).unwrap();
        (id, token)
    }
}

pub fn invite(call_id: &str) -> InitialRequest {
    InitialRequest::new(
        call_id,
        ALICE_TAG,
        "sip:alice@atlanta.example.com",
        "sip:bob@biloxi.example.com",
        "sip:bob@192.0.2.4",
    )
    .with_contact("sip:alice@pc33.atlanta.example.com")
    .with_cseq(1)
}

pub fn ack(call_id: &str, token: &str) -> InDialogRequest {
    InDialogRequest::new("ACK", call_id, ALICE_TAG)
        .with_to_tag(BOB_TAG)
        .with_token(token)
        .with_cseq(1)
}

/// BYE from the callee towards the caller
pub fn bye_from_callee(call_id: &str, token: &str) -> InDialogRequest {
    InDialogRequest::new("BYE", call_id, BOB_TAG)
        .with_to_tag(ALICE_TAG)
        .with_token(token)
        .with_cseq(1)
}

pub fn bye_from_caller(call_id: &str, token: &str) -> InDialogRequest {
    InDialogRequest::new("BYE", call_id, ALICE_TAG)
        .with_to_tag(BOB_TAG)
        .with_token(token)
        .with_cseq(2)
}
