//! Keep-alive schedule
//!
//! Confirmed dialogs flagged for keep-alive are probed periodically by a
//! collaborator that builds and sends the actual OPTIONS request. This
//! module only tracks who is due and when.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::dialog::{DialogId, DialogSnapshot};

/// Sends a keep-alive probe for a dialog.
///
/// The outcome is reported back asynchronously through
/// `DialogTracker::report_keepalive`.
pub trait KeepAliveSender: Send + Sync {
    /// Send one probe towards both ends of the dialog
    fn send_keepalive(&self, dialog: &DialogSnapshot);
}

#[derive(Debug, Clone, Copy)]
struct KeepAliveEntry {
    dialog: DialogId,
    next_due: u64,
}

/// FIFO of dialogs waiting for their next probe
#[derive(Debug, Default)]
pub struct KeepAliveList {
    entries: Mutex<VecDeque<KeepAliveEntry>>,
}

impl KeepAliveList {
    /// Create an empty schedule
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a dialog; a dialog already scheduled keeps its slot
    pub fn add(&self, dialog: DialogId, next_due: u64) {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.dialog == dialog) {
            return;
        }
        entries.push_back(KeepAliveEntry { dialog, next_due });
    }

    /// Remove a dialog from the schedule
    pub fn remove(&self, dialog: DialogId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.dialog != dialog);
        before != entries.len()
    }

    /// Pop every due dialog and reschedule it `interval` seconds later
    pub fn take_due(&self, now: u64, interval: u64) -> Vec<DialogId> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        for entry in entries.iter_mut().filter(|e| e.next_due <= now) {
            due.push(entry.dialog);
            entry.next_due = now + interval;
        }
        due
    }

    /// Number of scheduled dialogs
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_dialogs_are_rescheduled() {
        let list = KeepAliveList::new();
        let a = DialogId::new(1, 1);
        let b = DialogId::new(1, 2);
        list.add(a, 10);
        list.add(b, 20);
        list.add(a, 99);

        assert_eq!(list.take_due(10, 30), vec![a]);
        assert!(list.take_due(15, 30).is_empty());
        assert_eq!(list.take_due(40, 30), vec![a, b]);

        assert!(list.remove(a));
        assert!(!list.remove(a));
        assert_eq!(list.len(), 1);
    }
}
