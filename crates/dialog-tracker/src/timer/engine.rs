//! Dialog expiry timer engine
//!
//! One engine-wide lock protects an insertion-ordered list of
//! `(dialog, deadline)` entries. Entries refer to dialogs by identity only;
//! each entry stands for one reference the caller took on the dialog before
//! inserting it.
//!
//! Lock ordering with the registry:
//!
//! ```text
//! insert / update :  bucket lock ──▶ timer lock
//! tick            :  timer lock ──▶ (released) ──▶ bucket lock
//! ```
//!
//! `tick_with` therefore collects the expired entries under the timer lock
//! and only calls the expiry handler after releasing it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::dialog::DialogId;
use crate::errors::{DialogError, DialogResult};
use crate::timer::Clock;

/// Outcome of removing a timer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRemoval {
    /// The entry was armed and is now gone; its reference must be released
    Removed,
    /// The entry was not armed (already fired or never inserted)
    NotPresent,
    /// The identity can never be armed
    Invalid,
}

/// An armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    /// Dialog owning the entry
    pub dialog: DialogId,
    /// Absolute deadline in ticks
    pub deadline: u64,
}

#[derive(Debug, Default)]
struct TimerList {
    next_seq: u64,
    entries: BTreeMap<u64, TimerEntry>,
    index: HashMap<DialogId, u64>,
}

impl TimerList {
    fn take(&mut self, dialog: &DialogId) -> Option<TimerEntry> {
        let seq = self.index.remove(dialog)?;
        self.entries.remove(&seq)
    }

    fn push(&mut self, entry: TimerEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(seq, entry);
        self.index.insert(entry.dialog, seq);
    }
}

/// Dialog expiry engine
pub struct TimerEngine {
    list: Mutex<TimerList>,
    clock: Arc<dyn Clock>,
}

impl TimerEngine {
    /// Create an engine reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            list: Mutex::new(TimerList::default()),
            clock,
        }
    }

    /// Current engine time
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Arm a timer `rel_secs` from now and return its absolute deadline
    pub fn insert(&self, dialog: DialogId, rel_secs: u32) -> DialogResult<u64> {
        if !dialog.is_set() {
            return Err(DialogError::timer_error(format!("cannot arm timer for unlinked dialog {}", dialog)));
        }

        let deadline = self.clock.now() + u64::from(rel_secs);
        let mut list = self.list.lock();
        if list.index.contains_key(&dialog) {
            error!(dialog = %dialog, "timer entry already armed");
            return Err(DialogError::timer_error(format!("timer already armed for dialog {}", dialog)));
        }
        list.push(TimerEntry { dialog, deadline });
        debug!(dialog = %dialog, deadline, "timer armed");
        Ok(deadline)
    }

    /// Disarm a timer
    pub fn remove(&self, dialog: DialogId) -> TimerRemoval {
        if !dialog.is_set() {
            return TimerRemoval::Invalid;
        }

        match self.list.lock().take(&dialog) {
            Some(_) => {
                debug!(dialog = %dialog, "timer disarmed");
                TimerRemoval::Removed
            }
            None => TimerRemoval::NotPresent,
        }
    }

    /// Re-arm an armed timer `rel_secs` from now.
    ///
    /// Only an armed entry is moved; the reference it stands for carries over.
    /// Returns `Removed` when the entry was re-armed.
    pub fn update(&self, dialog: DialogId, rel_secs: u32) -> TimerRemoval {
        if !dialog.is_set() {
            return TimerRemoval::Invalid;
        }

        let deadline = self.clock.now() + u64::from(rel_secs);
        let mut list = self.list.lock();
        match list.take(&dialog) {
            Some(_) => {
                list.push(TimerEntry { dialog, deadline });
                debug!(dialog = %dialog, deadline, "timer re-armed");
                TimerRemoval::Removed
            }
            None => TimerRemoval::NotPresent,
        }
    }

    /// Remove and return every entry whose deadline has elapsed
    pub fn tick(&self) -> Vec<TimerEntry> {
        let now = self.clock.now();
        let mut list = self.list.lock();

        let expired: Vec<u64> = list
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        let mut fired = Vec::with_capacity(expired.len());
        for seq in expired {
            if let Some(entry) = list.entries.remove(&seq) {
                list.index.remove(&entry.dialog);
                fired.push(entry);
            }
        }
        fired
    }

    /// Expire due entries and hand each one to `handler` with the lock released
    pub fn tick_with<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(TimerEntry),
    {
        let fired = self.tick();
        let count = fired.len();
        for entry in fired {
            handler(entry);
        }
        count
    }

    /// Whether the dialog has an armed timer
    pub fn contains(&self, dialog: DialogId) -> bool {
        self.list.lock().index.contains_key(&dialog)
    }

    /// Deadline of the dialog's armed timer
    pub fn deadline_of(&self, dialog: DialogId) -> Option<u64> {
        let list = self.list.lock();
        let seq = list.index.get(&dialog)?;
        list.entries.get(seq).map(|e| e.deadline)
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.list.lock().entries.len()
    }

    /// Whether no timer is armed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TimerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEngine")
            .field("armed", &self.len())
            .field("now", &self.clock.now())
            .finish()
    }
}
