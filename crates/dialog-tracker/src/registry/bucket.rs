//! Registry buckets and their reentrant lock
//!
//! Each bucket owns the dialogs that hash to it and a sequence counter used
//! to hand out identities. The bucket lock is reentrant: a thread already
//! holding it (for example across a reserve-on-miss lookup) may lock it
//! again without deadlocking. Owner and depth are tracked explicitly and
//! exposed on [`BucketGuard`].
//!
//! Reentrancy only covers the lock. Access to the entries is a short,
//! non-nested borrow; a nested mutable borrow is reported as an invariant
//! violation instead of panicking.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::thread::{self, ThreadId};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::error;

use crate::dialog::Dialog;
use crate::errors::{DialogError, DialogResult};

/// Contents of one bucket
#[derive(Debug, Default)]
pub(crate) struct BucketEntries {
    /// Linked dialogs in link order
    pub dialogs: Vec<Dialog>,
    /// Last sequence number handed out
    pub next_id: u32,
}

impl BucketEntries {
    pub fn position(&self, seq: u32) -> Option<usize> {
        self.dialogs.iter().position(|d| d.id.seq == seq)
    }

    /// Hand out the next sequence number, skipping 0 and numbers still in use
    pub fn allocate_seq(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            let seq = self.next_id;
            if seq != 0 && self.position(seq).is_none() {
                return seq;
            }
        }
    }
}

struct BucketState {
    owner: Cell<Option<ThreadId>>,
    depth: Cell<usize>,
    entries: RefCell<BucketEntries>,
}

/// One shard of the registry
pub(crate) struct Bucket {
    index: u32,
    state: ReentrantMutex<BucketState>,
}

impl Bucket {
    pub fn new(index: u32, seed: u32) -> Self {
        Self {
            index,
            state: ReentrantMutex::new(BucketState {
                owner: Cell::new(None),
                depth: Cell::new(0),
                entries: RefCell::new(BucketEntries {
                    dialogs: Vec::new(),
                    next_id: seed,
                }),
            }),
        }
    }

    /// Acquire the bucket lock, reentrantly for the owning thread
    pub fn lock(&self) -> BucketGuard<'_> {
        let guard = self.state.lock();
        let depth = guard.depth.get();
        if depth == 0 {
            guard.owner.set(Some(thread::current().id()));
        }
        guard.depth.set(depth + 1);
        BucketGuard {
            index: self.index,
            guard,
        }
    }
}

/// Held bucket lock
pub struct BucketGuard<'a> {
    index: u32,
    guard: ReentrantMutexGuard<'a, BucketState>,
}

impl<'a> BucketGuard<'a> {
    /// Index of the locked bucket
    pub fn bucket(&self) -> u32 {
        self.index
    }

    /// Number of nested acquisitions by the owning thread, this one included
    pub fn depth(&self) -> usize {
        self.guard.depth.get()
    }

    /// Thread holding the lock
    pub fn owner(&self) -> Option<ThreadId> {
        self.guard.owner.get()
    }

    pub(crate) fn entries(&self) -> DialogResult<Ref<'_, BucketEntries>> {
        self.guard.entries.try_borrow().map_err(|_| {
            error!(bucket = self.index, "bucket entries already mutably borrowed");
            DialogError::invariant(format!("re-entrant access to bucket {}", self.index))
        })
    }

    pub(crate) fn entries_mut(&self) -> DialogResult<RefMut<'_, BucketEntries>> {
        self.guard.entries.try_borrow_mut().map_err(|_| {
            error!(bucket = self.index, "bucket entries already borrowed");
            DialogError::invariant(format!("re-entrant mutation of bucket {}", self.index))
        })
    }
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        let depth = self.guard.depth.get();
        if depth == 0 {
            error!(bucket = self.index, "bucket lock depth underflow");
            return;
        }
        self.guard.depth.set(depth - 1);
        if depth == 1 {
            self.guard.owner.set(None);
        }
    }
}
