//! Internal dialog flags

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit set of internal dialog flags
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialogFlags(u32);

impl DialogFlags {
    /// Never written to the store
    pub const NEW: DialogFlags = DialogFlags(1 << 0);
    /// Needs a store update
    pub const CHANGED: DialogFlags = DialogFlags(1 << 1);
    /// A BYE was seen
    pub const HAS_BYE: DialogFlags = DialogFlags(1 << 2);
    /// Probed by the keep-alive loop
    pub const KEEPALIVE: DialogFlags = DialogFlags(1 << 3);
    /// The initial request looped back through the proxy
    pub const SPIRALED: DialogFlags = DialogFlags(1 << 4);
    /// Owned by a peer instance
    pub const REPLICATED: DialogFlags = DialogFlags(1 << 5);
    /// In-dialog requests do not push the deadline back
    pub const TIMEOUT_NORESET: DialogFlags = DialogFlags(1 << 6);

    /// Empty flag set
    pub const fn empty() -> Self {
        DialogFlags(0)
    }

    /// Raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Rebuild from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        DialogFlags(bits)
    }

    /// Whether every flag in `other` is set
    pub const fn contains(&self, other: DialogFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`
    pub fn insert(&mut self, other: DialogFlags) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`
    pub fn remove(&mut self, other: DialogFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for DialogFlags {
    type Output = DialogFlags;

    fn bitor(self, rhs: DialogFlags) -> DialogFlags {
        DialogFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for DialogFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(DialogFlags, &str); 7] = [
            (DialogFlags::NEW, "NEW"),
            (DialogFlags::CHANGED, "CHANGED"),
            (DialogFlags::HAS_BYE, "HAS_BYE"),
            (DialogFlags::KEEPALIVE, "KEEPALIVE"),
            (DialogFlags::SPIRALED, "SPIRALED"),
            (DialogFlags::REPLICATED, "REPLICATED"),
            (DialogFlags::TIMEOUT_NORESET, "TIMEOUT_NORESET"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "DialogFlags({})", set.join(" | "))
    }
}
