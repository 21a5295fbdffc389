//! Branch tracking for forking proxies
//!
//! When a proxy forks an initial request, every destination that answers
//! with its own to-tag becomes a [`Branch`] of the same dialog. Branches are
//! owned by the dialog record and therefore protected by the bucket lock of
//! the registry; they have no lock of their own.
//!
//! Branches are never removed as soon as they lose: [`Branches::mark_for_deletion`]
//! only flags them so that late retransmissions still match, and
//! [`Branches::reap_marked`] drops them once the owning transaction is done.

use serde::{Deserialize, Serialize};

use crate::dialog::DialogId;

/// One forked callee leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// To-tag distinguishing the branch
    pub to_tag: String,
    /// To-URI as seen in the branch's responses
    pub to_uri: String,
    /// Remote contact
    pub contact: Option<String>,
    /// Remote route set
    pub route_set: Vec<String>,
    /// Remote CSeq
    pub cseq: Option<u32>,
    /// Obsolete, waiting to be reaped
    pub deleted: bool,
    /// Answered with a 2xx that the dialog accepted
    pub confirmed: bool,
}

impl Branch {
    fn new(to_tag: impl Into<String>, to_uri: impl Into<String>) -> Self {
        Self {
            to_tag: to_tag.into(),
            to_uri: to_uri.into(),
            contact: None,
            route_set: Vec::new(),
            cseq: None,
            deleted: false,
            confirmed: false,
        }
    }

    /// Whether the branch still takes part in the dialog
    pub fn is_active(&self) -> bool {
        !self.deleted
    }
}

/// Reference to a branch of a linked dialog
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchHandle {
    /// Owning dialog
    pub dialog: DialogId,
    /// To-tag of the branch
    pub to_tag: String,
}

/// Branch list owned by a dialog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Branches(Vec<Branch>);

impl Branches {
    /// Append a branch; an existing branch with the same tag is reused
    pub fn add(&mut self, to_tag: &str, to_uri: &str) -> &mut Branch {
        match self.0.iter().position(|b| b.to_tag == to_tag) {
            Some(index) => &mut self.0[index],
            None => {
                self.0.push(Branch::new(to_tag, to_uri));
                let last = self.0.len() - 1;
                &mut self.0[last]
            }
        }
    }

    /// Branch with the given tag
    pub fn get(&self, to_tag: &str) -> Option<&Branch> {
        self.0.iter().find(|b| b.to_tag == to_tag)
    }

    /// Mutable branch with the given tag
    pub fn get_mut(&mut self, to_tag: &str) -> Option<&mut Branch> {
        self.0.iter_mut().find(|b| b.to_tag == to_tag)
    }

    /// Flag a branch as obsolete; returns false when the tag is unknown
    pub fn mark_for_deletion(&mut self, to_tag: &str) -> bool {
        match self.get_mut(to_tag) {
            Some(branch) => {
                branch.deleted = true;
                true
            }
            None => false,
        }
    }

    /// Flag every branch except `keep` as obsolete
    pub fn mark_others_for_deletion(&mut self, keep: &str) -> usize {
        let mut marked = 0;
        for branch in self.0.iter_mut().filter(|b| b.to_tag != keep && !b.deleted) {
            branch.deleted = true;
            marked += 1;
        }
        marked
    }

    /// Flag every branch as obsolete
    pub fn mark_all_for_deletion(&mut self) {
        for branch in self.0.iter_mut() {
            branch.deleted = true;
        }
    }

    /// Drop every flagged branch, returning how many were removed
    pub fn reap_marked(&mut self) -> usize {
        let before = self.0.len();
        self.0.retain(|b| !b.deleted);
        before - self.0.len()
    }

    /// Number of active branches other than `to_tag`
    pub fn active_except(&self, to_tag: Option<&str>) -> usize {
        self.0
            .iter()
            .filter(|b| b.is_active() && Some(b.to_tag.as_str()) != to_tag)
            .count()
    }

    /// Whether `to_tag` belongs to a branch the dialog already accepted
    pub fn is_confirmed(&self, to_tag: &str) -> bool {
        self.get(to_tag).map(|b| b.confirmed).unwrap_or(false)
    }

    /// Iterate over the branches in arrival order
    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.0.iter()
    }

    /// Number of branches, flagged ones included
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no branches
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent_per_tag() {
        let mut branches = Branches::default();
        branches.add("a", "sip:a@example.com");
        branches.add("b", "sip:b@example.com");
        branches.add("a", "sip:a@example.com").cseq = Some(1);

        assert_eq!(branches.len(), 2);
        assert_eq!(branches.get("a").and_then(|b| b.cseq), Some(1));
    }

    #[test]
    fn test_mark_then_reap() {
        let mut branches = Branches::default();
        branches.add("a", "sip:a@example.com");
        branches.add("b", "sip:b@example.com");
        branches.add("c", "sip:c@example.com");

        assert!(branches.mark_for_deletion("b"));
        assert!(!branches.mark_for_deletion("zz"));
        // Marked branches still match late traffic
        assert!(branches.get("b").is_some());
        assert_eq!(branches.active_except(Some("a")), 1);

        assert_eq!(branches.reap_marked(), 1);
        assert!(branches.get("b").is_none());
        assert_eq!(branches.len(), 2);
    }

    #[test]
    fn test_mark_others_keeps_winner() {
        let mut branches = Branches::default();
        branches.add("a", "sip:a@example.com");
        branches.add("b", "sip:b@example.com");
        assert_eq!(branches.mark_others_for_deletion("a"), 1);
        assert_eq!(branches.active_except(None), 1);
        assert!(branches.get("a").map(|b| b.is_active()).unwrap_or(false));
    }
}
