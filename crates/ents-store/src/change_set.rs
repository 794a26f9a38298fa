//! Per-cycle ledger of add/update/remove marks.
//!
//! Within one mutation cycle an id may be touched many times; the ledger
//! collapses those touches so that the id sits in exactly one bucket, the
//! one describing its net effect.

use std::collections::BTreeSet;

/// The net change recorded for an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeSetOp {
    Add,
    Update,
    Remove,
}

/// Three disjoint sets of ids: added, updated and removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSet<T: Ord + Copy> {
    added: BTreeSet<T>,
    updated: BTreeSet<T>,
    removed: BTreeSet<T>,
}

impl<T: Ord + Copy> Default for ChangeSet<T> {
    fn default() -> Self {
        Self {
            added: BTreeSet::new(),
            updated: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Copy> ChangeSet<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as added, superseding any earlier update or removal.
    pub fn add(&mut self, id: T) {
        self.updated.remove(&id);
        self.removed.remove(&id);
        self.added.insert(id);
    }

    /// Mark `id` as updated. An id already added stays added.
    pub fn update(&mut self, id: T) {
        if self.added.contains(&id) {
            return;
        }
        self.removed.remove(&id);
        self.updated.insert(id);
    }

    /// Mark `id` as removed, superseding any earlier add or update.
    pub fn remove(&mut self, id: T) {
        self.added.remove(&id);
        self.updated.remove(&id);
        self.removed.insert(id);
    }

    /// Apply a single op with the same transition rules as the named methods.
    pub fn mark(&mut self, id: T, op: ChangeSetOp) {
        match op {
            ChangeSetOp::Add => self.add(id),
            ChangeSetOp::Update => self.update(id),
            ChangeSetOp::Remove => self.remove(id),
        }
    }

    /// The net op recorded for `id`, if any.
    #[must_use]
    pub fn op(&self, id: &T) -> Option<ChangeSetOp> {
        if self.added.contains(id) {
            Some(ChangeSetOp::Add)
        } else if self.updated.contains(id) {
            Some(ChangeSetOp::Update)
        } else if self.removed.contains(id) {
            Some(ChangeSetOp::Remove)
        } else {
            None
        }
    }

    pub fn added(&self) -> impl Iterator<Item = T> + '_ {
        self.added.iter().copied()
    }

    pub fn updated(&self) -> impl Iterator<Item = T> + '_ {
        self.updated.iter().copied()
    }

    pub fn removed(&self) -> impl Iterator<Item = T> + '_ {
        self.removed.iter().copied()
    }

    /// Ids marked added or updated, ascending.
    pub fn added_or_updated(&self) -> impl Iterator<Item = T> + '_ {
        self.added.union(&self.updated).copied()
    }

    /// Replay another ledger's marks on top of this one.
    pub fn merge(&mut self, other: &Self) {
        for id in other.added() {
            self.add(id);
        }
        for id in other.updated() {
            self.update(id);
        }
        for id in other.removed() {
            self.remove(id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.added.clear();
        self.updated.clear();
        self.removed.clear();
    }
}
