//! Unconfirmed transactions waiting on parents that are not indexed yet.

use std::collections::{HashMap, HashSet};

use crate::types::Hash256;

/// Tracks orphaned transactions and the parents blocking them.
///
/// Nothing here is persisted: after a restart orphans are rediscovered
/// from the upstream mempool.
#[derive(Debug, Default)]
pub struct OrphanPool {
    /// orphan txid → parent txids still missing.
    blocked_on: HashMap<Hash256, HashSet<Hash256>>,
    /// parent txid → orphans waiting for it.
    dependents: HashMap<Hash256, HashSet<Hash256>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `txid` as blocked on each of `missing`.
    ///
    /// Recording the same orphan again merges the parent sets. A self
    /// reference is ignored; an empty parent set records nothing.
    pub fn record_orphan(&mut self, txid: Hash256, missing: impl IntoIterator<Item = Hash256>) {
        let missing: HashSet<Hash256> = missing.into_iter().filter(|p| *p != txid).collect();
        if missing.is_empty() {
            return;
        }
        for parent in &missing {
            self.dependents.entry(*parent).or_default().insert(txid);
        }
        self.blocked_on.entry(txid).or_default().extend(missing);
    }

    /// Mark `parent` as available. Returns orphans that have no missing
    /// parents left, sorted; they are no longer tracked.
    pub fn resolve(&mut self, parent: &Hash256) -> Vec<Hash256> {
        let Some(waiting) = self.dependents.remove(parent) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for child in waiting {
            let Some(blockers) = self.blocked_on.get_mut(&child) else {
                continue;
            };
            blockers.remove(parent);
            if blockers.is_empty() {
                self.blocked_on.remove(&child);
                ready.push(child);
            }
        }
        ready.sort();
        ready
    }

    /// Stop tracking `txid` entirely.
    pub fn remove(&mut self, txid: &Hash256) -> bool {
        let Some(parents) = self.blocked_on.remove(txid) else {
            return false;
        };
        for parent in parents {
            if let Some(children) = self.dependents.get_mut(&parent) {
                children.remove(txid);
                if children.is_empty() {
                    self.dependents.remove(&parent);
                }
            }
        }
        true
    }

    /// Stop tracking every orphan for which `keep` returns false.
    /// Returns the evicted txids, sorted.
    pub fn retain(&mut self, mut keep: impl FnMut(&Hash256) -> bool) -> Vec<Hash256> {
        let mut evicted: Vec<Hash256> = self.blocked_on.keys().filter(|txid| !keep(txid)).copied().collect();
        evicted.sort();
        for txid in &evicted {
            self.remove(txid);
        }
        evicted
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.blocked_on.contains_key(txid)
    }

    /// Parents `txid` is still waiting on.
    pub fn missing_parents(&self, txid: &Hash256) -> Option<&HashSet<Hash256>> {
        self.blocked_on.get(txid)
    }

    /// Number of tracked orphans.
    pub fn len(&self) -> usize {
        self.blocked_on.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked_on.is_empty()
    }
}
