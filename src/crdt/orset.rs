//! Observed-remove set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A unique add-tag: `(node_id, per-node monotonic sequence)`.
///
/// The sequence is a local counter, not a wall clock; tags stay unique and
/// comparable under clock skew across replicas.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub node_id: String,
    pub seq: u64,
}

/// Add-wins set: removes only target the add-tags observed at remove time,
/// so a concurrent add (with a tag the remover never saw) survives the
/// merge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrSet<T: Ord> {
    /// Live add-tags per element.
    adds: BTreeMap<T, BTreeSet<Tag>>,
    /// Tombstoned tags per element; carried through merges so observed
    /// removes win over stale copies of their adds.
    removes: BTreeMap<T, BTreeSet<Tag>>,
    /// Per-node tag sequence counters.
    counters: BTreeMap<String, u64>,
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        Self {
            adds: BTreeMap::new(),
            removes: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Add `value` with a fresh tag; the tag is returned for gossip.
    pub fn add(&mut self, value: T, node_id: &str) -> Tag {
        let seq = self.counters.entry(node_id.to_string()).or_insert(0);
        *seq += 1;
        let tag = Tag {
            node_id: node_id.to_string(),
            seq: *seq,
        };
        self.adds.entry(value).or_default().insert(tag.clone());
        tag
    }

    /// Remove every currently-observed tag of `value`. Tags added
    /// concurrently elsewhere are unaffected.
    pub fn remove(&mut self, value: &T) {
        let Some(tags) = self.adds.remove(value) else {
            return;
        };
        self.removes.entry(value.clone()).or_default().extend(tags);
    }

    pub fn contains(&self, value: &T) -> bool {
        self.adds.get(value).is_some_and(|tags| !tags.is_empty())
    }

    /// All present values, in sorted order.
    pub fn values(&self) -> Vec<&T> {
        self.adds
            .iter()
            .filter(|(_, tags)| !tags.is_empty())
            .map(|(value, _)| value)
            .collect()
    }

    /// Element-wise union of both tag sets, with tombstones winning over
    /// the adds they observed.
    pub fn merge(&mut self, other: &OrSet<T>) {
        for (value, tags) in &other.adds {
            self.adds
                .entry(value.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
        for (value, tags) in &other.removes {
            self.removes
                .entry(value.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
        // Drop any live tag that some replica has tombstoned.
        for (value, removed) in &self.removes {
            if let Some(live) = self.adds.get_mut(value) {
                live.retain(|tag| !removed.contains(tag));
            }
        }
        self.adds.retain(|_, tags| !tags.is_empty());

        // Advance tag counters past anything seen, so future local tags
        // stay unique after state transfer.
        for (node, &seq) in &other.counters {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(seq);
        }
    }
}
