//! Positive-negative counter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A counter supporting concurrent increments and decrements.
///
/// Each replica owns its own slots in the positive and negative maps, so
/// merges never lose updates: the merged value is the per-key maximum.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    positive: BTreeMap<String, u64>,
    negative: BTreeMap<String, u64>,
}

impl PnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, node_id: &str, delta: u64) {
        *self.positive.entry(node_id.to_string()).or_insert(0) += delta;
    }

    pub fn decrement(&mut self, node_id: &str, delta: u64) {
        *self.negative.entry(node_id.to_string()).or_insert(0) += delta;
    }

    /// Sum of increments minus sum of decrements across all replicas.
    pub fn value(&self) -> i64 {
        let pos: u64 = self.positive.values().sum();
        let neg: u64 = self.negative.values().sum();
        pos as i64 - neg as i64
    }

    /// Per-key maximum of both maps.
    pub fn merge(&mut self, other: &PnCounter) {
        for (node, &count) in &other.positive {
            let entry = self.positive.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        for (node, &count) in &other.negative {
            let entry = self.negative.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_is_signed_difference() {
        let mut counter = PnCounter::new();
        counter.increment("n1", 10);
        counter.decrement("n1", 3);
        counter.decrement("n2", 12);
        assert_eq!(counter.value(), -5);
    }

    #[test]
    fn merge_converges_from_any_order() {
        let mut a = PnCounter::new();
        a.increment("n1", 5);
        a.decrement("n1", 1);

        let mut b = PnCounter::new();
        b.increment("n2", 7);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.value(), 11);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = PnCounter::new();
        a.increment("n1", 4);
        let b = a.clone();
        a.merge(&b);
        a.merge(&b);
        assert_eq!(a.value(), 4);
    }

    #[test]
    fn concurrent_updates_all_survive_merge() {
        // Each replica increments its own slot, then everyone merges.
        let mut replicas: Vec<PnCounter> = (0..3).map(|_| PnCounter::new()).collect();
        for (i, replica) in replicas.iter_mut().enumerate() {
            replica.increment(&format!("n{i}"), (i as u64) + 1);
        }
        let snapshot = replicas.clone();
        for replica in replicas.iter_mut() {
            for other in &snapshot {
                replica.merge(other);
            }
        }
        for replica in &replicas {
            assert_eq!(replica.value(), 6);
        }
    }
}
