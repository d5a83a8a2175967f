//! Vector clocks for causality tracking.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maps node id to a logical counter. Missing entries read as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VClock {
    counters: BTreeMap<String, u64>,
}

impl VClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, node_id: &str) {
        *self.counters.entry(node_id.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    /// True when `self` causally precedes `other`: every component is <=,
    /// and at least one is strictly less.
    pub fn happens_before(&self, other: &VClock) -> bool {
        let mut strictly_less = false;
        for (node, &count) in &self.counters {
            let theirs = other.get(node);
            if count > theirs {
                return false;
            }
            if count < theirs {
                strictly_less = true;
            }
        }
        for (node, &theirs) in &other.counters {
            if self.get(node) < theirs {
                strictly_less = true;
            }
        }
        strictly_less
    }

    /// Neither clock precedes the other.
    pub fn concurrent(&self, other: &VClock) -> bool {
        !self.happens_before(other) && !other.happens_before(self)
    }

    /// Component-wise maximum.
    pub fn merge(&mut self, other: &VClock) {
        for (node, &theirs) in &other.counters {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(theirs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_detects_causality() {
        let mut a = VClock::new();
        a.increment("n1");
        let mut b = a.clone();
        b.increment("n2");

        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));
        assert!(!a.concurrent(&b));
    }

    #[test]
    fn divergent_clocks_are_concurrent() {
        let mut a = VClock::new();
        a.increment("n1");
        let mut b = VClock::new();
        b.increment("n2");

        assert!(a.concurrent(&b));
        assert!(!a.happens_before(&b));
    }

    #[test]
    fn equal_clocks_are_not_ordered() {
        let mut a = VClock::new();
        a.increment("n1");
        let b = a.clone();
        assert!(!a.happens_before(&b));
        assert!(!b.happens_before(&a));
        // Equal clocks are "concurrent" by the definition's complement.
        assert!(a.concurrent(&b));
    }

    #[test]
    fn merge_takes_component_max() {
        let mut a = VClock::new();
        a.increment("n1");
        a.increment("n1");
        let mut b = VClock::new();
        b.increment("n1");
        b.increment("n2");

        a.merge(&b);
        assert_eq!(a.get("n1"), 2);
        assert_eq!(a.get("n2"), 1);
        assert!(b.happens_before(&a) || b == a);
    }
}
