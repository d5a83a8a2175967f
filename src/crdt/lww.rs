//! Last-write-wins register.

use serde::{Deserialize, Serialize};

/// A register resolving concurrent writes by `(timestamp, node_id)`,
/// compared lexicographically; the higher pair wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: Option<T>,
    timestamp: u64,
    node_id: String,
}

impl<T: Clone> LwwRegister<T> {
    pub fn new() -> Self {
        Self {
            value: None,
            timestamp: 0,
            node_id: String::new(),
        }
    }

    /// Accept the write iff `(ts, node_id)` exceeds the current stamp.
    /// Returns whether the write took effect.
    pub fn set(&mut self, value: T, ts: u64, node_id: &str) -> bool {
        if (ts, node_id) > (self.timestamp, self.node_id.as_str()) {
            self.value = Some(value);
            self.timestamp = ts;
            self.node_id = node_id.to_string();
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn stamp(&self) -> (u64, &str) {
        (self.timestamp, &self.node_id)
    }

    pub fn merge(&mut self, other: &LwwRegister<T>) {
        if let Some(value) = &other.value {
            self.set(value.clone(), other.timestamp, &other.node_id);
        }
    }
}
