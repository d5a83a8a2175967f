//! Membership records and the update dominance rule.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::NodeId;

/// Liveness state, ordered by badness at equal incarnation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

impl MemberState {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Alive => "alive",
            MemberState::Suspect => "suspect",
            MemberState::Dead => "dead",
        }
    }
}

/// One node's view of another, as carried in gossip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub node_id: NodeId,
    pub state: MemberState,
    pub incarnation: u64,
}

impl MemberInfo {
    /// Whether this update strictly dominates a local `(state, incarnation)`
    /// view: a higher incarnation always wins; at equal incarnation only a
    /// strictly-worse state wins.
    pub fn dominates(&self, state: MemberState, incarnation: u64) -> bool {
        self.incarnation > incarnation || (self.incarnation == incarnation && self.state > state)
    }
}

/// Local bookkeeping for one member.
#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub state: MemberState,
    pub incarnation: u64,
    pub suspected_at: Option<Instant>,
}

impl Member {
    pub fn alive(incarnation: u64) -> Self {
        Self {
            state: MemberState::Alive,
            incarnation,
            suspected_at: None,
        }
    }

    pub fn info(&self, node_id: &NodeId) -> MemberInfo {
        MemberInfo {
            node_id: node_id.clone(),
            state: self.state,
            incarnation: self.incarnation,
        }
    }
}
