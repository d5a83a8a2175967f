//! Replicated growable array for collaborative text.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{CrdtError, CrdtResult};

/// Globally unique element id: `(sequence, replica)`.
///
/// The sequence behaves like a Lamport counter: every replica bumps its
/// local counter past any sequence it has seen, so later inserts carry
/// higher sequences than anything they causally follow.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub seq: u64,
    pub node_id: String,
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.seq, self.node_id)
    }
}

/// A broadcastable operation. Applying the same operation twice is a no-op.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RgaOp {
    Insert {
        id: OpId,
        /// `None` anchors at the head of the document.
        after: Option<OpId>,
        ch: char,
    },
    Delete { id: OpId },
}

/// Arena slot. Children are sibling inserts anchored at this element, kept
/// in document order: `(seq DESC, node_id ASC)`.
#[derive(Clone, Debug)]
struct Element {
    id: OpId,
    ch: char,
    deleted: bool,
    children: Vec<usize>,
}

/// The document is a tree rooted at a virtual head; linearization is a
/// pre-order walk. Elements live in a contiguous arena and reference each
/// other by stable index, never by owning pointers.
#[derive(Clone, Debug, Default)]
pub struct Rga {
    arena: Vec<Element>,
    index: HashMap<OpId, usize>,
    /// Children of the virtual head, in document order.
    roots: Vec<usize>,
    next_seq: u64,
}

impl Rga {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible (non-tombstoned) characters.
    pub fn len(&self) -> usize {
        self.arena.iter().filter(|el| !el.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `ch` after `after` (`None` = head) on behalf of `node_id`,
    /// returning the operation to broadcast.
    pub fn insert(&mut self, after: Option<&OpId>, ch: char, node_id: &str) -> CrdtResult<RgaOp> {
        let id = OpId {
            seq: self.next_seq + 1,
            node_id: node_id.to_string(),
        };
        let op = RgaOp::Insert {
            id,
            after: after.cloned(),
            ch,
        };
        self.apply(op.clone())?;
        Ok(op)
    }

    /// Tombstone the element `id`, returning the operation to broadcast.
    pub fn delete(&mut self, id: &OpId) -> CrdtResult<RgaOp> {
        let op = RgaOp::Delete { id: id.clone() };
        self.apply(op.clone())?;
        Ok(op)
    }

    /// Apply a local or remote operation. Idempotent: a duplicate insert or
    /// delete has no additional effect. Unknown anchors and targets are
    /// `Invalid`.
    pub fn apply(&mut self, op: RgaOp) -> CrdtResult<()> {
        match op {
            RgaOp::Insert { id, after, ch } => self.apply_insert(id, after, ch),
            RgaOp::Delete { id } => self.apply_delete(&id),
        }
    }

    /// The visible document text, identical across replicas that have
    /// applied the same operations in any order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            let element = &self.arena[idx];
            if !element.deleted {
                out.push(element.ch);
            }
            stack.extend(element.children.iter().rev().copied());
        }
        out
    }

    /// Visible element ids in document order (the anchor candidates a
    /// caller needs to address positions).
    pub fn visible_ids(&self) -> Vec<OpId> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            let element = &self.arena[idx];
            if !element.deleted {
                out.push(element.id.clone());
            }
            stack.extend(element.children.iter().rev().copied());
        }
        out
    }

    fn apply_insert(&mut self, id: OpId, after: Option<OpId>, ch: char) -> CrdtResult<()> {
        if self.index.contains_key(&id) {
            return Ok(());
        }
        let parent = match &after {
            None => None,
            Some(anchor) => Some(*self.index.get(anchor).ok_or_else(|| {
                CrdtError::UnknownAnchor {
                    anchor: anchor.to_string(),
                }
            })?),
        };

        let arena_idx = self.arena.len();
        self.arena.push(Element {
            id: id.clone(),
            ch,
            deleted: false,
            children: Vec::new(),
        });

        let position = {
            let siblings = match parent {
                None => &self.roots,
                Some(p) => &self.arena[p].children,
            };
            siblings
                .iter()
                .position(|&s| Self::orders_before(&id, &self.arena[s].id))
                .unwrap_or(siblings.len())
        };
        match parent {
            None => self.roots.insert(position, arena_idx),
            Some(p) => self.arena[p].children.insert(position, arena_idx),
        }

        self.next_seq = self.next_seq.max(id.seq);
        self.index.insert(id, arena_idx);
        Ok(())
    }

    fn apply_delete(&mut self, id: &OpId) -> CrdtResult<()> {
        let idx = *self.index.get(id).ok_or_else(|| CrdtError::UnknownNode {
            id: id.to_string(),
        })?;
        self.arena[idx].deleted = true;
        Ok(())
    }

    /// Document order among siblings anchored at the same element:
    /// higher sequence first, node id ascending on ties.
    fn orders_before(a: &OpId, b: &OpId) -> bool {
        a.seq > b.seq || (a.seq == b.seq && a.node_id < b.node_id)
    }
}
