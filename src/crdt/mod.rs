//! Conflict-free replicated data types for collaborative state.
//!
//! RGA text, OR-Set, PN-Counter, LWW-Register, and vector clocks. Every
//! merge is commutative, associative, and idempotent; anything externally
//! visible iterates in sorted key order so replicas render identically.

mod counter;
mod lww;
mod orset;
mod rga;
mod vclock;

use thiserror::Error;

use crate::error::ErrorKind;

pub use counter::PnCounter;
pub use lww::LwwRegister;
pub use orset::{OrSet, Tag};
pub use rga::{OpId, Rga, RgaOp};
pub use vclock::VClock;

pub type CrdtResult<T> = std::result::Result<T, CrdtError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CrdtError {
    #[error("unknown anchor {anchor:?}")]
    UnknownAnchor { anchor: String },
    #[error("unknown node {id:?}")]
    UnknownNode { id: String },
}

impl CrdtError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Invalid
    }
}
