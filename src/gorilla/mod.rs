//! Gorilla-style codec for `(timestamp, f64)` streams.
//!
//! Timestamps are delta-of-delta encoded under variable-length prefix codes;
//! values are XOR-compressed against the previous value with leading/
//! meaningful-bit window reuse. Decoding restores the input exactly.

mod bits;
mod chunk;

pub use chunk::{Chunk, ChunkIter};

use thiserror::Error;

use crate::error::ErrorKind;

pub type ChunkResult<T> = std::result::Result<T, ChunkError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("non-monotonic timestamp {got} after {prev}")]
    NonMonotonicTimestamp { prev: i64, got: i64 },
    #[error("second-sample delta {delta} exceeds the 14-bit first-delta field")]
    FirstDeltaOverflow { delta: i64 },
    #[error("chunk bit stream ended unexpectedly")]
    UnexpectedEnd,
}

impl ChunkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChunkError::NonMonotonicTimestamp { .. } | ChunkError::FirstDeltaOverflow { .. } => {
                ErrorKind::Invalid
            }
            ChunkError::UnexpectedEnd => ErrorKind::Corruption,
        }
    }
}
