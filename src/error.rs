use thiserror::Error;

use crate::cache::CacheError;
use crate::crdt::CrdtError;
use crate::gorilla::ChunkError;
use crate::pipeline::PipelineError;
use crate::swim::SwimError;
use crate::wal::WalError;

/// Failure category shared by every core.
///
/// The category drives retry policy: `Io`, `Rejected`, and `Cancelled`
/// failures may succeed on retry; `Corruption` and `Invalid` never will
/// without changing inputs or state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Underlying storage or network failure.
    Io,
    /// On-disk data failed validation (CRC mismatch, impossible length).
    Corruption,
    /// An invariant was violated by the caller (unknown LSN, non-monotonic
    /// timestamp, missing anchor).
    Invalid,
    /// Denied by a rate limiter or circuit breaker.
    Rejected,
    /// Cooperative cancellation observed.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Io | ErrorKind::Rejected | ErrorKind::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Io => "io",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the per-core error types,
/// each of which classifies itself into an [`ErrorKind`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Swim(#[from] SwimError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Wal(e) => e.kind(),
            Error::Chunk(e) => e.kind(),
            Error::Cache(e) => e.kind(),
            Error::Pipeline(e) => e.kind(),
            Error::Swim(e) => e.kind(),
            Error::Crdt(e) => e.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
