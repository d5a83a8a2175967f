#![forbid(unsafe_code)]

//! girder — a portfolio of independent systems-infrastructure cores.
//!
//! Each module is a self-contained engine with a small synchronous or
//! task-driven API: a durable write-ahead log, a Gorilla-style time-series
//! codec, an HTTP edge cache with request coalescing, an adaptive rate
//! limiter and circuit breaker, a bounded streaming pipeline, a SWIM
//! failure detector, CRDTs for collaborative state, and a tail-based trace
//! sampler. The cores do not depend on each other.

pub mod cache;
pub mod cancel;
pub mod crdt;
pub mod error;
pub mod gorilla;
pub mod limiter;
pub mod pipeline;
pub mod sampler;
pub mod swim;
pub mod telemetry;
pub mod value;
pub mod wal;

pub use error::{Error, ErrorKind};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the core entry points at the crate root for convenience.
pub use cache::{CacheConfig, CacheKey, CachedResponse, EdgeCache, Freshness, Lookup};
pub use cancel::CancelToken;
pub use crdt::{LwwRegister, OrSet, PnCounter, Rga, VClock};
pub use gorilla::Chunk;
pub use limiter::{AdaptiveLimiter, BreakerConfig, BreakerError, CircuitBreaker, LimiterConfig};
pub use pipeline::{Item, Pipeline, PipelineConfig, StageOptions};
pub use sampler::{SamplerConfig, Span, SpanStatus, TailSampler, TraceId};
pub use swim::{Cluster, MemberState, SwimConfig};
pub use value::Value;
pub use wal::{Lsn, Wal, WalConfig};
