//! Per-tenant adaptive rate limiting and circuit breaking.
//!
//! The limiter combines token-bucket admission with an error-rate-driven
//! adaptive refill factor per tenant. The breaker is a three-state machine
//! over a rolling outcome window. Both return denial as a distinct
//! discriminant, never as a generic error.

mod breaker;
mod bucket;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, BreakerStats, CircuitBreaker};
pub use bucket::{AdaptiveLimiter, LimiterConfig, TenantStats};
