//! Three-state circuit breaker with rolling-window failure detection.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Denial is a distinct discriminant, never folded into the inner error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BreakerError::Open => ErrorKind::Rejected,
            BreakerError::Inner(_) => ErrorKind::Io,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Rolling window size in outcomes.
    pub window: usize,
    /// Failure ratio over a full window that trips the breaker.
    pub failure_threshold: f64,
    /// Open -> HalfOpen after this much quiet time.
    pub reset_timeout: Duration,
    /// Probes admitted while HalfOpen.
    pub probe_count: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 10,
            failure_threshold: 0.5,
            reset_timeout: Duration::from_secs(30),
            probe_count: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub total: u64,
    pub failures: u64,
    pub successes: u64,
    pub consecutive_failures: u64,
    pub failure_rate: f64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Circular buffer of recent outcomes; true = failure.
    window: Vec<bool>,
    head: usize,
    filled: usize,
    opened_at: Option<Instant>,
    probes_sent: usize,
    probes_succeeded: usize,
    total: u64,
    failures: u64,
    successes: u64,
    consecutive_failures: u64,
}

/// Only the lock holder may transition state; the lock is never held across
/// the protected operation itself.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let window = config.window.max(1);
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: vec![false; window],
                head: 0,
                filled: 0,
                opened_at: None,
                probes_sent: 0,
                probes_succeeded: 0,
                total: 0,
                failures: 0,
                successes: 0,
                consecutive_failures: 0,
            }),
            config,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] immediately while the circuit is open;
    /// otherwise the outcome of `op` feeds the rolling window.
    pub fn execute<T, E, F>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit()?;
        let result = op();
        self.record(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.maybe_half_open(&mut inner, Instant::now());
        inner.state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.maybe_half_open(&mut inner, Instant::now());
        let window_failures = inner.window[..inner.filled].iter().filter(|&&f| f).count();
        BreakerStats {
            state: inner.state,
            total: inner.total,
            failures: inner.failures,
            successes: inner.successes,
            consecutive_failures: inner.consecutive_failures,
            failure_rate: window_failures as f64 / inner.window.len() as f64,
        }
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        self.maybe_half_open(&mut inner, now);
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(BreakerError::Open),
            BreakerState::HalfOpen => {
                if inner.probes_sent < self.config.probe_count {
                    inner.probes_sent += 1;
                    Ok(())
                } else {
                    Err(BreakerError::Open)
                }
            }
        }
    }

    fn record(&self, ok: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.total += 1;
        if ok {
            inner.successes += 1;
            inner.consecutive_failures = 0;
        } else {
            inner.failures += 1;
            inner.consecutive_failures += 1;
        }

        match inner.state {
            BreakerState::HalfOpen => {
                if ok {
                    inner.probes_succeeded += 1;
                    if inner.probes_succeeded >= self.config.probe_count.div_ceil(2) {
                        tracing::info!("circuit closed after successful probes");
                        self.reset_window(&mut inner);
                        inner.state = BreakerState::Closed;
                        inner.opened_at = None;
                    }
                } else {
                    tracing::warn!("probe failed; circuit re-opened");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probes_sent = 0;
                    inner.probes_succeeded = 0;
                }
            }
            BreakerState::Closed => {
                let head = inner.head;
                inner.window[head] = !ok;
                inner.head = (head + 1) % inner.window.len();
                inner.filled = (inner.filled + 1).min(inner.window.len());

                // Ratio over the whole window; unrecorded slots count as
                // successes, so a cold breaker needs real volume to trip.
                let failures = inner.window.iter().filter(|&&f| f).count();
                let rate = failures as f64 / inner.window.len() as f64;
                if rate > self.config.failure_threshold {
                    tracing::warn!(failure_rate = rate, "circuit opened");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probes_sent = 0;
                    inner.probes_succeeded = 0;
                }
            }
            // A racing admit already flipped the state; the outcome still
            // counted toward the totals above.
            BreakerState::Open => {}
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != BreakerState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at
            && now.duration_since(opened_at) >= self.config.reset_timeout
        {
            tracing::info!("circuit half-open; admitting probes");
            inner.state = BreakerState::HalfOpen;
            inner.probes_sent = 0;
            inner.probes_succeeded = 0;
        }
    }

    fn reset_window(&self, inner: &mut BreakerInner) {
        inner.window.fill(false);
        inner.head = 0;
        inner.filled = 0;
        inner.probes_sent = 0;
        inner.probes_succeeded = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            window: 10,
            failure_threshold: 0.6,
            reset_timeout: Duration::from_millis(100),
            probe_count: 3,
        }
    }

    fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| Err("downstream error"))
    }

    fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| Ok(()))
    }

    #[test]
    fn opens_after_threshold_crossing() {
        let breaker = CircuitBreaker::new(test_config());
        // 7 failures / window of 10 = 0.7 > 0.6.
        for _ in 0..7 {
            let _ = fail(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = succeed(&breaker).unwrap_err();
        assert!(err.is_open());
        assert_eq!(err.kind(), ErrorKind::Rejected);
    }

    #[test]
    fn below_threshold_stays_closed() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..6 {
            let _ = fail(&breaker);
        }
        // 6/10 is not strictly above the 0.6 threshold.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn recovers_through_half_open_probes() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..10 {
            let _ = fail(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // ceil(3/2) = 2 successes close the circuit.
        assert!(succeed(&breaker).is_ok());
        assert!(succeed(&breaker).is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().failure_rate, 0.0, "window resets on close");
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..10 {
            let _ = fail(&breaker);
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let _ = fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);

        // The reset clock restarted at the failed probe.
        let err = succeed(&breaker).unwrap_err();
        assert!(err.is_open());
    }

    #[test]
    fn half_open_admits_at_most_probe_count() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            probe_count: 2,
            ..test_config()
        });
        for _ in 0..10 {
            let _ = fail(&breaker);
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Admit exactly two probes without recording their outcomes yet.
        assert!(breaker.admit::<&'static str>().is_ok());
        assert!(breaker.admit::<&'static str>().is_ok());
        assert!(breaker.admit::<&'static str>().unwrap_err().is_open());
    }

    #[test]
    fn inner_errors_pass_through() {
        let breaker = CircuitBreaker::new(test_config());
        let err = fail(&breaker).unwrap_err();
        assert_eq!(err, BreakerError::Inner("downstream error"));
        assert!(!err.is_open());
        let stats = breaker.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.consecutive_failures, 1);
    }
}
