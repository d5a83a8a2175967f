//! Multi-tenant token bucket with error-driven adaptation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Error rate above which the refill factor is cut to `1 - error_rate`.
const ERROR_RATE_HIGH: f64 = 0.3;
/// Error rate below which the factor recovers toward 1.0.
const ERROR_RATE_LOW: f64 = 0.1;
/// Recovery slope, per elapsed second.
const RECOVERY_PER_SEC: f64 = 0.01;
/// The factor never drops below this; a tenant is throttled, not starved.
const FACTOR_FLOOR: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Tokens per second at full health.
    pub rate: f64,
    /// Bucket capacity (burst size).
    pub burst: f64,
    /// Rolling window of recent outcomes per tenant.
    pub window: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 10.0,
            window: 64,
        }
    }
}

/// Snapshot of one tenant's bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TenantStats {
    pub allowed: u64,
    pub rejected: u64,
    pub tokens: f64,
    pub adaptive_factor: f64,
    pub error_rate: f64,
}

/// Fixed-size ring of recent request outcomes (true = error).
#[derive(Debug)]
struct OutcomeRing {
    slots: Vec<bool>,
    head: usize,
    filled: usize,
}

impl OutcomeRing {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![false; capacity.max(1)],
            head: 0,
            filled: 0,
        }
    }

    fn push(&mut self, error: bool) {
        self.slots[self.head] = error;
        self.head = (self.head + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }

    fn error_rate(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        let errors = self.slots[..self.filled.min(self.slots.len())]
            .iter()
            .filter(|&&e| e)
            .count();
        errors as f64 / self.filled as f64
    }
}

#[derive(Debug)]
struct TenantBucket {
    tokens: f64,
    last_refill: Instant,
    adaptive_factor: f64,
    ring: OutcomeRing,
    allowed: u64,
    rejected: u64,
}

impl TenantBucket {
    fn new(config: &LimiterConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst,
            last_refill: now,
            adaptive_factor: 1.0,
            ring: OutcomeRing::new(config.window),
            allowed: 0,
            rejected: 0,
        }
    }

    fn allow(&mut self, config: &LimiterConfig, now: Instant, was_error: bool) -> bool {
        self.ring.push(was_error);
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let error_rate = self.ring.error_rate();
        if error_rate > ERROR_RATE_HIGH {
            self.adaptive_factor = (1.0 - error_rate).clamp(FACTOR_FLOOR, 1.0);
        } else if error_rate < ERROR_RATE_LOW {
            self.adaptive_factor =
                (self.adaptive_factor + RECOVERY_PER_SEC * elapsed).min(1.0);
        }

        self.tokens =
            (self.tokens + config.rate * elapsed * self.adaptive_factor).min(config.burst);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.allowed += 1;
            true
        } else {
            self.rejected += 1;
            false
        }
    }

    fn stats(&self) -> TenantStats {
        TenantStats {
            allowed: self.allowed,
            rejected: self.rejected,
            tokens: self.tokens,
            adaptive_factor: self.adaptive_factor,
            error_rate: self.ring.error_rate(),
        }
    }
}

/// Multi-tenant adaptive rate limiter.
///
/// The tenant map is behind a short-duration `RwLock` used only for lookup
/// and first insert; each bucket has its own lock, so tenants never contend
/// with each other on the hot path. All operations are amortized O(1).
pub struct AdaptiveLimiter {
    config: LimiterConfig,
    tenants: RwLock<HashMap<String, Arc<Mutex<TenantBucket>>>>,
}

impl AdaptiveLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Attempt to consume one token for `tenant`.
    ///
    /// `was_error` reports whether the tenant's previous request failed; it
    /// feeds the rolling window that drives the adaptive refill factor.
    pub fn allow(&self, tenant: &str, was_error: bool) -> bool {
        let bucket = self.bucket(tenant);
        let mut bucket = bucket.lock().expect("tenant bucket lock poisoned");
        bucket.allow(&self.config, Instant::now(), was_error)
    }

    /// Snapshot of a tenant's metrics. Unknown tenants report a full,
    /// healthy bucket.
    pub fn stats(&self, tenant: &str) -> TenantStats {
        let tenants = self.tenants.read().expect("tenant map lock poisoned");
        match tenants.get(tenant) {
            Some(bucket) => bucket.lock().expect("tenant bucket lock poisoned").stats(),
            None => TenantStats {
                tokens: self.config.burst,
                adaptive_factor: 1.0,
                ..TenantStats::default()
            },
        }
    }

    fn bucket(&self, tenant: &str) -> Arc<Mutex<TenantBucket>> {
        {
            let tenants = self.tenants.read().expect("tenant map lock poisoned");
            if let Some(bucket) = tenants.get(tenant) {
                return Arc::clone(bucket);
            }
        }
        let mut tenants = self.tenants.write().expect("tenant map lock poisoned");
        Arc::clone(
            tenants
                .entry(tenant.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TenantBucket::new(&self.config, Instant::now())))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_is_bounded() {
        let limiter = AdaptiveLimiter::new(LimiterConfig {
            rate: 100.0,
            burst: 10.0,
            window: 64,
        });
        let allowed = (0..15).filter(|_| limiter.allow("tenant-a", false)).count();
        assert_eq!(allowed, 10);
        let stats = limiter.stats("tenant-a");
        assert_eq!(stats.allowed, 10);
        assert_eq!(stats.rejected, 5);
    }

    #[test]
    fn errors_drive_the_factor_down() {
        let limiter = AdaptiveLimiter::new(LimiterConfig::default());
        for i in 0..50 {
            limiter.allow("tenant-a", i % 3 == 0);
        }
        let stats = limiter.stats("tenant-a");
        assert!(
            stats.adaptive_factor < 0.80,
            "factor {} should reflect ~33% errors",
            stats.adaptive_factor
        );
        assert!(stats.adaptive_factor >= FACTOR_FLOOR);
    }

    #[test]
    fn factor_recovers_without_errors() {
        let limiter = AdaptiveLimiter::new(LimiterConfig {
            window: 8,
            ..LimiterConfig::default()
        });
        for _ in 0..20 {
            limiter.allow("tenant-a", true);
        }
        let degraded = limiter.stats("tenant-a").adaptive_factor;
        assert!(degraded < 0.5);

        // Flush the window with successes, then let time pass.
        for _ in 0..8 {
            limiter.allow("tenant-a", false);
        }
        std::thread::sleep(Duration::from_millis(300));
        limiter.allow("tenant-a", false);
        let recovered = limiter.stats("tenant-a").adaptive_factor;
        assert!(
            recovered > degraded,
            "factor should climb ({degraded} -> {recovered})"
        );
    }

    #[test]
    fn factor_never_hits_zero() {
        let limiter = AdaptiveLimiter::new(LimiterConfig::default());
        for _ in 0..200 {
            limiter.allow("tenant-a", true);
        }
        let stats = limiter.stats("tenant-a");
        assert!(stats.adaptive_factor >= FACTOR_FLOOR);
        assert!(stats.error_rate > 0.99);
    }

    #[test]
    fn tenants_are_isolated() {
        let limiter = AdaptiveLimiter::new(LimiterConfig {
            rate: 100.0,
            burst: 5.0,
            window: 16,
        });
        for _ in 0..10 {
            limiter.allow("noisy", true);
        }
        assert!(limiter.allow("quiet", false));
        let quiet = limiter.stats("quiet");
        assert_eq!(quiet.rejected, 0);
        assert!((quiet.adaptive_factor - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_tenant_reports_healthy_defaults() {
        let limiter = AdaptiveLimiter::new(LimiterConfig::default());
        let stats = limiter.stats("ghost");
        assert_eq!(stats.allowed, 0);
        assert_eq!(stats.tokens, LimiterConfig::default().burst);
        assert_eq!(stats.adaptive_factor, 1.0);
    }

    #[test]
    fn concurrent_tenants_do_not_lose_counts() {
        let limiter = Arc::new(AdaptiveLimiter::new(LimiterConfig {
            rate: 1000.0,
            burst: 50.0,
            window: 64,
        }));
        let mut handles = Vec::new();
        for id in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                let tenant = format!("tenant-{}", id % 2);
                for i in 0..200 {
                    limiter.allow(&tenant, i % 10 == 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let total: u64 = ["tenant-0", "tenant-1"]
            .iter()
            .map(|t| {
                let s = limiter.stats(t);
                s.allowed + s.rejected
            })
            .sum();
        assert_eq!(total, 1600);
    }
}
