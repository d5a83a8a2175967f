//! Per-stage counters and latency percentiles.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bounded reservoir of recent latency samples (milliseconds).
#[derive(Debug)]
struct Reservoir {
    samples: Vec<f64>,
    cap: usize,
    next: usize,
}

impl Reservoir {
    fn new(cap: usize) -> Self {
        Self {
            samples: Vec::with_capacity(cap.min(4096)),
            cap: cap.max(1),
            next: 0,
        }
    }

    fn record(&mut self, ms: f64) {
        if self.samples.len() < self.cap {
            self.samples.push(ms);
        } else {
            self.samples[self.next] = ms;
            self.next = (self.next + 1) % self.cap;
        }
    }

    /// Nearest-rank percentile; `q` in [0, 1].
    fn percentile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are finite"));
        let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
        sorted[rank - 1]
    }
}

#[derive(Debug)]
pub(crate) struct StageMetrics {
    processed: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    latencies: Mutex<Reservoir>,
}

impl StageMetrics {
    pub fn new(latency_samples: usize) -> Self {
        Self {
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            latencies: Mutex::new(Reservoir::new(latency_samples)),
        }
    }

    pub fn record_processed(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latencies
            .lock()
            .expect("latency reservoir lock poisoned")
            .record(latency.as_secs_f64() * 1000.0);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, name: &str) -> StageStats {
        let latencies = self
            .latencies
            .lock()
            .expect("latency reservoir lock poisoned");
        StageStats {
            name: name.to_string(),
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            p50_latency_ms: latencies.percentile(0.50),
            p99_latency_ms: latencies.percentile(0.99),
        }
    }
}

/// Observable metrics for one stage.
#[derive(Clone, Debug, PartialEq)]
pub struct StageStats {
    pub name: String,
    pub processed: u64,
    pub errors: u64,
    pub dropped: u64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub stages: Vec<StageStats>,
}

impl PipelineStats {
    pub fn stage(&self, name: &str) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.name == name)
    }
}
