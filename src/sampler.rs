//! Tail-based trace sampling.
//!
//! Spans are buffered per trace until the trace has been quiet for the
//! decision window, then kept or dropped as a whole. The keep decision is a
//! deterministic function of the trace id, so every collector instance (and
//! every restart) decides the same way for the same trace.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::value::Value;

/// 128-bit trace identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraceId(pub Uuid);

impl TraceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: u64,
    pub name: String,
    pub status: SpanStatus,
    pub start_unix_ms: i64,
    pub duration_ms: u64,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// A trace is decided once no span has arrived for this long.
    pub decision_wait: Duration,
    /// Maximum buffered traces; beyond this the least-recently-touched
    /// trace is decided early.
    pub num_traces: usize,
    /// Base keep probability for non-error traces.
    pub sampling_rate: f64,
    /// Keep every trace containing an errored span.
    pub always_sample_errors: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            decision_wait: Duration::from_secs(5),
            num_traces: 50_000,
            sampling_rate: 0.10,
            always_sample_errors: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub buffered: usize,
    pub decided: u64,
    pub kept: u64,
    pub dropped: u64,
    pub evicted: u64,
}

#[derive(Debug)]
struct TraceBuffer {
    spans: Vec<Span>,
    last_seen: Instant,
    touch: u64,
    has_error: bool,
}

/// Buffers spans by trace id and applies tail-based sampling decisions.
///
/// Single-owner API: the sampler lives inside one pipeline processor; wrap
/// it in a lock to share.
#[derive(Debug)]
pub struct TailSampler {
    config: SamplerConfig,
    traces: BTreeMap<TraceId, TraceBuffer>,
    /// Lazy LRU queue of `(touch, trace)`; stale entries are skipped when
    /// their trace has been touched again since.
    order: VecDeque<(u64, TraceId)>,
    next_touch: u64,
    /// Spans from early-decided (evicted) traces, delivered on next tick.
    ready: Vec<Span>,
    decided: u64,
    kept: u64,
    dropped: u64,
    evicted: u64,
}

impl TailSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            traces: BTreeMap::new(),
            order: VecDeque::new(),
            next_touch: 0,
            ready: Vec::new(),
            decided: 0,
            kept: 0,
            dropped: 0,
            evicted: 0,
        }
    }

    /// Buffer one span, touching its trace.
    pub fn observe(&mut self, span: Span, now: Instant) {
        self.next_touch += 1;
        let touch = self.next_touch;
        let trace_id = span.trace_id;

        let buffer = self.traces.entry(trace_id).or_insert_with(|| TraceBuffer {
            spans: Vec::new(),
            last_seen: now,
            touch,
            has_error: false,
        });
        buffer.has_error |= span.status == SpanStatus::Error;
        buffer.last_seen = now;
        buffer.touch = touch;
        buffer.spans.push(span);
        self.order.push_back((touch, trace_id));

        if self.traces.len() > self.config.num_traces {
            self.evict_lru();
        }
    }

    /// Flush traces quiet for the decision window (plus any early-decided
    /// spans), returning the kept spans.
    pub fn tick(&mut self, now: Instant) -> Vec<Span> {
        let mut out = std::mem::take(&mut self.ready);

        let due: Vec<TraceId> = self
            .traces
            .iter()
            .filter(|(_, buffer)| now.duration_since(buffer.last_seen) >= self.config.decision_wait)
            .map(|(id, _)| *id)
            .collect();

        for trace_id in due {
            let buffer = self.traces.remove(&trace_id).expect("due trace present");
            if self.decide(&trace_id, &buffer) {
                out.extend(buffer.spans);
            }
        }
        out
    }

    /// The pure, reproducible keep decision for a trace id (ignoring the
    /// error override).
    pub fn decision(&self, trace_id: &TraceId) -> bool {
        let rate = self.config.sampling_rate;
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        let threshold = (rate * u64::MAX as f64) as u64;
        trace_hash(trace_id) < threshold
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            buffered: self.traces.len(),
            decided: self.decided,
            kept: self.kept,
            dropped: self.dropped,
            evicted: self.evicted,
        }
    }

    fn decide(&mut self, trace_id: &TraceId, buffer: &TraceBuffer) -> bool {
        let keep = (self.config.always_sample_errors && buffer.has_error)
            || self.decision(trace_id);
        self.decided += 1;
        if keep {
            self.kept += 1;
        } else {
            self.dropped += 1;
            tracing::trace!(trace = %trace_id, spans = buffer.spans.len(), "trace dropped");
        }
        keep
    }

    /// Decide the least-recently-touched trace immediately rather than
    /// silently dropping it.
    fn evict_lru(&mut self) {
        while let Some((touch, trace_id)) = self.order.pop_front() {
            let current = match self.traces.get(&trace_id) {
                Some(buffer) => buffer.touch,
                None => continue,
            };
            if current != touch {
                // Touched again since this queue entry; skip.
                continue;
            }
            let buffer = self.traces.remove(&trace_id).expect("lru trace present");
            self.evicted += 1;
            tracing::debug!(trace = %trace_id, "trace buffer full; deciding early");
            if self.decide(&trace_id, &buffer) {
                self.ready.extend(buffer.spans);
            }
            return;
        }
    }
}

/// First 8 bytes (big-endian) of SHA-256 over the trace id.
fn trace_hash(trace_id: &TraceId) -> u64 {
    let digest = Sha256::digest(trace_id.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 digest is 32 bytes"))
}
