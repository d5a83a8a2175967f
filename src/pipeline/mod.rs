//! Bounded multi-stage streaming pipeline with backpressure and fan-out.
//!
//! A topology is a DAG of named stages, each with a worker pool and a
//! bounded input buffer. Sends block on a full downstream buffer by default;
//! a stage can opt into dropping instead. Without dropping, no item is lost:
//! after [`Pipeline::drain`], the sink's `processed + errors` equals the
//! number of pushed items.

mod metrics;
mod stage;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::ErrorKind;
use crate::value::Value;

pub use metrics::{PipelineStats, StageStats};
use metrics::StageMetrics;
use stage::{Downstream, WorkerContext, run_worker};

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown stage {name:?}")]
    UnknownStage { name: String },
    #[error("duplicate stage {name:?}")]
    DuplicateStage { name: String },
    #[error("stage {name:?} participates in a cycle")]
    CycleDetected { name: String },
    #[error("pipeline is not running")]
    NotStarted,
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error("pipeline has no stages")]
    Empty,
    #[error("pipeline input is closed")]
    Closed,
    #[error("pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Invalid,
        }
    }
}

/// The unit of data flowing through a pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub id: u64,
    pub payload: Value,
    pub attrs: BTreeMap<String, Value>,
}

impl Item {
    pub fn new(id: u64, payload: Value) -> Self {
        Self {
            id,
            payload,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// A stage function maps one item to zero or more output items.
pub type ProcessResult = std::result::Result<Vec<Item>, Box<dyn std::error::Error + Send + Sync>>;
pub(crate) type ProcessFn = Arc<dyn Fn(Item) -> ProcessResult + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input buffer size for stages that do not set their own.
    pub default_buffer_size: usize,
    /// Latency reservoir size per stage.
    pub latency_samples: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_buffer_size: 64,
            latency_samples: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    /// Bounded input buffer size; the pipeline default when `None`.
    pub buffer_size: Option<usize>,
    /// Drop items (counting them) instead of blocking when the input buffer
    /// is full.
    pub drop_on_full: bool,
}

struct StageSpec {
    name: Arc<str>,
    workers: usize,
    func: ProcessFn,
    options: StageOptions,
    metrics: Arc<StageMetrics>,
    tx: Option<Sender<Item>>,
    rx: Receiver<Item>,
    downstream: Vec<usize>,
    handles: Vec<JoinHandle<()>>,
}

/// A DAG of stages. The first added stage is the entry for [`Pipeline::push`].
pub struct Pipeline {
    config: PipelineConfig,
    stages: Vec<StageSpec>,
    names: HashMap<String, usize>,
    cancel: Option<CancelToken>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            names: HashMap::new(),
            cancel: None,
        }
    }

    /// Register a named stage with `workers` parallel workers.
    pub fn add_stage<F>(
        &mut self,
        name: &str,
        workers: usize,
        func: F,
        options: StageOptions,
    ) -> PipelineResult<()>
    where
        F: Fn(Item) -> ProcessResult + Send + Sync + 'static,
    {
        if self.cancel.is_some() {
            return Err(PipelineError::AlreadyStarted);
        }
        if self.names.contains_key(name) {
            return Err(PipelineError::DuplicateStage {
                name: name.to_string(),
            });
        }
        let buffer = options
            .buffer_size
            .unwrap_or(self.config.default_buffer_size)
            .max(1);
        let (tx, rx) = bounded(buffer);
        self.names.insert(name.to_string(), self.stages.len());
        self.stages.push(StageSpec {
            name: Arc::from(name),
            workers: workers.max(1),
            func: Arc::new(func),
            options,
            metrics: Arc::new(StageMetrics::new(self.config.latency_samples)),
            tx: Some(tx),
            rx,
            downstream: Vec::new(),
            handles: Vec::new(),
        });
        Ok(())
    }

    /// Link the output of `from` to the input of `to`. Connecting one stage
    /// to several downstreams fans items out to each.
    pub fn connect(&mut self, from: &str, to: &str) -> PipelineResult<()> {
        if self.cancel.is_some() {
            return Err(PipelineError::AlreadyStarted);
        }
        let from_idx = self.stage_index(from)?;
        let to_idx = self.stage_index(to)?;
        if !self.stages[from_idx].downstream.contains(&to_idx) {
            self.stages[from_idx].downstream.push(to_idx);
        }
        Ok(())
    }

    /// Launch every stage's worker pool. Validates that the topology is
    /// acyclic.
    pub fn start(&mut self, cancel: CancelToken) -> PipelineResult<()> {
        if self.cancel.is_some() {
            return Err(PipelineError::AlreadyStarted);
        }
        if self.stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        self.topo_order()?;

        for idx in 0..self.stages.len() {
            let downstream_specs: Vec<Downstream> = self.stages[idx]
                .downstream
                .clone()
                .into_iter()
                .map(|d| {
                    let target = &self.stages[d];
                    Downstream {
                        tx: target.tx.clone().expect("stage input open before start"),
                        drop_on_full: target.options.drop_on_full,
                        metrics: Arc::clone(&target.metrics),
                    }
                })
                .collect();

            let stage = &mut self.stages[idx];
            for worker in 0..stage.workers {
                let ctx = WorkerContext {
                    stage_name: Arc::clone(&stage.name),
                    func: Arc::clone(&stage.func),
                    rx: stage.rx.clone(),
                    downstream: downstream_specs
                        .iter()
                        .map(|d| Downstream {
                            tx: d.tx.clone(),
                            drop_on_full: d.drop_on_full,
                            metrics: Arc::clone(&d.metrics),
                        })
                        .collect(),
                    metrics: Arc::clone(&stage.metrics),
                    cancel: cancel.clone(),
                };
                let thread_name = format!("stage-{}-{worker}", stage.name);
                stage.handles.push(
                    std::thread::Builder::new()
                        .name(thread_name)
                        .spawn(move || run_worker(ctx))
                        .expect("spawn stage worker"),
                );
            }
        }

        // Only the entry stage keeps an external sender; every other input
        // is owned solely by upstream workers so disconnects cascade.
        for stage in self.stages.iter_mut().skip(1) {
            stage.tx = None;
        }
        self.cancel = Some(cancel);
        tracing::debug!(stages = self.stages.len(), "pipeline started");
        Ok(())
    }

    /// Feed items into the entry stage, honoring its buffer policy.
    pub fn push(&self, items: impl IntoIterator<Item = Item>) -> PipelineResult<()> {
        let Some(cancel) = &self.cancel else {
            return Err(PipelineError::NotStarted);
        };
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let entry = &self.stages[0];
        let Some(tx) = &entry.tx else {
            return Err(PipelineError::Closed);
        };
        for item in items {
            if entry.options.drop_on_full {
                match tx.try_send(item) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => entry.metrics.record_dropped(),
                    Err(TrySendError::Disconnected(_)) => return Err(PipelineError::Closed),
                }
            } else if tx.send(item).is_err() {
                return Err(PipelineError::Closed);
            }
        }
        Ok(())
    }

    /// Close the entry stage's input and wait for every stage's worker pool
    /// to finish, in topological order.
    pub fn drain(&mut self) -> PipelineResult<()> {
        if self.cancel.is_none() {
            return Err(PipelineError::NotStarted);
        }
        let order = self.topo_order()?;
        self.stages[0].tx = None;
        for idx in order {
            let handles = std::mem::take(&mut self.stages[idx].handles);
            for handle in handles {
                let _ = handle.join();
            }
        }
        tracing::debug!("pipeline drained");
        Ok(())
    }

    /// Per-stage metrics snapshot, in stage registration order.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            stages: self
                .stages
                .iter()
                .map(|stage| stage.metrics.snapshot(&stage.name))
                .collect(),
        }
    }

    fn stage_index(&self, name: &str) -> PipelineResult<usize> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownStage {
                name: name.to_string(),
            })
    }

    /// Kahn's algorithm; errors when the topology contains a cycle.
    fn topo_order(&self) -> PipelineResult<Vec<usize>> {
        let mut indegree = vec![0usize; self.stages.len()];
        for stage in &self.stages {
            for &d in &stage.downstream {
                indegree[d] += 1;
            }
        }
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &d in &self.stages[idx].downstream {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        if order.len() != self.stages.len() {
            let name = indegree
                .iter()
                .position(|&deg| deg > 0)
                .map(|i| self.stages[i].name.to_string())
                .unwrap_or_default();
            return Err(PipelineError::CycleDetected { name });
        }
        Ok(order)
    }
}
