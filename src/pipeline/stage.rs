//! Stage worker loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::cancel::CancelToken;

use super::metrics::StageMetrics;
use super::{Item, ProcessFn};

/// How often an idle worker rechecks the cancellation token.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// An edge to a downstream stage's input buffer.
///
/// `drop_on_full` is the receiving stage's policy; drops are charged to the
/// receiving stage's counters.
pub(crate) struct Downstream {
    pub tx: Sender<Item>,
    pub drop_on_full: bool,
    pub metrics: Arc<StageMetrics>,
}

impl Downstream {
    /// Blocking send by default; with `drop_on_full`, a full buffer loses
    /// the item and bumps `dropped`.
    pub fn send(&self, item: Item) {
        if self.drop_on_full {
            match self.tx.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.metrics.record_dropped(),
                Err(TrySendError::Disconnected(_)) => {}
            }
        } else if self.tx.send(item).is_err() {
            // Downstream drained before us; nothing left to do with the item.
        }
    }
}

pub(crate) struct WorkerContext {
    pub stage_name: Arc<str>,
    pub func: ProcessFn,
    pub rx: Receiver<Item>,
    pub downstream: Vec<Downstream>,
    pub metrics: Arc<StageMetrics>,
    pub cancel: CancelToken,
}

/// FIFO loop over the stage input.
///
/// On cancel the worker completes the current item, emits no further items,
/// and exits; on input disconnect it drains the buffer and exits.
pub(crate) fn run_worker(ctx: WorkerContext) {
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match ctx.rx.recv_timeout(POLL_INTERVAL) {
            Ok(item) => process_one(&ctx, item),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn process_one(ctx: &WorkerContext, item: Item) {
    let start = Instant::now();
    match (ctx.func)(item) {
        Ok(outputs) => {
            ctx.metrics.record_processed(start.elapsed());
            if ctx.cancel.is_cancelled() {
                return;
            }
            fan_out(ctx, outputs);
        }
        Err(err) => {
            ctx.metrics.record_error();
            tracing::warn!(stage = %ctx.stage_name, "stage function failed: {err}");
        }
    }
}

fn fan_out(ctx: &WorkerContext, outputs: Vec<Item>) {
    for output in outputs {
        match ctx.downstream.split_last() {
            Some((last, rest)) => {
                for edge in rest {
                    edge.send(output.clone());
                }
                last.send(output);
            }
            None => {
                // Sink stage: outputs are discarded by design.
            }
        }
    }
}
