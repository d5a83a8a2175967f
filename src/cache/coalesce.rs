//! Per-key single-flight coalescing.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use super::{CacheError, CachedResponse};

type FlightResult = Result<CachedResponse, CacheError>;

struct Flight {
    state: Mutex<Option<FlightResult>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, result: FlightResult) {
        let mut state = self.state.lock().expect("flight lock poisoned");
        *state = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> FlightResult {
        let mut state = self.state.lock().expect("flight lock poisoned");
        while state.is_none() {
            state = self.done.wait(state).expect("flight lock poisoned");
        }
        state.clone().expect("completed flight")
    }
}

/// Collapses concurrent calls per key into one in-flight execution.
///
/// Waiters block on a per-key completion primitive and never hold the map
/// lock while waiting; every caller in the window receives the leader's
/// result, errors included.
#[derive(Default)]
pub(crate) struct Coalescer {
    inflight: Mutex<HashMap<String, Arc<Flight>>>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run<F>(&self, key: &str, fetch: F) -> FlightResult
    where
        F: FnOnce() -> FlightResult,
    {
        let (flight, leader) = {
            let mut inflight = self.inflight.lock().expect("coalescer lock poisoned");
            match inflight.get(key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::new());
                    inflight.insert(key.to_string(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            return flight.wait();
        }

        let result = fetch();
        flight.complete(result.clone());
        self.inflight
            .lock()
            .expect("coalescer lock poisoned")
            .remove(key);
        result
    }
}
