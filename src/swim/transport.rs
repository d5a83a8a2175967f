//! In-process channel network with simulated per-hop latency and a
//! partition blocklist.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use rand::Rng;

use crate::cancel::CancelToken;

use super::NodeId;
use super::proto::Message;

const INBOX_CAPACITY: usize = 1024;
const IDLE_POLL: Duration = Duration::from_millis(25);

/// A message scheduled for future delivery. Ordered by delivery time (then
/// submission sequence) so the router heap pops the earliest first.
struct Delayed {
    deliver_at: Instant,
    order: u64,
    to: NodeId,
    msg: Message,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.order == other.order
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest delivery.
        (other.deliver_at, other.order).cmp(&(self.deliver_at, self.order))
    }
}

struct Routes {
    inboxes: Mutex<HashMap<NodeId, Sender<Message>>>,
    /// `(src, dst)` pairs whose messages are dropped.
    blocked: Mutex<HashSet<(NodeId, NodeId)>>,
}

/// The simulated network. A single router thread delays each message by a
/// uniform per-hop latency and drops anything crossing a partition; a full
/// inbox is lossy, like the UDP transport it stands in for.
pub(crate) struct Network {
    routes: Arc<Routes>,
    submit: Sender<Delayed>,
    order: AtomicU64,
    latency_min_ms: u64,
    latency_max_ms: u64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    pub fn new(latency_min: Duration, latency_max: Duration, cancel: CancelToken) -> Self {
        let routes = Arc::new(Routes {
            inboxes: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
        });
        let (submit, submissions) = unbounded::<Delayed>();
        let router_routes = Arc::clone(&routes);
        let handle = std::thread::Builder::new()
            .name("swim-router".to_string())
            .spawn(move || run_router(router_routes, submissions, cancel))
            .expect("spawn swim router");

        Self {
            routes,
            submit,
            order: AtomicU64::new(0),
            latency_min_ms: latency_min.as_millis() as u64,
            latency_max_ms: latency_max.as_millis() as u64,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register a node and return its inbox.
    pub fn register(&self, node_id: &NodeId) -> Receiver<Message> {
        let (tx, rx) = bounded(INBOX_CAPACITY);
        self.routes
            .inboxes
            .lock()
            .expect("network inbox lock poisoned")
            .insert(node_id.clone(), tx);
        rx
    }

    /// Remove a node from the network; queued and future messages to it are
    /// dropped.
    pub fn remove(&self, node_id: &NodeId) {
        self.routes
            .inboxes
            .lock()
            .expect("network inbox lock poisoned")
            .remove(node_id);
    }

    /// Drop messages from `src` to `dst` (one direction).
    pub fn block(&self, src: &NodeId, dst: &NodeId) {
        self.routes
            .blocked
            .lock()
            .expect("network blocklist lock poisoned")
            .insert((src.clone(), dst.clone()));
    }

    /// Submit a message for delayed delivery.
    pub fn send(&self, to: &NodeId, msg: Message) {
        let latency = if self.latency_max_ms == 0 {
            Duration::ZERO
        } else {
            let ms = rand::rng().random_range(self.latency_min_ms..=self.latency_max_ms);
            Duration::from_millis(ms)
        };
        let delayed = Delayed {
            deliver_at: Instant::now() + latency,
            order: self.order.fetch_add(1, Ordering::Relaxed),
            to: to.clone(),
            msg,
        };
        // The router only stops at shutdown; losing messages then is fine.
        let _ = self.submit.send(delayed);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .expect("network handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

fn run_router(routes: Arc<Routes>, submissions: Receiver<Delayed>, cancel: CancelToken) {
    let mut heap: BinaryHeap<Delayed> = BinaryHeap::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let timeout = heap
            .peek()
            .map(|next| next.deliver_at.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL);
        match submissions.recv_timeout(timeout) {
            Ok(delayed) => heap.push(delayed),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // Drain everything already submitted before delivering.
        while let Ok(delayed) = submissions.try_recv() {
            heap.push(delayed);
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|next| next.deliver_at <= now) {
            let delayed = heap.pop().expect("peeked delayed message");
            deliver(&routes, delayed);
        }
    }
}

fn deliver(routes: &Routes, delayed: Delayed) {
    {
        let blocked = routes.blocked.lock().expect("network blocklist lock poisoned");
        if blocked.contains(&(delayed.msg.from.clone(), delayed.to.clone())) {
            return;
        }
    }
    let inboxes = routes.inboxes.lock().expect("network inbox lock poisoned");
    if let Some(tx) = inboxes.get(&delayed.to) {
        // Lossy on overflow, like the UDP it simulates.
        let _ = tx.try_send(delayed.msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swim::proto::MessageKind;

    fn message(from: &str) -> Message {
        Message {
            from: from.to_string(),
            kind: MessageKind::Ping,
            seq: 1,
            gossip: Vec::new(),
        }
    }

    fn fast_network(cancel: &CancelToken) -> Network {
        Network::new(Duration::ZERO, Duration::from_millis(2), cancel.clone())
    }

    #[test]
    fn delivers_to_registered_inbox() {
        let cancel = CancelToken::new();
        let network = fast_network(&cancel);
        let inbox = network.register(&"b".to_string());

        network.send(&"b".to_string(), message("a"));
        let got = inbox.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(got.from, "a");

        cancel.cancel();
        network.shutdown();
    }

    #[test]
    fn blocked_pairs_drop_messages() {
        let cancel = CancelToken::new();
        let network = fast_network(&cancel);
        let inbox = network.register(&"b".to_string());
        network.block(&"a".to_string(), &"b".to_string());

        network.send(&"b".to_string(), message("a"));
        assert!(inbox.recv_timeout(Duration::from_millis(100)).is_err());

        // The reverse direction is unaffected.
        let inbox_a = network.register(&"a".to_string());
        network.send(&"a".to_string(), message("b"));
        assert!(inbox_a.recv_timeout(Duration::from_millis(500)).is_ok());

        cancel.cancel();
        network.shutdown();
    }

    #[test]
    fn removed_nodes_receive_nothing() {
        let cancel = CancelToken::new();
        let network = fast_network(&cancel);
        let inbox = network.register(&"b".to_string());
        network.remove(&"b".to_string());

        network.send(&"b".to_string(), message("a"));
        assert!(inbox.recv_timeout(Duration::from_millis(100)).is_err());

        cancel.cancel();
        network.shutdown();
    }
}
