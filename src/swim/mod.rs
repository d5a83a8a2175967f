//! SWIM failure detector over an in-process transport.
//!
//! Probe / indirect-probe / suspect / refute with infection-style gossip
//! piggy-backed on every message. The transport is a simulated network with
//! configurable per-hop latency and a partition blocklist, so whole-cluster
//! behavior (kill, partition, convergence) is testable in-process.

mod member;
mod node;
mod proto;
mod transport;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::ErrorKind;

use node::Node;
use transport::Network;

pub use member::{MemberInfo, MemberState};

pub type NodeId = String;

pub type SwimResult<T> = std::result::Result<T, SwimError>;

#[derive(Debug, Error)]
pub enum SwimError {
    #[error("unknown node {node:?}")]
    UnknownNode { node: String },
    #[error("cluster already started")]
    AlreadyStarted,
    #[error("cluster not started")]
    NotStarted,
}

impl SwimError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Invalid
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwimConfig {
    /// How often each node runs a probe round.
    pub protocol_period: Duration,
    /// Ack timeout for the direct probe before indirect probes go out.
    pub ping_timeout: Duration,
    /// How long a member stays Suspect before it is declared Dead.
    pub suspect_timeout: Duration,
    /// Number of relayers asked to probe an unresponsive member.
    pub indirect_k: usize,
    /// Simulated per-hop latency range.
    pub latency_min: Duration,
    pub latency_max: Duration,
    /// Most membership updates piggy-backed on one message.
    pub gossip_max_updates: usize,
    /// Retransmission budget per rumor.
    pub gossip_transmits: u32,
}

impl Default for SwimConfig {
    fn default() -> Self {
        Self {
            protocol_period: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(50),
            suspect_timeout: Duration::from_millis(600),
            indirect_k: 3,
            latency_min: Duration::from_millis(2),
            latency_max: Duration::from_millis(15),
            gossip_max_updates: 8,
            gossip_transmits: 8,
        }
    }
}

/// A cluster of `n` SWIM nodes wired over the simulated network.
pub struct Cluster {
    network: Arc<Network>,
    nodes: Vec<Arc<Node>>,
    killed: Mutex<HashSet<NodeId>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancelToken,
    started: AtomicBool,
}

impl Cluster {
    /// Create `n` nodes named `node-0` .. `node-{n-1}`, each knowing the
    /// full member list as Alive at incarnation 0.
    pub fn new(n: usize, config: SwimConfig) -> Self {
        let cancel = CancelToken::new();
        let network = Arc::new(Network::new(
            config.latency_min,
            config.latency_max,
            cancel.clone(),
        ));

        let ids: Vec<NodeId> = (0..n).map(|i| format!("node-{i}")).collect();
        let nodes = ids
            .iter()
            .map(|id| {
                let inbox = network.register(id);
                Arc::new(Node::new(
                    id.clone(),
                    &ids,
                    config.clone(),
                    Arc::clone(&network),
                    inbox,
                    CancelToken::new(),
                ))
            })
            .collect();

        Self {
            network,
            nodes,
            killed: Mutex::new(HashSet::new()),
            handles: Mutex::new(Vec::new()),
            cancel,
            started: AtomicBool::new(false),
        }
    }

    /// Launch every node's protocol thread.
    pub fn start(&self) -> SwimResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SwimError::AlreadyStarted);
        }
        let mut handles = self.handles.lock().expect("cluster handles lock poisoned");
        for node in &self.nodes {
            let runner = Arc::clone(node);
            let name = format!("swim-{}", node.id);
            handles.push(
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || runner.run())
                    .expect("spawn swim node"),
            );
        }
        tracing::info!(nodes = self.nodes.len(), "swim cluster started");
        Ok(())
    }

    /// Hard-kill a node: it stops sending and receiving without notice.
    pub fn kill(&self, node_id: &str) -> SwimResult<()> {
        let node = self.find(node_id)?;
        node.cancel.cancel();
        self.network.remove(&node.id);
        self.killed
            .lock()
            .expect("cluster killed lock poisoned")
            .insert(node.id.clone());
        tracing::info!(node = node_id, "node killed");
        Ok(())
    }

    /// Drop all messages between `a` and `b`, both directions. Messages are
    /// silently lost; the protocol must keep making progress.
    pub fn partition(&self, a: &str, b: &str) -> SwimResult<()> {
        let a = self.find(a)?.id.clone();
        let b = self.find(b)?.id.clone();
        self.network.block(&a, &b);
        self.network.block(&b, &a);
        tracing::info!(a = %a, b = %b, "partition installed");
        Ok(())
    }

    /// The membership view of a random live node.
    pub fn membership_state(&self) -> BTreeMap<NodeId, MemberState> {
        let live = self.live_nodes();
        if live.is_empty() {
            return BTreeMap::new();
        }
        let idx = rand::rng().random_range(0..live.len());
        live[idx].snapshot()
    }

    /// Poll until every live node holds an identical, settled view (no
    /// member still Suspect), or the timeout elapses.
    pub fn wait_converged(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let views: Vec<BTreeMap<NodeId, MemberState>> =
                self.live_nodes().iter().map(|node| node.snapshot()).collect();
            let settled = !views.is_empty()
                && views.windows(2).all(|pair| pair[0] == pair[1])
                && views[0].values().all(|&state| state != MemberState::Suspect);
            if settled {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Cancel every node and the router, then join the threads. Idempotent.
    pub fn stop(&self) {
        for node in &self.nodes {
            node.cancel.cancel();
        }
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .expect("cluster handles lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.network.shutdown();
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }

    fn find(&self, node_id: &str) -> SwimResult<&Arc<Node>> {
        self.nodes
            .iter()
            .find(|node| node.id == node_id)
            .ok_or_else(|| SwimError::UnknownNode {
                node: node_id.to_string(),
            })
    }

    fn live_nodes(&self) -> Vec<&Arc<Node>> {
        let killed = self.killed.lock().expect("cluster killed lock poisoned");
        self.nodes
            .iter()
            .filter(|node| !killed.contains(&node.id))
            .collect()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop();
    }
}
