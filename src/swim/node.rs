//! Per-node protocol state machine.
//!
//! Each node runs one thread: a ticker drives protocol periods, the inbox
//! feeds protocol messages, and a probe timer escalates a silent direct
//! probe to indirect probes before the period ends.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, after, never, tick};
use rand::Rng;

use crate::cancel::CancelToken;

use super::member::{Member, MemberInfo, MemberState};
use super::proto::{Message, MessageKind, Seq};
use super::transport::Network;
use super::{NodeId, SwimConfig};

/// Cancellation poll interval for the select loop.
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Pending updates queued for piggy-backing, each with a limited number of
/// retransmissions so rumors age out.
struct GossipEntry {
    info: MemberInfo,
    transmits_left: u32,
}

pub(crate) struct GossipBuffer {
    entries: Vec<GossipEntry>,
    transmit_budget: u32,
}

impl GossipBuffer {
    fn new(transmit_budget: u32) -> Self {
        Self {
            entries: Vec::new(),
            transmit_budget: transmit_budget.max(1),
        }
    }

    fn push(&mut self, info: MemberInfo) {
        self.entries.retain(|entry| entry.info.node_id != info.node_id);
        self.entries.push(GossipEntry {
            info,
            transmits_left: self.transmit_budget,
        });
    }

    /// Up to `max` updates, sorted by node id; each taken update spends one
    /// retransmission.
    fn take(&mut self, max: usize) -> Vec<MemberInfo> {
        self.entries.sort_by(|a, b| a.info.node_id.cmp(&b.info.node_id));
        let mut out = Vec::new();
        for entry in self.entries.iter_mut() {
            if out.len() >= max {
                break;
            }
            entry.transmits_left -= 1;
            out.push(entry.info.clone());
        }
        self.entries.retain(|entry| entry.transmits_left > 0);
        out
    }
}

/// An in-flight direct probe.
struct Probe {
    target: NodeId,
    seq: Seq,
    acked: bool,
    indirect_sent: bool,
    timer: Receiver<Instant>,
}

/// A relayed ping on behalf of another node.
struct Relay {
    origin: NodeId,
    origin_seq: Seq,
    created: Instant,
}

pub(crate) struct Node {
    pub id: NodeId,
    config: SwimConfig,
    network: Arc<Network>,
    inbox: Receiver<Message>,
    membership: Mutex<BTreeMap<NodeId, Member>>,
    incarnation: AtomicU64,
    gossip: Mutex<GossipBuffer>,
    next_seq: AtomicU64,
    pub cancel: CancelToken,
}

impl Node {
    pub fn new(
        id: NodeId,
        peers: &[NodeId],
        config: SwimConfig,
        network: Arc<Network>,
        inbox: Receiver<Message>,
        cancel: CancelToken,
    ) -> Self {
        let mut membership = BTreeMap::new();
        for peer in peers {
            membership.insert(peer.clone(), Member::alive(0));
        }
        membership.insert(id.clone(), Member::alive(0));
        let gossip = GossipBuffer::new(config.gossip_transmits);
        Self {
            id,
            config,
            network,
            inbox,
            membership: Mutex::new(membership),
            incarnation: AtomicU64::new(0),
            gossip: Mutex::new(gossip),
            next_seq: AtomicU64::new(1),
            cancel,
        }
    }

    /// A copy of this node's membership view.
    pub fn snapshot(&self) -> BTreeMap<NodeId, MemberState> {
        self.membership
            .lock()
            .expect("membership lock poisoned")
            .iter()
            .map(|(id, member)| (id.clone(), member.state))
            .collect()
    }

    /// Protocol loop; returns when cancelled or the network goes away.
    pub fn run(&self) {
        let ticker = tick(self.config.protocol_period);
        let inbox = self.inbox.clone();
        let mut probe: Option<Probe> = None;
        let mut relays: HashMap<Seq, Relay> = HashMap::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let probe_timer = match &probe {
                Some(p) if !p.acked && !p.indirect_sent => p.timer.clone(),
                _ => never(),
            };

            crossbeam::select! {
                recv(ticker) -> _ => {
                    self.finish_period(&mut probe);
                    self.sweep_suspects();
                    self.expire_relays(&mut relays);
                    probe = self.start_probe();
                }
                recv(probe_timer) -> _ => {
                    if let Some(p) = probe.as_mut() && !p.acked {
                        self.send_indirect_probes(p);
                        p.indirect_sent = true;
                    }
                }
                recv(inbox) -> msg => match msg {
                    Ok(msg) => self.handle(msg, &mut probe, &mut relays),
                    Err(_) => break,
                },
                default(CANCEL_POLL) => {}
            }
        }
    }

    fn handle(&self, msg: Message, probe: &mut Option<Probe>, relays: &mut HashMap<Seq, Relay>) {
        self.merge_gossip(&msg.gossip);

        match msg.kind {
            MessageKind::Ping => {
                self.send(&msg.from, MessageKind::Ack, msg.seq);
            }
            MessageKind::PingReq { target } => {
                let relay_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                relays.insert(
                    relay_seq,
                    Relay {
                        origin: msg.from,
                        origin_seq: msg.seq,
                        created: Instant::now(),
                    },
                );
                self.send(&target, MessageKind::Ping, relay_seq);
            }
            MessageKind::Ack => {
                if let Some(p) = probe.as_mut() && p.seq == msg.seq {
                    p.acked = true;
                } else if let Some(relay) = relays.remove(&msg.seq) {
                    // Forward the indirect ack back to the prober.
                    self.send(&relay.origin, MessageKind::Ack, relay.origin_seq);
                }
            }
        }
    }

    fn merge_gossip(&self, updates: &[MemberInfo]) {
        for info in updates {
            if info.node_id == self.id {
                if info.state != MemberState::Alive {
                    self.refute(info.incarnation);
                }
                continue;
            }

            let mut membership = self.membership.lock().expect("membership lock poisoned");
            let accepted = match membership.get_mut(&info.node_id) {
                Some(member) => {
                    if info.dominates(member.state, member.incarnation) {
                        member.state = info.state;
                        member.incarnation = info.incarnation;
                        member.suspected_at =
                            (info.state == MemberState::Suspect).then(Instant::now);
                        true
                    } else {
                        false
                    }
                }
                None => {
                    membership.insert(
                        info.node_id.clone(),
                        Member {
                            state: info.state,
                            incarnation: info.incarnation,
                            suspected_at: (info.state == MemberState::Suspect)
                                .then(Instant::now),
                        },
                    );
                    true
                }
            };
            drop(membership);

            if accepted {
                // Keep the rumor spreading.
                self.queue_gossip(info.clone());
            }
        }
    }

    /// Self-suspicion: bump our incarnation past the rumor and gossip Alive.
    fn refute(&self, rumored_incarnation: u64) {
        let current = self.incarnation.load(Ordering::Relaxed);
        let next = current.max(rumored_incarnation) + 1;
        self.incarnation.store(next, Ordering::Relaxed);

        let mut membership = self.membership.lock().expect("membership lock poisoned");
        if let Some(me) = membership.get_mut(&self.id) {
            me.state = MemberState::Alive;
            me.incarnation = next;
            me.suspected_at = None;
        }
        drop(membership);

        tracing::debug!(node = %self.id, incarnation = next, "refuting suspicion");
        self.queue_gossip(MemberInfo {
            node_id: self.id.clone(),
            state: MemberState::Alive,
            incarnation: next,
        });
    }

    fn finish_period(&self, probe: &mut Option<Probe>) {
        if let Some(p) = probe.take()
            && !p.acked
        {
            self.mark_suspect(&p.target);
        }
    }

    fn mark_suspect(&self, target: &NodeId) {
        let mut membership = self.membership.lock().expect("membership lock poisoned");
        let Some(member) = membership.get_mut(target) else {
            return;
        };
        if member.state != MemberState::Alive {
            return;
        }
        member.state = MemberState::Suspect;
        member.suspected_at = Some(Instant::now());
        let info = member.info(target);
        drop(membership);

        tracing::debug!(node = %self.id, suspect = %target, "probe failed; member suspected");
        self.queue_gossip(info);
    }

    fn sweep_suspects(&self) {
        let mut expired = Vec::new();
        {
            let mut membership = self.membership.lock().expect("membership lock poisoned");
            for (id, member) in membership.iter_mut() {
                if member.state == MemberState::Suspect
                    && member
                        .suspected_at
                        .is_some_and(|at| at.elapsed() >= self.config.suspect_timeout)
                {
                    member.state = MemberState::Dead;
                    member.suspected_at = None;
                    expired.push(member.info(id));
                }
            }
        }
        for info in expired {
            tracing::debug!(node = %self.id, dead = %info.node_id, "suspect timed out");
            self.queue_gossip(info);
        }
    }

    fn expire_relays(&self, relays: &mut HashMap<Seq, Relay>) {
        let ttl = self.config.protocol_period * 2;
        relays.retain(|_, relay| relay.created.elapsed() < ttl);
    }

    fn start_probe(&self) -> Option<Probe> {
        let target = self.pick_members(1, None).pop()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.send(&target, MessageKind::Ping, seq);
        Some(Probe {
            target,
            seq,
            acked: false,
            indirect_sent: false,
            timer: after(self.config.ping_timeout),
        })
    }

    fn send_indirect_probes(&self, probe: &Probe) {
        let relayers = self.pick_members(self.config.indirect_k, Some(&probe.target));
        for relayer in relayers {
            self.send(
                &relayer,
                MessageKind::PingReq {
                    target: probe.target.clone(),
                },
                probe.seq,
            );
        }
    }

    /// Up to `count` random non-dead members, excluding self and `except`.
    fn pick_members(&self, count: usize, except: Option<&NodeId>) -> Vec<NodeId> {
        let membership = self.membership.lock().expect("membership lock poisoned");
        let mut candidates: Vec<NodeId> = membership
            .iter()
            .filter(|(id, member)| {
                member.state != MemberState::Dead
                    && **id != self.id
                    && except.is_none_or(|e| **id != *e)
            })
            .map(|(id, _)| id.clone())
            .collect();
        drop(membership);

        let mut rng = rand::rng();
        let mut picked = Vec::new();
        while !candidates.is_empty() && picked.len() < count {
            let idx = rng.random_range(0..candidates.len());
            picked.push(candidates.swap_remove(idx));
        }
        picked
    }

    fn queue_gossip(&self, info: MemberInfo) {
        self.gossip
            .lock()
            .expect("gossip buffer lock poisoned")
            .push(info);
    }

    fn send(&self, to: &NodeId, kind: MessageKind, seq: Seq) {
        let gossip = self
            .gossip
            .lock()
            .expect("gossip buffer lock poisoned")
            .take(self.config.gossip_max_updates);
        self.network.send(
            to,
            Message {
                from: self.id.clone(),
                kind,
                seq,
                gossip,
            },
        );
    }
}
