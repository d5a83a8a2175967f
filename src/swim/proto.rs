//! Protocol messages exchanged over the in-process transport.

use super::NodeId;
use super::member::MemberInfo;

/// Probe sequence number, unique per sender.
pub(crate) type Seq = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MessageKind {
    /// Direct probe; answered with an `Ack` echoing the sequence.
    Ping,
    /// Response to a `Ping`, or a relayed response to a `PingReq`.
    Ack,
    /// Ask the receiver to probe `target` on the sender's behalf.
    PingReq { target: NodeId },
}

/// Every message piggy-backs a bounded list of membership updates, sorted by
/// node id before emission.
#[derive(Clone, Debug)]
pub(crate) struct Message {
    pub from: NodeId,
    pub kind: MessageKind,
    pub seq: Seq,
    pub gossip: Vec<MemberInfo>,
}
