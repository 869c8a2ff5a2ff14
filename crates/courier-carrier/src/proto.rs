/// Carrier control envelopes.
///
/// Everything the carrier puts on the overlay — multicast or unicast —
/// is one of these variants, MessagePack-encoded. Payload bytes are
/// opaque: the carrier routes without parsing application content.
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, TopicId};
use crate::CarrierError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CarrierMessage {
    /// A root announcing (or re-announcing) its subscription so peer
    /// roots of the same topic can discover each other.
    SubscribeAnnounce { topic: TopicId, node: NodeId },

    /// Per-beat capacity report to one tree neighbor. `topics` and
    /// `caps` are parallel sequences.
    Report {
        node: NodeId,
        topics: Vec<TopicId>,
        caps: Vec<u32>,
    },

    /// Topic fan-out payload, ordered per publisher by `seq`.
    Publish {
        topic: TopicId,
        seq: u64,
        payload: Vec<u8>,
    },

    /// A message hopping down the topic tree toward exactly one
    /// subscriber. `src` is the previous hop, excluded from the next
    /// branch pick.
    Balance {
        topic: TopicId,
        src: NodeId,
        inner: Box<CarrierMessage>,
    },

    /// Application payload for single delivery.
    Data { payload: Vec<u8> },

    /// Request awaiting a correlated reply at `from`.
    Request {
        id: u64,
        from: NodeId,
        payload: Vec<u8>,
    },

    /// Reply to a request issued by the receiving node.
    Reply { id: u64, payload: Vec<u8> },

    /// Tunnel initiation; `id` is the initiator-local tunnel id.
    TunnelRequest {
        id: u64,
        from: NodeId,
        timeout_ms: u64,
    },

    /// Responder confirmation: `init_id` correlates at the initiator,
    /// `resp_id` is the responder-local tunnel id.
    TunnelConfirm {
        init_id: u64,
        resp_id: u64,
        from: NodeId,
    },

    /// Responder refusal (application did not confirm in time).
    TunnelReject { init_id: u64 },

    /// Ordered tunnel payload; `id` is the receiver-local tunnel id.
    TunnelData { id: u64, seq: u64, payload: Vec<u8> },

    /// Flow-control acknowledgement for one delivered tunnel message.
    TunnelAck { id: u64, seq: u64 },

    /// Symmetric tunnel close; `id` is the receiver-local tunnel id.
    TunnelClose { id: u64 },
}

impl CarrierMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CarrierError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CarrierError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}
