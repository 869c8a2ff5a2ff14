/// The routing-service contract the carrier consumes.
///
/// The substrate is a Pastry-like overlay providing prefix-routed
/// point-to-point delivery and topic multicast. The carrier only sees
/// this trait plus an upcall event stream; process bootstrap and the
/// overlay itself live elsewhere.
use tokio::sync::mpsc;

use crate::types::{NodeId, TopicId};
use crate::CarrierError;

/// Calls from the carrier down into the routing substrate.
///
/// All methods are non-blocking enqueues: the substrate owns its own
/// delivery machinery and reports failures through the event stream.
pub trait Routing: Send + Sync {
    /// Join the multicast tree of a topic. Idempotent; re-issuing it
    /// re-announces the subscription toward the rendez-vous.
    fn subscribe(&self, topic: TopicId) -> Result<(), CarrierError>;

    /// Leave the multicast tree of a topic.
    fn unsubscribe(&self, topic: TopicId) -> Result<(), CarrierError>;

    /// Fan a payload out to every subscriber of a topic.
    fn publish(&self, topic: TopicId, payload: Vec<u8>) -> Result<(), CarrierError>;

    /// Route a payload toward the topic's rendez-vous for single
    /// delivery; per-hop branch selection is the carrier's job.
    fn balance(&self, topic: TopicId, payload: Vec<u8>) -> Result<(), CarrierError>;

    /// Unicast a payload to a specific node.
    fn direct(&self, node: NodeId, payload: Vec<u8>) -> Result<(), CarrierError>;
}

/// Upcalls from the routing substrate into the carrier.
#[derive(Debug, Clone)]
pub enum RoutingEvent {
    /// A multicast or rendez-vous-routed payload arrived for a topic.
    Deliver { topic: TopicId, payload: Vec<u8> },
    /// A unicast payload arrived.
    Direct { payload: Vec<u8> },
    /// The tree parent of a topic changed. `None` means the local node
    /// is now the root.
    TreeParent {
        topic: TopicId,
        parent: Option<NodeId>,
    },
    /// A node attached below us in a topic tree.
    TreeChildUp { topic: TopicId, child: NodeId },
    /// A node below us detached.
    TreeChildDown { topic: TopicId, child: NodeId },
}

/// The upcall stream handed to [`Carrier::start`](crate::Carrier::start).
pub type RoutingEvents = mpsc::UnboundedReceiver<RoutingEvent>;
