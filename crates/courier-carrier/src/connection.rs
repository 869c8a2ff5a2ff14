/// Client connection handles.
///
/// A connection is scoped to a cluster name (application id) and
/// implicitly joins the cluster's group topic, making it reachable by
/// broadcasts, balanced requests and tunnel initiations from other
/// members. Operations take `&self`, so a connection can be shared
/// behind an `Arc`; inbound traffic arrives on the separately owned
/// [`ConnectionEvents`] stream.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::carrier::Shared;
use crate::tunnel::Tunnel;
use crate::types::{ConnId, TopicId};
use crate::CarrierError;

/// Inbound traffic and upcalls for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnEvent {
    /// A topic publication this connection subscribes to.
    Message { topic: TopicId, payload: Vec<u8> },
    /// A balanced message that chose this connection.
    Delivery { payload: Vec<u8> },
    /// A request to serve; answer with [`Connection::reply`] quoting
    /// `id`.
    Request { id: u64, payload: Vec<u8> },
    /// A remote node wants a tunnel; accept with
    /// [`Connection::tunnel_confirm`] quoting `id` before the
    /// initiator's deadline.
    TunnelRequest { id: u64 },
}

/// The receive side of a connection.
pub struct ConnectionEvents {
    rx: mpsc::Receiver<ConnEvent>,
}

impl ConnectionEvents {
    /// The next inbound event, or `None` once the connection closes.
    pub async fn recv(&mut self) -> Option<ConnEvent> {
        self.rx.recv().await
    }
}

/// A client's handle into the carrier, scoped to one cluster.
pub struct Connection {
    id: ConnId,
    cluster: String,
    cluster_topic: TopicId,
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        cluster: String,
        cluster_topic: TopicId,
        shared: Arc<Shared>,
        events: mpsc::Receiver<ConnEvent>,
    ) -> (Self, ConnectionEvents) {
        (
            Self {
                id,
                cluster,
                cluster_topic,
                shared,
            },
            ConnectionEvents { rx: events },
        )
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// The cluster (application id) this connection belongs to.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The carrier-level topic a named topic maps to for this cluster.
    pub fn topic_id(&self, topic: &str) -> TopicId {
        TopicId::scoped(&self.cluster, topic)
    }

    /// The implicit group topic of this connection's cluster.
    pub fn cluster_topic(&self) -> TopicId {
        self.cluster_topic
    }

    /// Subscribe to a named topic. Idempotent per connection.
    pub fn subscribe(&self, topic: &str) -> Result<(), CarrierError> {
        self.shared.subscribe(self.id, self.topic_id(topic))
    }

    /// Unsubscribe from a named topic.
    pub fn unsubscribe(&self, topic: &str) -> Result<(), CarrierError> {
        self.shared.unsubscribe(self.id, self.topic_id(topic))
    }

    /// Publish to every subscriber of a named topic. Best effort,
    /// ordered per publisher.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CarrierError> {
        self.shared.publish(self.id, self.topic_id(topic), payload)
    }

    /// Broadcast to every member of this cluster.
    pub fn broadcast(&self, payload: Vec<u8>) -> Result<(), CarrierError> {
        self.shared.publish(self.id, self.cluster_topic, payload)
    }

    /// Broadcast to every member of a named cluster.
    pub fn broadcast_cluster(&self, cluster: &str, payload: Vec<u8>) -> Result<(), CarrierError> {
        self.shared
            .publish(self.id, TopicId::cluster(cluster), payload)
    }

    /// Deliver to exactly one subscriber of a named topic, chosen by
    /// capacity-weighted selection.
    pub fn balance(&self, topic: &str, payload: Vec<u8>) -> Result<(), CarrierError> {
        self.shared.balance(self.topic_id(topic), payload)
    }

    /// Request one cluster member to serve `payload`, awaiting the reply
    /// up to `timeout`.
    pub async fn request(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CarrierError> {
        self.shared
            .request_balanced(self.id, self.cluster_topic, payload, timeout)
            .await
    }

    /// Request one member of a named cluster to serve `payload`.
    pub async fn request_cluster(
        &self,
        cluster: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CarrierError> {
        self.shared
            .request_balanced(self.id, TopicId::cluster(cluster), payload, timeout)
            .await
    }

    /// Answer a previously delivered [`ConnEvent::Request`].
    pub fn reply(&self, id: u64, payload: Vec<u8>) -> Result<(), CarrierError> {
        self.shared.reply(id, payload)
    }

    /// Open an ordered bidirectional tunnel to one cluster member.
    pub async fn tunnel(&self, timeout: Duration) -> Result<Tunnel, CarrierError> {
        self.shared
            .tunnel_balanced(self.cluster_topic, timeout)
            .await
    }

    /// Open an ordered bidirectional tunnel to one member of a named
    /// cluster.
    pub async fn tunnel_cluster(
        &self,
        cluster: &str,
        timeout: Duration,
    ) -> Result<Tunnel, CarrierError> {
        self.shared
            .tunnel_balanced(TopicId::cluster(cluster), timeout)
            .await
    }

    /// Accept a previously delivered [`ConnEvent::TunnelRequest`].
    pub fn tunnel_confirm(&self, id: u64) -> Result<Tunnel, CarrierError> {
        self.shared.tunnel_confirm(id)
    }

    /// Release the connection: subscriptions cascade away, outstanding
    /// requests fail with `Closed`.
    pub fn close(&self) {
        self.shared.close_conn(self.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
