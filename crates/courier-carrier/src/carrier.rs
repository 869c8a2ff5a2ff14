/// The carrier — owner of the topic map and orchestrator of every
/// messaging primitive.
///
/// A carrier is constructed explicitly around a routing service and an
/// upcall event stream; there are no ambient registries. One event loop
/// task consumes routing upcalls and the heartbeat timer; connection
/// operations run on their callers' tasks against the shared state.
///
/// Lock discipline: the topic map lock is taken before any per-topic
/// lock, and the connection registry is never held together with either.
/// Critical sections stay synchronous; nothing awaits while holding a
/// lock.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::{ConnEvent, Connection};
use crate::heart::Heart;
use crate::proto::CarrierMessage;
use crate::routing::{Routing, RoutingEvent, RoutingEvents};
use crate::topic::{Branch, Topic};
use crate::tunnel::{LiveTunnels, Tunnel};
use crate::types::{ConnId, MonitorId, NodeId, TopicId};
use crate::CarrierError;

/// Carrier tuning knobs. All fields have workable defaults.
#[derive(Debug, Clone)]
pub struct CarrierConfig {
    /// Heartbeat period: load reports, root re-announces, sweeps.
    pub beat_interval: Duration,
    /// Beats without a ping before a tree neighbor is declared dead.
    pub kill_threshold: u32,
    /// Upper bound of every advertised capacity estimate.
    pub max_capacity: u32,
    /// Per-connection event queue depth.
    pub event_buffer: usize,
    /// Tunnel flow-control window (unacknowledged messages).
    pub tunnel_window: usize,
    /// How long a pending reply route survives without a reply.
    pub reply_ttl: Duration,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            beat_interval: Duration::from_secs(1),
            kill_threshold: 3,
            max_capacity: 100,
            event_buffer: 64,
            tunnel_window: 64,
            reply_ttl: Duration::from_secs(30),
        }
    }
}

/// Registry entry for one live client connection.
pub(crate) struct ConnEntry {
    pub events: mpsc::Sender<ConnEvent>,
    pub topics: Vec<TopicId>,
    /// Publish sequence per topic, making FIFO-per-publisher explicit.
    pub pub_seq: HashMap<TopicId, u64>,
}

/// A request issued from this node, awaiting its correlated reply.
struct PendingRequest {
    conn: ConnId,
    tx: oneshot::Sender<Result<Vec<u8>, CarrierError>>,
}

/// Route information for replying to a request delivered to this node.
struct ReplyRoute {
    origin: NodeId,
    req_id: u64,
    deadline: Instant,
}

/// An initiated tunnel awaiting the remote confirmation.
struct PendingInit {
    tx: oneshot::Sender<Result<Tunnel, CarrierError>>,
}

/// A remotely initiated tunnel awaiting local application confirmation.
struct PendingConfirm {
    conn: ConnId,
    tunnel: Tunnel,
    init_id: u64,
    from: NodeId,
    deadline: Instant,
}

pub(crate) struct Shared {
    pub self_id: NodeId,
    pub routing: Arc<dyn Routing>,
    pub config: CarrierConfig,

    /// The topic map. Guards only the map's shape; each topic carries
    /// its own lock for internal state.
    topics: RwLock<HashMap<TopicId, Arc<RwLock<Topic>>>>,

    conns: RwLock<HashMap<ConnId, ConnEntry>>,
    conn_autoid: AtomicU64,

    heart: Mutex<Heart<MonitorId>>,

    req_autoid: AtomicU64,
    reqs: Mutex<HashMap<u64, PendingRequest>>,

    reply_autoid: AtomicU64,
    reply_pend: Mutex<HashMap<u64, ReplyRoute>>,

    tun_autoid: AtomicU64,
    tun_pend: Mutex<HashMap<u64, PendingInit>>,
    tun_confirm: Mutex<HashMap<u64, PendingConfirm>>,
    pub(crate) tun_live: LiveTunnels,
}

/// The carrier handle. Dropping it stops the event loop.
pub struct Carrier {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Carrier {
    /// Construct a carrier over a routing service and start its event
    /// loop.
    pub fn start(
        self_id: NodeId,
        routing: Arc<dyn Routing>,
        mut events: RoutingEvents,
        config: CarrierConfig,
    ) -> Self {
        let kill_threshold = config.kill_threshold;
        let beat_interval = config.beat_interval;

        let shared = Arc::new(Shared {
            self_id,
            routing,
            config,
            topics: RwLock::new(HashMap::new()),
            conns: RwLock::new(HashMap::new()),
            conn_autoid: AtomicU64::new(1),
            heart: Mutex::new(Heart::new(kill_threshold)),
            req_autoid: AtomicU64::new(1),
            reqs: Mutex::new(HashMap::new()),
            reply_autoid: AtomicU64::new(1),
            reply_pend: Mutex::new(HashMap::new()),
            tun_autoid: AtomicU64::new(1),
            tun_pend: Mutex::new(HashMap::new()),
            tun_confirm: Mutex::new(HashMap::new()),
            tun_live: Arc::new(Mutex::new(HashMap::new())),
        });

        let loop_shared = shared.clone();
        let task = tokio::spawn(async move {
            let mut beat = tokio::time::interval(beat_interval);
            beat.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => loop_shared.handle_event(event),
                        None => break,
                    },
                    _ = beat.tick() => loop_shared.beat(),
                }
            }
        });

        Self { shared, task }
    }

    /// This node's overlay address.
    pub fn self_id(&self) -> NodeId {
        self.shared.self_id
    }

    /// Open a client connection scoped to a cluster name. The connection
    /// implicitly joins the cluster's group topic.
    pub fn connect(
        &self,
        cluster: &str,
    ) -> Result<(Connection, crate::connection::ConnectionEvents), CarrierError> {
        let id = self.shared.conn_autoid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.event_buffer);

        self.shared.conns.write().unwrap().insert(
            id,
            ConnEntry {
                events: tx,
                topics: Vec::new(),
                pub_seq: HashMap::new(),
            },
        );

        let cluster_topic = TopicId::cluster(cluster);
        self.shared.subscribe(id, cluster_topic)?;

        Ok(Connection::new(
            id,
            cluster.to_string(),
            cluster_topic,
            self.shared.clone(),
            rx,
        ))
    }

    /// Direct request to a specific node, correlated by request id.
    pub async fn request_node(
        &self,
        node: NodeId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CarrierError> {
        self.shared.request_node(0, node, payload, timeout).await
    }

    /// Direct tunnel initiation toward a specific node.
    pub async fn tunnel_node(
        &self,
        node: NodeId,
        timeout: Duration,
    ) -> Result<Tunnel, CarrierError> {
        let id = self.shared.tun_autoid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .tun_pend
            .lock()
            .unwrap()
            .insert(id, PendingInit { tx });

        let request = CarrierMessage::TunnelRequest {
            id,
            from: self.shared.self_id,
            timeout_ms: timeout.as_millis() as u64,
        };
        if let Err(err) = self.shared.routing.direct(node, request.to_bytes()?) {
            self.shared.tun_pend.lock().unwrap().remove(&id);
            return Err(err);
        }
        self.shared.await_tunnel(id, rx, timeout).await
    }

    // ── Introspection (operational queries and tests) ──────────────────

    /// Number of live topic entries.
    pub fn topic_count(&self) -> usize {
        self.shared.topics.read().unwrap().len()
    }

    /// Whether a topic entry exists.
    pub fn has_topic(&self, topic: TopicId) -> bool {
        self.shared.topics.read().unwrap().contains_key(&topic)
    }

    /// The tree parent of a topic, if the entry exists.
    pub fn topic_parent(&self, topic: TopicId) -> Option<Option<NodeId>> {
        let topics = self.shared.topics.read().unwrap();
        topics.get(&topic).map(|t| t.read().unwrap().parent())
    }

    /// Number of outstanding locally issued requests.
    pub fn pending_requests(&self) -> usize {
        self.shared.reqs.lock().unwrap().len()
    }

    /// Number of initiated tunnels awaiting confirmation.
    pub fn pending_tunnels(&self) -> usize {
        self.shared.tun_pend.lock().unwrap().len()
    }
}

impl Drop for Carrier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Shared {
    // ── Connection-facing operations ───────────────────────────────────

    /// Add a connection to a topic's local subscriber set, cascading a
    /// routing-service subscription when the topic entry is new.
    pub(crate) fn subscribe(&self, conn: ConnId, topic: TopicId) -> Result<(), CarrierError> {
        {
            let mut conns = self.conns.write().unwrap();
            let entry = conns.get_mut(&conn).ok_or(CarrierError::Closed)?;
            if !entry.topics.contains(&topic) {
                entry.topics.push(topic);
            }
        }

        let cascade = {
            let mut topics = self.topics.write().unwrap();
            match topics.get(&topic) {
                Some(existing) => {
                    existing.write().unwrap().subscribe_local(conn);
                    false
                }
                None => {
                    let mut fresh = Topic::new(topic, self.self_id, self.config.max_capacity);
                    fresh.subscribe_local(conn);
                    topics.insert(topic, Arc::new(RwLock::new(fresh)));
                    true
                }
            }
        };

        if cascade {
            // Serialized per topic: the cascade happens on the same call
            // path that created the entry, before anyone else can race
            // an unsubscribe for it.
            self.routing.subscribe(topic)?;
        }
        Ok(())
    }

    /// Remove a connection from a topic's subscriber set, dropping and
    /// unsubscribing the topic once nothing local remains.
    pub(crate) fn unsubscribe(&self, conn: ConnId, topic: TopicId) -> Result<(), CarrierError> {
        {
            let mut conns = self.conns.write().unwrap();
            if let Some(entry) = conns.get_mut(&conn) {
                entry.topics.retain(|t| *t != topic);
            }
        }

        let mut topics = self.topics.write().unwrap();
        let Some(entry) = topics.get(&topic) else {
            tracing::warn!(%topic, "unsubscribe from non-existent topic");
            return Err(CarrierError::NotSubscribed);
        };
        if !entry.write().unwrap().unsubscribe_local(conn) {
            tracing::warn!(%topic, conn, "remove non-existent subscription");
            return Err(CarrierError::NotSubscribed);
        }
        self.collect_if_idle(&mut topics, topic)?;
        Ok(())
    }

    /// Drop a topic entry whose subscribers and children are both gone,
    /// cascading the routing-service unsubscription exactly once.
    fn collect_if_idle(
        &self,
        topics: &mut HashMap<TopicId, Arc<RwLock<Topic>>>,
        topic: TopicId,
    ) -> Result<(), CarrierError> {
        let (drop_entry, parent) = match topics.get(&topic) {
            Some(entry) => {
                let guard = entry.read().unwrap();
                (
                    guard.subscribers().is_empty() && guard.children().is_empty(),
                    guard.parent(),
                )
            }
            None => (false, None),
        };
        if !drop_entry {
            return Ok(());
        }

        topics.remove(&topic);
        let mut heart = self.heart.lock().unwrap();
        if let Some(parent) = parent {
            heart.unmonitor(&(topic, parent));
        }
        drop(heart);
        self.routing.unsubscribe(topic)
    }

    /// Fan a payload out to every subscriber of a topic.
    pub(crate) fn publish(
        &self,
        conn: ConnId,
        topic: TopicId,
        payload: Vec<u8>,
    ) -> Result<(), CarrierError> {
        let seq = {
            let mut conns = self.conns.write().unwrap();
            let entry = conns.get_mut(&conn).ok_or(CarrierError::Closed)?;
            let seq = entry.pub_seq.entry(topic).or_insert(0);
            *seq += 1;
            *seq
        };

        let msg = CarrierMessage::Publish {
            topic,
            seq,
            payload,
        };
        self.routing.publish(topic, msg.to_bytes()?)
    }

    /// Deliver a payload to exactly one subscriber of a topic, chosen by
    /// capacity-weighted random selection at every hop.
    pub(crate) fn balance(&self, topic: TopicId, payload: Vec<u8>) -> Result<(), CarrierError> {
        self.balance_from(topic, CarrierMessage::Data { payload })
    }

    /// Start a balanced delivery of an arbitrary inner message.
    fn balance_from(&self, topic: TopicId, inner: CarrierMessage) -> Result<(), CarrierError> {
        let known_locally = self.topics.read().unwrap().contains_key(&topic);
        if !known_locally {
            // No tree state here: hand the message to the substrate to
            // route toward the rendez-vous.
            let msg = CarrierMessage::Balance {
                topic,
                src: self.self_id,
                inner: Box::new(inner),
            };
            return self.routing.balance(topic, msg.to_bytes()?);
        }
        self.balance_hop(topic, None, inner)
    }

    /// One hop of balanced delivery: pick a branch and either deliver
    /// locally or forward.
    fn balance_hop(
        &self,
        topic: TopicId,
        exclude: Option<NodeId>,
        inner: CarrierMessage,
    ) -> Result<(), CarrierError> {
        let picked = {
            let topics = self.topics.read().unwrap();
            let Some(entry) = topics.get(&topic) else {
                return Err(CarrierError::NoSubscribers);
            };
            let mut guard = entry.write().unwrap();
            let pick = guard.pick_branch(&mut rand::thread_rng(), exclude);
            if let Some(branch) = pick {
                guard.count_delivery(branch);
            }
            pick
        };

        match picked {
            Some(Branch::Local) => self.deliver_inner(topic, inner),
            Some(Branch::Node(node)) => {
                let msg = CarrierMessage::Balance {
                    topic,
                    src: self.self_id,
                    inner: Box::new(inner),
                };
                self.routing.direct(node, msg.to_bytes()?)
            }
            None => Err(CarrierError::NoSubscribers),
        }
    }

    /// Terminal delivery of a balanced message to one local subscriber.
    fn deliver_inner(&self, topic: TopicId, inner: CarrierMessage) -> Result<(), CarrierError> {
        let conn = {
            let topics = self.topics.read().unwrap();
            let subscribers = topics
                .get(&topic)
                .map(|t| t.read().unwrap().subscribers().to_vec())
                .unwrap_or_default();
            subscribers
                .choose(&mut rand::thread_rng())
                .copied()
                .ok_or(CarrierError::NoSubscribers)?
        };
        self.deliver_inner_to(conn, inner)
    }

    fn deliver_inner_to(&self, conn: ConnId, inner: CarrierMessage) -> Result<(), CarrierError> {
        match inner {
            CarrierMessage::Data { payload } => {
                self.send_event(conn, ConnEvent::Delivery { payload });
                Ok(())
            }
            CarrierMessage::Request { id, from, payload } => {
                let local_id = self.reply_autoid.fetch_add(1, Ordering::Relaxed);
                self.reply_pend.lock().unwrap().insert(
                    local_id,
                    ReplyRoute {
                        origin: from,
                        req_id: id,
                        deadline: Instant::now() + self.config.reply_ttl,
                    },
                );
                self.send_event(
                    conn,
                    ConnEvent::Request {
                        id: local_id,
                        payload,
                    },
                );
                Ok(())
            }
            CarrierMessage::TunnelRequest {
                id,
                from,
                timeout_ms,
            } => {
                self.inbound_tunnel(conn, id, from, timeout_ms);
                Ok(())
            }
            other => Err(CarrierError::Protocol(format!(
                "unexpected balanced payload: {other:?}"
            ))),
        }
    }

    /// Issue a request and await its reply. `conn` 0 marks node-level
    /// requests that survive connection teardown checks.
    pub(crate) async fn request_node(
        &self,
        conn: ConnId,
        node: NodeId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CarrierError> {
        let (id, rx) = self.register_request(conn);
        let msg = CarrierMessage::Request {
            id,
            from: self.self_id,
            payload,
        };
        if let Err(err) = self.routing.direct(node, msg.to_bytes()?) {
            self.reqs.lock().unwrap().remove(&id);
            return Err(err);
        }
        self.await_reply(id, rx, timeout).await
    }

    /// Issue a balanced request over a topic and await its reply.
    pub(crate) async fn request_balanced(
        &self,
        conn: ConnId,
        topic: TopicId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CarrierError> {
        let (id, rx) = self.register_request(conn);
        let inner = CarrierMessage::Request {
            id,
            from: self.self_id,
            payload,
        };
        if let Err(err) = self.balance_from(topic, inner) {
            self.reqs.lock().unwrap().remove(&id);
            return Err(err);
        }
        self.await_reply(id, rx, timeout).await
    }

    fn register_request(
        &self,
        conn: ConnId,
    ) -> (u64, oneshot::Receiver<Result<Vec<u8>, CarrierError>>) {
        let id = self.req_autoid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.reqs
            .lock()
            .unwrap()
            .insert(id, PendingRequest { conn, tx });
        (id, rx)
    }

    async fn await_reply(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<Vec<u8>, CarrierError>>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CarrierError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CarrierError::Closed),
            Err(_) => {
                // Late replies find no sink and are dropped.
                self.reqs.lock().unwrap().remove(&id);
                Err(CarrierError::Timeout)
            }
        }
    }

    /// Answer a request previously delivered to this node. A reply to an
    /// already-timed-out request is a silent no-op.
    pub(crate) fn reply(&self, local_id: u64, payload: Vec<u8>) -> Result<(), CarrierError> {
        let Some(route) = self.reply_pend.lock().unwrap().remove(&local_id) else {
            tracing::debug!(local_id, "reply to expired request dropped");
            return Ok(());
        };
        let msg = CarrierMessage::Reply {
            id: route.req_id,
            payload,
        };
        self.routing.direct(route.origin, msg.to_bytes()?)
    }

    /// Initiate a balanced tunnel over a topic and await confirmation.
    pub(crate) async fn tunnel_balanced(
        &self,
        topic: TopicId,
        timeout: Duration,
    ) -> Result<Tunnel, CarrierError> {
        let id = self.tun_autoid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.tun_pend
            .lock()
            .unwrap()
            .insert(id, PendingInit { tx });

        let inner = CarrierMessage::TunnelRequest {
            id,
            from: self.self_id,
            timeout_ms: timeout.as_millis() as u64,
        };
        if let Err(err) = self.balance_from(topic, inner) {
            self.tun_pend.lock().unwrap().remove(&id);
            return Err(err);
        }
        self.await_tunnel(id, rx, timeout).await
    }

    pub(crate) async fn await_tunnel(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<Tunnel, CarrierError>>,
        timeout: Duration,
    ) -> Result<Tunnel, CarrierError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CarrierError::Refused),
            Err(_) => {
                self.tun_pend.lock().unwrap().remove(&id);
                Err(CarrierError::Refused)
            }
        }
    }

    /// Application confirmation of a remotely initiated tunnel.
    pub(crate) fn tunnel_confirm(&self, local_id: u64) -> Result<Tunnel, CarrierError> {
        let Some(pending) = self.tun_confirm.lock().unwrap().remove(&local_id) else {
            return Err(CarrierError::Refused);
        };

        self.tun_live
            .lock()
            .unwrap()
            .insert(local_id, pending.tunnel.shared());

        let msg = CarrierMessage::TunnelConfirm {
            init_id: pending.init_id,
            resp_id: local_id,
            from: self.self_id,
        };
        self.routing.direct(pending.from, msg.to_bytes()?)?;
        Ok(pending.tunnel)
    }

    /// Tear down a connection: release subscriptions, fail outstanding
    /// requests, reject unconfirmed tunnels.
    pub(crate) fn close_conn(&self, conn: ConnId) {
        let Some(entry) = self.conns.write().unwrap().remove(&conn) else {
            return;
        };
        for topic in entry.topics {
            let mut topics = self.topics.write().unwrap();
            if let Some(t) = topics.get(&topic) {
                t.write().unwrap().unsubscribe_local(conn);
                if let Err(err) = self.collect_if_idle(&mut topics, topic) {
                    tracing::warn!(%topic, "unsubscribe cascade failed: {err}");
                }
            }
        }

        let mut reqs = self.reqs.lock().unwrap();
        let ids: Vec<u64> = reqs
            .iter()
            .filter(|(_, p)| p.conn == conn)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(pending) = reqs.remove(&id) {
                let _ = pending.tx.send(Err(CarrierError::Closed));
            }
        }
        drop(reqs);

        let mut confirms = self.tun_confirm.lock().unwrap();
        let ids: Vec<u64> = confirms
            .iter()
            .filter(|(_, p)| p.conn == conn)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(pending) = confirms.remove(&id) {
                self.reject_pending_tunnel(pending);
            }
        }
    }

    /// Push an event toward a connection; overflow drops with a warning
    /// rather than stalling the carrier.
    fn send_event(&self, conn: ConnId, event: ConnEvent) {
        let conns = self.conns.read().unwrap();
        let Some(entry) = conns.get(&conn) else {
            return;
        };
        if let Err(err) = entry.events.try_send(event) {
            tracing::warn!(conn, "connection event queue overrun: {err}");
        }
    }

    // ── Routing upcalls ────────────────────────────────────────────────

    fn handle_event(&self, event: RoutingEvent) {
        match event {
            RoutingEvent::Deliver { topic, payload } => match CarrierMessage::from_bytes(&payload)
            {
                Ok(msg) => self.handle_deliver(topic, msg),
                Err(err) => tracing::warn!(%topic, "undecodable topic payload: {err}"),
            },
            RoutingEvent::Direct { payload } => match CarrierMessage::from_bytes(&payload) {
                Ok(msg) => self.handle_direct(msg),
                Err(err) => tracing::warn!("undecodable direct payload: {err}"),
            },
            RoutingEvent::TreeParent { topic, parent } => self.handle_tree_parent(topic, parent),
            RoutingEvent::TreeChildUp { topic, child } => self.handle_child_up(topic, child),
            RoutingEvent::TreeChildDown { topic, child } => self.handle_child_down(topic, child),
        }
    }

    fn handle_deliver(&self, topic: TopicId, msg: CarrierMessage) {
        match msg {
            CarrierMessage::Publish { payload, .. } => self.deliver_publish(topic, payload),
            CarrierMessage::Balance { topic, src, inner } => {
                if let Err(err) = self.balance_hop(topic, Some(src), *inner) {
                    tracing::warn!(%topic, "balanced delivery stranded: {err}");
                }
            }
            CarrierMessage::SubscribeAnnounce { topic, node } => self.handle_child_up(topic, node),
            other => {
                tracing::warn!(%topic, "unexpected multicast payload: {other:?}");
            }
        }
    }

    fn handle_direct(&self, msg: CarrierMessage) {
        match msg {
            CarrierMessage::Report { node, topics, caps } => self.handle_report(node, topics, caps),
            CarrierMessage::Reply { id, payload } => {
                match self.reqs.lock().unwrap().remove(&id) {
                    Some(pending) => {
                        let _ = pending.tx.send(Ok(payload));
                    }
                    None => tracing::debug!(id, "late reply dropped"),
                }
            }
            CarrierMessage::Request { id, from, payload } => {
                // Node-targeted request: any local connection may serve it.
                let conn = self.conns.read().unwrap().keys().min().copied();
                match conn {
                    Some(conn) => {
                        let inner = CarrierMessage::Request { id, from, payload };
                        if let Err(err) = self.deliver_inner_to(conn, inner) {
                            tracing::warn!("request delivery failed: {err}");
                        }
                    }
                    None => tracing::debug!("direct request with no local connections"),
                }
            }
            CarrierMessage::Balance { topic, src, inner } => {
                if let Err(err) = self.balance_hop(topic, Some(src), *inner) {
                    tracing::warn!(%topic, "balanced delivery stranded: {err}");
                }
            }
            CarrierMessage::TunnelRequest {
                id,
                from,
                timeout_ms,
            } => {
                let conn = self.conns.read().unwrap().keys().min().copied();
                match conn {
                    Some(conn) => self.inbound_tunnel(conn, id, from, timeout_ms),
                    None => {
                        let reject = CarrierMessage::TunnelReject { init_id: id };
                        if let Ok(bytes) = reject.to_bytes() {
                            let _ = self.routing.direct(from, bytes);
                        }
                    }
                }
            }
            CarrierMessage::TunnelConfirm {
                init_id,
                resp_id,
                from,
            } => self.handle_tunnel_confirm(init_id, resp_id, from),
            CarrierMessage::TunnelReject { init_id } => {
                if let Some(pending) = self.tun_pend.lock().unwrap().remove(&init_id) {
                    let _ = pending.tx.send(Err(CarrierError::Refused));
                }
            }
            CarrierMessage::TunnelData { id, seq, payload } => {
                self.handle_tunnel_data(id, seq, payload)
            }
            CarrierMessage::TunnelAck { id, .. } => {
                if let Some(tunnel) = self.tun_live.lock().unwrap().get(&id) {
                    tunnel.ack_one();
                }
            }
            CarrierMessage::TunnelClose { id } => self.handle_tunnel_close(id),
            CarrierMessage::SubscribeAnnounce { topic, node } => self.handle_child_up(topic, node),
            CarrierMessage::Publish { topic, payload, .. } => self.deliver_publish(topic, payload),
            CarrierMessage::Data { .. } => {
                tracing::warn!("stray data payload outside balanced delivery");
            }
        }
    }

    fn deliver_publish(&self, topic: TopicId, payload: Vec<u8>) {
        let subscribers = {
            let topics = self.topics.read().unwrap();
            match topics.get(&topic) {
                Some(entry) => entry.read().unwrap().subscribers().to_vec(),
                None => return,
            }
        };
        for conn in subscribers {
            self.send_event(
                conn,
                ConnEvent::Message {
                    topic,
                    payload: payload.clone(),
                },
            );
        }
    }

    fn handle_report(&self, node: NodeId, report_topics: Vec<TopicId>, caps: Vec<u32>) {
        if report_topics.len() != caps.len() {
            tracing::warn!(%node, "malformed load report: uneven sequences");
            return;
        }
        {
            let topics = self.topics.read().unwrap();
            for (topic, cap) in report_topics.iter().zip(&caps) {
                if let Some(entry) = topics.get(topic) {
                    entry.write().unwrap().set_capacity(node, *cap);
                }
            }
        }
        let mut heart = self.heart.lock().unwrap();
        for topic in report_topics {
            if heart.ping(&(topic, node)).is_err() {
                tracing::debug!(%node, %topic, "report from unmonitored branch");
            }
        }
    }

    fn handle_tree_parent(&self, topic: TopicId, parent: Option<NodeId>) {
        let mut topics = self.topics.write().unwrap();
        let entry = topics
            .entry(topic)
            .or_insert_with(|| {
                Arc::new(RwLock::new(Topic::new(
                    topic,
                    self.self_id,
                    self.config.max_capacity,
                )))
            })
            .clone();
        drop(topics);

        let mut guard = entry.write().unwrap();
        let old = guard.parent();
        let parent = if parent == Some(self.self_id) {
            None
        } else {
            parent
        };
        guard.reown(parent);
        drop(guard);

        let mut heart = self.heart.lock().unwrap();
        if let Some(old) = old {
            heart.unmonitor(&(topic, old));
        }
        if let Some(new) = parent {
            heart.monitor((topic, new));
        }
    }

    fn handle_child_up(&self, topic: TopicId, child: NodeId) {
        if child == self.self_id {
            return;
        }
        let mut topics = self.topics.write().unwrap();
        let entry = topics
            .entry(topic)
            .or_insert_with(|| {
                Arc::new(RwLock::new(Topic::new(
                    topic,
                    self.self_id,
                    self.config.max_capacity,
                )))
            })
            .clone();
        drop(topics);

        if entry.write().unwrap().add_child(child) {
            self.heart.lock().unwrap().monitor((topic, child));
        }
    }

    fn handle_child_down(&self, topic: TopicId, child: NodeId) {
        let mut topics = self.topics.write().unwrap();
        let Some(entry) = topics.get(&topic) else {
            return;
        };
        entry.write().unwrap().remove_child(child);
        self.heart.lock().unwrap().unmonitor(&(topic, child));
        if let Err(err) = self.collect_if_idle(&mut topics, topic) {
            tracing::warn!(%topic, "unsubscribe cascade failed: {err}");
        }
    }

    // ── Heartbeat ──────────────────────────────────────────────────────

    /// One heartbeat: liveness accounting, topic healing, load reports,
    /// root re-announces and correlation-table sweeps.
    fn beat(&self) {
        let deaths = self.heart.lock().unwrap().tick();
        for (topic, node) in deaths {
            self.handle_death(topic, node);
        }

        // Snapshot every topic's report under its own lock, then send
        // with no locks held.
        let mut buckets: HashMap<NodeId, (Vec<TopicId>, Vec<u32>)> = HashMap::new();
        let mut roots = Vec::new();
        {
            let topics = self.topics.read().unwrap();
            for entry in topics.values() {
                let mut guard = entry.write().unwrap();
                let (ids, caps) = guard.generate_report();
                for (node, cap) in ids.into_iter().zip(caps) {
                    let bucket = buckets.entry(node).or_default();
                    bucket.0.push(guard.id());
                    bucket.1.push(cap);
                }
                if guard.parent().is_none() {
                    roots.push(guard.id());
                }
                guard.cycle();
            }
        }

        for (node, (report_topics, caps)) in buckets {
            let msg = CarrierMessage::Report {
                node: self.self_id,
                topics: report_topics,
                caps,
            };
            match msg.to_bytes() {
                Ok(bytes) => {
                    if let Err(err) = self.routing.direct(node, bytes) {
                        tracing::debug!(%node, "load report failed: {err}");
                    }
                }
                Err(err) => tracing::warn!("load report encode failed: {err}"),
            }
        }

        // Roots re-announce so freshly joined roots of the same topic
        // find each other.
        for topic in roots {
            if let Err(err) = self.routing.subscribe(topic) {
                tracing::debug!(%topic, "root re-announce failed: {err}");
            }
        }

        self.sweep_reply_routes();
        self.sweep_unconfirmed_tunnels();
    }

    /// Split a dead monitor key back into its topic and node, then heal:
    /// a dead parent re-roots the topic, a dead child unsubscribes.
    fn handle_death(&self, topic: TopicId, node: NodeId) {
        let entry = {
            let topics = self.topics.read().unwrap();
            topics.get(&topic).cloned()
        };
        let Some(entry) = entry else {
            tracing::debug!(%topic, "death event for collected topic");
            return;
        };

        let was_parent = {
            let mut guard = entry.write().unwrap();
            if guard.parent() == Some(node) {
                guard.reown(None);
                true
            } else {
                guard.remove_child(node);
                false
            }
        };

        let mut heart = self.heart.lock().unwrap();
        heart.unmonitor(&(topic, node));
        drop(heart);

        if was_parent {
            tracing::info!(%topic, %node, "tree parent died, re-rooting");
            // Re-announce immediately; the routing service elects the
            // new rendez-vous.
            if let Err(err) = self.routing.subscribe(topic) {
                tracing::warn!(%topic, "re-subscription after parent death failed: {err}");
            }
        } else {
            tracing::info!(%topic, %node, "tree child died, unsubscribing it");
            let mut topics = self.topics.write().unwrap();
            if let Err(err) = self.collect_if_idle(&mut topics, topic) {
                tracing::warn!(%topic, "unsubscribe cascade failed: {err}");
            }
        }
    }

    fn sweep_reply_routes(&self) {
        let now = Instant::now();
        self.reply_pend
            .lock()
            .unwrap()
            .retain(|_, route| route.deadline > now);
    }

    fn sweep_unconfirmed_tunnels(&self) {
        let now = Instant::now();
        let expired: Vec<PendingConfirm> = {
            let mut confirms = self.tun_confirm.lock().unwrap();
            let ids: Vec<u64> = confirms
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| confirms.remove(&id)).collect()
        };
        for pending in expired {
            tracing::debug!(init_id = pending.init_id, "tunnel confirmation timed out");
            self.reject_pending_tunnel(pending);
        }
    }

    fn reject_pending_tunnel(&self, pending: PendingConfirm) {
        let reject = CarrierMessage::TunnelReject {
            init_id: pending.init_id,
        };
        if let Ok(bytes) = reject.to_bytes() {
            let _ = self.routing.direct(pending.from, bytes);
        }
        pending.tunnel.abandon();
    }

    // ── Tunnels ────────────────────────────────────────────────────────

    /// A remote node asked for a tunnel: allocate the local endpoint and
    /// hand the decision to the application.
    fn inbound_tunnel(&self, conn: ConnId, init_id: u64, from: NodeId, timeout_ms: u64) {
        let local_id = self.tun_autoid.fetch_add(1, Ordering::Relaxed);
        let tunnel = self.new_tunnel(local_id, from, init_id);

        self.tun_confirm.lock().unwrap().insert(
            local_id,
            PendingConfirm {
                conn,
                tunnel,
                init_id,
                from,
                deadline: Instant::now() + Duration::from_millis(timeout_ms),
            },
        );
        self.send_event(conn, ConnEvent::TunnelRequest { id: local_id });
    }

    fn handle_tunnel_confirm(&self, init_id: u64, resp_id: u64, from: NodeId) {
        let Some(pending) = self.tun_pend.lock().unwrap().remove(&init_id) else {
            // We already gave up; tell the remote to drop its endpoint.
            let close = CarrierMessage::TunnelClose { id: resp_id };
            if let Ok(bytes) = close.to_bytes() {
                let _ = self.routing.direct(from, bytes);
            }
            return;
        };

        let tunnel = self.new_tunnel(init_id, from, resp_id);
        self.tun_live
            .lock()
            .unwrap()
            .insert(init_id, tunnel.shared());
        let _ = pending.tx.send(Ok(tunnel));
    }

    fn handle_tunnel_data(&self, id: u64, seq: u64, payload: Vec<u8>) {
        let tunnel = self.tun_live.lock().unwrap().get(&id).cloned();
        let Some(tunnel) = tunnel else {
            tracing::debug!(id, "data for unknown tunnel dropped");
            return;
        };
        for delivered_seq in tunnel.deliver(seq, payload) {
            let ack = CarrierMessage::TunnelAck {
                id: tunnel.peer_id(),
                seq: delivered_seq,
            };
            if let Ok(bytes) = ack.to_bytes() {
                let _ = self.routing.direct(tunnel.peer_node(), bytes);
            }
        }
    }

    fn handle_tunnel_close(&self, id: u64) {
        let Some(tunnel) = self.tun_live.lock().unwrap().remove(&id) else {
            return;
        };
        if !tunnel.mark_closed() {
            // Remote-initiated close: acknowledge symmetrically.
            let close = CarrierMessage::TunnelClose {
                id: tunnel.peer_id(),
            };
            if let Ok(bytes) = close.to_bytes() {
                let _ = self.routing.direct(tunnel.peer_node(), bytes);
            }
        }
        tunnel.close_incoming();
    }

    fn new_tunnel(&self, local_id: u64, peer_node: NodeId, peer_id: u64) -> Tunnel {
        Tunnel::new(
            local_id,
            peer_node,
            peer_id,
            self.routing.clone(),
            self.tun_live.clone(),
            self.config.tunnel_window,
        )
    }
}
