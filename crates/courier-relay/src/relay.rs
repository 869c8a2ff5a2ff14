/// Per-client relay: handshake, frame dispatch, correlation state and
/// coordinated teardown.
///
/// One reader parses frames off the socket and hands them to a bounded
/// worker pool; a full pool queue blocks the reader, back-pressuring
/// the client. Every outbound frame is composed under the socket write
/// lock so multi-field frames stay atomic. Relay locks are leaves:
/// never taken while a carrier lock is held.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use courier_carrier::{
    Carrier, ConnEvent, Connection, ConnectionEvents, TopicId, Tunnel, TunnelReceiver,
    TunnelSender,
};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pool::WorkerPool;
use crate::server::RelayConfig;
use crate::wire::{self, reply_status, tunnel_status, Opcode};
use crate::RelayError;

/// The socket write mutex: one lock acquisition per outbound frame.
type Writer = Arc<tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>>;

enum TunnelCmd {
    Data(Vec<u8>),
    Close,
}

/// Client-side frames may overtake each other on the worker pool; data
/// is re-sequenced here before entering the carrier tunnel.
struct Reorder {
    next: u64,
    buffer: BTreeMap<u64, Vec<u8>>,
}

/// Relay-side state of one live tunnel, keyed by the client's id.
struct RelayTunnel {
    cmds: mpsc::Sender<TunnelCmd>,
    reorder: tokio::sync::Mutex<Reorder>,
    /// Credits for relay → client data; client acks replenish.
    out_window: Arc<tokio::sync::Semaphore>,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-socket relay state.
pub(crate) struct Relay {
    conn: Arc<Connection>,
    writer: Writer,
    /// Reverse map from carrier topic ids to the client's topic names.
    topics: Mutex<HashMap<TopicId, String>>,
    /// Client request ids with an in-flight carrier request.
    req_pend: RwLock<HashSet<u64>>,
    /// Inbound tunnel announcements awaiting client confirmation:
    /// temporary id → carrier confirmation id.
    tun_idx: AtomicU64,
    tun_pend: Mutex<HashMap<u64, u64>>,
    tun_live: Mutex<HashMap<u64, Arc<RelayTunnel>>>,
    config: RelayConfig,
}

/// Accept one relay client and serve it until disconnect.
///
/// The handshake reads `init(cluster)`, opens a carrier connection for
/// that cluster and answers `init-ack`; any failure drops the socket
/// with no carrier state left behind.
pub(crate) async fn serve(
    socket: TcpStream,
    carrier: Arc<Carrier>,
    config: RelayConfig,
) -> Result<(), RelayError> {
    socket.set_nodelay(true)?;
    let (mut read_half, write_half) = socket.into_split();
    let mut writer = BufWriter::new(write_half);

    // Handshake: nothing else writes the socket yet, so the init
    // exchange is trivially atomic.
    let opcode = wire::read_opcode(&mut read_half).await?;
    if opcode != Opcode::Init {
        return Err(RelayError::Protocol(format!(
            "expected init, got {opcode:?}"
        )));
    }
    let cluster = wire::read_str(&mut read_half).await?;
    let (conn, events) = carrier.connect(&cluster)?;

    wire::write_opcode(&mut writer, Opcode::InitAck).await?;
    writer.flush().await?;
    tracing::info!(%cluster, "relay client attached");

    let relay = Arc::new(Relay {
        conn: Arc::new(conn),
        writer: Arc::new(tokio::sync::Mutex::new(writer)),
        topics: Mutex::new(HashMap::new()),
        req_pend: RwLock::new(HashSet::new()),
        tun_idx: AtomicU64::new(1),
        tun_pend: Mutex::new(HashMap::new()),
        tun_live: Mutex::new(HashMap::new()),
        config,
    });

    let pump = tokio::spawn(pump_events(relay.clone(), events));
    let mut pool = WorkerPool::new(relay.config.workers, relay.config.queue_depth);

    let result = read_loop(&relay, &mut read_half, &pool).await;
    if let Err(err) = &result {
        tracing::warn!("relay client dropped: {err}");
    }

    teardown(&relay, pump, &mut pool).await;
    result
}

/// Parse one frame at a time and dispatch it onto the worker pool.
async fn read_loop(
    relay: &Arc<Relay>,
    r: &mut OwnedReadHalf,
    pool: &WorkerPool,
) -> Result<(), RelayError> {
    loop {
        let opcode = match wire::read_opcode(r).await {
            Ok(op) => op,
            // Socket gone: ungraceful but routine teardown.
            Err(RelayError::Transport(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        match opcode {
            Opcode::Broadcast => {
                let cluster = wire::read_str(r).await?;
                let payload = wire::read_bytes(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    if let Err(err) = relay.conn.broadcast_cluster(&cluster, payload) {
                        tracing::warn!(%cluster, "broadcast failed: {err}");
                    }
                })
                .await?;
            }
            Opcode::Request => {
                let id = wire::read_uvarint(r).await?;
                let cluster = wire::read_str(r).await?;
                let payload = wire::read_bytes(r).await?;
                let timeout_ms = wire::read_uvarint(r).await?;
                let relay = relay.clone();
                relay.req_pend.write().unwrap().insert(id);
                submit(pool, async move {
                    relay.handle_request(id, cluster, payload, timeout_ms).await;
                })
                .await?;
            }
            Opcode::Reply => {
                let id = wire::read_uvarint(r).await?;
                let payload = wire::read_bytes(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    if let Err(err) = relay.conn.reply(id, payload) {
                        tracing::warn!(id, "reply failed: {err}");
                    }
                })
                .await?;
            }
            Opcode::Publish => {
                let topic = wire::read_str(r).await?;
                let payload = wire::read_bytes(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    if let Err(err) = relay.conn.publish(&topic, payload) {
                        tracing::warn!(%topic, "publish failed: {err}");
                    }
                })
                .await?;
            }
            Opcode::Subscribe => {
                let topic = wire::read_str(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    relay
                        .topics
                        .lock()
                        .unwrap()
                        .insert(relay.conn.topic_id(&topic), topic.clone());
                    if let Err(err) = relay.conn.subscribe(&topic) {
                        tracing::warn!(%topic, "subscribe failed: {err}");
                        relay.topics.lock().unwrap().remove(&relay.conn.topic_id(&topic));
                    }
                })
                .await?;
            }
            Opcode::Unsubscribe => {
                let topic = wire::read_str(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    match relay.conn.unsubscribe(&topic) {
                        Ok(()) => {
                            relay
                                .topics
                                .lock()
                                .unwrap()
                                .remove(&relay.conn.topic_id(&topic));
                        }
                        Err(err) => tracing::warn!(%topic, "unsubscribe failed: {err}"),
                    }
                })
                .await?;
            }
            Opcode::TunnelInit => {
                let loc_id = wire::read_uvarint(r).await?;
                let cluster = wire::read_str(r).await?;
                let timeout_ms = wire::read_uvarint(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    handle_tunnel_init(relay, loc_id, cluster, timeout_ms).await;
                })
                .await?;
            }
            Opcode::TunnelConfirm => {
                let tmp_id = wire::read_uvarint(r).await?;
                let client_tun_id = wire::read_uvarint(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    handle_tunnel_confirm(relay, tmp_id, client_tun_id).await;
                })
                .await?;
            }
            Opcode::TunnelData => {
                let tun_id = wire::read_uvarint(r).await?;
                let seq = wire::read_uvarint(r).await?;
                let payload = wire::read_bytes(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    relay.handle_tunnel_data(tun_id, seq, payload).await;
                })
                .await?;
            }
            Opcode::TunnelAck => {
                let tun_id = wire::read_uvarint(r).await?;
                let _seq = wire::read_uvarint(r).await?;
                let tunnel = relay.tun_live.lock().unwrap().get(&tun_id).cloned();
                if let Some(tunnel) = tunnel {
                    tunnel.out_window.add_permits(1);
                }
            }
            Opcode::TunnelClose => {
                let tun_id = wire::read_uvarint(r).await?;
                let relay = relay.clone();
                submit(pool, async move {
                    relay.handle_tunnel_close(tun_id).await;
                })
                .await?;
            }
            Opcode::Close => {
                // Graceful teardown requested; acknowledge and stop.
                let mut w = relay.writer.lock().await;
                let _ = wire::write_opcode(&mut *w, Opcode::Close).await;
                let _ = w.flush().await;
                return Ok(());
            }
            Opcode::Init | Opcode::InitAck => {
                return Err(RelayError::Protocol(format!(
                    "unexpected {opcode:?} after handshake"
                )));
            }
        }
    }
}

async fn submit<F>(pool: &WorkerPool, job: F) -> Result<(), RelayError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    pool.submit(job).await.map_err(|_| RelayError::Closed)
}

/// Forward carrier events to the client as frames.
async fn pump_events(relay: Arc<Relay>, mut events: ConnectionEvents) {
    while let Some(event) = events.recv().await {
        let result = match event {
            ConnEvent::Message { topic, payload } => {
                if topic == relay.conn.cluster_topic() {
                    relay.write_broadcast(&payload).await
                } else {
                    let name = relay.topics.lock().unwrap().get(&topic).cloned();
                    match name {
                        Some(name) => relay.write_publish(&name, &payload).await,
                        None => {
                            tracing::debug!(%topic, "delivery for unmapped topic dropped");
                            Ok(())
                        }
                    }
                }
            }
            ConnEvent::Delivery { payload } => relay.write_broadcast(&payload).await,
            ConnEvent::Request { id, payload } => relay.write_request(id, &payload).await,
            ConnEvent::TunnelRequest { id } => {
                let tmp = relay.tun_idx.fetch_add(1, Ordering::Relaxed);
                relay.tun_pend.lock().unwrap().insert(tmp, id);
                relay.write_tunnel_init(tmp).await
            }
        };
        if result.is_err() {
            break;
        }
    }
}

/// Coordinated teardown: stop the workers, release request sinks with
/// `closed`, close live tunnels, release the carrier connection.
async fn teardown(relay: &Arc<Relay>, pump: JoinHandle<()>, pool: &mut WorkerPool) {
    pool.shutdown();
    pump.abort();

    let outstanding: Vec<u64> = relay.req_pend.write().unwrap().drain().collect();
    for id in outstanding {
        let _ = relay.write_reply(id, reply_status::CLOSED, b"").await;
    }

    let tunnels: Vec<Arc<RelayTunnel>> = relay
        .tun_live
        .lock()
        .unwrap()
        .drain()
        .map(|(_, t)| t)
        .collect();
    for tunnel in tunnels {
        // Aborting the send loop drops the carrier sender, which closes
        // the tunnel toward the peer.
        for task in &tunnel.tasks {
            task.abort();
        }
    }

    relay.conn.close();
    let mut w = relay.writer.lock().await;
    let _ = w.shutdown().await;
}

impl Relay {
    async fn handle_request(&self, id: u64, cluster: String, payload: Vec<u8>, timeout_ms: u64) {
        let result = self
            .conn
            .request_cluster(&cluster, payload, Duration::from_millis(timeout_ms))
            .await;

        // Teardown may have reported `closed` already.
        if !self.req_pend.write().unwrap().remove(&id) {
            return;
        }
        let outcome = match &result {
            Ok(reply) => self.write_reply(id, reply_status::OK, reply).await,
            Err(courier_carrier::CarrierError::Timeout) => {
                self.write_reply(id, reply_status::TIMEOUT, b"").await
            }
            Err(err) => {
                self.write_reply(id, reply_status::FAULT, err.to_string().as_bytes())
                    .await
            }
        };
        if let Err(err) = outcome {
            tracing::debug!(id, "reply frame write failed: {err}");
        }
    }

    async fn handle_tunnel_data(&self, tun_id: u64, seq: u64, payload: Vec<u8>) {
        let tunnel = self.tun_live.lock().unwrap().get(&tun_id).cloned();
        let Some(tunnel) = tunnel else {
            tracing::debug!(tun_id, "data for unknown tunnel dropped");
            return;
        };

        let mut reorder = tunnel.reorder.lock().await;
        reorder.buffer.insert(seq, payload);
        loop {
            let next = reorder.next;
            let Some(payload) = reorder.buffer.remove(&next) else {
                break;
            };
            if tunnel.cmds.send(TunnelCmd::Data(payload)).await.is_err() {
                return;
            }
            reorder.next += 1;
            let _ = self.write_tunnel_ack(tun_id, next).await;
        }
    }

    async fn handle_tunnel_close(&self, tun_id: u64) {
        let tunnel = self.tun_live.lock().unwrap().remove(&tun_id);
        if let Some(tunnel) = tunnel {
            let _ = tunnel.cmds.send(TunnelCmd::Close).await;
        }
    }

    // ── Outbound frames (each under one writer lock acquisition) ───────

    async fn write_broadcast(&self, payload: &[u8]) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::Broadcast).await?;
        wire::write_bytes(&mut *w, payload).await?;
        w.flush().await?;
        Ok(())
    }

    async fn write_publish(&self, topic: &str, payload: &[u8]) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::Publish).await?;
        wire::write_str(&mut *w, topic).await?;
        wire::write_bytes(&mut *w, payload).await?;
        w.flush().await?;
        Ok(())
    }

    async fn write_request(&self, id: u64, payload: &[u8]) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::Request).await?;
        wire::write_uvarint(&mut *w, id).await?;
        wire::write_bytes(&mut *w, payload).await?;
        w.flush().await?;
        Ok(())
    }

    async fn write_reply(&self, id: u64, status: u8, payload: &[u8]) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::Reply).await?;
        wire::write_uvarint(&mut *w, id).await?;
        w.write_u8(status).await?;
        wire::write_bytes(&mut *w, payload).await?;
        w.flush().await?;
        Ok(())
    }

    async fn write_tunnel_init(&self, tmp_id: u64) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::TunnelInit).await?;
        wire::write_uvarint(&mut *w, tmp_id).await?;
        w.flush().await?;
        Ok(())
    }

    async fn write_tunnel_confirm(&self, loc_id: u64, status: u8) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::TunnelConfirm).await?;
        wire::write_uvarint(&mut *w, loc_id).await?;
        w.write_u8(status).await?;
        w.flush().await?;
        Ok(())
    }

    async fn write_tunnel_ack(&self, tun_id: u64, seq: u64) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::TunnelAck).await?;
        wire::write_uvarint(&mut *w, tun_id).await?;
        wire::write_uvarint(&mut *w, seq).await?;
        w.flush().await?;
        Ok(())
    }

    async fn write_tunnel_close(&self, tun_id: u64) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::TunnelClose).await?;
        wire::write_uvarint(&mut *w, tun_id).await?;
        w.flush().await?;
        Ok(())
    }

    async fn write_tunnel_data(&self, tun_id: u64, seq: u64, payload: &[u8]) -> Result<(), RelayError> {
        let mut w = self.writer.lock().await;
        wire::write_opcode(&mut *w, Opcode::TunnelData).await?;
        wire::write_uvarint(&mut *w, tun_id).await?;
        wire::write_uvarint(&mut *w, seq).await?;
        wire::write_bytes(&mut *w, payload).await?;
        w.flush().await?;
        Ok(())
    }
}

/// Open a client-initiated tunnel toward one member of `cluster` and
/// report the outcome.
async fn handle_tunnel_init(relay: Arc<Relay>, loc_id: u64, cluster: String, timeout_ms: u64) {
    let result = relay
        .conn
        .tunnel_cluster(&cluster, Duration::from_millis(timeout_ms))
        .await;
    match result {
        Ok(tunnel) => {
            // Confirm before pumping so the client never sees data
            // frames for a tunnel it has no confirmation for.
            let _ = relay.write_tunnel_confirm(loc_id, tunnel_status::OK).await;
            start_tunnel(&relay, loc_id, tunnel);
        }
        Err(err) => {
            tracing::debug!(loc_id, "tunnel initiation failed: {err}");
            let _ = relay
                .write_tunnel_confirm(loc_id, tunnel_status::REFUSED)
                .await;
        }
    }
}

/// The client accepted an inbound tunnel announced under `tmp_id`.
async fn handle_tunnel_confirm(relay: Arc<Relay>, tmp_id: u64, client_tun_id: u64) {
    let Some(carrier_id) = relay.tun_pend.lock().unwrap().remove(&tmp_id) else {
        tracing::warn!(tmp_id, "confirmation for unknown tunnel");
        return;
    };
    match relay.conn.tunnel_confirm(carrier_id) {
        Ok(tunnel) => {
            start_tunnel(&relay, client_tun_id, tunnel);
        }
        Err(err) => {
            tracing::debug!(tmp_id, "tunnel confirmation failed: {err}");
            let _ = relay.write_tunnel_close(client_tun_id).await;
        }
    }
}

/// Wire a confirmed carrier tunnel to the client under its id.
fn start_tunnel(relay: &Arc<Relay>, client_id: u64, tunnel: Tunnel) {
    let (sender, receiver) = tunnel.split();
    let (cmd_tx, cmd_rx) = mpsc::channel(relay.config.tunnel_buffer);
    let out_window = Arc::new(tokio::sync::Semaphore::new(relay.config.tunnel_window));

    let send_task = tokio::spawn(tunnel_send_loop(sender, cmd_rx));
    let recv_task = tokio::spawn(tunnel_recv_loop(
        receiver,
        relay.clone(),
        client_id,
        out_window.clone(),
    ));

    relay.tun_live.lock().unwrap().insert(
        client_id,
        Arc::new(RelayTunnel {
            cmds: cmd_tx,
            reorder: tokio::sync::Mutex::new(Reorder {
                next: 0,
                buffer: BTreeMap::new(),
            }),
            out_window,
            tasks: vec![send_task, recv_task],
        }),
    );
}

/// Feed ordered client payloads into the carrier tunnel.
async fn tunnel_send_loop(mut sender: TunnelSender, mut cmds: mpsc::Receiver<TunnelCmd>) {
    while let Some(cmd) = cmds.recv().await {
        match cmd {
            TunnelCmd::Data(payload) => {
                if sender.send(payload).await.is_err() {
                    break;
                }
            }
            TunnelCmd::Close => break,
        }
    }
    sender.close();
}

/// Forward carrier tunnel payloads to the client, windowed by acks.
async fn tunnel_recv_loop(
    mut receiver: TunnelReceiver,
    relay: Arc<Relay>,
    client_id: u64,
    window: Arc<tokio::sync::Semaphore>,
) {
    let mut seq = 0u64;
    while let Ok(payload) = receiver.recv().await {
        let Ok(permit) = window.acquire().await else {
            break;
        };
        permit.forget();
        if relay
            .write_tunnel_data(client_id, seq, &payload)
            .await
            .is_err()
        {
            break;
        }
        seq += 1;
    }
    relay.tun_live.lock().unwrap().remove(&client_id);
    let _ = relay.write_tunnel_close(client_id).await;
}
