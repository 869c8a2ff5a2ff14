/// Ordered bidirectional tunnels over carrier direct messaging.
///
/// Each side addresses the other by the peer-local tunnel id. Payloads
/// carry a monotonic sequence; the receiver buffers out-of-order
/// arrivals until the gap fills and acknowledges each in-order delivery,
/// which opens the sender's flow-control window.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};

use crate::proto::CarrierMessage;
use crate::routing::Routing;
use crate::types::NodeId;
use crate::CarrierError;

/// The live-tunnel table, shared between the carrier dispatcher and the
/// tunnel handles (which remove themselves on close).
pub(crate) type LiveTunnels = Arc<Mutex<HashMap<u64, Arc<TunnelShared>>>>;

struct RecvState {
    next_seq: u64,
    /// Out-of-order arrivals waiting for the gap to fill.
    pending: BTreeMap<u64, Vec<u8>>,
    /// Delivery side of the ordered queue; dropped on close.
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Tunnel state shared between the handles and the carrier dispatcher.
pub(crate) struct TunnelShared {
    local_id: u64,
    peer_node: NodeId,
    peer_id: u64,
    /// Flow-control window: one permit per in-flight message.
    window: Semaphore,
    recv: Mutex<RecvState>,
    closed: AtomicBool,
}

impl TunnelShared {
    pub fn peer_node(&self) -> NodeId {
        self.peer_node
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    /// Accept an inbound payload; returns the sequences that became
    /// deliverable (each of which the carrier acknowledges).
    pub fn deliver(&self, seq: u64, payload: Vec<u8>) -> Vec<u64> {
        let mut state = self.recv.lock().unwrap();
        let Some(tx) = state.tx.clone() else {
            return Vec::new();
        };

        let mut delivered = Vec::new();
        if seq < state.next_seq {
            // Duplicate of an already-delivered message.
            return delivered;
        }
        if seq > state.next_seq {
            state.pending.insert(seq, payload);
            return delivered;
        }

        let _ = tx.send(payload);
        delivered.push(seq);
        state.next_seq += 1;
        while let Some(payload) = { let seq = state.next_seq; state.pending.remove(&seq) } {
            let _ = tx.send(payload);
            delivered.push(state.next_seq);
            state.next_seq += 1;
        }
        delivered
    }

    /// Open the window by one acknowledged message.
    pub fn ack_one(&self) {
        self.window.add_permits(1);
    }

    /// Flip the closed flag; returns whether it was already set.
    pub fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::AcqRel)
    }

    /// Stop deliveries and release senders blocked on the window.
    pub fn close_incoming(&self) {
        self.recv.lock().unwrap().tx = None;
        self.window.close();
    }
}

/// The sending half of a tunnel endpoint. Dropping it closes the
/// tunnel.
pub struct TunnelSender {
    shared: Arc<TunnelShared>,
    send_seq: u64,
    routing: Arc<dyn Routing>,
    live: LiveTunnels,
}

impl TunnelSender {
    /// The tunnel's local identifier.
    pub fn id(&self) -> u64 {
        self.shared.local_id
    }

    /// The node on the other end.
    pub fn peer(&self) -> NodeId {
        self.shared.peer_node
    }

    /// Send one ordered message, waiting for window space if the peer
    /// is behind on acknowledgements.
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<(), CarrierError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CarrierError::Closed);
        }
        let permit = self
            .shared
            .window
            .acquire()
            .await
            .map_err(|_| CarrierError::Closed)?;
        permit.forget();

        let seq = self.send_seq;
        self.send_seq += 1;

        let msg = CarrierMessage::TunnelData {
            id: self.shared.peer_id,
            seq,
            payload,
        };
        self.routing.direct(self.shared.peer_node, msg.to_bytes()?)
    }

    /// Close the tunnel. Idempotent; the peer acknowledges with its own
    /// close.
    pub fn close(&mut self) {
        if !self.shared.mark_closed() {
            self.shared.close_incoming();
            self.live.lock().unwrap().remove(&self.shared.local_id);
            let msg = CarrierMessage::TunnelClose {
                id: self.shared.peer_id,
            };
            if let Ok(bytes) = msg.to_bytes() {
                let _ = self.routing.direct(self.shared.peer_node, bytes);
            }
        }
    }
}

impl Drop for TunnelSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// The receiving half of a tunnel endpoint.
pub struct TunnelReceiver {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TunnelReceiver {
    /// The next in-order message, or `Closed` once the tunnel is done.
    pub async fn recv(&mut self) -> Result<Vec<u8>, CarrierError> {
        self.incoming.recv().await.ok_or(CarrierError::Closed)
    }
}

/// One endpoint of a live tunnel.
///
/// `send` applies back-pressure once the flow-control window fills with
/// unacknowledged messages; `recv` yields payloads strictly in order
/// with no gaps. Closing is symmetric and idempotent. [`Tunnel::split`]
/// separates the halves for concurrent pumping.
pub struct Tunnel {
    tx: TunnelSender,
    rx: TunnelReceiver,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel").finish_non_exhaustive()
    }
}

impl Tunnel {
    pub(crate) fn new(
        local_id: u64,
        peer_node: NodeId,
        peer_id: u64,
        routing: Arc<dyn Routing>,
        live: LiveTunnels,
        window: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(TunnelShared {
            local_id,
            peer_node,
            peer_id,
            window: Semaphore::new(window),
            recv: Mutex::new(RecvState {
                next_seq: 0,
                pending: BTreeMap::new(),
                tx: Some(tx),
            }),
            closed: AtomicBool::new(false),
        });
        Self {
            tx: TunnelSender {
                shared,
                send_seq: 0,
                routing,
                live,
            },
            rx: TunnelReceiver { incoming: rx },
        }
    }

    pub(crate) fn shared(&self) -> Arc<TunnelShared> {
        self.tx.shared.clone()
    }

    /// The tunnel's local identifier.
    pub fn id(&self) -> u64 {
        self.tx.id()
    }

    /// The node on the other end.
    pub fn peer(&self) -> NodeId {
        self.tx.peer()
    }

    /// See [`TunnelSender::send`].
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<(), CarrierError> {
        self.tx.send(payload).await
    }

    /// See [`TunnelReceiver::recv`].
    pub async fn recv(&mut self) -> Result<Vec<u8>, CarrierError> {
        self.rx.recv().await
    }

    /// Close the tunnel. Idempotent.
    pub fn close(&mut self) {
        self.tx.close();
    }

    /// Separate the endpoint into independently owned halves.
    pub fn split(self) -> (TunnelSender, TunnelReceiver) {
        (self.tx, self.rx)
    }

    /// Silently discard the endpoint without notifying the peer; used
    /// when the application never confirmed it.
    pub(crate) fn abandon(self) {
        self.tx.shared.mark_closed();
        self.tx.shared.close_incoming();
    }
}
