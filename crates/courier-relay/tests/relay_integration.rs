/// Integration tests: a raw wire client attached to a relay server
/// backed by a carrier on the in-memory mesh.
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_carrier::testing::Mesh;
use courier_carrier::{Carrier, CarrierConfig, NodeId};
use courier_relay::wire::{self, reply_status, tunnel_status, Opcode};
use courier_relay::{RelayConfig, RelayServer};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

fn node(seed: u8) -> NodeId {
    NodeId::from_bytes([seed; 32])
}

async fn relay_fixture() -> (RelayServer, Arc<Carrier>, Mesh) {
    let mesh = Mesh::new();
    let (routing, events) = mesh.join(node(1));
    let config = CarrierConfig {
        beat_interval: Duration::from_millis(50),
        ..CarrierConfig::default()
    };
    let carrier = Arc::new(Carrier::start(node(1), routing, events, config));
    let server = RelayServer::bind("127.0.0.1:0", carrier.clone(), RelayConfig::default())
        .await
        .unwrap();
    (server, carrier, mesh)
}

/// Node → client frames, decoded for assertions.
#[derive(Debug, PartialEq)]
enum Frame {
    Broadcast(Vec<u8>),
    Publish(String, Vec<u8>),
    Request { id: u64, payload: Vec<u8> },
    Reply { id: u64, status: u8, payload: Vec<u8> },
    TunnelInit { tmp: u64 },
    TunnelConfirm { id: u64, status: u8 },
    TunnelData { id: u64, seq: u64, payload: Vec<u8> },
    TunnelAck { id: u64, seq: u64 },
    TunnelClose { id: u64 },
    Close,
}

struct TestClient {
    sock: TcpStream,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr, cluster: &str) -> Self {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        wire::write_opcode(&mut sock, Opcode::Init).await.unwrap();
        wire::write_str(&mut sock, cluster).await.unwrap();

        let ack = wire::read_opcode(&mut sock).await.unwrap();
        assert_eq!(ack, Opcode::InitAck);
        Self { sock }
    }

    async fn subscribe(&mut self, topic: &str) {
        wire::write_opcode(&mut self.sock, Opcode::Subscribe)
            .await
            .unwrap();
        wire::write_str(&mut self.sock, topic).await.unwrap();
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) {
        wire::write_opcode(&mut self.sock, Opcode::Publish)
            .await
            .unwrap();
        wire::write_str(&mut self.sock, topic).await.unwrap();
        wire::write_bytes(&mut self.sock, payload).await.unwrap();
    }

    async fn broadcast(&mut self, cluster: &str, payload: &[u8]) {
        wire::write_opcode(&mut self.sock, Opcode::Broadcast)
            .await
            .unwrap();
        wire::write_str(&mut self.sock, cluster).await.unwrap();
        wire::write_bytes(&mut self.sock, payload).await.unwrap();
    }

    async fn request(&mut self, id: u64, cluster: &str, payload: &[u8], timeout_ms: u64) {
        wire::write_opcode(&mut self.sock, Opcode::Request)
            .await
            .unwrap();
        wire::write_uvarint(&mut self.sock, id).await.unwrap();
        wire::write_str(&mut self.sock, cluster).await.unwrap();
        wire::write_bytes(&mut self.sock, payload).await.unwrap();
        wire::write_uvarint(&mut self.sock, timeout_ms).await.unwrap();
    }

    async fn reply(&mut self, id: u64, payload: &[u8]) {
        wire::write_opcode(&mut self.sock, Opcode::Reply)
            .await
            .unwrap();
        wire::write_uvarint(&mut self.sock, id).await.unwrap();
        wire::write_bytes(&mut self.sock, payload).await.unwrap();
    }

    async fn tunnel_init(&mut self, loc_id: u64, cluster: &str, timeout_ms: u64) {
        wire::write_opcode(&mut self.sock, Opcode::TunnelInit)
            .await
            .unwrap();
        wire::write_uvarint(&mut self.sock, loc_id).await.unwrap();
        wire::write_str(&mut self.sock, cluster).await.unwrap();
        wire::write_uvarint(&mut self.sock, timeout_ms).await.unwrap();
    }

    async fn tunnel_confirm(&mut self, tmp_id: u64, tun_id: u64) {
        wire::write_opcode(&mut self.sock, Opcode::TunnelConfirm)
            .await
            .unwrap();
        wire::write_uvarint(&mut self.sock, tmp_id).await.unwrap();
        wire::write_uvarint(&mut self.sock, tun_id).await.unwrap();
    }

    async fn tunnel_data(&mut self, tun_id: u64, seq: u64, payload: &[u8]) {
        wire::write_opcode(&mut self.sock, Opcode::TunnelData)
            .await
            .unwrap();
        wire::write_uvarint(&mut self.sock, tun_id).await.unwrap();
        wire::write_uvarint(&mut self.sock, seq).await.unwrap();
        wire::write_bytes(&mut self.sock, payload).await.unwrap();
    }

    async fn tunnel_close(&mut self, tun_id: u64) {
        wire::write_opcode(&mut self.sock, Opcode::TunnelClose)
            .await
            .unwrap();
        wire::write_uvarint(&mut self.sock, tun_id).await.unwrap();
    }

    async fn close(&mut self) {
        wire::write_opcode(&mut self.sock, Opcode::Close)
            .await
            .unwrap();
    }

    async fn read_frame(&mut self) -> Frame {
        let opcode = wire::read_opcode(&mut self.sock).await.unwrap();
        match opcode {
            Opcode::Broadcast => Frame::Broadcast(wire::read_bytes(&mut self.sock).await.unwrap()),
            Opcode::Publish => Frame::Publish(
                wire::read_str(&mut self.sock).await.unwrap(),
                wire::read_bytes(&mut self.sock).await.unwrap(),
            ),
            Opcode::Request => Frame::Request {
                id: wire::read_uvarint(&mut self.sock).await.unwrap(),
                payload: wire::read_bytes(&mut self.sock).await.unwrap(),
            },
            Opcode::Reply => Frame::Reply {
                id: wire::read_uvarint(&mut self.sock).await.unwrap(),
                status: self.sock.read_u8().await.unwrap(),
                payload: wire::read_bytes(&mut self.sock).await.unwrap(),
            },
            Opcode::TunnelInit => Frame::TunnelInit {
                tmp: wire::read_uvarint(&mut self.sock).await.unwrap(),
            },
            Opcode::TunnelConfirm => Frame::TunnelConfirm {
                id: wire::read_uvarint(&mut self.sock).await.unwrap(),
                status: self.sock.read_u8().await.unwrap(),
            },
            Opcode::TunnelData => Frame::TunnelData {
                id: wire::read_uvarint(&mut self.sock).await.unwrap(),
                seq: wire::read_uvarint(&mut self.sock).await.unwrap(),
                payload: wire::read_bytes(&mut self.sock).await.unwrap(),
            },
            Opcode::TunnelAck => Frame::TunnelAck {
                id: wire::read_uvarint(&mut self.sock).await.unwrap(),
                seq: wire::read_uvarint(&mut self.sock).await.unwrap(),
            },
            Opcode::TunnelClose => Frame::TunnelClose {
                id: wire::read_uvarint(&mut self.sock).await.unwrap(),
            },
            Opcode::Close => Frame::Close,
            other => panic!("unexpected inbound opcode {other:?}"),
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn handshake_returns_init_ack() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let _client = TestClient::connect(server.local_addr(), "app").await;
}

#[tokio::test]
async fn non_init_first_frame_drops_client() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let mut sock = TcpStream::connect(server.local_addr()).await.unwrap();

    wire::write_opcode(&mut sock, Opcode::Publish).await.unwrap();
    wire::write_str(&mut sock, "premature").await.unwrap();
    wire::write_bytes(&mut sock, b"x").await.unwrap();

    // The relay drops the socket without carrier state; reads hit EOF.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(1), sock.read(&mut buf))
        .await
        .expect("socket should close");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn subscribe_publish_roundtrip() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let mut client = TestClient::connect(server.local_addr(), "app").await;

    client.subscribe("news").await;
    settle().await;
    client.publish("news", b"breaking").await;

    assert_eq!(
        client.read_frame().await,
        Frame::Publish("news".into(), b"breaking".to_vec())
    );
}

#[tokio::test]
async fn broadcast_loops_back_to_cluster() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let mut client = TestClient::connect(server.local_addr(), "app").await;
    settle().await;

    client.broadcast("app", b"to everyone").await;
    assert_eq!(
        client.read_frame().await,
        Frame::Broadcast(b"to everyone".to_vec())
    );
}

#[tokio::test]
async fn request_served_over_the_same_socket() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let mut client = TestClient::connect(server.local_addr(), "app").await;
    settle().await;

    client.request(7, "app", b"task", 1000).await;

    // The balanced request lands back on this client; serve it.
    let (served_id, payload) = loop {
        match client.read_frame().await {
            Frame::Request { id, payload } => break (id, payload),
            other => panic!("expected request, got {other:?}"),
        }
    };
    assert_eq!(payload, b"task");
    client.reply(served_id, b"done").await;

    loop {
        match client.read_frame().await {
            Frame::Reply {
                id,
                status,
                payload,
            } => {
                assert_eq!(id, 7);
                assert_eq!(status, reply_status::OK);
                assert_eq!(payload, b"done");
                break;
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn unserved_request_times_out() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let mut client = TestClient::connect(server.local_addr(), "app").await;
    settle().await;

    let started = Instant::now();
    client.request(9, "app", b"void", 50).await;

    loop {
        match client.read_frame().await {
            Frame::Request { .. } => continue, // deliberately unserved
            Frame::Reply { id, status, .. } => {
                assert_eq!(id, 9);
                assert_eq!(status, reply_status::TIMEOUT);
                break;
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(45) && elapsed < Duration::from_secs(2),
        "timeout after {elapsed:?}"
    );
}

#[tokio::test]
async fn tunnel_to_self_echoes_data() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let mut client = TestClient::connect(server.local_addr(), "app").await;
    settle().await;

    client.tunnel_init(1, "app", 1000).await;

    // The initiation balances back to this client as an inbound
    // announcement; accept it under local id 2.
    let tmp = loop {
        match client.read_frame().await {
            Frame::TunnelInit { tmp } => break tmp,
            other => panic!("expected tunnel-init, got {other:?}"),
        }
    };
    client.tunnel_confirm(tmp, 2).await;

    loop {
        match client.read_frame().await {
            Frame::TunnelConfirm { id, status } => {
                assert_eq!(id, 1);
                assert_eq!(status, tunnel_status::OK);
                break;
            }
            other => panic!("expected tunnel-confirm, got {other:?}"),
        }
    }

    // Data through tunnel 1 surfaces on tunnel 2 (and vice versa),
    // with relay acks along the way.
    client.tunnel_data(1, 0, b"ping").await;
    loop {
        match client.read_frame().await {
            // The relay's forwarding ack may arrive in either order
            // relative to the delivered data.
            Frame::TunnelAck { id: 1, seq: 0 } => {}
            Frame::TunnelData { id, seq, payload } => {
                assert_eq!(id, 2);
                assert_eq!(seq, 0);
                assert_eq!(payload, b"ping");
                break;
            }
            other => panic!("expected tunnel traffic, got {other:?}"),
        }
    }

    // Close from the initiating side; both endpoints report closure.
    client.tunnel_close(1).await;
    let mut closed = std::collections::HashSet::new();
    while closed.len() < 2 {
        match client.read_frame().await {
            Frame::TunnelClose { id } => {
                closed.insert(id);
            }
            Frame::TunnelAck { .. } => {}
            other => panic!("expected tunnel-close, got {other:?}"),
        }
    }
    assert!(closed.contains(&1) && closed.contains(&2));
}

#[tokio::test]
async fn graceful_close_is_acknowledged() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let mut client = TestClient::connect(server.local_addr(), "app").await;

    client.close().await;
    assert_eq!(client.read_frame().await, Frame::Close);

    // The relay then shuts the socket down.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(1), client.sock.read(&mut buf))
        .await
        .expect("socket should close");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn two_clients_share_a_topic() {
    let (server, _carrier, _mesh) = relay_fixture().await;
    let mut alice = TestClient::connect(server.local_addr(), "app").await;
    let mut bob = TestClient::connect(server.local_addr(), "app").await;

    alice.subscribe("room").await;
    bob.subscribe("room").await;
    settle().await;

    alice.publish("room", b"hi bob").await;

    assert_eq!(
        alice.read_frame().await,
        Frame::Publish("room".into(), b"hi bob".to_vec())
    );
    assert_eq!(
        bob.read_frame().await,
        Frame::Publish("room".into(), b"hi bob".to_vec())
    );
}
