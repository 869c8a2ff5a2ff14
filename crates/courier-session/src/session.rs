/// Authenticated encrypted duplex links.
///
/// A session multiplexes two subchannels — control and data — over one
/// TCP socket. Each direction of each subchannel has its own ChaCha20
/// keystream and HMAC-SHA256 state, derived during the handshake. A MAC
/// mismatch on receive is fatal: the link tears down and all further
/// operations report [`SessionError::Closed`].
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::handshake::{self, DirectionKeys};
use crate::{PublicKey, SecretKey, SessionError};

type HmacSha256 = Hmac<Sha256>;

/// Frames above this size are rejected before allocation.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Negotiated sessions queued on a listener before `accept` is called.
const ACCEPT_BACKLOG: usize = 16;

/// Per-subchannel receive queue depth.
const RECV_QUEUE: usize = 64;

/// The two independent subchannels of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subchannel {
    Control,
    Data,
}

impl Subchannel {
    fn wire(self) -> u8 {
        match self {
            Subchannel::Control => 0,
            Subchannel::Data => 1,
        }
    }

    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Subchannel::Control),
            1 => Some(Subchannel::Data),
            _ => None,
        }
    }
}

/// Session lifecycle. Transitions are unidirectional; user payloads flow
/// only in `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Dialing = 0,
    Handshaking = 1,
    Live = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Dialing,
            1 => SessionState::Handshaking,
            2 => SessionState::Live,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// One direction of one subchannel: running keystream, MAC key, sequence.
struct ChannelState {
    cipher: ChaCha20,
    mac_key: [u8; 32],
    seq: u64,
}

impl ChannelState {
    fn new(keys: &DirectionKeys) -> Self {
        Self {
            cipher: ChaCha20::new(&keys.key.into(), &keys.iv.into()),
            mac_key: keys.mac,
            seq: 0,
        }
    }

    /// Encrypt a payload in place and return the frame MAC.
    ///
    /// The MAC covers the sequence number, the subchannel tag and the
    /// ciphertext, binding frames to their position on the link.
    fn seal(&mut self, chan: Subchannel, payload: &mut [u8]) -> [u8; 32] {
        self.cipher.apply_keystream(payload);
        let tag = self.mac(chan, payload);
        self.seq += 1;
        tag
    }

    /// Verify a frame MAC (constant-time) and decrypt the payload.
    fn open(
        &mut self,
        chan: Subchannel,
        mac: &[u8],
        payload: &mut [u8],
    ) -> Result<(), SessionError> {
        let mut hmac = HmacSha256::new_from_slice(&self.mac_key)
            .expect("HMAC accepts keys of any length");
        hmac.update(&self.seq.to_be_bytes());
        hmac.update(&[chan.wire()]);
        hmac.update(payload);
        hmac.verify_slice(mac)
            .map_err(|_| SessionError::Crypto("frame MAC mismatch".into()))?;

        self.cipher.apply_keystream(payload);
        self.seq += 1;
        Ok(())
    }

    fn mac(&self, chan: Subchannel, ciphertext: &[u8]) -> [u8; 32] {
        let mut hmac = HmacSha256::new_from_slice(&self.mac_key)
            .expect("HMAC accepts keys of any length");
        hmac.update(&self.seq.to_be_bytes());
        hmac.update(&[chan.wire()]);
        hmac.update(ciphertext);
        hmac.finalize().into_bytes().into()
    }
}

/// Outbound half: the write socket plus both outbound channel states.
struct SessionWriter {
    io: BufWriter<OwnedWriteHalf>,
    ctrl: ChannelState,
    data: ChannelState,
}

impl SessionWriter {
    async fn send(&mut self, chan: Subchannel, payload: &[u8]) -> Result<(), SessionError> {
        if payload.len() > MAX_FRAME {
            return Err(SessionError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME,
            });
        }
        let mut ciphertext = payload.to_vec();
        let state = match chan {
            Subchannel::Control => &mut self.ctrl,
            Subchannel::Data => &mut self.data,
        };
        let mac = state.seal(chan, &mut ciphertext);

        self.io.write_all(&[chan.wire()]).await?;
        let len = ((mac.len() + ciphertext.len()) as u32).to_be_bytes();
        self.io.write_all(&len).await?;
        self.io.write_all(&mac).await?;
        self.io.write_all(&ciphertext).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// An authenticated, encrypted duplex link to a remote node.
pub struct Session {
    remote: PublicKey,
    state: Arc<AtomicU8>,
    closed: Arc<AtomicBool>,
    writer: Arc<Mutex<SessionWriter>>,
    ctrl_rx: mpsc::Receiver<Result<Vec<u8>, SessionError>>,
    data_rx: mpsc::Receiver<Result<Vec<u8>, SessionError>>,
    reader: JoinHandle<()>,
}

impl Session {
    /// Dial a remote node and negotiate a session.
    pub async fn dial<A: ToSocketAddrs>(
        addr: A,
        local: &SecretKey,
        remote: &PublicKey,
    ) -> Result<Self, SessionError> {
        let mut socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;

        let keys = handshake::dial(&mut socket, local, remote).await?;
        Ok(Self::from_parts(socket, keys, *remote))
    }

    /// Complete the listener side of a session on an accepted socket.
    async fn accept(socket: TcpStream, local: &SecretKey) -> Result<Self, SessionError> {
        let mut socket = socket;
        socket.set_nodelay(true)?;

        let (keys, remote) = handshake::accept(&mut socket, local).await?;
        Ok(Self::from_parts(socket, keys, remote))
    }

    fn from_parts(socket: TcpStream, keys: handshake::KeySchedule, remote: PublicKey) -> Self {
        let (read_half, write_half) = socket.into_split();

        let state = Arc::new(AtomicU8::new(SessionState::Live as u8));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = Arc::new(Mutex::new(SessionWriter {
            io: BufWriter::new(write_half),
            ctrl: ChannelState::new(&keys.ctrl_out),
            data: ChannelState::new(&keys.data_out),
        }));

        let (ctrl_tx, ctrl_rx) = mpsc::channel(RECV_QUEUE);
        let (data_tx, data_rx) = mpsc::channel(RECV_QUEUE);

        let reader = tokio::spawn(read_loop(
            read_half,
            ChannelState::new(&keys.ctrl_in),
            ChannelState::new(&keys.data_in),
            ctrl_tx,
            data_tx,
            closed.clone(),
            state.clone(),
        ));

        Self {
            remote,
            state,
            closed,
            writer,
            ctrl_rx,
            data_rx,
            reader,
        }
    }

    /// The remote node's long-term identity.
    pub fn remote(&self) -> PublicKey {
        self.remote
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Send a payload on the control subchannel.
    pub async fn send_control(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.send(Subchannel::Control, payload).await
    }

    /// Send a payload on the data subchannel.
    pub async fn send_data(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.send(Subchannel::Data, payload).await
    }

    async fn send(&self, chan: Subchannel, payload: &[u8]) -> Result<(), SessionError> {
        if self.state() != SessionState::Live {
            return Err(SessionError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(chan, payload).await
    }

    /// Receive the next control payload.
    pub async fn recv_control(&mut self) -> Result<Vec<u8>, SessionError> {
        self.ctrl_rx.recv().await.unwrap_or(Err(SessionError::Closed))
    }

    /// Receive the next data payload.
    pub async fn recv_data(&mut self) -> Result<Vec<u8>, SessionError> {
        self.data_rx.recv().await.unwrap_or(Err(SessionError::Closed))
    }

    /// Close the session. Idempotent.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        self.state
            .store(SessionState::Closing as u8, Ordering::Release);
        self.closed.store(true, Ordering::Release);

        let mut writer = self.writer.lock().await;
        let _ = writer.io.shutdown().await;
        drop(writer);

        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Reader task: parses inbound frames, verifies and decrypts them, and
/// dispatches plaintext to the subchannel queues. Any crypto or framing
/// error is fatal to the link.
async fn read_loop(
    mut io: OwnedReadHalf,
    mut ctrl: ChannelState,
    mut data: ChannelState,
    ctrl_tx: mpsc::Sender<Result<Vec<u8>, SessionError>>,
    data_tx: mpsc::Sender<Result<Vec<u8>, SessionError>>,
    closed: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
) {
    loop {
        match read_frame(&mut io, &mut ctrl, &mut data).await {
            Ok((chan, payload)) => {
                let tx = match chan {
                    Subchannel::Control => &ctrl_tx,
                    Subchannel::Data => &data_tx,
                };
                if tx.send(Ok(payload)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                if !closed.load(Ordering::Acquire) {
                    tracing::debug!("session link failed: {err}");
                    // Surface the fatal error on both queues, then stop.
                    let _ = ctrl_tx.try_send(Err(clone_fatal(&err)));
                    let _ = data_tx.try_send(Err(clone_fatal(&err)));
                }
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    state.store(SessionState::Closed as u8, Ordering::Release);
}

/// Fatal read errors are fanned out to both subchannel queues.
fn clone_fatal(err: &SessionError) -> SessionError {
    match err {
        SessionError::Crypto(msg) => SessionError::Crypto(msg.clone()),
        SessionError::Protocol(msg) => SessionError::Protocol(msg.clone()),
        _ => SessionError::Closed,
    }
}

async fn read_frame(
    io: &mut OwnedReadHalf,
    ctrl: &mut ChannelState,
    data: &mut ChannelState,
) -> Result<(Subchannel, Vec<u8>), SessionError> {
    let mut chan_buf = [0u8; 1];
    io.read_exact(&mut chan_buf).await?;
    let chan = Subchannel::from_wire(chan_buf[0])
        .ok_or_else(|| SessionError::Protocol(format!("unknown subchannel {}", chan_buf[0])))?;

    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 32 {
        return Err(SessionError::Protocol(format!("truncated frame: {len} bytes")));
    }
    if len > MAX_FRAME + 32 {
        return Err(SessionError::FrameTooLarge {
            size: len,
            max: MAX_FRAME,
        });
    }

    let mut mac = [0u8; 32];
    io.read_exact(&mut mac).await?;
    let mut payload = vec![0u8; len - 32];
    io.read_exact(&mut payload).await?;

    let channel = match chan {
        Subchannel::Control => ctrl,
        Subchannel::Data => data,
    };
    channel.open(chan, &mac, &mut payload)?;
    Ok((chan, payload))
}

/// Accepts inbound sessions, running handshakes concurrently and queueing
/// the negotiated links.
pub struct Listener {
    local_addr: SocketAddr,
    sink: mpsc::Receiver<Session>,
    acceptor: JoinHandle<()>,
}

impl Listener {
    /// Bind a TCP listener and start accepting sessions.
    pub async fn bind<A: ToSocketAddrs>(addr: A, key: SecretKey) -> Result<Self, SessionError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

        let acceptor = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!("session accept failed: {err}");
                        continue;
                    }
                };
                let key = key.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match Session::accept(socket, &key).await {
                        Ok(session) => {
                            let _ = tx.send(session).await;
                        }
                        Err(err) => {
                            tracing::debug!("handshake with {peer} failed: {err}");
                        }
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            sink: rx,
            acceptor,
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        Ok(self.local_addr)
    }

    /// The next negotiated session, or `None` once the listener is gone.
    pub async fn accept(&mut self) -> Option<Session> {
        self.sink.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::expand_keys;
    use rand::SeedableRng;

    fn keypair(seed: u64) -> (SecretKey, PublicKey) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let secret = SecretKey::generate(&mut rng);
        let public = secret.public();
        (secret, public)
    }

    async fn session_pair() -> (Session, Session) {
        let (server_key, server_pub) = keypair(1);
        let (client_key, _) = keypair(2);

        let mut listener = Listener::bind("127.0.0.1:0", server_key).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = Session::dial(addr, &client_key, &server_pub).await.unwrap();
        let server = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn cipher_states_mirror_across_endpoints() {
        // Both endpoints of a link must derive keystreams and MAC states
        // that agree for every direction of every subchannel.
        let shared = [9u8; 32];
        let dialer = expand_keys(&shared, &[1u8; 32], &[2u8; 32], true);
        let listener = expand_keys(&shared, &[1u8; 32], &[2u8; 32], false);

        for (out_keys, in_keys) in [
            (&dialer.ctrl_out, &listener.ctrl_in),
            (&listener.ctrl_out, &dialer.ctrl_in),
            (&dialer.data_out, &listener.data_in),
            (&listener.data_out, &dialer.data_in),
        ] {
            let mut tx = ChannelState::new(out_keys);
            let mut rx = ChannelState::new(in_keys);

            let mut sent = vec![0u8; 4096];
            let mut received = vec![0u8; 4096];
            tx.cipher.apply_keystream(&mut sent);
            rx.cipher.apply_keystream(&mut received);
            assert_eq!(sent, received, "keystream mismatch between endpoints");

            assert_eq!(
                tx.mac(Subchannel::Control, &sent),
                rx.mac(Subchannel::Control, &received),
                "MAC state mismatch between endpoints"
            );
        }
    }

    #[test]
    fn frame_seal_open_roundtrip() {
        let keys = expand_keys(&[3u8; 32], &[1u8; 32], &[2u8; 32], true);
        let mut tx = ChannelState::new(&keys.data_out);
        let mut rx = ChannelState::new(&keys.data_out);

        let mut payload = b"payload bytes".to_vec();
        let mac = tx.seal(Subchannel::Data, &mut payload);
        rx.open(Subchannel::Data, &mac, &mut payload).unwrap();
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn corrupted_frame_fails_mac() {
        let keys = expand_keys(&[3u8; 32], &[1u8; 32], &[2u8; 32], true);
        let mut tx = ChannelState::new(&keys.data_out);

        let mut payload = b"payload bytes".to_vec();
        let mac = tx.seal(Subchannel::Data, &mut payload);

        for i in 0..payload.len() {
            let mut rx = ChannelState::new(&keys.data_out);
            let mut corrupted = payload.clone();
            corrupted[i] ^= 0x01;
            let err = rx.open(Subchannel::Data, &mac, &mut corrupted).unwrap_err();
            assert!(matches!(err, SessionError::Crypto(_)));
        }
    }

    #[test]
    fn reordered_frame_fails_mac() {
        let keys = expand_keys(&[3u8; 32], &[1u8; 32], &[2u8; 32], true);
        let mut tx = ChannelState::new(&keys.data_out);
        let mut rx = ChannelState::new(&keys.data_out);

        let mut first = b"first".to_vec();
        let _ = tx.seal(Subchannel::Data, &mut first);
        let mut second = b"second".to_vec();
        let mac2 = tx.seal(Subchannel::Data, &mut second);

        // Receiver expects frame 0; replaying frame 1 must fail.
        let err = rx.open(Subchannel::Data, &mac2, &mut second).unwrap_err();
        assert!(matches!(err, SessionError::Crypto(_)));
    }

    #[tokio::test]
    async fn session_roundtrip_both_channels() {
        let (client, mut server) = session_pair().await;

        client.send_control(b"ctrl ping").await.unwrap();
        client.send_data(b"data ping").await.unwrap();

        assert_eq!(server.recv_control().await.unwrap(), b"ctrl ping");
        assert_eq!(server.recv_data().await.unwrap(), b"data ping");

        server.send_data(b"data pong").await.unwrap();
        let mut client = client;
        assert_eq!(client.recv_data().await.unwrap(), b"data pong");
    }

    #[tokio::test]
    async fn multiple_sequential_dials() {
        let (server_key, server_pub) = keypair(1);
        let mut listener = Listener::bind("127.0.0.1:0", server_key).await.unwrap();
        let addr = listener.local_addr().unwrap();

        for seed in 10..13 {
            let (client_key, _) = keypair(seed);
            let client = Session::dial(addr, &client_key, &server_pub).await.unwrap();
            let server = listener.accept().await.unwrap();
            assert_eq!(server.remote(), client_key.public());
            assert_eq!(client.state(), SessionState::Live);
            assert_eq!(server.state(), SessionState::Live);
        }
    }

    #[tokio::test]
    async fn dial_with_wrong_server_key_fails() {
        let (server_key, _) = keypair(1);
        let (_, wrong_pub) = keypair(99);
        let (client_key, _) = keypair(2);

        let listener = Listener::bind("127.0.0.1:0", server_key).await.unwrap();
        let addr = listener.local_addr().unwrap();

        // The listener cannot unseal an offer encrypted to a key it does
        // not hold; the dialer observes a failed handshake.
        let result = Session::dial(addr, &client_key, &wrong_pub).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_after_close_reports_closed() {
        let (client, _server) = session_pair().await;
        let mut client = client;
        client.close().await.unwrap();
        assert_eq!(client.state(), SessionState::Closed);

        let err = client.send_data(b"late").await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test]
    async fn peer_close_surfaces_on_recv() {
        let (client, server) = session_pair().await;
        let mut client = client;
        drop(server);

        let err = client.recv_data().await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test]
    async fn on_wire_corruption_kills_link() {
        // A raw TCP peer completes a real handshake, sends one valid
        // frame and then one with a flipped ciphertext byte. The session
        // must deliver the first and die on the second.
        let (server_key, server_pub) = keypair(1);
        let (client_key, _) = keypair(2);

        let mut listener = Listener::bind("127.0.0.1:0", server_key).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let keys = handshake::dial(&mut raw, &client_key, &server_pub)
            .await
            .unwrap();
        let mut server = listener.accept().await.unwrap();

        let mut tx = ChannelState::new(&keys.data_out);

        // Valid frame.
        let mut good = b"good frame".to_vec();
        let mac = tx.seal(Subchannel::Data, &mut good);
        write_raw_frame(&mut raw, Subchannel::Data, &mac, &good).await;
        assert_eq!(server.recv_data().await.unwrap(), b"good frame");

        // Corrupted frame.
        let mut bad = b"bad frame".to_vec();
        let mac = tx.seal(Subchannel::Data, &mut bad);
        bad[0] ^= 0xFF;
        write_raw_frame(&mut raw, Subchannel::Data, &mac, &bad).await;

        let err = server.recv_data().await.unwrap_err();
        assert!(matches!(err, SessionError::Crypto(_)));

        // The link is torn down for good.
        let err = server.recv_data().await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    async fn write_raw_frame(
        socket: &mut TcpStream,
        chan: Subchannel,
        mac: &[u8; 32],
        ciphertext: &[u8],
    ) {
        socket.write_all(&[chan.wire()]).await.unwrap();
        let len = ((mac.len() + ciphertext.len()) as u32).to_be_bytes();
        socket.write_all(&len).await.unwrap();
        socket.write_all(mac).await.unwrap();
        socket.write_all(ciphertext).await.unwrap();
        socket.flush().await.unwrap();
    }
}
