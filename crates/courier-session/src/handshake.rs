/// Two-round session handshake and the symmetric key schedule.
///
/// The dialer seals its static identity, a handshake-ephemeral public key
/// and a nonce to the listener's long-term key; the listener answers with
/// its own ephemeral and nonce sealed to the dialer's identity. Both ends
/// expand the ephemeral Diffie-Hellman secret into independent cipher,
/// IV and MAC keys for each direction of each subchannel.
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::seal::{self, SealedBox};
use crate::{PublicKey, SecretKey, SessionError};

/// HKDF info string for the session key block.
const KEY_INFO: &[u8] = b"courier-session-keys-v1";

/// Handshake frames never legitimately exceed this.
const MAX_HANDSHAKE_FRAME: usize = 4096;

/// Bytes per direction: 32 cipher key + 12 IV + 32 MAC key.
const DIRECTION_BYTES: usize = 76;

/// Dialer's opening frame, sealed to the listener's long-term key.
#[derive(Serialize, Deserialize)]
struct Offer {
    static_pub: [u8; 32],
    ephemeral_pub: [u8; 32],
    nonce: [u8; 32],
}

/// Listener's answer, sealed to the dialer's long-term key.
#[derive(Serialize, Deserialize)]
struct Answer {
    ephemeral_pub: [u8; 32],
    nonce: [u8; 32],
}

/// Key material for one direction of one subchannel.
#[derive(Clone)]
pub(crate) struct DirectionKeys {
    pub key: [u8; 32],
    pub iv: [u8; 12],
    pub mac: [u8; 32],
}

impl DirectionKeys {
    fn from_slice(bytes: &[u8]) -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 12];
        let mut mac = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        iv.copy_from_slice(&bytes[32..44]);
        mac.copy_from_slice(&bytes[44..76]);
        Self { key, iv, mac }
    }
}

/// The full key block for one endpoint, already oriented: `*_out` keys
/// encrypt what this endpoint sends, `*_in` keys verify what it receives.
pub(crate) struct KeySchedule {
    pub ctrl_out: DirectionKeys,
    pub ctrl_in: DirectionKeys,
    pub data_out: DirectionKeys,
    pub data_in: DirectionKeys,
}

/// Expand the shared secret into the four directed key sets.
///
/// Block order is fixed: control dialer-to-listener, control
/// listener-to-dialer, data dialer-to-listener, data listener-to-dialer.
/// `dialer` selects which half becomes outbound.
pub(crate) fn expand_keys(
    shared: &[u8; 32],
    nonce_dialer: &[u8; 32],
    nonce_listener: &[u8; 32],
    dialer: bool,
) -> KeySchedule {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(nonce_dialer);
    salt[32..].copy_from_slice(nonce_listener);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; 4 * DIRECTION_BYTES];
    hkdf.expand(KEY_INFO, &mut okm)
        .expect("HKDF-SHA256 expand to 304 bytes always succeeds");

    let ctrl_d2l = DirectionKeys::from_slice(&okm[..DIRECTION_BYTES]);
    let ctrl_l2d = DirectionKeys::from_slice(&okm[DIRECTION_BYTES..2 * DIRECTION_BYTES]);
    let data_d2l = DirectionKeys::from_slice(&okm[2 * DIRECTION_BYTES..3 * DIRECTION_BYTES]);
    let data_l2d = DirectionKeys::from_slice(&okm[3 * DIRECTION_BYTES..]);

    if dialer {
        KeySchedule {
            ctrl_out: ctrl_d2l,
            ctrl_in: ctrl_l2d,
            data_out: data_d2l,
            data_in: data_l2d,
        }
    } else {
        KeySchedule {
            ctrl_out: ctrl_l2d,
            ctrl_in: ctrl_d2l,
            data_out: data_l2d,
            data_in: data_d2l,
        }
    }
}

/// Run the dialer side of the handshake on a fresh TCP socket.
pub(crate) async fn dial(
    socket: &mut TcpStream,
    local: &SecretKey,
    remote: &PublicKey,
) -> Result<KeySchedule, SessionError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519PublicKey::from(&ephemeral);

    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);

    let offer = Offer {
        static_pub: *local.public().as_bytes(),
        ephemeral_pub: ephemeral_pub.to_bytes(),
        nonce,
    };
    let sealed = seal::seal(&rmp_serde::to_vec(&offer)?, remote)?;
    write_frame(socket, &rmp_serde::to_vec(&sealed)?).await?;

    let answer_frame = read_frame(socket).await?;
    let sealed: SealedBox = rmp_serde::from_slice(&answer_frame)
        .map_err(|e| SessionError::Handshake(format!("malformed answer: {e}")))?;
    let answer: Answer = rmp_serde::from_slice(&seal::open(&sealed, local)?)
        .map_err(|e| SessionError::Handshake(format!("malformed answer payload: {e}")))?;

    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(answer.ephemeral_pub));
    Ok(expand_keys(shared.as_bytes(), &nonce, &answer.nonce, true))
}

/// Run the listener side of the handshake on an accepted TCP socket.
///
/// Returns the negotiated keys and the dialer's long-term identity.
pub(crate) async fn accept(
    socket: &mut TcpStream,
    local: &SecretKey,
) -> Result<(KeySchedule, PublicKey), SessionError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let offer_frame = read_frame(socket).await?;
    let sealed: SealedBox = rmp_serde::from_slice(&offer_frame)
        .map_err(|e| SessionError::Handshake(format!("malformed offer: {e}")))?;
    let offer: Offer = rmp_serde::from_slice(&seal::open(&sealed, local)?)
        .map_err(|e| SessionError::Handshake(format!("malformed offer payload: {e}")))?;

    let remote_static = PublicKey::from_bytes(offer.static_pub);

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519PublicKey::from(&ephemeral);

    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);

    let answer = Answer {
        ephemeral_pub: ephemeral_pub.to_bytes(),
        nonce,
    };
    let sealed = seal::seal(&rmp_serde::to_vec(&answer)?, &remote_static)?;
    write_frame(socket, &rmp_serde::to_vec(&sealed)?).await?;

    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(offer.ephemeral_pub));
    let keys = expand_keys(shared.as_bytes(), &offer.nonce, &nonce, false);
    Ok((keys, remote_static))
}

async fn write_frame(socket: &mut TcpStream, data: &[u8]) -> Result<(), SessionError> {
    let len = (data.len() as u32).to_be_bytes();
    socket.write_all(&len).await?;
    socket.write_all(data).await?;
    socket.flush().await?;
    Ok(())
}

async fn read_frame(socket: &mut TcpStream) -> Result<Vec<u8>, SessionError> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_HANDSHAKE_FRAME {
        return Err(SessionError::Handshake(format!(
            "oversized handshake frame: {len} bytes"
        )));
    }
    let mut buf = vec![0u8; len];
    socket.read_exact(&mut buf).await?;
    Ok(buf)
}
