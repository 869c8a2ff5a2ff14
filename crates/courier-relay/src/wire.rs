/// Relay wire primitives.
///
/// Every frame starts with a one-byte opcode followed by opcode-specific
/// fields: scalars as LEB128 varints, byte strings and strings as a
/// varint length prefix plus raw bytes. The same opcodes run in both
/// directions with direction-specific bodies.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::RelayError;

/// Upper bound for any single length-prefixed field.
pub const MAX_FIELD: usize = 1 << 20;

/// Frame opcodes of the local relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Client handshake: declares the application's cluster.
    Init = 0x00,
    /// Relay handshake acknowledgement.
    InitAck = 0x01,
    /// Cluster-wide delivery (client: send; relay: deliver).
    Broadcast = 0x02,
    /// Balanced request (client: issue; relay: deliver to serve).
    Request = 0x03,
    /// Request outcome (client: answer a served request; relay: result).
    Reply = 0x04,
    /// Topic publication (client: send; relay: deliver).
    Publish = 0x05,
    Subscribe = 0x06,
    Unsubscribe = 0x07,
    /// Tunnel initiation (client: open; relay: inbound announcement).
    TunnelInit = 0x08,
    /// Tunnel confirmation (client: accept inbound; relay: open result).
    TunnelConfirm = 0x09,
    TunnelData = 0x0a,
    TunnelAck = 0x0b,
    TunnelClose = 0x0c,
    /// Graceful teardown.
    Close = 0x0d,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Opcode::Init),
            0x01 => Some(Opcode::InitAck),
            0x02 => Some(Opcode::Broadcast),
            0x03 => Some(Opcode::Request),
            0x04 => Some(Opcode::Reply),
            0x05 => Some(Opcode::Publish),
            0x06 => Some(Opcode::Subscribe),
            0x07 => Some(Opcode::Unsubscribe),
            0x08 => Some(Opcode::TunnelInit),
            0x09 => Some(Opcode::TunnelConfirm),
            0x0a => Some(Opcode::TunnelData),
            0x0b => Some(Opcode::TunnelAck),
            0x0c => Some(Opcode::TunnelClose),
            0x0d => Some(Opcode::Close),
            _ => None,
        }
    }
}

/// Reply status codes carried in relay → client reply frames.
pub mod reply_status {
    pub const OK: u8 = 0;
    pub const TIMEOUT: u8 = 1;
    pub const FAULT: u8 = 2;
    pub const CLOSED: u8 = 3;
}

/// Tunnel open status codes in relay → client tunnel-confirm frames.
pub mod tunnel_status {
    pub const OK: u8 = 0;
    pub const REFUSED: u8 = 1;
}

// ── Async stream accessors ─────────────────────────────────────────────

pub async fn write_opcode<W: AsyncWrite + Unpin>(w: &mut W, op: Opcode) -> Result<(), RelayError> {
    w.write_u8(op as u8).await?;
    Ok(())
}

pub async fn read_opcode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Opcode, RelayError> {
    let byte = r.read_u8().await?;
    Opcode::from_u8(byte).ok_or(RelayError::UnknownOpcode(byte))
}

pub async fn write_uvarint<W: AsyncWrite + Unpin>(w: &mut W, mut v: u64) -> Result<(), RelayError> {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            w.write_u8(byte).await?;
            return Ok(());
        }
        w.write_u8(byte | 0x80).await?;
    }
}

pub async fn read_uvarint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, RelayError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = r.read_u8().await?;
        if shift == 63 && byte > 1 {
            return Err(RelayError::Protocol("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(RelayError::Protocol("varint too long".into()));
        }
    }
}

pub async fn write_bytes<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<(), RelayError> {
    write_uvarint(w, data.len() as u64).await?;
    w.write_all(data).await?;
    Ok(())
}

pub async fn read_bytes<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, RelayError> {
    let len = read_uvarint(r).await? as usize;
    if len > MAX_FIELD {
        return Err(RelayError::FieldTooLarge {
            size: len,
            max: MAX_FIELD,
        });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_str<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<(), RelayError> {
    write_bytes(w, s.as_bytes()).await
}

pub async fn read_str<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, RelayError> {
    let bytes = read_bytes(r).await?;
    String::from_utf8(bytes).map_err(|_| RelayError::Protocol("string is not UTF-8".into()))
}

// ── Buffer-level helpers (used by tests and property checks) ───────────

pub fn encode_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in data.iter().enumerate() {
        if shift == 63 && *byte > 1 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}
