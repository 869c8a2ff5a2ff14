/// Schema-registered datagram codec.
///
/// Both endpoints register the message kinds they intend to exchange, in
/// the same order, before first use; the registration index becomes the
/// wire tag. Message bodies are MessagePack. A decode failure invalidates
/// the coder state: the encoder and decoder are rebuilt and every schema
/// re-registered in the original order before the error is surfaced, so
/// the next well-formed frame decodes correctly.
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::SessionError;

struct Encoder {
    tags: HashMap<String, u32>,
}

struct Decoder {
    kinds: Vec<String>,
}

impl Encoder {
    fn new() -> Self {
        Self {
            tags: HashMap::new(),
        }
    }

    fn register(&mut self, kind: &str) {
        let tag = self.tags.len() as u32;
        self.tags.insert(kind.to_string(), tag);
    }
}

impl Decoder {
    fn new() -> Self {
        Self { kinds: Vec::new() }
    }

    fn register(&mut self, kind: &str) {
        self.kinds.push(kind.to_string());
    }
}

/// A datagram coder with rebuildable schema state.
pub struct Codec {
    /// Registered kinds in original order; survives rebuilds.
    types: Vec<String>,
    enc: Encoder,
    dec: Decoder,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            enc: Encoder::new(),
            dec: Decoder::new(),
        }
    }

    /// Register a message kind. Order matters and must match the peer.
    pub fn register(&mut self, kind: &str) -> Result<(), SessionError> {
        if self.types.iter().any(|t| t == kind) {
            return Err(SessionError::DuplicateSchema(kind.to_string()));
        }
        self.types.push(kind.to_string());
        self.enc.register(kind);
        self.dec.register(kind);
        Ok(())
    }

    /// Encode a message of a registered kind into a datagram.
    pub fn encode<T: Serialize>(&mut self, kind: &str, msg: &T) -> Result<Vec<u8>, SessionError> {
        let tag = *self
            .enc
            .tags
            .get(kind)
            .ok_or_else(|| SessionError::UnknownSchema(kind.to_string()))?;

        let body = rmp_serde::to_vec(msg)?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&tag.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a datagram into a registered kind and its message.
    ///
    /// On failure the coder state is rebuilt before the error returns.
    pub fn decode<T: DeserializeOwned>(
        &mut self,
        data: &[u8],
    ) -> Result<(String, T), SessionError> {
        match self.try_decode(data) {
            Ok(decoded) => Ok(decoded),
            Err(err) => {
                self.rebuild();
                Err(err)
            }
        }
    }

    fn try_decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<(String, T), SessionError> {
        if data.len() < 4 {
            return Err(SessionError::Protocol(format!(
                "datagram too short: {} bytes",
                data.len()
            )));
        }
        let tag = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let kind = self
            .dec
            .kinds
            .get(tag as usize)
            .ok_or_else(|| SessionError::UnknownSchema(format!("wire tag {tag}")))?
            .clone();

        let msg = rmp_serde::from_slice(&data[4..])?;
        Ok((kind, msg))
    }

    /// Recreate the coders and replay every registration in order.
    fn rebuild(&mut self) {
        self.enc = Encoder::new();
        self.dec = Decoder::new();
        for kind in &self.types {
            self.enc.register(kind);
            self.dec.register(kind);
        }
    }

    /// Number of registered schemas.
    pub fn registered(&self) -> usize {
        self.types.len()
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}
