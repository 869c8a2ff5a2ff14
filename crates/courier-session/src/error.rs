/// Errors returned by the session layer.
///
/// Crypto and protocol errors on a live link are fatal: the link tears
/// down and every subsequent operation reports `Closed`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("session closed")]
    Closed,

    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    #[error("schema already registered: {0}")]
    DuplicateSchema(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
