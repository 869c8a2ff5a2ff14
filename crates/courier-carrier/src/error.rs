/// Errors returned by carrier-level operations.
///
/// Crypto and protocol failures on a link are fatal to that link; the
/// carrier observes them as tree-link loss and the topic subsystem heals.
#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    #[error("operation timed out")]
    Timeout,

    #[error("not subscribed to topic")]
    NotSubscribed,

    #[error("no subscribers reachable")]
    NoSubscribers,

    #[error("connection closed")]
    Closed,

    #[error("refused by remote application")]
    Refused,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<rmp_serde::encode::Error> for CarrierError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CarrierError::Protocol(format!("encode: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for CarrierError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CarrierError::Protocol(format!("decode: {e}"))
    }
}
