//! Courier relay layer.
//!
//! Exposes carrier operations to co-located client processes over a
//! framed local socket: one long-lived connection per client, a
//! handshake that scopes the client to its cluster, a bounded worker
//! pool per connection, and request/tunnel correlation tables.
//!
//! Wire format: one-byte opcodes with varint-length-prefixed fields
//! (see [`wire`]).

mod error;
mod pool;
mod relay;
mod server;
pub mod wire;

pub use error::RelayError;
pub use server::{RelayConfig, RelayServer};
