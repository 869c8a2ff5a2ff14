//! Courier carrier layer.
//!
//! Turns a rendez-vous overlay into a messaging fabric: dynamic topic
//! trees with heartbeat-driven parent re-ownership, topic-local
//! capacity-weighted load balancing, request/reply correlation, and
//! ordered bidirectional tunnels — all against an abstract routing
//! service.
//!
//! The carrier is constructed explicitly ([`Carrier::start`]) around a
//! [`Routing`] implementation and its upcall stream; client processes
//! obtain [`Connection`] handles scoped to a cluster name.

mod carrier;
mod connection;
mod error;
mod heart;
mod proto;
mod routing;
pub mod testing;
mod topic;
mod tunnel;
mod types;

pub use carrier::{Carrier, CarrierConfig};
pub use connection::{ConnEvent, Connection, ConnectionEvents};
pub use error::CarrierError;
pub use heart::{Heart, NotMonitored};
pub use proto::CarrierMessage;
pub use routing::{Routing, RoutingEvent, RoutingEvents};
pub use tunnel::{Tunnel, TunnelReceiver, TunnelSender};
pub use types::{ConnId, MonitorId, NodeId, TopicId};
