use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::CarrierError;

/// Overlay node address — 32 bytes, the node's session public key.
///
/// Displayed and parsed as a 64-character hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "NodeId({}...)", &hex[..12])
    }
}

impl FromStr for NodeId {
    type Err = CarrierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = parse_hex32(s).ok_or_else(|| {
            CarrierError::Protocol(format!("invalid node id: {s}"))
        })?;
        Ok(Self(bytes))
    }
}

/// Topic address — SHA-256 of the scoped topic name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId([u8; 32]);

impl TopicId {
    /// Hash a raw name into a topic address.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// The topic carrying pub/sub traffic for `topic` within `cluster`.
    pub fn scoped(cluster: &str, topic: &str) -> Self {
        Self::from_name(&format!("topic/{cluster}/{topic}"))
    }

    /// The implicit group topic every member of a cluster joins; carries
    /// broadcasts, balanced requests and tunnel initiations.
    pub fn cluster(cluster: &str) -> Self {
        Self::from_name(&format!("cluster/{cluster}"))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "TopicId({}...)", &hex[..12])
    }
}

/// Local connection identifier. Zero is reserved and never assigned.
pub type ConnId = u64;

/// Heart monitor key: one tracked tree neighbor within one topic.
///
/// Pairing the topic with the node keeps identical nodes on different
/// topics distinct in the monitor set.
pub type MonitorId = (TopicId, NodeId);

fn parse_hex32(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in bytes.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(bytes)
}

mod serde_impls {
    use super::{NodeId, TopicId};

    macro_rules! bytes32_serde {
        ($ty:ident) => {
            impl serde::Serialize for $ty {
                fn serialize<S: serde::Serializer>(
                    &self,
                    serializer: S,
                ) -> Result<S::Ok, S::Error> {
                    serializer.serialize_bytes(&self.0)
                }
            }

            impl<'de> serde::Deserialize<'de> for $ty {
                fn deserialize<D: serde::Deserializer<'de>>(
                    deserializer: D,
                ) -> Result<Self, D::Error> {
                    struct Visitor;

                    impl serde::de::Visitor<'_> for Visitor {
                        type Value = $ty;

                        fn expecting(
                            &self,
                            f: &mut std::fmt::Formatter<'_>,
                        ) -> std::fmt::Result {
                            f.write_str("32 bytes")
                        }

                        fn visit_bytes<E: serde::de::Error>(
                            self,
                            v: &[u8],
                        ) -> Result<$ty, E> {
                            let bytes: [u8; 32] = v
                                .try_into()
                                .map_err(|_| E::invalid_length(v.len(), &self))?;
                            Ok($ty(bytes))
                        }
                    }

                    deserializer.deserialize_bytes(Visitor)
                }
            }
        };
    }

    bytes32_serde!(NodeId);
    bytes32_serde!(TopicId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_hash_is_deterministic() {
        assert_eq!(TopicId::from_name("alpha"), TopicId::from_name("alpha"));
        assert_ne!(TopicId::from_name("alpha"), TopicId::from_name("beta"));
    }

    #[test]
    fn scoped_topics_do_not_collide_across_clusters() {
        assert_ne!(TopicId::scoped("a", "t"), TopicId::scoped("b", "t"));
        assert_ne!(TopicId::scoped("a", "t"), TopicId::cluster("a"));
    }

    #[test]
    fn cluster_and_topic_namespaces_are_disjoint() {
        // A topic literally named like a cluster marker must not alias
        // the cluster group topic.
        assert_ne!(TopicId::scoped("a", ""), TopicId::cluster("a"));
    }

    #[test]
    fn node_id_hex_roundtrip() {
        let id = NodeId::from_bytes([0xAB; 32]);
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn node_id_rejects_bad_hex() {
        assert!("xyz".parse::<NodeId>().is_err());
    }

    #[test]
    fn node_id_serde_roundtrip() {
        let id = NodeId::from_bytes([7; 32]);
        let bytes = rmp_serde::to_vec(&id).unwrap();
        let decoded: NodeId = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn monitor_ids_distinguish_topics() {
        let node = NodeId::from_bytes([1; 32]);
        let a: MonitorId = (TopicId::from_name("a"), node);
        let b: MonitorId = (TopicId::from_name("b"), node);
        assert_ne!(a, b);
    }
}
