/// In-memory routing substrate for multi-carrier tests.
///
/// Wires any number of carriers together with loss-free channels and a
/// first-subscriber-becomes-rendez-vous tree policy. Also counts
/// subscribe/unsubscribe cascades so tests can assert on them.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::routing::{Routing, RoutingEvent, RoutingEvents};
use crate::types::{NodeId, TopicId};
use crate::CarrierError;

struct MeshTopic {
    root: NodeId,
    members: Vec<NodeId>,
}

struct MeshInner {
    nodes: HashMap<NodeId, mpsc::UnboundedSender<RoutingEvent>>,
    topics: HashMap<TopicId, MeshTopic>,
    subscribe_calls: HashMap<TopicId, u32>,
    unsubscribe_calls: HashMap<TopicId, u32>,
}

impl MeshInner {
    fn emit(&self, node: NodeId, event: RoutingEvent) {
        if let Some(tx) = self.nodes.get(&node) {
            let _ = tx.send(event);
        }
    }
}

/// The shared fake substrate.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MeshInner {
                nodes: HashMap::new(),
                topics: HashMap::new(),
                subscribe_calls: HashMap::new(),
                unsubscribe_calls: HashMap::new(),
            })),
        }
    }

    /// Attach a node; returns its routing handle and upcall stream.
    pub fn join(&self, node: NodeId) -> (Arc<MeshRouting>, RoutingEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().nodes.insert(node, tx);
        (
            Arc::new(MeshRouting {
                node,
                inner: self.inner.clone(),
            }),
            rx,
        )
    }

    /// Detach a node abruptly: deliveries to it vanish, simulating a
    /// crashed peer.
    pub fn disconnect(&self, node: NodeId) {
        self.inner.lock().unwrap().nodes.remove(&node);
    }

    /// How many times any node cascaded a subscribe for a topic.
    pub fn subscribe_calls(&self, topic: TopicId) -> u32 {
        *self
            .inner
            .lock()
            .unwrap()
            .subscribe_calls
            .get(&topic)
            .unwrap_or(&0)
    }

    /// How many times any node cascaded an unsubscribe for a topic.
    pub fn unsubscribe_calls(&self, topic: TopicId) -> u32 {
        *self
            .inner
            .lock()
            .unwrap()
            .unsubscribe_calls
            .get(&topic)
            .unwrap_or(&0)
    }

    /// Current members of a topic, rendez-vous first.
    pub fn members(&self, topic: TopicId) -> Vec<NodeId> {
        let inner = self.inner.lock().unwrap();
        inner
            .topics
            .get(&topic)
            .map(|t| t.members.clone())
            .unwrap_or_default()
    }

    /// The rendez-vous node of a topic, if anyone subscribes.
    pub fn root(&self, topic: TopicId) -> Option<NodeId> {
        self.inner.lock().unwrap().topics.get(&topic).map(|t| t.root)
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of the mesh.
pub struct MeshRouting {
    node: NodeId,
    inner: Arc<Mutex<MeshInner>>,
}

impl Routing for MeshRouting {
    fn subscribe(&self, topic: TopicId) -> Result<(), CarrierError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.subscribe_calls.entry(topic).or_insert(0) += 1;

        enum Outcome {
            NewRoot,
            Attached { root: NodeId },
            TookOver { survivors: Vec<NodeId> },
            Noop,
        }

        let outcome = match inner.topics.get_mut(&topic) {
            None => {
                inner.topics.insert(
                    topic,
                    MeshTopic {
                        root: self.node,
                        members: vec![self.node],
                    },
                );
                Outcome::NewRoot
            }
            Some(entry) if !entry.members.contains(&self.node) => {
                entry.members.push(self.node);
                Outcome::Attached { root: entry.root }
            }
            Some(entry) => {
                // Re-announce. If the recorded rendez-vous vanished, the
                // announcing member takes over and the survivors attach
                // below it.
                let root = entry.root;
                if root != self.node && !inner.nodes.contains_key(&root) {
                    let entry = inner.topics.get_mut(&topic).expect("entry exists");
                    entry.members.retain(|m| *m != root);
                    entry.root = self.node;
                    let survivors = entry.members.clone();
                    Outcome::TookOver { survivors }
                } else {
                    Outcome::Noop
                }
            }
        };

        match outcome {
            Outcome::NewRoot => {
                inner.emit(
                    self.node,
                    RoutingEvent::TreeParent {
                        topic,
                        parent: None,
                    },
                );
            }
            Outcome::Attached { root } => {
                inner.emit(
                    self.node,
                    RoutingEvent::TreeParent {
                        topic,
                        parent: Some(root),
                    },
                );
                inner.emit(
                    root,
                    RoutingEvent::TreeChildUp {
                        topic,
                        child: self.node,
                    },
                );
            }
            Outcome::TookOver { survivors } => {
                inner.emit(
                    self.node,
                    RoutingEvent::TreeParent {
                        topic,
                        parent: None,
                    },
                );
                for member in survivors {
                    if member == self.node {
                        continue;
                    }
                    inner.emit(
                        member,
                        RoutingEvent::TreeParent {
                            topic,
                            parent: Some(self.node),
                        },
                    );
                    inner.emit(
                        self.node,
                        RoutingEvent::TreeChildUp {
                            topic,
                            child: member,
                        },
                    );
                }
            }
            Outcome::Noop => {}
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: TopicId) -> Result<(), CarrierError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.unsubscribe_calls.entry(topic).or_insert(0) += 1;

        enum Outcome {
            Gone,
            Promoted { new_root: NodeId, others: Vec<NodeId> },
            LeftChild { root: NodeId },
        }

        let outcome = {
            let Some(entry) = inner.topics.get_mut(&topic) else {
                return Ok(());
            };
            entry.members.retain(|m| *m != self.node);
            if entry.members.is_empty() {
                Outcome::Gone
            } else if entry.root == self.node {
                let new_root = entry.members[0];
                entry.root = new_root;
                Outcome::Promoted {
                    new_root,
                    others: entry.members.clone(),
                }
            } else {
                Outcome::LeftChild { root: entry.root }
            }
        };

        match outcome {
            Outcome::Gone => {
                inner.topics.remove(&topic);
            }
            Outcome::Promoted { new_root, others } => {
                inner.emit(
                    new_root,
                    RoutingEvent::TreeParent {
                        topic,
                        parent: None,
                    },
                );
                for member in others {
                    if member == new_root {
                        continue;
                    }
                    inner.emit(
                        member,
                        RoutingEvent::TreeParent {
                            topic,
                            parent: Some(new_root),
                        },
                    );
                    inner.emit(
                        new_root,
                        RoutingEvent::TreeChildUp {
                            topic,
                            child: member,
                        },
                    );
                }
            }
            Outcome::LeftChild { root } => {
                inner.emit(
                    root,
                    RoutingEvent::TreeChildDown {
                        topic,
                        child: self.node,
                    },
                );
            }
        }
        Ok(())
    }

    fn publish(&self, topic: TopicId, payload: Vec<u8>) -> Result<(), CarrierError> {
        let inner = self.inner.lock().unwrap();
        let Some(entry) = inner.topics.get(&topic) else {
            return Ok(());
        };
        for member in &entry.members {
            inner.emit(
                *member,
                RoutingEvent::Deliver {
                    topic,
                    payload: payload.clone(),
                },
            );
        }
        Ok(())
    }

    fn balance(&self, topic: TopicId, payload: Vec<u8>) -> Result<(), CarrierError> {
        let inner = self.inner.lock().unwrap();
        let Some(entry) = inner.topics.get(&topic) else {
            return Ok(());
        };
        inner.emit(entry.root, RoutingEvent::Deliver { topic, payload });
        Ok(())
    }

    fn direct(&self, node: NodeId, payload: Vec<u8>) -> Result<(), CarrierError> {
        let inner = self.inner.lock().unwrap();
        inner.emit(node, RoutingEvent::Direct { payload });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; 32])
    }

    #[tokio::test]
    async fn first_subscriber_becomes_root() {
        let mesh = Mesh::new();
        let (a, mut a_events) = mesh.join(node(1));
        let (b, mut b_events) = mesh.join(node(2));

        let topic = TopicId::from_name("t");
        a.subscribe(topic).unwrap();
        b.subscribe(topic).unwrap();

        assert_eq!(mesh.root(topic), Some(node(1)));
        assert!(matches!(
            a_events.recv().await,
            Some(RoutingEvent::TreeParent { parent: None, .. })
        ));
        assert!(matches!(
            b_events.recv().await,
            Some(RoutingEvent::TreeParent {
                parent: Some(p), ..
            }) if p == node(1)
        ));
        assert!(matches!(
            a_events.recv().await,
            Some(RoutingEvent::TreeChildUp { child, .. }) if child == node(2)
        ));
    }

    #[tokio::test]
    async fn reannounce_takes_over_dead_root() {
        let mesh = Mesh::new();
        let (a, _a_events) = mesh.join(node(1));
        let (b, mut b_events) = mesh.join(node(2));

        let topic = TopicId::from_name("t");
        a.subscribe(topic).unwrap();
        b.subscribe(topic).unwrap();
        let _ = b_events.recv().await; // parent assignment

        mesh.disconnect(node(1));
        b.subscribe(topic).unwrap();

        assert_eq!(mesh.root(topic), Some(node(2)));
        assert!(matches!(
            b_events.recv().await,
            Some(RoutingEvent::TreeParent { parent: None, .. })
        ));
    }

    #[tokio::test]
    async fn publish_reaches_all_members() {
        let mesh = Mesh::new();
        let (a, mut a_events) = mesh.join(node(1));
        let (b, mut b_events) = mesh.join(node(2));

        let topic = TopicId::from_name("t");
        a.subscribe(topic).unwrap();
        b.subscribe(topic).unwrap();

        a.publish(topic, b"payload".to_vec()).unwrap();

        // Drain tree events until the publication arrives on both ends.
        for events in [&mut a_events, &mut b_events] {
            loop {
                match events.recv().await {
                    Some(RoutingEvent::Deliver { payload, .. }) => {
                        assert_eq!(payload, b"payload");
                        break;
                    }
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        }
    }
}
