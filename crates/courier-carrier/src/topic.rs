/// Per-topic routing state: one node of a topic's spanning tree.
///
/// Tracks the tree link (parent + ordered children), local subscribers,
/// per-branch delivery counts for the current report cycle, and the
/// capacity estimates learned from neighbor reports. Branches are keys
/// into the topic map, never owning references; the topic map owns every
/// topic instance.
use std::collections::HashMap;

use rand::Rng;

use crate::types::{ConnId, NodeId, TopicId};

/// A legal delivery target for a balanced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Branch {
    /// Deliver to a local subscriber.
    Local,
    /// Forward to a tree neighbor.
    Node(NodeId),
}

pub(crate) struct Topic {
    id: TopicId,
    self_id: NodeId,
    parent: Option<NodeId>,
    /// Tree children in attach order; selection ties resolve this way.
    children: Vec<NodeId>,
    /// Capacity last reported by each branch neighbor.
    capacity: HashMap<NodeId, u32>,
    /// Messages forwarded to each branch since the last cycle.
    delivered: HashMap<NodeId, u32>,
    /// Messages delivered locally since the last cycle.
    local_delivered: u32,
    /// Local subscriber connections in subscribe order.
    subscribers: Vec<ConnId>,
    max_capacity: u32,
    /// Monotonic publish sequence for this node's publishers.
    publish_seq: u64,
}

impl Topic {
    pub fn new(id: TopicId, self_id: NodeId, max_capacity: u32) -> Self {
        Self {
            id,
            self_id,
            parent: None,
            children: Vec::new(),
            capacity: HashMap::new(),
            delivered: HashMap::new(),
            local_delivered: 0,
            subscribers: Vec::new(),
            max_capacity,
            publish_seq: 0,
        }
    }

    pub fn id(&self) -> TopicId {
        self.id
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Reassign the tree parent. `None` makes the local node the root.
    pub fn reown(&mut self, parent: Option<NodeId>) {
        debug_assert_ne!(parent, Some(self.self_id), "node cannot parent itself");
        self.parent = parent;
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Attach a child branch. Returns false if already attached or the
    /// child is the local node.
    pub fn add_child(&mut self, node: NodeId) -> bool {
        if node == self.self_id || self.children.contains(&node) {
            return false;
        }
        self.children.push(node);
        true
    }

    /// Detach a child branch. Returns false if it was not attached.
    pub fn remove_child(&mut self, node: NodeId) -> bool {
        let Some(pos) = self.children.iter().position(|c| *c == node) else {
            return false;
        };
        self.children.remove(pos);
        self.capacity.remove(&node);
        self.delivered.remove(&node);
        true
    }

    /// Add a local subscriber. Idempotent per connection.
    pub fn subscribe_local(&mut self, conn: ConnId) -> bool {
        if self.subscribers.contains(&conn) {
            return false;
        }
        self.subscribers.push(conn);
        true
    }

    /// Remove a local subscriber. Returns false if absent.
    pub fn unsubscribe_local(&mut self, conn: ConnId) -> bool {
        let Some(pos) = self.subscribers.iter().position(|c| *c == conn) else {
            return false;
        };
        self.subscribers.remove(pos);
        true
    }

    pub fn subscribers(&self) -> &[ConnId] {
        &self.subscribers
    }

    /// Next publish sequence number for local publishers.
    pub fn next_publish_seq(&mut self) -> u64 {
        self.publish_seq += 1;
        self.publish_seq
    }

    /// Record a capacity estimate reported by a branch neighbor.
    pub fn set_capacity(&mut self, node: NodeId, capacity: u32) {
        self.capacity
            .insert(node, capacity.clamp(1, self.max_capacity));
    }

    /// Count one message forwarded to a branch (or delivered locally).
    pub fn count_delivery(&mut self, branch: Branch) {
        match branch {
            Branch::Local => self.local_delivered += 1,
            Branch::Node(node) => *self.delivered.entry(node).or_insert(0) += 1,
        }
    }

    /// All tree neighbors: parent (if any) followed by the children.
    fn branches(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.parent.into_iter().chain(self.children.iter().copied())
    }

    /// Assemble the capacity report for this cycle.
    ///
    /// One entry per tree neighbor; the advertised capacity shrinks with
    /// every message the branch absorbed since the last cycle, clipped
    /// to `[1, max_capacity]`.
    pub fn generate_report(&self) -> (Vec<NodeId>, Vec<u32>) {
        let mut ids = Vec::new();
        let mut caps = Vec::new();
        for node in self.branches() {
            let delivered = self.delivered.get(&node).copied().unwrap_or(0);
            ids.push(node);
            caps.push(self.advertised(delivered));
        }
        (ids, caps)
    }

    /// Reset the per-cycle delivery counters.
    pub fn cycle(&mut self) {
        self.delivered.clear();
        self.local_delivered = 0;
    }

    /// The capacity the local node contributes when it competes for a
    /// balanced delivery.
    fn local_capacity(&self) -> u32 {
        self.advertised(self.local_delivered)
    }

    fn advertised(&self, delivered: u32) -> u32 {
        self.max_capacity.saturating_sub(delivered).max(1)
    }

    /// Pick one delivery target for a balanced message, weighted by
    /// capacity. The branch the message arrived from is excluded; the
    /// local node competes only while it has subscribers. Cumulative
    /// scan, so equal weights resolve in insertion order.
    pub fn pick_branch<R: Rng>(&self, rng: &mut R, exclude: Option<NodeId>) -> Option<Branch> {
        let mut candidates: Vec<(Branch, u32)> = Vec::new();
        if !self.subscribers.is_empty() {
            candidates.push((Branch::Local, self.local_capacity()));
        }
        for node in self.branches() {
            if Some(node) == exclude {
                continue;
            }
            let weight = self.capacity.get(&node).copied().unwrap_or(1);
            candidates.push((Branch::Node(node), weight));
        }

        let total: u64 = candidates.iter().map(|(_, w)| *w as u64).sum();
        if total == 0 {
            return None;
        }
        let mut roll = rng.gen_range(0..total);
        for (branch, weight) in candidates {
            if roll < weight as u64 {
                return Some(branch);
            }
            roll -= weight as u64;
        }
        None
    }

    /// Whether this entry can be dropped from the topic map: nothing
    /// local listens, nothing hangs below, and the node is not the
    /// topic's rendez-vous.
    pub fn collectable(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty() && self.parent.is_some()
    }
}
