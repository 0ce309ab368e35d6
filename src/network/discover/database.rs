//! Node database
//!
//! Remembers every node the discovery loop has talked to: its endpoint,
//! when it last answered a ping and how often find-node queries to it
//! failed. Seeds for the routing table come from here.

use crate::network::discover::node::{Node, NodeId};
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// Nodes that have not answered for this long are forgotten
pub const NODE_EXPIRY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
struct Entry {
    node: Node,
    added: u64,
    last_ping: Option<u64>,
    last_pong: Option<u64>,
    find_fails: u32,
}

#[derive(Debug)]
pub struct NodeDb {
    self_id: NodeId,
    entries: HashMap<NodeId, Entry>,
}

impl NodeDb {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or refresh the endpoint of a node
    pub fn update_node(&mut self, node: &Node, now: u64) {
        if node.id == self.self_id {
            return;
        }
        self.entries
            .entry(node.id)
            .and_modify(|e| e.node = node.clone())
            .or_insert_with(|| Entry {
                node: node.clone(),
                added: now,
                last_ping: None,
                last_pong: None,
                find_fails: 0,
            });
    }

    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.entries.get(id).map(|e| e.node.clone())
    }

    pub fn delete_node(&mut self, id: &NodeId) {
        self.entries.remove(id);
    }

    pub fn last_ping(&self, id: &NodeId) -> Option<u64> {
        self.entries.get(id).and_then(|e| e.last_ping)
    }

    pub fn update_last_ping(&mut self, id: &NodeId, now: u64) {
        if let Some(e) = self.entries.get_mut(id) {
            e.last_ping = Some(now);
        }
    }

    pub fn last_pong(&self, id: &NodeId) -> Option<u64> {
        self.entries.get(id).and_then(|e| e.last_pong)
    }

    pub fn update_last_pong(&mut self, id: &NodeId, now: u64) {
        if let Some(e) = self.entries.get_mut(id) {
            e.last_pong = Some(now);
        }
    }

    pub fn find_fails(&self, id: &NodeId) -> u32 {
        self.entries.get(id).map_or(0, |e| e.find_fails)
    }

    pub fn update_find_fails(&mut self, id: &NodeId, fails: u32) {
        if let Some(e) = self.entries.get_mut(id) {
            e.find_fails = fails;
        }
    }

    /// Up to `n` random nodes that answered a ping within `max_age` seconds
    pub fn query_seeds(&self, n: usize, max_age: u64, now: u64) -> Vec<Node> {
        let cutoff = now.saturating_sub(max_age);
        let mut seeds: Vec<Node> = self
            .entries
            .values()
            .filter(|e| e.last_pong.map_or(false, |t| t >= cutoff))
            .map(|e| e.node.clone())
            .collect();
        seeds.shuffle(&mut rand::thread_rng());
        seeds.truncate(n);
        seeds
    }

    /// Forget nodes not heard from in [`NODE_EXPIRY_SECS`]; returns how many
    pub fn expire(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(NODE_EXPIRY_SECS);
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_pong.unwrap_or(e.added) >= cutoff);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;

    fn node() -> Node {
        Node::new(NodeKey::generate().pub_key(), "10.0.0.1".parse().unwrap(), 30303, 46656)
    }

    #[test]
    fn test_update_and_query() {
        let me = node();
        let mut db = NodeDb::new(me.id);
        db.update_node(&me, 0);
        assert!(db.is_empty());

        let fresh = node();
        let stale = node();
        let silent = node();
        for n in [&fresh, &stale, &silent] {
            db.update_node(n, 0);
        }
        db.update_last_pong(&fresh.id, 1000);
        db.update_last_pong(&stale.id, 10);

        let seeds = db.query_seeds(30, 500, 1000);
        assert_eq!(seeds, vec![fresh.clone()]);
        assert_eq!(db.last_pong(&fresh.id), Some(1000));
        assert_eq!(db.last_pong(&silent.id), None);
    }

    #[test]
    fn test_find_fails() {
        let mut db = NodeDb::new(node().id);
        let n = node();
        db.update_node(&n, 0);
        assert_eq!(db.find_fails(&n.id), 0);
        db.update_find_fails(&n.id, 3);
        assert_eq!(db.find_fails(&n.id), 3);
        db.delete_node(&n.id);
        assert!(db.node(&n.id).is_none());
    }

    #[test]
    fn test_expire() {
        let mut db = NodeDb::new(node().id);
        let old = node();
        let alive = node();
        db.update_node(&old, 0);
        db.update_node(&alive, 0);
        db.update_last_pong(&alive.id, NODE_EXPIRY_SECS);
        assert_eq!(db.expire(NODE_EXPIRY_SECS + 10), 1);
        assert!(db.node(&alive.id).is_some());
        assert!(db.node(&old.id).is_none());
    }
}
