//! Kademlia routing table
//!
//! Buckets are indexed by the log distance between the hash of our id and
//! the hash of the node's id. Each bucket keeps its most recently seen
//! nodes at the front and a short list of replacements for when an entry
//! stops answering.

use crate::network::discover::node::{hash_at_distance, log_dist, Hash, Node, NodeId, NodesByDistance, HASH_BITS};
use rand::seq::SliceRandom;
use rand::Rng;

/// Kademlia bucket size
pub const BUCKET_SIZE: usize = 16;

pub const MAX_REPLACEMENTS: usize = 10;

/// Bucket 0 only ever matches our own id
pub const N_BUCKETS: usize = HASH_BITS + 1;

#[derive(Debug, Default, Clone)]
struct Bucket {
    entries: Vec<Node>,
    replacements: Vec<Node>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|n| n.id == *id)
    }

    fn add_replacement(&mut self, n: Node) {
        if self.replacements.iter().any(|r| r.id == n.id) {
            return;
        }
        self.replacements.insert(0, n);
        self.replacements.truncate(MAX_REPLACEMENTS);
    }
}

#[derive(Debug)]
pub struct Table {
    self_node: Node,
    buckets: Vec<Bucket>,
    count: usize,
}

impl Table {
    pub fn new(self_node: Node) -> Self {
        Self {
            self_node,
            buckets: vec![Bucket::default(); N_BUCKETS],
            count: 0,
        }
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bucket_index(&self, sha: &Hash) -> usize {
        log_dist(&self.self_node.sha, sha)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Whether the node is an entry or a replacement candidate
    pub fn knows(&self, id: &NodeId) -> bool {
        let sha = crate::network::discover::node::id_hash(id);
        let b = &self.buckets[self.bucket_index(&sha)];
        b.position(id).is_some() || b.replacements.iter().any(|r| r.id == *id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        let sha = crate::network::discover::node::id_hash(id);
        self.buckets[self.bucket_index(&sha)].entries.iter().find(|n| n.id == *id)
    }

    /// Add `n` as the most recently seen entry of its bucket. When the
    /// bucket is full, `n` becomes a replacement and the least recently
    /// seen entry is returned so that it can be contested.
    pub fn add(&mut self, n: Node) -> Option<Node> {
        if n.id == self.self_node.id {
            return None;
        }
        let b = &mut self.buckets[log_dist(&self.self_node.sha, &n.sha)];
        if let Some(pos) = b.position(&n.id) {
            b.entries.remove(pos);
            b.entries.insert(0, n);
            return None;
        }
        if b.entries.len() < BUCKET_SIZE {
            b.replacements.retain(|r| r.id != n.id);
            b.entries.insert(0, n);
            self.count += 1;
            return None;
        }
        b.add_replacement(n);
        b.entries.last().cloned()
    }

    /// Remove a node from its bucket and its replacement list
    pub fn delete(&mut self, id: &NodeId) -> bool {
        let sha = crate::network::discover::node::id_hash(id);
        let idx = self.bucket_index(&sha);
        let b = &mut self.buckets[idx];
        b.replacements.retain(|r| r.id != *id);
        match b.position(id) {
            Some(pos) => {
                b.entries.remove(pos);
                self.count -= 1;
                true
            }
            None => false,
        }
    }

    /// Remove a node and fill its slot with a random replacement
    pub fn delete_replace(&mut self, id: &NodeId) -> Option<Node> {
        if !self.delete(id) {
            return None;
        }
        let sha = crate::network::discover::node::id_hash(id);
        let idx = self.bucket_index(&sha);
        let b = &mut self.buckets[idx];
        if b.replacements.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..b.replacements.len());
        let r = b.replacements.remove(pick);
        b.entries.push(r.clone());
        self.count += 1;
        Some(r)
    }

    /// The `n` entries closest to `target`
    pub fn closest(&self, target: &Hash, n: usize) -> Vec<Node> {
        let mut result = NodesByDistance::new(*target);
        for b in &self.buckets {
            for e in &b.entries {
                result.push(e.clone(), n);
            }
        }
        result.entries
    }

    /// Up to `n` random entries
    pub fn read_random_nodes(&self, n: usize) -> Vec<Node> {
        let mut all: Vec<Node> = self.buckets.iter().flat_map(|b| b.entries.iter().cloned()).collect();
        all.shuffle(&mut rand::thread_rng());
        all.truncate(n);
        all
    }

    /// A random hash inside a random populated bucket, or far away when
    /// the table is empty
    pub fn choose_bucket_refresh_target(&self) -> Hash {
        let populated: Vec<usize> = (1..N_BUCKETS).filter(|i| !self.buckets[*i].entries.is_empty()).collect();
        let mut rng = rand::thread_rng();
        let dist = match populated.choose(&mut rng) {
            Some(d) => *d,
            None => rng.gen_range(HASH_BITS - 16..=HASH_BITS),
        };
        hash_at_distance(&self.self_node.sha, dist)
    }

    #[cfg(test)]
    fn bucket(&self, idx: usize) -> &[Node] {
        &self.buckets[idx].entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;

    fn node() -> Node {
        Node::new(NodeKey::generate().pub_key(), "10.0.0.1".parse().unwrap(), 30303, 46656)
    }

    /// A node that lands in bucket `idx` of `table`
    fn node_in_bucket(table: &Table, idx: usize) -> Node {
        loop {
            let n = node();
            if table.bucket_index(&n.sha) == idx {
                return n;
            }
        }
    }

    #[test]
    fn test_bucket_invariant() {
        let mut table = Table::new(node());
        for _ in 0..300 {
            table.add(node());
        }
        let mut total = 0;
        for idx in 0..N_BUCKETS {
            let bucket = table.bucket(idx);
            assert!(bucket.len() <= BUCKET_SIZE);
            for n in bucket {
                assert_eq!(table.bucket_index(&n.sha), idx);
            }
            total += bucket.len();
        }
        assert_eq!(total, table.len());
    }

    #[test]
    fn test_full_bucket_returns_contested() {
        let mut table = Table::new(node());
        let mut added = Vec::new();
        for _ in 0..BUCKET_SIZE {
            let n = node_in_bucket(&table, 256);
            assert!(table.add(n.clone()).is_none());
            added.push(n);
        }
        let extra = node_in_bucket(&table, 256);
        let contested = table.add(extra.clone()).unwrap();
        // The first one added is least recently seen
        assert_eq!(contested, added[0]);
        assert!(!table.contains(&extra.id));

        let replacement = table.delete_replace(&contested.id).unwrap();
        assert_eq!(replacement, extra);
        assert!(table.contains(&extra.id));
        assert!(!table.contains(&contested.id));
        assert_eq!(table.len(), BUCKET_SIZE);
    }

    #[test]
    fn test_re_add_moves_to_front() {
        let mut table = Table::new(node());
        let a = node_in_bucket(&table, 256);
        let b = node_in_bucket(&table, 256);
        table.add(a.clone());
        table.add(b.clone());
        assert_eq!(table.bucket(256)[0], b);
        table.add(a.clone());
        assert_eq!(table.bucket(256)[0], a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_self_not_added() {
        let me = node();
        let mut table = Table::new(me.clone());
        assert!(table.add(me).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_closest_and_random() {
        let mut table = Table::new(node());
        let nodes: Vec<Node> = (0..50).map(|_| node()).collect();
        for n in &nodes {
            table.add(n.clone());
        }
        let target = Hash::of(b"target");
        let closest = table.closest(&target, BUCKET_SIZE);
        assert_eq!(closest.len(), BUCKET_SIZE.min(table.len()));

        let mut brute: Vec<Node> = nodes.iter().filter(|n| table.contains(&n.id)).cloned().collect();
        brute.sort_by(|a, b| crate::network::discover::node::dist_cmp(&target, &a.sha, &b.sha));
        brute.truncate(BUCKET_SIZE);
        assert_eq!(closest, brute);

        let random = table.read_random_nodes(10);
        assert_eq!(random.len(), 10);
    }

    #[test]
    fn test_refresh_target_in_populated_bucket() {
        let mut table = Table::new(node());
        let n = node();
        table.add(n.clone());
        let target = table.choose_bucket_refresh_target();
        assert_eq!(table.bucket_index(&target), table.bucket_index(&n.sha));
    }
}
