//! Discovery nodes and the distance metric
//!
//! A node is identified by its Ed25519 public key. Distances are measured
//! between SHA3-256 hashes of node ids, so a lookup target is a [`Hash`]
//! rather than an id.

use crate::crypto::{sha3_256, PubKey};
use crate::network::discover::DiscoverError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Identity of a discovery node
pub type NodeId = PubKey;

/// Bits in a [`Hash`]
pub const HASH_BITS: usize = 256;

/// A 32-byte hash on the distance ring
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn of(data: &[u8]) -> Self {
        Hash(sha3_256(data))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, DiscoverError> {
        let bytes = hex::decode(s).map_err(|e| DiscoverError::InvalidNode(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DiscoverError::InvalidNode("hash must be 32 bytes".to_string()))?;
        Ok(Hash(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", &self.to_hex()[..8])
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash of a node id on the distance ring
pub fn id_hash(id: &NodeId) -> Hash {
    Hash::of(id.as_bytes())
}

/// Log distance: bit length of `a XOR b`, 0 when equal
pub fn log_dist(a: &Hash, b: &Hash) -> usize {
    let mut lz = 0;
    for (x, y) in a.0.iter().zip(b.0.iter()) {
        let d = x ^ y;
        if d == 0 {
            lz += 8;
        } else {
            lz += d.leading_zeros() as usize;
            break;
        }
    }
    HASH_BITS - lz
}

/// Compare the distances of `a` and `b` to `target`
pub fn dist_cmp(target: &Hash, a: &Hash, b: &Hash) -> Ordering {
    for i in 0..32 {
        let da = a.0[i] ^ target.0[i];
        let db = b.0[i] ^ target.0[i];
        match da.cmp(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// A random hash at log distance `d` from `a`
pub fn hash_at_distance(a: &Hash, d: usize) -> Hash {
    if d == 0 {
        return *a;
    }
    let mut b = *a;
    // Flip bit d-1 (counted from the least significant end)
    let pos = (HASH_BITS - d) / 8;
    let bit = 0x80u8 >> ((HASH_BITS - d) % 8);
    b.0[pos] ^= bit;
    // Randomise everything below it
    let low_mask = bit.wrapping_sub(1);
    let r: [u8; 32] = rand::random();
    b.0[pos] = (b.0[pos] & !low_mask) | (r[pos] & low_mask);
    for i in pos + 1..32 {
        b.0[i] = r[i];
    }
    b
}

/// A node on the discovery network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub ip: IpAddr,
    /// Discovery port
    pub udp: u16,
    /// Peer port
    pub tcp: u16,
    /// Hash of the id, cached
    pub sha: Hash,
}

impl Node {
    pub fn new(id: NodeId, ip: IpAddr, udp: u16, tcp: u16) -> Self {
        Self {
            id,
            ip,
            udp,
            tcp,
            sha: id_hash(&id),
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp)
    }

    pub fn endpoint(&self) -> RpcEndpoint {
        RpcEndpoint {
            ip: self.ip,
            udp: self.udp,
            tcp: self.tcp,
        }
    }

    pub fn to_rpc(&self) -> RpcNode {
        RpcNode {
            ip: self.ip,
            udp: self.udp,
            tcp: self.tcp,
            id: self.id,
        }
    }

    /// Whether the node can be contacted at all
    pub fn is_valid(&self) -> bool {
        !self.ip.is_unspecified() && !self.ip.is_multicast() && self.udp != 0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.udp_addr())?;
        if self.tcp != self.udp {
            write!(f, "?tcp={}", self.tcp)?;
        }
        Ok(())
    }
}

/// Parses `<hex id>@<ip>:<udp port>[?tcp=<port>]`
impl FromStr for Node {
    type Err = DiscoverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches("enode://");
        let (id, rest) = s
            .split_once('@')
            .ok_or_else(|| DiscoverError::InvalidNode(format!("missing '@' in {}", s)))?;
        let id = PubKey::from_hex(id).map_err(|e| DiscoverError::InvalidNode(e.to_string()))?;
        let (addr, tcp) = match rest.split_once("?tcp=") {
            Some((addr, tcp)) => (addr, Some(tcp)),
            None => (rest, None),
        };
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e: std::net::AddrParseError| DiscoverError::InvalidNode(e.to_string()))?;
        let tcp = match tcp {
            Some(port) => port
                .parse()
                .map_err(|e: std::num::ParseIntError| DiscoverError::InvalidNode(e.to_string()))?,
            None => addr.port(),
        };
        Ok(Node::new(id, addr.ip(), addr.port(), tcp))
    }
}

/// Endpoint as carried in ping and pong payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEndpoint {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
}

/// Node as carried in neighbors and topic-nodes payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcNode {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
    pub id: NodeId,
}

impl From<RpcNode> for Node {
    fn from(n: RpcNode) -> Self {
        Node::new(n.id, n.ip, n.udp, n.tcp)
    }
}

/// Nodes ordered by distance to a target, capped in length
#[derive(Debug, Clone)]
pub struct NodesByDistance {
    pub target: Hash,
    pub entries: Vec<Node>,
}

impl NodesByDistance {
    pub fn new(target: Hash) -> Self {
        Self {
            target,
            entries: Vec::new(),
        }
    }

    /// Insert `n` in order, keeping at most `max` entries
    pub fn push(&mut self, n: Node, max: usize) {
        let target = self.target;
        let idx = self
            .entries
            .partition_point(|e| dist_cmp(&target, &e.sha, &n.sha) != Ordering::Greater);
        if idx >= max {
            return;
        }
        self.entries.insert(idx, n);
        self.entries.truncate(max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;

    #[test]
    fn test_log_dist() {
        let a = Hash([0u8; 32]);
        assert_eq!(log_dist(&a, &a), 0);
        let mut b = a;
        b.0[31] = 1;
        assert_eq!(log_dist(&a, &b), 1);
        b.0[0] = 0x80;
        assert_eq!(log_dist(&a, &b), 256);
    }

    #[test]
    fn test_hash_at_distance() {
        let a = Hash::of(b"base");
        for d in [1, 7, 8, 9, 100, 255, 256] {
            let b = hash_at_distance(&a, d);
            assert_eq!(log_dist(&a, &b), d, "distance {}", d);
        }
        assert_eq!(hash_at_distance(&a, 0), a);
    }

    #[test]
    fn test_dist_cmp() {
        let target = Hash([0u8; 32]);
        let mut near = target;
        near.0[31] = 1;
        let mut far = target;
        far.0[0] = 1;
        assert_eq!(dist_cmp(&target, &near, &far), Ordering::Less);
        assert_eq!(dist_cmp(&target, &far, &near), Ordering::Greater);
        assert_eq!(dist_cmp(&target, &far, &far), Ordering::Equal);
    }

    #[test]
    fn test_parse_node() {
        let id = NodeKey::generate().pub_key();
        let node: Node = format!("{}@127.0.0.1:30303", id.to_hex()).parse().unwrap();
        assert_eq!(node.id, id);
        assert_eq!(node.udp, 30303);
        assert_eq!(node.tcp, 30303);

        let node: Node = format!("enode://{}@[::1]:30303?tcp=46656", id.to_hex()).parse().unwrap();
        assert_eq!(node.tcp, 46656);
        assert_eq!(node.to_string().parse::<Node>().unwrap(), node);

        assert!("nothex@1.2.3.4:1".parse::<Node>().is_err());
        assert!(format!("{}", id.to_hex()).parse::<Node>().is_err());
    }

    #[test]
    fn test_nodes_by_distance() {
        let target = Hash::of(b"target");
        let mut nodes = NodesByDistance::new(target);
        for _ in 0..40 {
            let n = Node::new(NodeKey::generate().pub_key(), "1.2.3.4".parse().unwrap(), 1, 1);
            nodes.push(n, 16);
        }
        assert_eq!(nodes.entries.len(), 16);
        for pair in nodes.entries.windows(2) {
            assert_ne!(dist_cmp(&target, &pair[0].sha, &pair[1].sha), Ordering::Greater);
        }
    }
}
