//! Discovery packet codec
//!
//! ```text
//! | "bytom disv" | sender id (32) | signature (65) | chain id (8) | type (1) | JSON payload |
//! ```
//!
//! The signature covers SHA-256 of everything after it. The packet hash
//! used as reply token is SHA-256 of the payload alone.

use crate::crypto::{sha256, NodeKey, PubKey, SIGNATURE_LEN};
use crate::network::discover::node::{Hash, NodeId, RpcEndpoint, RpcNode};
use crate::network::discover::topic::Topic;
use crate::network::discover::DiscoverError;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::sync::OnceLock;

// =============================================================================
// Constants
// =============================================================================

pub const PACKET_PREFIX: &[u8; 10] = b"bytom disv";
pub const CHAIN_ID_LEN: usize = 8;
pub const SIG_FIELD_LEN: usize = 65;
pub const MAX_PACKET_SIZE: usize = 1280;

const ID_OFFSET: usize = PACKET_PREFIX.len();
const SIG_OFFSET: usize = ID_OFFSET + 32;
const CHAIN_OFFSET: usize = SIG_OFFSET + SIG_FIELD_LEN;
const TYPE_OFFSET: usize = CHAIN_OFFSET + CHAIN_ID_LEN;
pub const HEADER_SIZE: usize = TYPE_OFFSET + 1;

/// Protocol version carried in pings
pub const PROTOCOL_VERSION: u32 = 4;

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub version: u32,
    pub from: RpcEndpoint,
    pub to: RpcEndpoint,
    pub expiration: u64,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Endpoint the ping was sent from, as seen by us
    pub to: RpcEndpoint,
    /// Hash of the ping being answered
    pub reply_tok: Hash,
    pub expiration: u64,
    /// Hash of the topics in the ping; zero when it carried none
    #[serde(default)]
    pub topic_hash: Hash,
    #[serde(default)]
    pub ticket_serial: u32,
    /// Seconds to wait before registering each topic
    #[serde(default)]
    pub wait_periods: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNode {
    pub target: NodeId,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeHash {
    pub target: Hash,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbors {
    pub nodes: Vec<RpcNode>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRegister {
    pub topics: Vec<Topic>,
    pub idx: u32,
    /// The complete pong packet that issued the ticket, hex encoded
    pub pong: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicQuery {
    pub topic: Topic,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicNodes {
    /// Hash of the query being answered
    pub echo: Hash,
    pub nodes: Vec<RpcNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
    FindNodeHash(FindNodeHash),
    TopicRegister(TopicRegister),
    TopicQuery(TopicQuery),
    TopicNodes(TopicNodes),
}

impl Packet {
    pub fn type_byte(&self) -> u8 {
        match self {
            Packet::Ping(_) => 1,
            Packet::Pong(_) => 2,
            Packet::FindNode(_) => 3,
            Packet::Neighbors(_) => 4,
            Packet::FindNodeHash(_) => 5,
            Packet::TopicRegister(_) => 6,
            Packet::TopicQuery(_) => 7,
            Packet::TopicNodes(_) => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Ping(_) => "ping",
            Packet::Pong(_) => "pong",
            Packet::FindNode(_) => "findnode",
            Packet::Neighbors(_) => "neighbors",
            Packet::FindNodeHash(_) => "findnode_hash",
            Packet::TopicRegister(_) => "topic_register",
            Packet::TopicQuery(_) => "topic_query",
            Packet::TopicNodes(_) => "topic_nodes",
        }
    }

    /// Expiration timestamp, for packets that carry one
    pub fn expiration(&self) -> Option<u64> {
        match self {
            Packet::Ping(p) => Some(p.expiration),
            Packet::Pong(p) => Some(p.expiration),
            Packet::FindNode(p) => Some(p.expiration),
            Packet::Neighbors(p) => Some(p.expiration),
            Packet::FindNodeHash(p) => Some(p.expiration),
            Packet::TopicQuery(p) => Some(p.expiration),
            Packet::TopicRegister(_) | Packet::TopicNodes(_) => None,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Packet::Ping(p) => serde_json::to_vec(p),
            Packet::Pong(p) => serde_json::to_vec(p),
            Packet::FindNode(p) => serde_json::to_vec(p),
            Packet::Neighbors(p) => serde_json::to_vec(p),
            Packet::FindNodeHash(p) => serde_json::to_vec(p),
            Packet::TopicRegister(p) => serde_json::to_vec(p),
            Packet::TopicQuery(p) => serde_json::to_vec(p),
            Packet::TopicNodes(p) => serde_json::to_vec(p),
        }
    }

    fn decode_payload(ptype: u8, payload: &[u8]) -> Result<Self, DiscoverError> {
        Ok(match ptype {
            1 => Packet::Ping(serde_json::from_slice(payload)?),
            2 => Packet::Pong(serde_json::from_slice(payload)?),
            3 => Packet::FindNode(serde_json::from_slice(payload)?),
            4 => Packet::Neighbors(serde_json::from_slice(payload)?),
            5 => Packet::FindNodeHash(serde_json::from_slice(payload)?),
            6 => Packet::TopicRegister(serde_json::from_slice(payload)?),
            7 => Packet::TopicQuery(serde_json::from_slice(payload)?),
            8 => Packet::TopicNodes(serde_json::from_slice(payload)?),
            other => return Err(DiscoverError::PacketType(other)),
        })
    }
}

/// A packet that passed decoding and signature verification
#[derive(Debug, Clone)]
pub struct Decoded {
    pub packet: Packet,
    pub from_id: NodeId,
    /// SHA-256 of the payload
    pub hash: Hash,
}

// =============================================================================
// Codec
// =============================================================================

/// ASCII chain id, zero padded or truncated to 8 bytes
pub fn chain_id_bytes(chain_id: &str) -> [u8; CHAIN_ID_LEN] {
    let mut out = [0u8; CHAIN_ID_LEN];
    let src = chain_id.as_bytes();
    let n = src.len().min(CHAIN_ID_LEN);
    out[..n].copy_from_slice(&src[..n]);
    out
}

/// Encode and sign `packet`. Returns the datagram and its hash.
pub fn encode_packet(key: &NodeKey, chain_id: &str, packet: &Packet) -> Result<(Vec<u8>, Hash), DiscoverError> {
    let payload = packet.encode_payload()?;
    let size = HEADER_SIZE + payload.len();
    if size > MAX_PACKET_SIZE {
        return Err(DiscoverError::PacketTooLarge(size));
    }

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(PACKET_PREFIX);
    buf.extend_from_slice(key.pub_key().as_bytes());
    buf.extend_from_slice(&[0u8; SIG_FIELD_LEN]);
    buf.extend_from_slice(&chain_id_bytes(chain_id));
    buf.push(packet.type_byte());
    buf.extend_from_slice(&payload);

    let sig = key.sign(&sha256(&buf[CHAIN_OFFSET..]));
    buf[SIG_OFFSET..SIG_OFFSET + SIGNATURE_LEN].copy_from_slice(&sig);

    Ok((buf, Hash(sha256(&payload))))
}

/// Decode a datagram and verify its signature against the sender id
pub fn decode_packet(buf: &[u8], chain_id: &str) -> Result<Decoded, DiscoverError> {
    if buf.len() < HEADER_SIZE {
        return Err(DiscoverError::PacketTooSmall);
    }
    if &buf[..ID_OFFSET] != PACKET_PREFIX {
        return Err(DiscoverError::BadPrefix);
    }
    if buf[CHAIN_OFFSET..TYPE_OFFSET] != chain_id_bytes(chain_id) {
        return Err(DiscoverError::ChainIdMismatch);
    }

    let from_id = NodeId::from_slice(&buf[ID_OFFSET..SIG_OFFSET]).map_err(|_| DiscoverError::BadSignature)?;
    let sig = &buf[SIG_OFFSET..SIG_OFFSET + SIGNATURE_LEN];
    if !from_id.verify(&sha256(&buf[CHAIN_OFFSET..]), sig) {
        return Err(DiscoverError::BadSignature);
    }

    let payload = &buf[HEADER_SIZE..];
    let packet = Packet::decode_payload(buf[TYPE_OFFSET], payload)?;
    Ok(Decoded {
        packet,
        from_id,
        hash: Hash(sha256(payload)),
    })
}

/// Number of nodes that always fit in one neighbors or topic-nodes packet
pub fn max_nodes_per_packet() -> usize {
    static MAX: OnceLock<usize> = OnceLock::new();
    *MAX.get_or_init(|| {
        // Worst case: full-width IPv6 addresses and five-digit ports
        let widest = RpcNode {
            ip: Ipv6Addr::from([0xffff; 8]).into(),
            udp: u16::MAX,
            tcp: u16::MAX,
            id: PubKey([0xff; 32]),
        };
        let node_len = serde_json::to_vec(&widest).map(|v| v.len()).unwrap_or(MAX_PACKET_SIZE);
        let envelope = Neighbors {
            nodes: Vec::new(),
            expiration: u64::MAX,
        };
        let envelope_len = serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(MAX_PACKET_SIZE);
        let room = MAX_PACKET_SIZE.saturating_sub(HEADER_SIZE + envelope_len);
        // One separator per node
        (room / (node_len + 1)).max(1)
    })
}

/// Split `nodes` into chunks that fit a single datagram each
pub fn chunk_nodes(nodes: &[RpcNode]) -> Vec<Vec<RpcNode>> {
    if nodes.is_empty() {
        return vec![Vec::new()];
    }
    nodes.chunks(max_nodes_per_packet()).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ping() -> Packet {
        Packet::Ping(Ping {
            version: 4,
            from: RpcEndpoint {
                ip: "127.0.0.1".parse().unwrap(),
                udp: 3322,
                tcp: 5544,
            },
            to: RpcEndpoint {
                ip: "::1".parse().unwrap(),
                udp: 2222,
                tcp: 3333,
            },
            expiration: 1136239445,
            topics: vec![Topic::from("test topic")],
        })
    }

    #[test]
    fn test_ping_codec() {
        let key = NodeKey::generate();
        let ping = test_ping();
        let (buf, hash) = encode_packet(&key, "wisdom", &ping).unwrap();

        let decoded = decode_packet(&buf, "wisdom").unwrap();
        assert_eq!(decoded.packet, ping);
        assert_eq!(decoded.from_id, key.pub_key());
        assert_eq!(decoded.hash, hash);

        assert!(matches!(decode_packet(&buf, "mainnet"), Err(DiscoverError::ChainIdMismatch)));

        let mut wrong_prefix = buf.clone();
        wrong_prefix[..10].copy_from_slice(b"eth discv\0");
        assert!(matches!(decode_packet(&wrong_prefix, "wisdom"), Err(DiscoverError::BadPrefix)));
    }

    #[test]
    fn test_reply_token_is_payload_hash() {
        let key = NodeKey::generate();
        let (buf, hash) = encode_packet(&key, "mainnet", &test_ping()).unwrap();
        assert_eq!(hash, Hash(sha256(&buf[HEADER_SIZE..])));
    }

    #[test]
    fn test_decode_errors() {
        let key = NodeKey::generate();
        assert!(matches!(decode_packet(&[0u8; 20], "mainnet"), Err(DiscoverError::PacketTooSmall)));

        let (mut buf, _) = encode_packet(&key, "mainnet", &test_ping()).unwrap();
        let last = buf.len() - 2;
        buf[last] ^= 0x01;
        assert!(matches!(decode_packet(&buf, "mainnet"), Err(DiscoverError::BadSignature)));

        // Re-sign an unknown type byte
        let (mut buf, _) = encode_packet(&key, "mainnet", &test_ping()).unwrap();
        buf[TYPE_OFFSET] = 42;
        let sig = key.sign(&sha256(&buf[CHAIN_OFFSET..]));
        buf[SIG_OFFSET..SIG_OFFSET + SIGNATURE_LEN].copy_from_slice(&sig);
        assert!(matches!(decode_packet(&buf, "mainnet"), Err(DiscoverError::PacketType(42))));
    }

    #[test]
    fn test_chain_id_padding() {
        assert_eq!(&chain_id_bytes("wisdom"), b"wisdom\0\0");
        assert_eq!(&chain_id_bytes("averylongchain"), b"averylon");
    }

    #[test]
    fn test_neighbors_chunks_fit() {
        let key = NodeKey::generate();
        let nodes: Vec<RpcNode> = (0..40u16)
            .map(|i| RpcNode {
                ip: "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap(),
                udp: 60000 + i,
                tcp: 60000 + i,
                id: NodeKey::generate().pub_key(),
            })
            .collect();
        let chunks = chunk_nodes(&nodes);
        assert!(chunks.len() > 1);
        let per = max_nodes_per_packet();
        for (i, chunk) in chunks.iter().enumerate() {
            if i + 1 < chunks.len() {
                assert_eq!(chunk.len(), per);
            }
            let packet = Packet::Neighbors(Neighbors {
                nodes: chunk.clone(),
                expiration: u64::MAX,
            });
            let (buf, _) = encode_packet(&key, "mainnet", &packet).unwrap();
            assert!(buf.len() <= MAX_PACKET_SIZE);
        }
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 40);
    }
}
