//! Node discovery
//!
//! A Kademlia-style DHT over signed UDP datagrams. One task owns the routing
//! table and every node's state; the [`Network`] handle talks to it through
//! request channels.

pub mod database;
pub mod net;
pub mod node;
pub mod packet;
pub mod table;
pub mod ticket;
pub mod topic;
pub mod udp;

pub use net::{DiscoverConfig, Network, NodeState};
pub use node::{Hash, Node, NodeId};
pub use topic::Topic;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("Packet too small")]
    PacketTooSmall,
    #[error("Packet of {0} bytes exceeds the datagram limit")]
    PacketTooLarge(usize),
    #[error("Bad packet prefix")]
    BadPrefix,
    #[error("Chain id mismatch")]
    ChainIdMismatch,
    #[error("Unknown packet type {0}")]
    PacketType(u8),
    #[error("Bad packet signature")]
    BadSignature,
    #[error("Packet expired")]
    Expired,
    #[error("Reply without a matching query")]
    NoQuery,
    #[error("Packet from an unexpected address")]
    WrongAddress,
    #[error("Packet from an unknown node")]
    UnknownNode,
    #[error("Invalid node: {0}")]
    InvalidNode(String),
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),
    #[error("Discovery stopped")]
    Closed,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Seconds since the unix epoch
pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
