//! Connected peers
//!
//! A [`Peer`] is a handshaken remote node: its [`NodeInfo`], the direction
//! of the connection and the multiplexed connection carrying the reactor
//! channels. The [`PeerSet`] indexes live peers by public key.

use crate::crypto::PubKey;
use crate::network::mconn::{ConnectionStatus, MConnError, MConnection};
use crate::network::netaddress::NetAddress;
use crate::network::node_info::NodeInfo;
use crate::network::switch::SwitchError;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A connected and handshaken peer
pub struct Peer {
    node_info: NodeInfo,
    /// Whether we dialed this peer
    outbound: bool,
    /// Address of the other end of the TCP connection
    remote_addr: NetAddress,
    mconn: MConnection,
}

impl Peer {
    pub(crate) fn new(node_info: NodeInfo, outbound: bool, remote_addr: NetAddress, mconn: MConnection) -> Self {
        Self {
            node_info,
            outbound,
            remote_addr,
            mconn,
        }
    }

    /// The peer's public key, which is also its key in the peer set
    pub fn id(&self) -> PubKey {
        self.node_info.pub_key
    }

    /// Hex id for logging
    pub fn key(&self) -> String {
        self.node_info.pub_key.to_hex()
    }

    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn remote_addr(&self) -> NetAddress {
        self.remote_addr
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip
    }

    /// Where the peer accepts connections.
    ///
    /// Outbound peers are reachable where we dialed them. For inbound peers
    /// the advertised port is paired with the observed IP.
    pub fn listen_addr(&self) -> Option<NetAddress> {
        if self.outbound {
            return Some(self.remote_addr);
        }
        let port = self.node_info.listen_port()?;
        Some(NetAddress::new(self.remote_addr.ip, port))
    }

    /// Queue a message, waiting for room up to the send timeout
    pub async fn send(&self, ch_id: u8, msg: Bytes) -> Result<(), MConnError> {
        self.mconn.send(ch_id, msg).await
    }

    /// Queue a message only if there is room now
    pub fn try_send(&self, ch_id: u8, msg: Bytes) -> Result<(), MConnError> {
        self.mconn.try_send(ch_id, msg)
    }

    pub fn can_send(&self, ch_id: u8) -> bool {
        self.mconn.can_send(ch_id)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.mconn.status()
    }

    pub(crate) fn start(&self) {
        self.mconn.start();
    }

    pub(crate) fn stop(&self) {
        self.mconn.stop();
    }

    pub fn is_running(&self) -> bool {
        !self.mconn.is_stopped()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.key())
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// Live peers keyed by public key
#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<PubKey, Arc<Peer>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer unless one with the same key is present
    pub async fn add(&self, peer: Arc<Peer>) -> Result<(), SwitchError> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&peer.id()) {
            return Err(SwitchError::DuplicatePeer(peer.key()));
        }
        peers.insert(peer.id(), peer);
        Ok(())
    }

    /// Remove and return the peer with `id`
    pub async fn remove(&self, id: &PubKey) -> Option<Arc<Peer>> {
        self.peers.write().await.remove(id)
    }

    pub async fn get(&self, id: &PubKey) -> Option<Arc<Peer>> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn has(&self, id: &PubKey) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Whether any peer is connected from `ip`
    pub async fn has_ip(&self, ip: &IpAddr) -> bool {
        self.peers.read().await.values().any(|p| p.remote_ip() == *ip)
    }

    pub async fn size(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Snapshot of all peers
    pub async fn list(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;
    use crate::network::mconn::{ChannelDescriptor, MConnConfig};
    use crate::network::node_info::ServiceFlags;

    fn peer(outbound: bool, remote: &str) -> Arc<Peer> {
        let (a, _b) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(a);
        let (inbound, _) = MConnection::inbound_queue();
        let mconn = MConnection::new(
            Box::new(r),
            Box::new(w),
            &[ChannelDescriptor::new(0x00, 1)],
            MConnConfig::default(),
            inbound,
            Box::new(|_| {}),
        );
        let info = NodeInfo {
            pub_key: NodeKey::generate().pub_key(),
            moniker: "peer".to_string(),
            network: "mainnet".to_string(),
            listen_addr: "0.0.0.0:46657".to_string(),
            version: "1.0.0".to_string(),
            genesis_hash: String::new(),
            best_height: 0,
            best_hash: String::new(),
            service_flags: ServiceFlags::FULL_NODE,
            other: Vec::new(),
        };
        Arc::new(Peer::new(info, outbound, remote.parse().unwrap(), mconn))
    }

    #[tokio::test]
    async fn test_listen_addr() {
        let inbound = peer(false, "8.8.8.8:50000");
        assert_eq!(inbound.listen_addr(), Some("8.8.8.8:46657".parse().unwrap()));
        let outbound = peer(true, "8.8.4.4:46656");
        assert_eq!(outbound.listen_addr(), Some("8.8.4.4:46656".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_peer_set() {
        let set = PeerSet::new();
        let p = peer(true, "1.2.3.4:46656");
        set.add(p.clone()).await.unwrap();
        assert!(matches!(set.add(p.clone()).await, Err(SwitchError::DuplicatePeer(_))));
        assert_eq!(set.size().await, 1);
        assert!(set.has(&p.id()).await);
        assert!(set.has_ip(&"1.2.3.4".parse().unwrap()).await);

        assert!(set.remove(&p.id()).await.is_some());
        assert!(set.list().await.is_empty());
        assert!(set.get(&p.id()).await.is_none());
    }
}
