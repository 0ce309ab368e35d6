//! Node information exchanged after the secret handshake
//!
//! Each side sends its [`NodeInfo`] as a big-endian `u32` length followed by
//! JSON. The remote info is then checked against ours before the peer is
//! admitted.

use crate::crypto::PubKey;
use crate::network::netaddress::NetAddress;
use crate::network::switch::SwitchError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted encoded node info
pub const MAX_NODE_INFO_SIZE: usize = 10240;

bitflags::bitflags! {
    /// Services offered by a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServiceFlags: u64 {
        /// Serves the full block history
        const FULL_NODE = 1 << 0;
        /// Serves fast-sync headers
        const FAST_SYNC = 1 << 1;
        /// Serves compact block filters
        const SPV_FILTER = 1 << 2;
    }
}

impl Serialize for ServiceFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for ServiceFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Unknown bits from newer peers are ignored
        Ok(ServiceFlags::from_bits_truncate(u64::deserialize(deserializer)?))
    }
}

/// Decides whether a remote version string can talk to ours
pub type VersionCheck = fn(ours: &str, theirs: &str) -> bool;

/// What a node tells its peers about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub pub_key: PubKey,
    pub moniker: String,
    /// Chain id of the network the node is on
    pub network: String,
    /// `host:port` the node accepts connections on
    pub listen_addr: String,
    pub version: String,
    /// Hex hash of the genesis block
    pub genesis_hash: String,
    pub best_height: u64,
    pub best_hash: String,
    pub service_flags: ServiceFlags,
    #[serde(default)]
    pub other: Vec<String>,
}

impl NodeInfo {
    /// Check that a peer with `other` info may join us
    pub fn compatible_with(&self, other: &NodeInfo, is_compatible_version: VersionCheck) -> Result<(), SwitchError> {
        if !is_compatible_version(&self.version, &other.version) {
            return Err(SwitchError::VersionMismatch {
                ours: self.version.clone(),
                theirs: other.version.clone(),
            });
        }
        if self.network != other.network {
            return Err(SwitchError::NetworkMismatch {
                ours: self.network.clone(),
                theirs: other.network.clone(),
            });
        }
        if self.genesis_hash != other.genesis_hash {
            return Err(SwitchError::GenesisMismatch);
        }
        Ok(())
    }

    /// The advertised listen address, if it parses
    pub fn listen_net_address(&self) -> Option<NetAddress> {
        self.listen_addr.parse().ok()
    }

    /// Port part of the advertised listen address
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_net_address().map(|addr| addr.port)
    }
}

/// Versions are compatible when their major components match
pub fn major_version_compatible(ours: &str, theirs: &str) -> bool {
    let major = |v: &str| v.trim_start_matches('v').split('.').next().map(str::to_owned);
    match (major(ours), major(theirs)) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

async fn write_node_info<W: AsyncWrite + Unpin>(writer: &mut W, info: &NodeInfo) -> Result<(), SwitchError> {
    let body = serde_json::to_vec(info)?;
    if body.len() > MAX_NODE_INFO_SIZE {
        return Err(SwitchError::InvalidNodeInfo(format!("{} bytes exceeds limit", body.len())));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_node_info<R: AsyncRead + Unpin>(reader: &mut R) -> Result<NodeInfo, SwitchError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_NODE_INFO_SIZE {
        return Err(SwitchError::InvalidNodeInfo(format!("{} bytes exceeds limit", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Send ours and receive theirs concurrently
pub async fn exchange_node_info<R, W>(reader: &mut R, writer: &mut W, ours: &NodeInfo) -> Result<NodeInfo, SwitchError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (_, theirs) = tokio::try_join!(write_node_info(writer, ours), read_node_info(reader))?;
    Ok(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;

    fn info(network: &str, version: &str) -> NodeInfo {
        NodeInfo {
            pub_key: NodeKey::generate().pub_key(),
            moniker: "test".to_string(),
            network: network.to_string(),
            listen_addr: "127.0.0.1:46656".to_string(),
            version: version.to_string(),
            genesis_hash: "00ff".to_string(),
            best_height: 10,
            best_hash: "aa".to_string(),
            service_flags: ServiceFlags::FULL_NODE,
            other: Vec::new(),
        }
    }

    #[test]
    fn test_major_version() {
        assert!(major_version_compatible("1.0.2", "1.3.0"));
        assert!(major_version_compatible("v1.0.0", "1.9"));
        assert!(!major_version_compatible("1.0.0", "2.0.0"));
        assert!(!major_version_compatible("", "1.0.0"));
    }

    #[test]
    fn test_compatibility_gate() {
        let ours = info("mainnet", "1.0.0");
        assert!(ours.compatible_with(&info("mainnet", "1.1.0"), major_version_compatible).is_ok());
        assert!(matches!(
            ours.compatible_with(&info("mainnet", "2.0.0"), major_version_compatible),
            Err(SwitchError::VersionMismatch { .. })
        ));
        assert!(matches!(
            ours.compatible_with(&info("wisdom", "1.0.0"), major_version_compatible),
            Err(SwitchError::NetworkMismatch { .. })
        ));

        let mut other_genesis = info("mainnet", "1.0.0");
        other_genesis.genesis_hash = "0011".to_string();
        assert!(matches!(
            ours.compatible_with(&other_genesis, major_version_compatible),
            Err(SwitchError::GenesisMismatch)
        ));
    }

    #[test]
    fn test_service_flags_json() {
        let flags = ServiceFlags::FULL_NODE | ServiceFlags::FAST_SYNC;
        assert_eq!(serde_json::to_string(&flags).unwrap(), "3");
        let parsed: ServiceFlags = serde_json::from_str("259").unwrap();
        assert_eq!(parsed, ServiceFlags::FULL_NODE | ServiceFlags::FAST_SYNC);
    }

    #[tokio::test]
    async fn test_exchange() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);
        let info_a = info("mainnet", "1.0.0");
        let info_b = info("mainnet", "1.0.1");

        let (got_b, got_a) = tokio::join!(
            exchange_node_info(&mut ar, &mut aw, &info_a),
            exchange_node_info(&mut br, &mut bw, &info_b)
        );
        assert_eq!(got_b.unwrap(), info_b);
        assert_eq!(got_a.unwrap(), info_a);
    }

    #[tokio::test]
    async fn test_oversized_info_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let (_, mut aw) = tokio::io::split(a);
        let (mut br, _) = tokio::io::split(b);
        aw.write_u32(MAX_NODE_INFO_SIZE as u32 + 1).await.unwrap();
        assert!(matches!(read_node_info(&mut br).await, Err(SwitchError::InvalidNodeInfo(_))));
    }
}
