//! P2P configuration
//!
//! All options of the switch, the discovery service and the peer-exchange
//! reactor. Durations are written as whole seconds (or milliseconds for the
//! connection timers) in serialized form.

use crate::network::banscore::BanScoreConfig;
use crate::network::mconn::MConnConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:46656";
pub const DEFAULT_DATA_DIR: &str = ".p2p_data";
pub const NODE_KEY_FILE: &str = "node_key.txt";
pub const ADDR_BOOK_FILE: &str = "addrbook.json";

/// Node-wide p2p options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2PConfig {
    /// TCP `host:port` to accept peers on
    pub listen_addr: String,
    /// Comma-delimited bootstrap `host:port` list
    pub seeds: String,
    /// Inline hex key or path to the key file; empty for the default file
    pub node_key: String,
    pub skip_upnp: bool,
    /// Cap on inbound plus outbound peers
    pub max_num_peers: usize,
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,
    /// Skip the secret connection upgrade (testing only)
    pub auth_enc_disable: bool,
    pub pex_enable: bool,
    /// Reject non-routable addresses in the address book
    pub addrbook_strict: bool,
    pub chain_id: String,
    pub moniker: String,
    pub data_dir: PathBuf,
    /// UDP `host:port` for node discovery
    pub discovery_listen_addr: String,
    pub discovery_enable: bool,
    pub min_outbound_peers: usize,
    pub ban: BanScoreConfig,
    pub mconn: MConnConfig,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            seeds: String::new(),
            node_key: String::new(),
            skip_upnp: true,
            max_num_peers: 50,
            handshake_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(3),
            auth_enc_disable: false,
            pex_enable: true,
            addrbook_strict: true,
            chain_id: "mainnet".to_string(),
            moniker: "p2pnode".to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            discovery_listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            discovery_enable: true,
            min_outbound_peers: 10,
            ban: BanScoreConfig::default(),
            mconn: MConnConfig::default(),
        }
    }
}

impl P2PConfig {
    /// Seeds as a trimmed list, empty entries dropped
    pub fn seed_list(&self) -> Vec<String> {
        self.seeds
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn node_key_path(&self) -> PathBuf {
        self.data_dir.join(NODE_KEY_FILE)
    }

    pub fn addr_book_path(&self) -> PathBuf {
        self.data_dir.join(ADDR_BOOK_FILE)
    }

    pub fn ban_list_path(&self) -> PathBuf {
        self.data_dir.join(crate::network::banscore::BAN_LIST_FILE)
    }
}

/// Serde helpers for `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Serde helpers for `Duration` as milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_list() {
        let config = P2PConfig {
            seeds: " 1.2.3.4:46656, ,5.6.7.8:46657 ".to_string(),
            ..P2PConfig::default()
        };
        assert_eq!(config.seed_list(), vec!["1.2.3.4:46656", "5.6.7.8:46657"]);
        assert!(P2PConfig::default().seed_list().is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: P2PConfig =
            serde_json::from_str(r#"{"max_num_peers": 8, "dial_timeout": 5, "mconn": {"ping_interval": 1000}}"#)
                .unwrap();
        assert_eq!(config.max_num_peers, 8);
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.mconn.ping_interval, Duration::from_secs(1));
        assert_eq!(config.mconn.send_rate, 512_000);
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert!(config.pex_enable);
    }
}
