//! Blockchain P2P: the networking and node-discovery core of a blockchain daemon
//!
//! This crate provides:
//! - A password-protected keystore of chainkd extended keys
//! - Authenticated encrypted transport between peers
//! - Channel multiplexing with priorities and rate limits
//! - An address book of known peers
//! - Kademlia-style node discovery over signed UDP
//! - A switch that owns peer lifecycles and routes messages to reactors
//! - A peer-exchange reactor
//!
//! # Example
//!
//! ```no_run
//! use blockchain_p2p::crypto::NodeKey;
//! use blockchain_p2p::network::discover::{DiscoverConfig, Network};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DiscoverConfig {
//!     listen_addr: "0.0.0.0:46656".to_string(),
//!     ..DiscoverConfig::default()
//! };
//! let network = Network::listen(NodeKey::generate(), config).await?;
//! for node in network.read_random_nodes(10).await {
//!     println!("{}", node);
//! }
//! network.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod keystore;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use config::P2PConfig;
pub use crypto::{NodeKey, PubKey};
pub use keystore::{Hsm, KeyStoreError, XPrv, XPub};
pub use network::discover::{DiscoverConfig, Network};
pub use network::{AddrBook, NetAddress, PexReactor, Reactor, Switch, SwitchError};
