//! P2P Networking module
//!
//! Peer connections and node discovery for the daemon.
//!
//! # Features
//! - Authenticated, encrypted peer connections
//! - Multiplexed channels with flow control
//! - Address book with new/tried buckets
//! - Kademlia-style UDP discovery with topic advertisement
//! - Peer exchange
//! - Peer scoring and banning

pub mod addrbook;
pub mod banscore;
pub mod discover;
pub mod known_address;
pub mod listener;
pub mod mconn;
pub mod netaddress;
pub mod node_info;
pub mod peer;
pub mod pex;
pub mod reactor;
pub mod secret_conn;
pub mod switch;
pub mod upnp;

pub use addrbook::{AddrBook, AddrBookError, SharedAddrBook};
pub use banscore::{BanList, BanScoreConfig, DynamicBanScore};
pub use mconn::{ChannelDescriptor, MConnConfig, MConnError, MConnection};
pub use netaddress::NetAddress;
pub use node_info::{NodeInfo, ServiceFlags};
pub use peer::Peer;
pub use pex::PexReactor;
pub use reactor::Reactor;
pub use secret_conn::{SecretConnError, SecretConnection};
pub use switch::{Switch, SwitchError};
