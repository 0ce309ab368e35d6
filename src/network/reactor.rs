//! Reactors
//!
//! A reactor owns one or more channels of every peer connection. The switch
//! tells it when peers come and go and hands it every message received on
//! its channels.

use crate::network::peer::Peer;
use crate::network::switch::{Switch, SwitchError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};

pub use crate::network::mconn::ChannelDescriptor;

#[async_trait]
pub trait Reactor: Send + Sync {
    /// Channels this reactor owns on every connection
    fn get_channels(&self) -> Vec<ChannelDescriptor>;

    /// Called once when the reactor is registered
    fn set_switch(&self, _switch: Weak<Switch>) {}

    async fn start(&self) -> Result<(), SwitchError> {
        Ok(())
    }

    async fn stop(&self) {}

    /// A peer passed the handshake; its connection is not started yet
    async fn add_peer(&self, _peer: &Arc<Peer>) -> Result<(), SwitchError> {
        Ok(())
    }

    async fn remove_peer(&self, _peer: &Arc<Peer>, _reason: &str) {}

    /// A complete message arrived on one of our channels
    async fn receive(&self, ch_id: u8, peer: &Arc<Peer>, msg: Bytes);
}
