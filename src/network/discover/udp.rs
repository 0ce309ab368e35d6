//! UDP transport for the discovery protocol

use crate::crypto::NodeKey;
use crate::network::discover::node::Hash;
use crate::network::discover::packet::{decode_packet, encode_packet, Decoded, Packet, MAX_PACKET_SIZE};
use crate::network::discover::DiscoverError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A verified packet and where it came from
#[derive(Debug)]
pub struct Ingress {
    pub from: SocketAddr,
    pub decoded: Decoded,
    /// The datagram as received
    pub raw: Vec<u8>,
}

/// Signs and sends packets on the discovery socket
pub struct Transport {
    socket: Arc<UdpSocket>,
    key: NodeKey,
    chain_id: String,
}

impl Transport {
    pub fn new(socket: Arc<UdpSocket>, key: NodeKey, chain_id: String) -> Self {
        Self { socket, key, chain_id }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Encode and send without waiting on the socket. Returns the packet hash
    /// and the encoded datagram.
    pub fn send(&self, to: SocketAddr, packet: &Packet) -> Result<(Hash, Vec<u8>), DiscoverError> {
        let (buf, hash) = encode_packet(&self.key, &self.chain_id, packet)?;
        log::trace!(">> {} to {}", packet.name(), to);
        self.socket.try_send_to(&buf, to)?;
        Ok((hash, buf))
    }
}

/// Read datagrams until `quit` flips; packets that fail to decode are dropped
pub fn spawn_reader(
    socket: Arc<UdpSocket>,
    chain_id: String,
    ingress: mpsc::Sender<Ingress>,
    mut quit: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            log::debug!("Discovery read error: {}", e);
                            continue;
                        }
                    };
                    let raw = buf[..n].to_vec();
                    match decode_packet(&raw, &chain_id) {
                        Ok(decoded) => {
                            log::trace!("<< {} from {}", decoded.packet.name(), from);
                            if ingress.send(Ingress { from, decoded, raw }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::debug!("Dropped discovery packet from {}: {}", from, e),
                    }
                }
            }
        }
        log::debug!("Discovery reader stopped");
    })
}
