//! Inbound TCP listener
//!
//! Binds the listen address, works out the address peers should dial
//! (internal, or external through UPnP when enabled) and hands accepted
//! connections to the switch.

use crate::network::netaddress::NetAddress;
use crate::network::upnp::{self, PortMapping, Protocol};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};

pub struct Listener {
    listener: TcpListener,
    internal: NetAddress,
    external: Option<NetAddress>,
    mapping: Option<PortMapping>,
}

impl Listener {
    /// Bind `addr` (`host:port`); try a UPnP mapping unless `skip_upnp`
    pub async fn bind(addr: &str, skip_upnp: bool) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let internal = internal_address(bound);
        log::info!("Listening for peers on {} (internal {})", bound, internal);

        let mut mapping = None;
        if !skip_upnp && !bound.ip().is_loopback() {
            match upnp::map_port(Protocol::Tcp, bound.port()).await {
                Ok(m) => mapping = Some(m),
                Err(e) => log::info!("UPnP port mapping unavailable: {}", e),
            }
        }

        Ok(Self {
            listener,
            internal,
            external: mapping.map(|m| m.external),
            mapping,
        })
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn internal_address(&self) -> NetAddress {
        self.internal
    }

    pub fn external_address(&self) -> Option<NetAddress> {
        self.external
    }

    /// External address when mapped, internal otherwise
    pub fn best_address(&self) -> NetAddress {
        self.external.unwrap_or(self.internal)
    }

    pub fn port_mapping(&self) -> Option<PortMapping> {
        self.mapping
    }
}

/// Replace a wildcard bind IP with the LAN address
fn internal_address(bound: SocketAddr) -> NetAddress {
    if bound.ip().is_unspecified() {
        if let Some(ip) = upnp::local_ipv4() {
            return NetAddress::new(IpAddr::V4(ip), bound.port());
        }
    }
    NetAddress::from_socket_addr(bound)
}
