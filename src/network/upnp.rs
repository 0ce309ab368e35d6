//! Best-effort UPnP port mapping
//!
//! Maps the TCP listen port (and the UDP discovery port) on the local
//! gateway so peers behind a NAT can still be dialed. Every failure is
//! reported and the node simply keeps running with its internal address.

use crate::network::netaddress::NetAddress;
use igd_next::{search_gateway, PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// =============================================================================
// Constants
// =============================================================================

/// Lease requested for each mapping
const PORT_MAPPING_LEASE: u32 = 3600;

/// Mappings are refreshed before the lease runs out
const RENEWAL_INTERVAL: Duration = Duration::from_secs(50 * 60);

const MAPPING_DESCRIPTION: &str = "p2pnode";

/// How long to wait for a gateway to answer the search
const SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("UPnP gateway not found: {0}")]
    GatewayNotFound(String),
    #[error("Failed to get external IP: {0}")]
    ExternalIpError(String),
    #[error("Failed to add port mapping: {0}")]
    PortMappingError(String),
    #[error("No usable local IPv4 address")]
    InvalidLocalAddress,
    #[error("UPnP task failed: {0}")]
    TaskFailed(String),
}

/// Transport of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl From<Protocol> for PortMappingProtocol {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Tcp => PortMappingProtocol::TCP,
            Protocol::Udp => PortMappingProtocol::UDP,
        }
    }
}

/// A port mapped on the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub local: SocketAddrV4,
    /// Address other nodes should dial
    pub external: NetAddress,
}

fn search_options() -> SearchOptions {
    SearchOptions {
        timeout: Some(SEARCH_TIMEOUT),
        ..Default::default()
    }
}

fn add_mapping_blocking(protocol: Protocol, local: SocketAddrV4) -> Result<PortMapping, UpnpError> {
    let gateway = search_gateway(search_options()).map_err(|e| UpnpError::GatewayNotFound(e.to_string()))?;
    log::info!("Found UPnP gateway: {}", gateway.addr);

    let external_ip = gateway
        .get_external_ip()
        .map_err(|e| UpnpError::ExternalIpError(e.to_string()))?;

    gateway
        .add_port(
            protocol.into(),
            local.port(),
            SocketAddr::V4(local),
            PORT_MAPPING_LEASE,
            MAPPING_DESCRIPTION,
        )
        .map_err(|e| UpnpError::PortMappingError(e.to_string()))?;

    let external = NetAddress::new(external_ip, local.port());
    log::info!("Mapped {:?} port {} to {}", protocol, local, external);
    Ok(PortMapping {
        protocol,
        local,
        external,
    })
}

/// Map `port` of our LAN address on the gateway
pub async fn map_port(protocol: Protocol, port: u16) -> Result<PortMapping, UpnpError> {
    let local_ip = local_ipv4().ok_or(UpnpError::InvalidLocalAddress)?;
    let local = SocketAddrV4::new(local_ip, port);
    tokio::task::spawn_blocking(move || add_mapping_blocking(protocol, local))
        .await
        .map_err(|e| UpnpError::TaskFailed(e.to_string()))?
}

/// Remove a mapping; failures are only logged
pub async fn unmap_port(mapping: PortMapping) {
    let result = tokio::task::spawn_blocking(move || {
        let gateway = search_gateway(search_options()).map_err(|e| e.to_string())?;
        gateway
            .remove_port(mapping.protocol.into(), mapping.local.port())
            .map_err(|e| e.to_string())
    })
    .await;
    match result {
        Ok(Ok(())) => log::info!("Removed UPnP mapping for {}", mapping.local),
        Ok(Err(e)) => log::debug!("Failed to remove UPnP mapping: {}", e),
        Err(e) => log::debug!("UPnP removal task failed: {}", e),
    }
}

/// Keep a mapping alive until `shutdown` flips, then remove it
pub fn spawn_renewal(mapping: PortMapping, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RENEWAL_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let renewed = tokio::task::spawn_blocking(move || add_mapping_blocking(mapping.protocol, mapping.local)).await;
                    match renewed {
                        Ok(Ok(_)) => log::debug!("Renewed UPnP mapping for {}", mapping.local),
                        Ok(Err(e)) => log::warn!("Failed to renew UPnP mapping: {}", e),
                        Err(e) => log::warn!("UPnP renewal task failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        unmap_port(mapping).await;
    })
}

/// Our LAN IPv4 address, found by routing a UDP socket. Nothing is sent.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_conversion() {
        assert!(matches!(PortMappingProtocol::from(Protocol::Tcp), PortMappingProtocol::TCP));
        assert!(matches!(PortMappingProtocol::from(Protocol::Udp), PortMappingProtocol::UDP));
    }

    #[test]
    fn test_local_ipv4() {
        // Unavailable without a route; only check what comes back
        if let Some(ip) = local_ipv4() {
            assert!(!ip.is_unspecified());
            assert!(!ip.is_loopback());
        }
    }
}
