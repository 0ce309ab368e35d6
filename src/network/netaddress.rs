//! Network addresses of peers
//!
//! A [`NetAddress`] is an IP and TCP port. Besides parsing and dialing it
//! classifies the IP against the reserved ranges so the address book can
//! reject unroutable peers and group related addresses together.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;

/// An IP:port endpoint of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
}

fn in_v4(ip: &Ipv4Addr, net: [u8; 4], bits: u32) -> bool {
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    (u32::from(*ip) & mask) == (u32::from(Ipv4Addr::from(net)) & mask)
}

fn in_v6(ip: &Ipv6Addr, net: [u16; 8], bits: u32) -> bool {
    let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
    let net = Ipv6Addr::new(net[0], net[1], net[2], net[3], net[4], net[5], net[6], net[7]);
    (u128::from(*ip) & mask) == (u128::from(net) & mask)
}

fn mask_v4(ip: Ipv4Addr, bits: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & (u32::MAX << (32 - bits)))
}

fn mask_v6(ip: Ipv6Addr, bits: u32) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(ip) & (u128::MAX << (128 - bits)))
}

impl NetAddress {
    /// Create an address; IPv4-mapped IPv6 addresses are stored as IPv4
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self { ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Resolve a `host:port` string, using DNS when the host is a name
    pub async fn resolve(addr: &str) -> io::Result<Self> {
        if let Ok(parsed) = addr.parse::<NetAddress>() {
            return Ok(parsed);
        }
        tokio::net::lookup_host(addr)
            .await?
            .next()
            .map(Self::from_socket_addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", addr)))
    }

    /// Resolve many addresses, skipping the ones that fail
    pub async fn resolve_many(addrs: &[String]) -> Vec<Self> {
        let mut out = Vec::with_capacity(addrs.len());
        for addr in addrs {
            match Self::resolve(addr).await {
                Ok(na) => out.push(na),
                Err(e) => log::warn!("Failed to resolve address {}: {}", addr, e),
            }
        }
        out
    }

    /// Open a TCP connection to this address
    pub async fn dial_timeout(&self, timeout: Duration) -> io::Result<TcpStream> {
        match tokio::time::timeout(timeout, TcpStream::connect(self.to_socket_addr())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("dial {} timed out", self))),
        }
    }

    /// The zero address, used as "no address"
    pub fn is_nil(&self) -> bool {
        self.ip.is_unspecified() && self.port == 0
    }

    fn v4(&self) -> Option<Ipv4Addr> {
        match self.ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    }

    fn v6(&self) -> Option<Ipv6Addr> {
        match self.ip {
            IpAddr::V6(v6) => Some(v6),
            IpAddr::V4(_) => None,
        }
    }

    fn v4_in(&self, net: [u8; 4], bits: u32) -> bool {
        self.v4().map_or(false, |ip| in_v4(&ip, net, bits))
    }

    fn v6_in(&self, net: [u16; 8], bits: u32) -> bool {
        self.v6().map_or(false, |ip| in_v6(&ip, net, bits))
    }

    /// Private IPv4 ranges (10/8, 172.16/12, 192.168/16)
    pub fn rfc1918(&self) -> bool {
        self.v4_in([10, 0, 0, 0], 8) || self.v4_in([172, 16, 0, 0], 12) || self.v4_in([192, 168, 0, 0], 16)
    }

    /// Benchmarking network 198.18/15
    pub fn rfc2544(&self) -> bool {
        self.v4_in([198, 18, 0, 0], 15)
    }

    /// IPv6 documentation range 2001:db8::/32
    pub fn rfc3849(&self) -> bool {
        self.v6_in([0x2001, 0x0db8, 0, 0, 0, 0, 0, 0], 32)
    }

    /// IPv4 link-local 169.254/16
    pub fn rfc3927(&self) -> bool {
        self.v4_in([169, 254, 0, 0], 16)
    }

    /// 6to4 tunnels 2002::/16
    pub fn rfc3964(&self) -> bool {
        self.v6_in([0x2002, 0, 0, 0, 0, 0, 0, 0], 16)
    }

    /// Unique local IPv6 fc00::/7
    pub fn rfc4193(&self) -> bool {
        self.v6_in([0xfc00, 0, 0, 0, 0, 0, 0, 0], 7)
    }

    /// Teredo tunnels 2001::/32
    pub fn rfc4380(&self) -> bool {
        self.v6_in([0x2001, 0, 0, 0, 0, 0, 0, 0], 32)
    }

    /// ORCHID 2001:10::/28
    pub fn rfc4843(&self) -> bool {
        self.v6_in([0x2001, 0x0010, 0, 0, 0, 0, 0, 0], 28)
    }

    /// IPv6 link-local fe80::/64
    pub fn rfc4862(&self) -> bool {
        self.v6_in([0xfe80, 0, 0, 0, 0, 0, 0, 0], 64)
    }

    /// IPv4 documentation ranges (TEST-NET-1/2/3)
    pub fn rfc5737(&self) -> bool {
        self.v4_in([192, 0, 2, 0], 24) || self.v4_in([198, 51, 100, 0], 24) || self.v4_in([203, 0, 113, 0], 24)
    }

    /// IPv4-embedded IPv6 64:ff9b::/96
    pub fn rfc6052(&self) -> bool {
        self.v6_in([0x64, 0xff9b, 0, 0, 0, 0, 0, 0], 96)
    }

    /// IPv4-translated IPv6 ::ffff:0:0:0/96
    pub fn rfc6145(&self) -> bool {
        self.v6_in([0, 0, 0, 0, 0xffff, 0, 0, 0], 96)
    }

    /// Carrier-grade NAT 100.64/10
    pub fn rfc6598(&self) -> bool {
        self.v4_in([100, 64, 0, 0], 10)
    }

    /// Deprecated 6bone 3ffe::/16
    pub fn six_bone(&self) -> bool {
        self.v6_in([0x3ffe, 0, 0, 0, 0, 0, 0, 0], 16)
    }

    /// Hurricane Electric 2001:470::/32
    pub fn he_net(&self) -> bool {
        self.v6_in([0x2001, 0x0470, 0, 0, 0, 0, 0, 0], 32)
    }

    /// Loopback or the 0.0.0.0/8 block
    pub fn is_local(&self) -> bool {
        self.ip.is_loopback() || self.v4_in([0, 0, 0, 0], 8)
    }

    /// Whether the address could ever be dialed
    pub fn is_valid(&self) -> bool {
        !(self.ip.is_unspecified() || self.rfc3849() || self.ip == IpAddr::V4(Ipv4Addr::BROADCAST))
    }

    /// Whether the address is reachable over the public internet
    pub fn is_routable(&self) -> bool {
        self.is_valid()
            && !(self.rfc1918()
                || self.rfc2544()
                || self.rfc3927()
                || self.rfc4862()
                || self.rfc4193()
                || self.rfc4843()
                || self.rfc5737()
                || self.rfc6598()
                || self.is_local())
    }

    /// The network group used for bucketing related addresses
    ///
    /// IPv4 groups by /16; IPv6 by /32 (/36 for HE.net); tunnelled
    /// addresses group by their embedded IPv4 address.
    pub fn group_key(&self, routability_strict: bool) -> String {
        if routability_strict && self.is_local() {
            return "local".to_string();
        }
        if routability_strict && !self.is_routable() {
            return "unroutable".to_string();
        }

        let v6 = match self.ip {
            IpAddr::V4(v4) => return format!("{}/16", mask_v4(v4, 16)),
            IpAddr::V6(v6) => v6,
        };
        let octets = v6.octets();

        if self.rfc6145() || self.rfc6052() {
            let embedded = Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]);
            return format!("{}/16", mask_v4(embedded, 16));
        }
        if self.rfc3964() {
            let embedded = Ipv4Addr::new(octets[2], octets[3], octets[4], octets[5]);
            return format!("{}/16", mask_v4(embedded, 16));
        }
        if self.rfc4380() {
            // Teredo carries the client IPv4 address xored with 0xff
            let embedded = Ipv4Addr::new(
                octets[12] ^ 0xff,
                octets[13] ^ 0xff,
                octets[14] ^ 0xff,
                octets[15] ^ 0xff,
            );
            return format!("{}/16", mask_v4(embedded, 16));
        }
        if self.six_bone() {
            return format!("{}/32", mask_v6(v6, 32));
        }

        let bits = if self.he_net() { 36 } else { 32 };
        format!("{}/{}", mask_v6(v6, bits), bits)
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl FromStr for NetAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<SocketAddr>().map(Self::from_socket_addr)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let a = addr("1.2.3.4:46656");
        assert_eq!(a.ip, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(a.port, 46656);
        assert_eq!(a.to_string(), "1.2.3.4:46656");

        let v6 = addr("[2001:db8::1]:80");
        assert_eq!(v6.to_string(), "[2001:db8::1]:80");

        assert!("not an address".parse::<NetAddress>().is_err());
    }

    #[test]
    fn test_mapped_ipv4_is_canonical() {
        let mapped = addr("[::ffff:1.2.3.4]:1");
        assert_eq!(mapped, addr("1.2.3.4:1"));
    }

    #[test]
    fn test_routability() {
        assert!(addr("8.8.8.8:1").is_routable());
        assert!(!addr("127.0.0.1:1").is_routable());
        assert!(!addr("10.1.2.3:1").is_routable());
        assert!(!addr("192.168.1.1:1").is_routable());
        assert!(!addr("169.254.1.1:1").is_routable());
        assert!(!addr("100.64.0.1:1").is_routable());
        assert!(!addr("0.0.0.0:1").is_valid());
        assert!(!addr("255.255.255.255:1").is_valid());
        assert!(!addr("[2001:db8::1]:1").is_valid());
        assert!(!addr("[fe80::1]:1").is_routable());
        assert!(!addr("[fc00::1]:1").is_routable());
        assert!(addr("[2a00:1450::1]:1").is_routable());
        assert!(addr("127.0.0.1:1").is_local());
    }

    #[test]
    fn test_group_key() {
        assert_eq!(addr("1.2.3.4:1").group_key(true), "1.2.0.0/16");
        assert_eq!(addr("1.2.200.9:1").group_key(true), "1.2.0.0/16");
        assert_eq!(addr("127.0.0.1:1").group_key(true), "local");
        assert_eq!(addr("10.0.0.1:1").group_key(true), "unroutable");
        assert_eq!(addr("10.0.0.1:1").group_key(false), "10.0.0.0/16");
        assert_eq!(addr("[2a00:1450:4001::1]:1").group_key(true), "2a00:1450::/32");
        assert_eq!(addr("[2001:470:1234::1]:1").group_key(true), "2001:470:1000::/36");
        assert_eq!(addr("[2002:0102:0304::1]:1").group_key(true), "1.2.0.0/16");
        assert_eq!(
            addr("[2001:0:0:0:0:0:fefd:fcfb]:1").group_key(true),
            "1.2.0.0/16"
        );
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let a = NetAddress::resolve("127.0.0.1:9").await.unwrap();
        assert_eq!(a, addr("127.0.0.1:9"));
    }
}
