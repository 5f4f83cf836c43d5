use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Name of a service port as it appears in the service definition.
pub type PortName = String;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    /// Wildcard used by lookups that do not care about the protocol.
    None,
    #[default]
    Tcp,
    Udp,
}

/// Protocols probed, in order, when matching an address without a protocol.
pub const ALL_PROTOCOLS: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::None => write!(f, "NONE"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    #[default]
    External,
    Internal,
}

/// L4 half of a frontend, a port qualified by its protocol.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct L4Addr {
    pub protocol: Protocol,
    pub port: u16,
}

impl L4Addr {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }
}

/// Address through which a service is reached: IP, port, protocol and scope.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrontendAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub scope: Scope,
}

impl FrontendAddr {
    pub fn new(ip: IpAddr, l4: L4Addr, scope: Scope) -> Self {
        Self {
            ip,
            port: l4.port,
            protocol: l4.protocol,
            scope,
        }
    }

    /// Protocol-qualified string form, used as a set key by frontend lookups.
    pub fn string_with_protocol(&self) -> String {
        format!("{}/{}", self, self.protocol)
    }
}

impl fmt::Display for FrontendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Returns the first IP of the requested family, IPv4 when `prefer_ipv4` is
/// set and IPv6 otherwise.
pub fn get_ip_by_family(ips: &[IpAddr], prefer_ipv4: bool) -> Option<IpAddr> {
    ips.iter().copied().find(|ip| ip.is_ipv4() == prefer_ipv4)
}

/// An unspecified address (`0.0.0.0`, `::`) cannot front a service.
pub fn is_valid_frontend_ip(ip: IpAddr) -> bool {
    !ip.is_unspecified()
}

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_get_ip_by_family() {
        let ips = vec![
            IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)),
        ];

        assert_eq!(
            get_ip_by_family(&ips, true),
            Some(IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)))
        );
        assert_eq!(
            get_ip_by_family(&ips, false),
            Some(IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)))
        );

        let v6_only = vec![IpAddr::V6(Ipv6Addr::LOCALHOST)];
        assert_eq!(get_ip_by_family(&v6_only, true), None);
    }

    #[test]
    fn test_frontend_addr_strings() {
        let addr = FrontendAddr::new(
            IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)),
            L4Addr::new(Protocol::Tcp, 80),
            Scope::External,
        );
        assert_eq!(addr.to_string(), "10.96.0.1:80");
        assert_eq!(addr.string_with_protocol(), "10.96.0.1:80/TCP");

        let addr = FrontendAddr::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            L4Addr::new(Protocol::Udp, 53),
            Scope::External,
        );
        assert_eq!(addr.string_with_protocol(), "[::1]:53/UDP");
    }

    #[test]
    fn test_is_valid_frontend_ip() {
        assert!(is_valid_frontend_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!is_valid_frontend_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert!(!is_valid_frontend_ip(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
    }
}
