use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6},
};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Type};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> AddressFamily {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub(crate) fn domain(self) -> Domain {
        match self {
            AddressFamily::V4 => Domain::IPV4,
            AddressFamily::V6 => Domain::IPV6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    #[default]
    Stream,
    Datagram,
}

impl SocketKind {
    pub(crate) fn socket_type(self) -> Type {
        match self {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Datagram => Type::DGRAM,
        }
    }

    pub(crate) fn protocol(self) -> Protocol {
        match self {
            SocketKind::Stream => Protocol::TCP,
            SocketKind::Datagram => Protocol::UDP,
        }
    }
}

/// Mapping between IPv4 addresses and their `::ffff:a.b.c.d` IPv6 form.
///
/// Only the `::ffff:0:0/96` prefix counts as mapped. The deprecated
/// IPv4-compatible form (`::a.b.c.d`) is an ordinary IPv6 address here.
pub trait MappedAddress: Sized {
    fn is_v4_mapped_to_v6(&self) -> bool;
    /// Identity for anything already IPv6.
    fn map_to_v6(&self) -> Self;
    /// Recovers the IPv4 address behind a mapped one, identity otherwise.
    fn map_to_v4(&self) -> Self;
}

impl MappedAddress for IpAddr {
    fn is_v4_mapped_to_v6(&self) -> bool {
        match self {
            IpAddr::V4(_) => false,
            IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
        }
    }

    fn map_to_v6(&self) -> IpAddr {
        match self {
            IpAddr::V4(v4) => IpAddr::V6(v4.to_ipv6_mapped()),
            IpAddr::V6(_) => *self,
        }
    }

    fn map_to_v4(&self) -> IpAddr {
        match self {
            IpAddr::V4(_) => *self,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => *self,
            },
        }
    }
}

impl MappedAddress for SocketAddr {
    fn is_v4_mapped_to_v6(&self) -> bool {
        self.ip().is_v4_mapped_to_v6()
    }

    fn map_to_v6(&self) -> SocketAddr {
        match self {
            SocketAddr::V4(v4) => {
                SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
            }
            SocketAddr::V6(_) => *self,
        }
    }

    fn map_to_v4(&self) -> SocketAddr {
        SocketAddr::new(self.ip().map_to_v4(), self.port())
    }
}

pub fn unspecified(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Where a socket operation points: a concrete address, or a host name that
/// still has to go through an [`AddressResolver`](crate::resolver::AddressResolver).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ip(SocketAddr),
    Host(String, u16),
}

impl Endpoint {
    pub fn host(name: impl Into<String>, port: u16) -> Endpoint {
        Endpoint::Host(name.into(), port)
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Ip(addr) => addr.port(),
            Endpoint::Host(_, port) => *port,
        }
    }

    pub fn family(&self) -> Option<AddressFamily> {
        match self {
            Endpoint::Ip(addr) => Some(AddressFamily::of(&addr.ip())),
            Endpoint::Host(..) => None,
        }
    }

    /// Literal addresses become `Ip`, anything else is kept as a host name.
    pub fn parse(host: &str, port: u16) -> Endpoint {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        match literal.parse::<IpAddr>() {
            Ok(ip) => Endpoint::Ip(SocketAddr::new(ip, port)),
            Err(_) => Endpoint::Host(host.to_string(), port),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint::Ip(addr)
    }
}

impl<I: Into<IpAddr>> From<(I, u16)> for Endpoint {
    fn from((ip, port): (I, u16)) -> Endpoint {
        Endpoint::Ip(SocketAddr::new(ip.into(), port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{}", addr),
            Endpoint::Host(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    use super::{AddressFamily, Endpoint, MappedAddress};

    #[test]
    fn test_map_to_v6_uses_ffff_prefix() {
        let v4 = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let mapped = v4.map_to_v6();
        assert_eq!("::ffff:127.0.0.1".parse::<IpAddr>().unwrap(), mapped);
        assert!(mapped.is_v4_mapped_to_v6());
        assert_eq!(v4, mapped.map_to_v4());
    }

    #[test]
    fn test_map_to_v6_is_idempotent() {
        let mapped = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)).map_to_v6();
        assert_eq!(mapped, mapped.map_to_v6());
        let plain = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(plain, plain.map_to_v6());
        assert!(!plain.is_v4_mapped_to_v6());
    }

    #[test]
    fn test_compatible_form_is_not_mapped() {
        let compat: IpAddr = "::127.0.0.1".parse().unwrap();
        assert!(!compat.is_v4_mapped_to_v6());
        assert_ne!(compat, IpAddr::V4(Ipv4Addr::LOCALHOST).map_to_v6());
        assert_eq!(compat, compat.map_to_v4());
    }

    #[test]
    fn test_socket_addr_mapping_keeps_port() {
        let addr: SocketAddr = "192.0.2.7:8080".parse().unwrap();
        let mapped = addr.map_to_v6();
        assert_eq!("[::ffff:192.0.2.7]:8080".parse::<SocketAddr>().unwrap(), mapped);
        assert_eq!(addr, mapped.map_to_v4());
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::Ip("[::1]:80".parse().unwrap()),
            Endpoint::parse("[::1]", 80)
        );
        assert_eq!(Endpoint::Ip("127.0.0.1:1".parse().unwrap()), Endpoint::parse("127.0.0.1", 1));
        assert_eq!(Endpoint::host("localhost", 5), Endpoint::parse("localhost", 5));
        assert_eq!(None, Endpoint::host("localhost", 5).family());
        assert_eq!(Some(AddressFamily::V6), Endpoint::parse("::", 0).family());
    }
}
