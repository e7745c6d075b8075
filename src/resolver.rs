use std::{collections::HashMap, io, net::IpAddr};

use async_trait::async_trait;

use crate::error::SocketError;

/// Turns a host name into candidate addresses, in the order a connect should
/// try them.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, SocketError>;
}

/// Resolves through the operating system (`getaddrinfo` on most platforms).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, SocketError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let resolved = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| SocketError::NameResolution {
                host: host.to_string(),
                source,
            })?;
        let mut addresses: Vec<IpAddr> = Vec::new();
        for addr in resolved {
            if !addresses.contains(&addr.ip()) {
                addresses.push(addr.ip());
            }
        }
        if addresses.is_empty() {
            return Err(no_addresses(host));
        }
        log::trace!("resolved {} to {:?}", host, addresses);
        Ok(addresses)
    }
}

/// Fixed table of names, for tests and for pinning names in configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> StaticResolver {
        StaticResolver::default()
    }

    pub fn with(mut self, host: impl Into<String>, addresses: Vec<IpAddr>) -> StaticResolver {
        self.entries.insert(host.into().to_ascii_lowercase(), addresses);
        self
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, SocketError> {
        match self.entries.get(&host.to_ascii_lowercase()) {
            Some(addresses) if !addresses.is_empty() => Ok(addresses.clone()),
            _ => Err(no_addresses(host)),
        }
    }
}

fn no_addresses(host: &str) -> SocketError {
    SocketError::NameResolution {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses for host"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use crate::error::Kind;

    use super::{AddressResolver, StaticResolver, SystemResolver};

    #[tokio::test]
    async fn test_static_keeps_order() {
        let resolver = StaticResolver::new().with(
            "Service.Test",
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::LOCALHOST)],
        );
        let resolved = resolver.resolve("service.test").await.unwrap();
        assert_eq!(
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::LOCALHOST)],
            resolved
        );
    }

    #[tokio::test]
    async fn test_static_unknown_host() {
        let err = StaticResolver::new().resolve("missing.test").await.unwrap_err();
        assert_eq!(Kind::NameResolution, err.kind());
    }

    #[tokio::test]
    async fn test_system_literal_skips_lookup() {
        let resolved = SystemResolver.resolve("192.0.2.1").await.unwrap();
        assert_eq!(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))], resolved);
    }

    #[tokio::test]
    async fn test_system_localhost() {
        let resolved = SystemResolver.resolve("localhost").await.unwrap();
        assert!(resolved.iter().all(|ip| ip.is_loopback()));
    }
}
