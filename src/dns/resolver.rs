//! Forward resolution and fake-IP membership.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::{Error, Result};

/// Resolves a domain to an address. The real implementation queries
/// upstream DNS servers and is out of scope here; only the contract used by
/// the rule evaluator and pre-handle is specified.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<IpAddr>;

    /// Reverse-lookup a host previously mapped to `ip`, used by the
    /// enhanced-mode (fake-IP/DNSMapping) pre-handle rewrite.
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Membership test for the fake-IP address space. The real pool allocates
/// and retires fake addresses; only membership is needed by the dispatch
/// core.
pub trait FakeIpPool: Send + Sync {
    fn is_fake_ip(&self, ip: IpAddr) -> bool;
}

/// Always reports no address as a fake-IP; the default when fake-IP mode is
/// disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFakeIpPool;

impl FakeIpPool for NullFakeIpPool {
    fn is_fake_ip(&self, _ip: IpAddr) -> bool {
        false
    }
}

/// A fixed forward/reverse map, standing in for a real resolver in tests
/// and minimal deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    forward: HashMap<String, IpAddr>,
    reverse: HashMap<IpAddr, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        StaticResolver::default()
    }

    pub fn with_mapping(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        let host = host.into();
        self.reverse.insert(ip, host.clone());
        self.forward.insert(host, ip);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        self.forward
            .get(host)
            .copied()
            .ok_or_else(|| Error::dns(format!("no record for {}", host)))
    }

    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        self.reverse.get(&ip).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_roundtrip() {
        let resolver = StaticResolver::new().with_mapping("example.com", "1.2.3.4".parse().unwrap());
        assert_eq!(
            resolver.resolve("example.com").await.unwrap(),
            "1.2.3.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolver.reverse_lookup("1.2.3.4".parse().unwrap()).await,
            Some("example.com".to_string())
        );
        assert!(resolver.resolve("unknown.com").await.is_err());
    }

    #[test]
    fn test_null_fake_ip_pool() {
        let pool = NullFakeIpPool;
        assert!(!pool.is_fake_ip("198.18.0.1".parse().unwrap()));
    }
}
