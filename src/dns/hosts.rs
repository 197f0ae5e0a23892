//! The hosts-file override tree consulted before rule evaluation.

use std::collections::HashMap;
use std::net::IpAddr;

/// A static host -> address override, checked ahead of both the resolver
/// and the rule scan. The real tree supports wildcard entries loaded from a
/// hosts file; only point lookup is needed by the dispatch core.
pub trait HostsTree: Send + Sync {
    fn lookup(&self, host: &str) -> Option<IpAddr>;
}

#[derive(Debug, Default, Clone)]
pub struct StaticHostsTree {
    entries: HashMap<String, IpAddr>,
}

impl StaticHostsTree {
    pub fn new() -> Self {
        StaticHostsTree::default()
    }

    pub fn with_entry(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.entries.insert(host.into(), ip);
        self
    }
}

impl HostsTree for StaticHostsTree {
    fn lookup(&self, host: &str) -> Option<IpAddr> {
        self.entries.get(host).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_hosts_tree() {
        let tree = StaticHostsTree::new().with_entry("router.lan", "192.168.1.1".parse().unwrap());
        assert_eq!(tree.lookup("router.lan"), Some("192.168.1.1".parse().unwrap()));
        assert_eq!(tree.lookup("other.lan"), None);
    }
}
