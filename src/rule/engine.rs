//! The ordered rule-evaluation algorithm.
//!
//! A single scan over the configured rule list in configuration order —
//! not grouped by rule kind — so that rule precedence matches the order
//! the rules were written in.

use super::types::Rule;
use crate::common::{Metadata, Network};
use crate::dns::{HostsTree, Resolver};
use crate::outbound::{is_pass, Adapter, AdapterManager};
use std::sync::Arc;
use tracing::debug;

/// Result of one evaluation: the resolved adapter, and the rule that
/// produced it (`None` for the REJECT fallback when nothing matched).
pub struct MatchOutcome {
    pub adapter: Arc<dyn Adapter>,
    pub rule: Option<Arc<dyn Rule>>,
}

/// Evaluate `rules` against `metadata` in order, resolving the destination
/// IP at most once via `hosts`/`resolver` along the way.
pub async fn match_rules(
    rules: &[Arc<dyn Rule>],
    adapters: &AdapterManager,
    hosts: &dyn HostsTree,
    resolver: &dyn Resolver,
    metadata: &mut Metadata,
) -> MatchOutcome {
    let mut resolved = false;

    if !metadata.host.is_empty() {
        if let Some(ip) = hosts.lookup(&metadata.host) {
            metadata.dst_ip = Some(ip);
            resolved = true;
        }
    }

    for rule in rules {
        if !resolved
            && rule.should_resolve_ip()
            && !metadata.host.is_empty()
            && metadata.dst_ip.is_none()
        {
            if let Ok(ip) = resolver.resolve(&metadata.host).await {
                metadata.dst_ip = Some(ip);
            }
            resolved = true;
        }

        if !rule.is_match(metadata) {
            continue;
        }

        let Some(adapter) = adapters.get(rule.adapter()) else {
            debug!("rule {} names unknown adapter {}", rule.rule_type(), rule.adapter());
            continue;
        };

        if is_pass(&adapter, metadata) {
            continue;
        }

        if metadata.network == Network::Udp && !adapter.supports_udp() {
            continue;
        }

        if let Some(extra) = rule.rule_extra() {
            if extra.disqualifies(metadata) {
                continue;
            }
        }

        debug!(
            "rule matched: {}{} -> {}",
            rule.rule_type(),
            if rule.payload().is_empty() {
                String::new()
            } else {
                format!(",{}", rule.payload())
            },
            adapter.name()
        );
        return MatchOutcome {
            adapter,
            rule: Some(rule.clone()),
        };
    }

    MatchOutcome {
        adapter: adapters
            .get("REJECT")
            .expect("REJECT adapter always present"),
        rule: None,
    }
}

/// Format the `<rule_type>(payload)` clause used in dispatch log lines,
/// normalizing away a stray `()` when the payload is empty (e.g. MATCH).
pub fn format_rule_clause(rule: &dyn Rule) -> String {
    if rule.payload().is_empty() {
        rule.rule_type().to_string()
    } else {
        format!("{}({})", rule.rule_type(), rule.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{StaticHostsTree, StaticResolver};
    use crate::rule::types::{parse_rule_line, MatchAll};
    use crate::rule::GeoIpReader;

    fn geoip() -> Arc<GeoIpReader> {
        Arc::new(GeoIpReader::new("nonexistent.mmdb"))
    }

    #[tokio::test]
    async fn test_no_match_defaults_to_reject() {
        let geoip = geoip();
        let rules: Vec<Arc<dyn Rule>> =
            vec![parse_rule_line("DOMAIN,example.com,A", &geoip).unwrap()];
        let adapters = AdapterManager::new();
        let hosts = StaticHostsTree::new();
        let resolver = StaticResolver::new();
        let mut metadata = Metadata::tcp()
            .with_host("other.com".to_string())
            .with_dst_port(80);

        let outcome = match_rules(&rules, &adapters, &hosts, &resolver, &mut metadata).await;
        assert_eq!(outcome.adapter.name(), "REJECT");
        assert!(outcome.rule.is_none());
    }

    #[tokio::test]
    async fn test_missing_adapter_falls_through_to_reject() {
        let geoip = geoip();
        let rules: Vec<Arc<dyn Rule>> =
            vec![parse_rule_line("DOMAIN,example.com,GhostProxy", &geoip).unwrap()];
        let adapters = AdapterManager::new();
        let hosts = StaticHostsTree::new();
        let resolver = StaticResolver::new();
        let mut metadata = Metadata::tcp()
            .with_host("example.com".to_string())
            .with_dst_port(80);

        let outcome = match_rules(&rules, &adapters, &hosts, &resolver, &mut metadata).await;
        assert_eq!(outcome.adapter.name(), "REJECT");
    }

    #[tokio::test]
    async fn test_match_resolves_adapter() {
        let geoip = geoip();
        let rules: Vec<Arc<dyn Rule>> = vec![
            parse_rule_line("DOMAIN,example.com,DIRECT", &geoip).unwrap(),
            Arc::new(MatchAll::new("REJECT".to_string())),
        ];
        let adapters = AdapterManager::new();
        let hosts = StaticHostsTree::new();
        let resolver = StaticResolver::new();
        let mut metadata = Metadata::tcp()
            .with_host("example.com".to_string())
            .with_dst_port(443);

        let outcome = match_rules(&rules, &adapters, &hosts, &resolver, &mut metadata).await;
        assert_eq!(outcome.adapter.name(), "DIRECT");
        assert_eq!(outcome.rule.unwrap().rule_type(), "DOMAIN");
    }

    #[tokio::test]
    async fn test_dns_resolved_at_most_once() {
        let geoip = geoip();
        // Two IP-CIDR rules that both demand a resolved IP; only one
        // resolver call should occur even though neither matches first.
        let rules: Vec<Arc<dyn Rule>> = vec![
            parse_rule_line("IP-CIDR,10.0.0.0/8,DIRECT", &geoip).unwrap(),
            parse_rule_line("IP-CIDR,192.168.0.0/16,PROXY", &geoip).unwrap(),
            Arc::new(MatchAll::new("DIRECT".to_string())),
        ];
        let adapters = AdapterManager::new();
        let hosts = StaticHostsTree::new();
        let resolver =
            StaticResolver::new().with_mapping("example.com", "192.168.1.1".parse().unwrap());
        let mut metadata = Metadata::tcp()
            .with_host("example.com".to_string())
            .with_dst_port(443);

        let outcome = match_rules(&rules, &adapters, &hosts, &resolver, &mut metadata).await;
        assert_eq!(metadata.dst_ip, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(outcome.adapter.name(), "REJECT");
    }

    #[tokio::test]
    async fn test_hosts_tree_pre_resolves() {
        let geoip = geoip();
        let rules: Vec<Arc<dyn Rule>> =
            vec![parse_rule_line("IP-CIDR,192.168.0.0/16,DIRECT", &geoip).unwrap()];
        let adapters = AdapterManager::new();
        let hosts =
            StaticHostsTree::new().with_entry("router.lan", "192.168.1.1".parse().unwrap());
        let resolver = StaticResolver::new();
        let mut metadata = Metadata::tcp()
            .with_host("router.lan".to_string())
            .with_dst_port(80);

        let outcome = match_rules(&rules, &adapters, &hosts, &resolver, &mut metadata).await;
        assert_eq!(outcome.adapter.name(), "DIRECT");
    }
}
