//! Rule-set providers: externally-sourced rule content, multiplexed through
//! a behavior strategy and folded transparently into the ordered rule scan.

use super::fetcher::{content_hash, FileVehicle, Fetcher};
use super::VehicleType;
use crate::common::Metadata;
use crate::rule::{parse_rule_line, DomainTrie, GeoIpReader, Rule};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How the provider's payload lines are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleBehavior {
    Domain,
    IpCidr,
    Classical,
}

impl std::fmt::Display for RuleBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleBehavior::Domain => write!(f, "Domain"),
            RuleBehavior::IpCidr => write!(f, "IPCIDR"),
            RuleBehavior::Classical => write!(f, "Classical"),
        }
    }
}

/// A behavior-specific matcher a `RuleSetProvider` delegates to. Swapped out
/// wholesale on every successful `on_update`.
trait RuleStrategy: Send + Sync {
    fn is_match(&self, metadata: &Metadata) -> bool;
    fn should_resolve_ip(&self) -> bool;
    fn count(&self) -> usize;
}

struct DomainStrategy {
    trie: DomainTrie<()>,
}

impl DomainStrategy {
    fn build(lines: &[String]) -> Self {
        let mut trie = DomainTrie::new();
        for line in lines {
            trie.insert(line, ());
        }
        DomainStrategy { trie }
    }
}

impl RuleStrategy for DomainStrategy {
    fn is_match(&self, metadata: &Metadata) -> bool {
        self.trie.contains(&metadata.host)
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
    fn count(&self) -> usize {
        self.trie.len()
    }
}

struct IpCidrStrategy {
    nets: Vec<IpNet>,
}

impl IpCidrStrategy {
    fn build(lines: &[String]) -> Self {
        let mut nets = Vec::with_capacity(lines.len());
        for line in lines {
            match line.parse::<IpNet>() {
                Ok(net) => nets.push(net),
                Err(e) => warn!("skipping malformed CIDR line {:?}: {}", line, e),
            }
        }
        IpCidrStrategy { nets }
    }
}

impl RuleStrategy for IpCidrStrategy {
    fn is_match(&self, metadata: &Metadata) -> bool {
        match metadata.dst_ip {
            Some(ip) => self.nets.iter().any(|n| n.contains(&ip)),
            None => false,
        }
    }
    fn should_resolve_ip(&self) -> bool {
        true
    }
    fn count(&self) -> usize {
        self.nets.len()
    }
}

/// Each line is a full `<TYPE>,<PAYLOAD>[,<ADAPTER>][,<OPTION>]` rule; the
/// adapter field is parsed but ignored, since a classical rule-set only
/// contributes a match predicate, not its own routing decision.
struct ClassicalStrategy {
    sub_rules: Vec<Arc<dyn Rule>>,
    should_resolve_ip: bool,
    count: usize,
}

impl ClassicalStrategy {
    fn build(lines: &[String], geoip: &Arc<GeoIpReader>) -> Self {
        let mut sub_rules = Vec::new();
        let mut should_resolve_ip = false;
        let mut count = 0;
        for line in lines {
            match parse_rule_line(line, geoip) {
                Ok(rule) => {
                    if !should_resolve_ip {
                        should_resolve_ip = rule.should_resolve_ip();
                    }
                    count += 1;
                    sub_rules.push(rule);
                }
                Err(e) => warn!("skipping malformed classical rule line {:?}: {}", line, e),
            }
        }
        ClassicalStrategy {
            sub_rules,
            should_resolve_ip,
            count,
        }
    }
}

impl RuleStrategy for ClassicalStrategy {
    fn is_match(&self, metadata: &Metadata) -> bool {
        self.sub_rules.iter().any(|r| r.is_match(metadata))
    }
    fn should_resolve_ip(&self) -> bool {
        self.should_resolve_ip
    }
    fn count(&self) -> usize {
        self.count
    }
}

fn build_strategy(
    behavior: RuleBehavior,
    lines: &[String],
    geoip: &Arc<GeoIpReader>,
) -> Arc<dyn RuleStrategy> {
    match behavior {
        RuleBehavior::Domain => Arc::new(DomainStrategy::build(lines)),
        RuleBehavior::IpCidr => Arc::new(IpCidrStrategy::build(lines)),
        RuleBehavior::Classical => Arc::new(ClassicalStrategy::build(lines, geoip)),
    }
}

/// A rule-set document: `payload:` and `rules:` are both accepted as the
/// top-level sequence key and concatenated, matching either naming a
/// provider file uses.
#[derive(serde::Deserialize, Default)]
struct RulePayload {
    #[serde(default)]
    payload: Vec<String>,
    #[serde(default)]
    rules: Vec<String>,
}

fn parse_payload_lines(content: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(content);
    match serde_yaml::from_str::<RulePayload>(&text) {
        Ok(mut doc) => {
            doc.payload.append(&mut doc.rules);
            doc.payload
        }
        Err(e) => {
            warn!("rule-set payload is not valid YAML, skipping: {}", e);
            Vec::new()
        }
    }
}

/// Management-API JSON view of a rule-set provider.
#[derive(Serialize)]
pub struct RuleProviderInfo {
    pub behavior: RuleBehavior,
    pub name: String,
    #[serde(rename = "ruleCount")]
    pub rule_count: usize,
    #[serde(rename = "type")]
    pub provider_type: &'static str,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "vehicleType")]
    pub vehicle_type: VehicleType,
}

enum Vehicle {
    Http(Fetcher),
    File(FileVehicle),
}

/// An externally-sourced rule set. Implements `Rule` itself so it folds
/// transparently into the ordered evaluator's scan once added under a
/// `RULE-SET,<name>,<adapter>` line.
pub struct RuleSetProvider {
    name: String,
    adapter: String,
    behavior: RuleBehavior,
    vehicle: Vehicle,
    geoip: Arc<GeoIpReader>,
    strategy: RwLock<Arc<dyn RuleStrategy>>,
    last_hash: AtomicU32,
    updated_at: RwLock<Option<DateTime<Utc>>>,
}

impl RuleSetProvider {
    pub fn new_http(
        name: String,
        adapter: String,
        url: String,
        cache_path: PathBuf,
        interval: Duration,
        behavior: RuleBehavior,
        geoip: Arc<GeoIpReader>,
    ) -> Self {
        RuleSetProvider {
            name,
            adapter,
            behavior,
            vehicle: Vehicle::Http(Fetcher::new(url, cache_path, interval)),
            geoip,
            strategy: RwLock::new(Arc::new(DomainStrategy::build(&[]))),
            last_hash: AtomicU32::new(0),
            updated_at: RwLock::new(None),
        }
    }

    pub fn new_file(
        name: String,
        adapter: String,
        path: PathBuf,
        behavior: RuleBehavior,
        geoip: Arc<GeoIpReader>,
    ) -> Self {
        RuleSetProvider {
            name,
            adapter,
            behavior,
            vehicle: Vehicle::File(FileVehicle::new(path)),
            geoip,
            strategy: RwLock::new(Arc::new(DomainStrategy::build(&[]))),
            last_hash: AtomicU32::new(0),
            updated_at: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behavior(&self) -> RuleBehavior {
        self.behavior
    }

    pub fn vehicle_type(&self) -> VehicleType {
        match self.vehicle {
            Vehicle::Http(_) => VehicleType::HTTP,
            Vehicle::File(_) => VehicleType::File,
        }
    }

    pub fn count(&self) -> usize {
        self.strategy.read().count()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        *self.updated_at.read()
    }

    pub fn info(&self) -> RuleProviderInfo {
        RuleProviderInfo {
            behavior: self.behavior,
            name: self.name.clone(),
            rule_count: self.count(),
            provider_type: "Rule",
            updated_at: self.updated_at(),
            vehicle_type: self.vehicle_type(),
        }
    }

    async fn fetch_raw(&self) -> Result<Vec<u8>> {
        match &self.vehicle {
            Vehicle::Http(fetcher) => match fetcher.fetch().await {
                Ok((content, _)) => Ok(content),
                Err(e) => {
                    warn!("fetching rule-set {} failed, using cache: {}", self.name, e);
                    fetcher.load_cache().await
                }
            },
            Vehicle::File(vehicle) => vehicle.read().await,
        }
    }

    /// First load. Always installs the parsed strategy, regardless of hash.
    pub async fn initial(&self) -> Result<()> {
        let raw = self.fetch_raw().await?;
        self.install(&raw);
        Ok(())
    }

    /// Re-fetch and swap the strategy only if the content actually changed.
    pub async fn update(&self) -> Result<()> {
        let raw = self.fetch_raw().await?;
        let hash = content_hash(&raw);
        if hash == self.last_hash.load(Ordering::Acquire) {
            return Ok(());
        }
        self.install(&raw);
        Ok(())
    }

    fn install(&self, raw: &[u8]) {
        let hash = content_hash(raw);
        let lines = parse_payload_lines(raw);
        let strategy = build_strategy(self.behavior, &lines, &self.geoip);
        *self.strategy.write() = strategy;
        self.last_hash.store(hash, Ordering::Release);
        *self.updated_at.write() = Some(Utc::now());
    }

    /// Explicit teardown, called by the owner when the provider is dropped
    /// from configuration rather than relying on a finalizer.
    pub async fn close(&self) {}
}

impl std::fmt::Debug for RuleSetProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSetProvider")
            .field("name", &self.name)
            .field("behavior", &self.behavior)
            .finish()
    }
}

impl Rule for RuleSetProvider {
    fn is_match(&self, metadata: &Metadata) -> bool {
        self.strategy.read().is_match(metadata)
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.name
    }
    fn rule_type(&self) -> &str {
        "RULE-SET"
    }
    fn should_resolve_ip(&self) -> bool {
        self.strategy.read().should_resolve_ip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Metadata;

    fn geoip() -> Arc<GeoIpReader> {
        Arc::new(GeoIpReader::new("nonexistent.mmdb"))
    }

    #[test]
    fn test_parse_payload_lines_concatenates_payload_and_rules_keys() {
        let doc = b"payload:\n  - 'DOMAIN,a.com,DIRECT'\nrules:\n  - 'DOMAIN,b.com,DIRECT'\n";
        let lines = parse_payload_lines(doc);
        assert_eq!(lines, vec!["DOMAIN,a.com,DIRECT", "DOMAIN,b.com,DIRECT"]);
    }

    #[test]
    fn test_parse_payload_lines_invalid_yaml_yields_empty() {
        assert!(parse_payload_lines(b"not: [valid").is_empty());
    }

    #[test]
    fn test_domain_strategy_matches_suffix() {
        let strategy = DomainStrategy::build(&[".example.com".to_string()]);
        assert!(strategy.is_match(&Metadata::tcp().with_host("foo.example.com".to_string())));
        assert!(!strategy.should_resolve_ip());
        assert_eq!(strategy.count(), 1);
    }

    #[test]
    fn test_ip_cidr_strategy() {
        let strategy = IpCidrStrategy::build(&["10.0.0.0/8".to_string(), "garbage".to_string()]);
        assert_eq!(strategy.count(), 1);
        assert!(strategy.should_resolve_ip());
        let meta = Metadata::tcp().with_dst_ip("10.1.2.3".parse().unwrap());
        assert!(strategy.is_match(&meta));
    }

    #[test]
    fn test_classical_strategy_first_match_and_or_resolve() {
        let geoip = geoip();
        let lines = vec![
            "DOMAIN,example.com,DIRECT".to_string(),
            "IP-CIDR,10.0.0.0/8,DIRECT".to_string(),
        ];
        let strategy = ClassicalStrategy::build(&lines, &geoip);
        assert_eq!(strategy.count(), 2);
        assert!(strategy.should_resolve_ip());
        assert!(strategy.is_match(&Metadata::tcp().with_host("example.com".to_string())));
    }

    #[test]
    fn test_classical_strategy_counts_duplicates() {
        let geoip = geoip();
        let lines = vec![
            "DOMAIN,example.com,DIRECT".to_string(),
            "DOMAIN,example.com,DIRECT".to_string(),
        ];
        let strategy = ClassicalStrategy::build(&lines, &geoip);
        assert_eq!(strategy.count(), 2);
    }

    #[tokio::test]
    async fn test_rule_set_provider_file_initial_and_rule_impl() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "rule_set_provider_test_{}.txt",
            std::process::id()
        ));
        tokio::fs::write(&path, b"payload:\n  - '.example.com'\n")
            .await
            .unwrap();

        let provider = RuleSetProvider::new_file(
            "test-set".to_string(),
            "PROXY".to_string(),
            path.clone(),
            RuleBehavior::Domain,
            geoip(),
        );
        provider.initial().await.unwrap();
        assert_eq!(provider.count(), 1);
        assert!(provider.is_match(&Metadata::tcp().with_host("foo.example.com".to_string())));
        assert_eq!(Rule::adapter(&provider), "PROXY");

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_rule_set_provider_update_skips_unchanged_content() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "rule_set_provider_test_update_{}.txt",
            std::process::id()
        ));
        tokio::fs::write(&path, b"payload:\n  - '.example.com'\n")
            .await
            .unwrap();

        let provider = RuleSetProvider::new_file(
            "test-set".to_string(),
            "PROXY".to_string(),
            path.clone(),
            RuleBehavior::Domain,
            geoip(),
        );
        provider.initial().await.unwrap();
        let first_updated_at = provider.updated_at();

        provider.update().await.unwrap();
        assert_eq!(provider.updated_at(), first_updated_at);
        assert_eq!(provider.count(), 1);

        tokio::fs::remove_file(&path).await.ok();
    }
}
