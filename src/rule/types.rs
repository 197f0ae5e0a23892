//! The polymorphic `Rule` predicate and its concrete variants.

use crate::common::{Metadata, Network};
use crate::rule::{DomainTrie, GeoIpReader};
use crate::{Error, Result};
use ipnet::IpNet;
use std::sync::Arc;

/// Exclusion filters a matched rule may still be disqualified by. Each
/// populated field returns "not-match" when the corresponding metadata
/// field violates it.
#[derive(Debug, Clone, Default)]
pub struct RuleExtra {
    pub network: Option<Network>,
    pub src_ip_cidrs: Vec<IpNet>,
    pub process_names: Vec<String>,
}

impl RuleExtra {
    pub fn is_empty(&self) -> bool {
        self.network.is_none() && self.src_ip_cidrs.is_empty() && self.process_names.is_empty()
    }

    /// True if `metadata` violates any constraint this extra specifies.
    pub fn disqualifies(&self, metadata: &Metadata) -> bool {
        if let Some(network) = self.network {
            if metadata.network != network {
                return true;
            }
        }
        if !self.src_ip_cidrs.is_empty()
            && !self.src_ip_cidrs.iter().any(|c| c.contains(&metadata.src_ip))
        {
            return true;
        }
        if !self.process_names.is_empty() {
            let proc = metadata.process.as_deref().unwrap_or("");
            if !self
                .process_names
                .iter()
                .any(|n| n.eq_ignore_ascii_case(proc))
            {
                return true;
            }
        }
        false
    }
}

/// A polymorphic predicate over `Metadata` with a target adapter name.
pub trait Rule: Send + Sync + std::fmt::Debug {
    /// Whether this rule matches the given flow.
    fn is_match(&self, metadata: &Metadata) -> bool;

    /// Name of the adapter this rule routes to.
    fn adapter(&self) -> &str;

    /// Original rule payload text, as configured.
    fn payload(&self) -> &str;

    /// Short tag identifying the rule kind, e.g. "DOMAIN-SUFFIX".
    fn rule_type(&self) -> &str;

    /// Whether the evaluator must have a resolved destination IP before
    /// this rule can meaningfully match.
    fn should_resolve_ip(&self) -> bool;

    /// Optional exclusion filters layered on top of the match.
    fn rule_extra(&self) -> Option<&RuleExtra> {
        None
    }
}

macro_rules! simple_rule {
    ($name:ident, $tag:expr) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            payload: String,
            adapter: String,
        }

        impl $name {
            pub fn new(payload: String, adapter: String) -> Self {
                $name { payload, adapter }
            }
        }
    };
}

simple_rule!(Domain, "DOMAIN");

impl Rule for Domain {
    fn is_match(&self, metadata: &Metadata) -> bool {
        metadata.host.eq_ignore_ascii_case(&self.payload)
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "DOMAIN"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

simple_rule!(DomainSuffix, "DOMAIN-SUFFIX");

impl Rule for DomainSuffix {
    fn is_match(&self, metadata: &Metadata) -> bool {
        let host = metadata.host.to_lowercase();
        let suffix = self.payload.to_lowercase();
        host == suffix || host.ends_with(&format!(".{}", suffix))
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "DOMAIN-SUFFIX"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

simple_rule!(DomainKeyword, "DOMAIN-KEYWORD");

impl Rule for DomainKeyword {
    fn is_match(&self, metadata: &Metadata) -> bool {
        metadata
            .host
            .to_lowercase()
            .contains(&self.payload.to_lowercase())
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "DOMAIN-KEYWORD"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

/// Backed by a shared `DomainTrie`, used by rule-set providers with Domain
/// behavior (see `provider::rule`). Not constructed from a single config
/// line the way the other variants are.
#[derive(Debug, Clone)]
pub struct DomainSet {
    trie: Arc<DomainTrie<()>>,
    adapter: String,
    name: String,
}

impl DomainSet {
    pub fn new(trie: Arc<DomainTrie<()>>, adapter: String, name: String) -> Self {
        DomainSet { trie, adapter, name }
    }
}

impl Rule for DomainSet {
    fn is_match(&self, metadata: &Metadata) -> bool {
        self.trie.contains(&metadata.host)
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
        false
    }
}

#[derive(Debug, Clone)]
pub struct GeoIp {
    payload: String,
    adapter: String,
    reader: Arc<GeoIpReader>,
}

impl GeoIp {
    pub fn new(payload: String, adapter: String, reader: Arc<GeoIpReader>) -> Self {
        GeoIp { payload, adapter, reader }
    }
}

impl Rule for GeoIp {
    fn is_match(&self, metadata: &Metadata) -> bool {
        match metadata.dst_ip {
            Some(ip) => self.reader.matches(ip, &self.payload),
            None => false,
        }
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "GEOIP"
    }
    fn should_resolve_ip(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct IpCidr {
    payload: String,
    adapter: String,
    cidr: IpNet,
    no_resolve: bool,
}

impl IpCidr {
    pub fn parse(payload: String, adapter: String, no_resolve: bool) -> Result<Self> {
        let cidr: IpNet = payload
            .parse()
            .map_err(|e| Error::Rule(format!("invalid CIDR {}: {}", payload, e)))?;
        Ok(IpCidr { payload, adapter, cidr, no_resolve })
    }
}

impl Rule for IpCidr {
    fn is_match(&self, metadata: &Metadata) -> bool {
        match metadata.dst_ip {
            Some(ip) => self.cidr.contains(&ip),
            None => false,
        }
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "IP-CIDR"
    }
    fn should_resolve_ip(&self) -> bool {
        !self.no_resolve
    }
}

#[derive(Debug, Clone)]
pub struct SrcIpCidr {
    payload: String,
    adapter: String,
    cidr: IpNet,
}

impl SrcIpCidr {
    pub fn parse(payload: String, adapter: String) -> Result<Self> {
        let cidr: IpNet = payload
            .parse()
            .map_err(|e| Error::Rule(format!("invalid CIDR {}: {}", payload, e)))?;
        Ok(SrcIpCidr { payload, adapter, cidr })
    }
}

impl Rule for SrcIpCidr {
    fn is_match(&self, metadata: &Metadata) -> bool {
        self.cidr.contains(&metadata.src_ip)
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "SRC-IP-CIDR"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct SrcPort {
    payload: String,
    adapter: String,
    port: u16,
}

impl SrcPort {
    pub fn parse(payload: String, adapter: String) -> Result<Self> {
        let port: u16 = payload
            .parse()
            .map_err(|e| Error::Rule(format!("invalid port {}: {}", payload, e)))?;
        Ok(SrcPort { payload, adapter, port })
    }
}

impl Rule for SrcPort {
    fn is_match(&self, metadata: &Metadata) -> bool {
        metadata.src_port == self.port
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "SRC-PORT"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct DstPort {
    payload: String,
    adapter: String,
    port: u16,
}

impl DstPort {
    pub fn parse(payload: String, adapter: String) -> Result<Self> {
        let port: u16 = payload
            .parse()
            .map_err(|e| Error::Rule(format!("invalid port {}: {}", payload, e)))?;
        Ok(DstPort { payload, adapter, port })
    }
}

impl Rule for DstPort {
    fn is_match(&self, metadata: &Metadata) -> bool {
        metadata.dst_port == self.port
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "DST-PORT"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

simple_rule!(ProcessName, "PROCESS-NAME");

impl Rule for ProcessName {
    fn is_match(&self, metadata: &Metadata) -> bool {
        metadata
            .process
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(&self.payload))
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "PROCESS-NAME"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

simple_rule!(ProcessPath, "PROCESS-PATH");

impl Rule for ProcessPath {
    fn is_match(&self, metadata: &Metadata) -> bool {
        metadata
            .process_path
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(&self.payload))
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        &self.payload
    }
    fn rule_type(&self) -> &str {
        "PROCESS-PATH"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

/// `MATCH` — the catch-all final rule.
#[derive(Debug, Clone)]
pub struct MatchAll {
    adapter: String,
}

impl MatchAll {
    pub fn new(adapter: String) -> Self {
        MatchAll { adapter }
    }
}

impl Rule for MatchAll {
    fn is_match(&self, _metadata: &Metadata) -> bool {
        true
    }
    fn adapter(&self) -> &str {
        &self.adapter
    }
    fn payload(&self) -> &str {
        ""
    }
    fn rule_type(&self) -> &str {
        "MATCH"
    }
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

/// Parse a single configuration line into a boxed `Rule`.
///
/// Accepts `TYPE,payload,target[,no-resolve]` for most kinds and
/// `MATCH,target` for the final rule.
pub fn parse_rule_line(line: &str, geoip: &Arc<GeoIpReader>) -> Result<Arc<dyn Rule>> {
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.is_empty() {
        return Err(Error::Rule(format!("empty rule: {}", line)));
    }

    let tag = parts[0].to_uppercase();
    if tag == "MATCH" || tag == "FINAL" {
        if parts.len() < 2 {
            return Err(Error::Rule(format!("invalid MATCH rule: {}", line)));
        }
        return Ok(Arc::new(MatchAll::new(parts[1].to_string())));
    }

    if parts.len() < 3 {
        return Err(Error::Rule(format!("invalid rule: {}", line)));
    }
    let payload = parts[1].to_string();
    let adapter = parts[2].to_string();
    let no_resolve = parts.len() > 3 && parts[3].eq_ignore_ascii_case("no-resolve");

    let rule: Arc<dyn Rule> = match tag.as_str() {
        "DOMAIN" => Arc::new(Domain::new(payload, adapter)),
        "DOMAIN-SUFFIX" => Arc::new(DomainSuffix::new(payload, adapter)),
        "DOMAIN-KEYWORD" => Arc::new(DomainKeyword::new(payload, adapter)),
        "GEOIP" => Arc::new(GeoIp::new(payload.to_uppercase(), adapter, geoip.clone())),
        "IP-CIDR" | "IP-CIDR6" => Arc::new(IpCidr::parse(payload, adapter, no_resolve)?),
        "SRC-IP-CIDR" => Arc::new(SrcIpCidr::parse(payload, adapter)?),
        "SRC-PORT" => Arc::new(SrcPort::parse(payload, adapter)?),
        "DST-PORT" => Arc::new(DstPort::parse(payload, adapter)?),
        "PROCESS-NAME" => Arc::new(ProcessName::new(payload, adapter)),
        "PROCESS-PATH" => Arc::new(ProcessPath::new(payload, adapter)),
        "UID" => Arc::new(super::uid::Uid::parse(payload, adapter)?),
        other => return Err(Error::Rule(format!("unknown rule type: {}", other))),
    };
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Network;

    fn meta(host: &str) -> Metadata {
        Metadata::tcp().with_host(host.to_string()).with_dst_port(443)
    }

    #[test]
    fn test_domain_suffix_matches_subdomains() {
        let rule = DomainSuffix::new("google.com".to_string(), "PROXY".to_string());
        assert!(rule.is_match(&meta("www.google.com")));
        assert!(rule.is_match(&meta("google.com")));
        assert!(!rule.is_match(&meta("notgoogle.com")));
    }

    #[test]
    fn test_ip_cidr_should_resolve() {
        let rule = IpCidr::parse("10.0.0.0/8".to_string(), "DIRECT".to_string(), false).unwrap();
        assert!(rule.should_resolve_ip());
        let rule = IpCidr::parse("10.0.0.0/8".to_string(), "DIRECT".to_string(), true).unwrap();
        assert!(!rule.should_resolve_ip());
    }

    #[test]
    fn test_rule_extra_disqualifies_on_network() {
        let extra = RuleExtra {
            network: Some(Network::Udp),
            ..Default::default()
        };
        assert!(extra.disqualifies(&meta("x.com")));
    }

    #[test]
    fn test_parse_rule_line_match() {
        let geoip = Arc::new(GeoIpReader::new("nonexistent.mmdb"));
        let rule = parse_rule_line("MATCH,DIRECT", &geoip).unwrap();
        assert_eq!(rule.rule_type(), "MATCH");
        assert_eq!(rule.adapter(), "DIRECT");
    }

    #[test]
    fn test_parse_rule_line_domain() {
        let geoip = Arc::new(GeoIpReader::new("nonexistent.mmdb"));
        let rule = parse_rule_line("DOMAIN-SUFFIX,example.com,PROXY", &geoip).unwrap();
        assert_eq!(rule.rule_type(), "DOMAIN-SUFFIX");
        assert!(rule.is_match(&meta("www.example.com")));
    }
}
