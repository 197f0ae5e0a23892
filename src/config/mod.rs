//! Configuration for the dispatch core.
//!
//! Loading a full mihomo config file (proxy definitions, proxy groups, DNS
//! server setup, listener bind addresses) is out of scope; this keeps only
//! the fields the tunnel, rule engine, and rule-set providers actually read.

use crate::Result;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Routing mode: "rule", "global", or "direct".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Log level passed to the tracing env-filter.
    #[serde(default = "default_log_level", rename = "log-level")]
    pub log_level: String,

    /// Inline rule lines, evaluated in order ahead of any rule-set provider.
    #[serde(default)]
    pub rules: Vec<String>,

    /// Externally-sourced rule-set providers.
    #[serde(default, rename = "rule-providers")]
    pub rule_providers: Vec<RuleProviderConfig>,

    /// GeoIP database path used by GEOIP rules.
    #[serde(rename = "geoip-database")]
    pub geoip_database: Option<String>,

    /// Whether to resolve the owning process/uid of a flow; skipped
    /// entirely when no configured rule needs it regardless of this flag.
    #[serde(default = "default_true", rename = "find-process-mode")]
    pub find_process_mode: bool,

    /// Enhanced DNS mode: "fake-ip", "redir-host", or unset for disabled.
    #[serde(rename = "enhanced-mode")]
    pub enhanced_mode: Option<String>,

    /// Dispatch tuning knobs.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Unrecognized top-level keys (proxy definitions, DNS server setup,
    /// management API bind address, listener config) kept around rather
    /// than rejected, since loading those is out of scope here but a real
    /// config file will carry them.
    #[serde(flatten)]
    pub extra: std::collections::HashMap<String, serde_yaml::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: default_mode(),
            log_level: default_log_level(),
            rules: Vec::new(),
            rule_providers: Vec::new(),
            geoip_database: None,
            find_process_mode: true,
            enhanced_mode: None,
            dispatch: DispatchConfig::default(),
            extra: std::collections::HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub async fn load_async<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn mapping_enabled(&self) -> bool {
        matches!(self.enhanced_mode.as_deref(), Some("fake-ip") | Some("redir-host"))
    }
}

fn default_true() -> bool {
    true
}

fn default_mode() -> String {
    "rule".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Intake queue sizes, NAT idle timeout, and dial timeouts the tunnel uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    #[serde(rename = "tcp-queue-capacity")]
    pub tcp_queue_capacity: usize,
    #[serde(rename = "udp-queue-capacity")]
    pub udp_queue_capacity: usize,
    #[serde(rename = "nat-idle-timeout-secs")]
    pub nat_idle_timeout_secs: u64,
    #[serde(rename = "tcp-dial-timeout-secs")]
    pub tcp_dial_timeout_secs: u64,
    #[serde(rename = "udp-dial-timeout-secs")]
    pub udp_dial_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            tcp_queue_capacity: 200,
            udp_queue_capacity: 200,
            nat_idle_timeout_secs: 60,
            tcp_dial_timeout_secs: 10,
            udp_dial_timeout_secs: 10,
        }
    }
}

/// One configured rule-set provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleProviderConfig {
    pub name: String,
    pub behavior: String,
    #[serde(rename = "type")]
    pub vehicle: String,
    pub url: Option<String>,
    pub path: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval: u64,
    /// The adapter this rule-set routes matches to.
    pub adapter: String,
}

fn default_interval_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.mode, "rule");
        assert_eq!(config.dispatch.tcp_queue_capacity, 200);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
mode: rule
log-level: debug
rules:
  - DOMAIN-SUFFIX,google.com,DIRECT
  - MATCH,DIRECT
rule-providers:
  - name: ads
    behavior: domain
    type: http
    url: https://example.com/ads.txt
    adapter: REJECT
enhanced-mode: fake-ip
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rule_providers.len(), 1);
        assert!(config.mapping_enabled());
    }
}
