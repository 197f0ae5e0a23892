//! Dispatch core for a rule-based network proxy.
//!
//! This crate owns the concurrent TCP/UDP flow pipeline, the ordered rule
//! evaluator, and the rule-set provider machinery that keeps externally
//! sourced rule content current. Concrete outbound protocol adapters, the
//! DNS resolver/hosts tree, the traffic sniffer, and the management API are
//! external collaborators referenced only through the traits in `outbound`,
//! `dns`, `sniffer`, and `locator`.
//!
//! # Architecture
//!
//! ```text
//! +-------------+      +----------------+      +-------------+
//! |  inbound/   | ---> |    tunnel/      | ---> |  outbound/  |
//! | (trait only)|      | (dispatch core) |      |(DIRECT/REJECT)
//! +-------------+      +--------+--------+      +-------------+
//!                               |
//!              +----------------+----------------+
//!              |                |                 |
//!       +------v------+  +------v------+   +------v------+
//!       |    rule/    |  |  provider/  |   |     nat/    |
//!       |  (engine)   |  | (rule-sets) |   |  (UDP NAT)  |
//!       +-------------+  +-------------+   +-------------+
//! ```

pub mod common;
pub mod config;
pub mod dns;
pub mod inbound;
pub mod locator;
pub mod nat;
pub mod outbound;
pub mod provider;
pub mod rule;
pub mod sniffer;
pub mod statistic;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use provider::{ProviderManager, RuleSetProvider};
use rule::{parse_rule_line, GeoIpReader, Rule};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Builds the ordered rules vector from inline config lines, with every
/// configured rule-set provider appended after them in declared order.
async fn build_rules(
    config: &Config,
    geoip: &Arc<GeoIpReader>,
    providers: &ProviderManager,
) -> Result<Vec<Arc<dyn Rule>>> {
    let mut rules: Vec<Arc<dyn Rule>> = Vec::with_capacity(config.rules.len() + config.rule_providers.len());

    for line in &config.rules {
        rules.push(parse_rule_line(line, geoip)?);
    }

    for provider_config in &config.rule_providers {
        let behavior = match provider_config.behavior.to_lowercase().as_str() {
            "domain" => provider::RuleBehavior::Domain,
            "ipcidr" | "ip-cidr" => provider::RuleBehavior::IpCidr,
            "classical" => provider::RuleBehavior::Classical,
            other => {
                return Err(Error::config(format!(
                    "unknown rule-provider behavior: {}",
                    other
                )))
            }
        };

        let provider = match provider_config.vehicle.to_lowercase().as_str() {
            "http" => {
                let url = provider_config.url.clone().ok_or_else(|| {
                    Error::config(format!(
                        "rule-provider {} is type http but has no url",
                        provider_config.name
                    ))
                })?;
                let cache_path = provider_config
                    .path
                    .clone()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(format!("{}.cache", provider_config.name)));
                Arc::new(RuleSetProvider::new_http(
                    provider_config.name.clone(),
                    provider_config.adapter.clone(),
                    url,
                    cache_path,
                    Duration::from_secs(provider_config.interval),
                    behavior,
                    geoip.clone(),
                ))
            }
            "file" => {
                let path = provider_config.path.clone().ok_or_else(|| {
                    Error::config(format!(
                        "rule-provider {} is type file but has no path",
                        provider_config.name
                    ))
                })?;
                Arc::new(RuleSetProvider::new_file(
                    provider_config.name.clone(),
                    provider_config.adapter.clone(),
                    PathBuf::from(path),
                    behavior,
                    geoip.clone(),
                ))
            }
            other => {
                return Err(Error::config(format!(
                    "unknown rule-provider vehicle type: {}",
                    other
                )))
            }
        };

        provider.initial().await?;
        rules.push(provider.clone());
        providers.add_rule_provider(provider).await;
    }

    Ok(rules)
}

/// Owns the tunnel, the shared statistic manager, and the rule-set
/// providers that feed it, and wires them together from a loaded `Config`.
pub struct Gateway {
    config: Config,
    tunnel: Arc<tunnel::Tunnel>,
    statistic: Arc<statistic::StatisticManager>,
    providers: Arc<ProviderManager>,
}

impl Gateway {
    /// Build every dispatch-core collaborator from `config` and wire a
    /// `Tunnel` on top of them. Out-of-scope collaborators (resolver, hosts
    /// tree, fake-IP pool, process locator, sniffer) are given minimal
    /// stand-ins unless a real implementation is wired in by the caller.
    pub async fn new(config: Config) -> Result<Self> {
        let geoip_path = config.geoip_database.clone().unwrap_or_default();
        let geoip = Arc::new(GeoIpReader::new(&geoip_path));

        let statistic = Arc::new(statistic::StatisticManager::new());
        statistic.start_ticker();

        let providers = Arc::new(ProviderManager::new());
        let rules = build_rules(&config, &geoip, &providers).await?;
        info!("loaded {} rules", rules.len());

        let adapters = outbound::AdapterManager::new();
        let sniffer: Arc<dyn sniffer::Sniffer> = Arc::new(sniffer::NoopSniffer);
        let tunnel_config = tunnel::TunnelConfig::new(rules, adapters, sniffer);

        let locator: Arc<dyn locator::ProcessLocator> = if config.find_process_mode {
            pick_locator()
        } else {
            Arc::new(locator::UnsupportedLocator)
        };

        let resolver: Arc<dyn dns::Resolver> = Arc::new(dns::StaticResolver::new());
        let hosts: Arc<dyn dns::HostsTree> = Arc::new(dns::StaticHostsTree::new());
        let fake_ip_pool: Arc<dyn dns::FakeIpPool> = Arc::new(dns::NullFakeIpPool);

        let tunnel = tunnel::Tunnel::with_dispatch_config(
            tunnel_config,
            statistic.clone(),
            hosts,
            resolver,
            fake_ip_pool,
            locator,
            config.mapping_enabled(),
            &config.dispatch,
        );
        tunnel.set_mode(tunnel::TunnelMode::try_from(config.mode.as_str())?);

        Ok(Gateway {
            config,
            tunnel,
            statistic,
            providers,
        })
    }

    /// Starts the tunnel's fan-out/worker tasks and the rule-provider
    /// refresh schedule. Call once after construction.
    pub fn run(&self) {
        self.tunnel.start();

        let providers = self.providers.clone();
        let interval = self
            .config
            .rule_providers
            .iter()
            .map(|p| p.interval)
            .min()
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3600));
        if !self.config.rule_providers.is_empty() {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    providers.update_all().await;
                }
            });
        }
    }

    pub fn tunnel(&self) -> &Arc<tunnel::Tunnel> {
        &self.tunnel
    }

    pub fn statistic(&self) -> &Arc<statistic::StatisticManager> {
        &self.statistic
    }

    pub fn providers(&self) -> &Arc<ProviderManager> {
        &self.providers
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(target_os = "linux")]
fn pick_locator() -> Arc<dyn locator::ProcessLocator> {
    Arc::new(locator::LinuxLocator)
}

#[cfg(not(target_os = "linux"))]
fn pick_locator() -> Arc<dyn locator::ProcessLocator> {
    warn!("process matching requested but unsupported on this platform");
    Arc::new(locator::UnsupportedLocator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_builds_from_default_config() {
        let config = Config::default();
        let gateway = Gateway::new(config).await.unwrap();
        assert_eq!(gateway.tunnel().mode(), tunnel::TunnelMode::Rule);
    }

    #[tokio::test]
    async fn test_gateway_loads_inline_rules() {
        let mut config = Config::default();
        config.rules = vec!["MATCH,DIRECT".to_string()];
        let gateway = Gateway::new(config).await.unwrap();
        assert!(gateway.tunnel().config_snapshot().rules.len() >= 1);
    }
}
