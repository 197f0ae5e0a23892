//! Rule-set providers: externally-sourced rule content kept current in the
//! background and folded into the ordered rule scan.

mod fetcher;
pub mod rule;

pub use rule::{RuleBehavior, RuleProviderInfo, RuleSetProvider};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// How a provider's payload is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum VehicleType {
    HTTP,
    File,
    Inline,
    Compatible,
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleType::HTTP => write!(f, "HTTP"),
            VehicleType::File => write!(f, "File"),
            VehicleType::Inline => write!(f, "Inline"),
            VehicleType::Compatible => write!(f, "Compatible"),
        }
    }
}

/// Holds every configured rule-set provider, keyed by name.
pub struct ProviderManager {
    rule_providers: RwLock<HashMap<String, Arc<RuleSetProvider>>>,
}

impl ProviderManager {
    pub fn new() -> Self {
        ProviderManager {
            rule_providers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_rule_provider(&self, provider: Arc<RuleSetProvider>) {
        let name = provider.name().to_string();
        self.rule_providers.write().await.insert(name, provider);
    }

    pub async fn get_rule_provider(&self, name: &str) -> Option<Arc<RuleSetProvider>> {
        self.rule_providers.read().await.get(name).cloned()
    }

    pub async fn rule_providers(&self) -> HashMap<String, Arc<RuleSetProvider>> {
        self.rule_providers.read().await.clone()
    }

    pub async fn update_all(&self) {
        for provider in self.rule_providers.read().await.values() {
            if let Err(e) = provider.update().await {
                warn!("failed to update rule provider {}: {}", provider.name(), e);
            }
        }
    }

    pub async fn close_all(&self) {
        for provider in self.rule_providers.read().await.values() {
            provider.close().await;
        }
    }
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_type_display() {
        assert_eq!(VehicleType::HTTP.to_string(), "HTTP");
        assert_eq!(VehicleType::File.to_string(), "File");
    }
}
