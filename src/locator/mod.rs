//! Process/uid resolution for a flow's local socket.
//!
//! Modeled as a trait so the dispatch core can be exercised without real
//! `/proc` access; `LinuxLocator` is the one concrete implementation, built
//! the way `process_other.go`'s per-platform stub dispatches: unsupported
//! platforms and any lookup failure collapse to the same sentinel error.

#[cfg(target_os = "linux")]
mod linux;

use crate::common::{Metadata, Network};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::IpAddr;

#[cfg(target_os = "linux")]
pub use linux::LinuxLocator;

/// Resolves the owning process and uid of a local socket.
#[async_trait]
pub trait ProcessLocator: Send + Sync {
    /// Find the executable path of the process bound to `(network, ip, port)`.
    async fn find_process_name(&self, network: Network, ip: IpAddr, port: u16) -> Result<String>;

    /// Find the uid of the process bound to `(network, ip, port)`.
    async fn find_uid(&self, network: Network, ip: IpAddr, port: u16) -> Result<i32>;
}

/// Always returns [`Error::platform_not_supported`]; used on targets with no
/// socket-to-process mapping and as the default when process matching is
/// disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedLocator;

#[async_trait]
impl ProcessLocator for UnsupportedLocator {
    async fn find_process_name(&self, _network: Network, _ip: IpAddr, _port: u16) -> Result<String> {
        Err(Error::platform_not_supported())
    }

    async fn find_uid(&self, _network: Network, _ip: IpAddr, _port: u16) -> Result<i32> {
        Err(Error::platform_not_supported())
    }
}

/// Whether any active rule actually needs process/uid information for this
/// flow. Evaluated once per flow so the (comparatively expensive) locator is
/// skipped entirely when no `PROCESS-NAME`/`PROCESS-PATH`/`UID` rule is
/// configured.
pub fn should_find_process(rule_types: &[&str]) -> bool {
    rule_types
        .iter()
        .any(|t| matches!(*t, "PROCESS-NAME" | "PROCESS-PATH" | "UID"))
}

/// Rate-limits the debug log for lookup failures and remembers the last
/// successfully resolved process name, mirroring `tunnel.go`'s `failTotal`/
/// `procesCache` package-level state.
pub struct FailureTracker {
    fail_total: std::sync::atomic::AtomicUsize,
    last_process: parking_lot::Mutex<String>,
}

impl Default for FailureTracker {
    fn default() -> Self {
        FailureTracker {
            fail_total: std::sync::atomic::AtomicUsize::new(0),
            last_process: parking_lot::Mutex::new(String::new()),
        }
    }
}

impl FailureTracker {
    const MAX_LOGGED_FAILURES: usize = 20;

    /// Returns true the first 20 times it is called; after that, callers
    /// should suppress the debug log for repeated failures.
    pub fn should_log_failure(&self) -> bool {
        let n = self.fail_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        n < Self::MAX_LOGGED_FAILURES
    }

    pub fn record_process(&self, name: &str) {
        *self.last_process.lock() = name.to_string();
    }

    pub fn last_process(&self) -> String {
        self.last_process.lock().clone()
    }
}

/// Resolve `metadata.process`/`metadata.process_path`/`metadata.uid` in
/// place using `locator`, honoring already-cached values and the failure
/// tracker's rate limit.
pub async fn resolve_process(
    locator: &dyn ProcessLocator,
    tracker: &FailureTracker,
    metadata: &mut Metadata,
) {
    if metadata.process.is_none() {
        match locator
            .find_process_name(metadata.network, metadata.src_ip, metadata.src_port)
            .await
        {
            Ok(path) => {
                tracker.record_process(&path);
                metadata.process = Some(
                    std::path::Path::new(&path)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.clone()),
                );
                metadata.process_path = Some(path);
            }
            Err(e) => {
                if tracker.should_log_failure() {
                    tracing::debug!("process lookup failed for {}: {}", metadata, e);
                }
            }
        }
    }

    if metadata.uid.is_none() {
        if let Ok(uid) = locator
            .find_uid(metadata.network, metadata.src_ip, metadata.src_port)
            .await
        {
            metadata.uid = Some(uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_locator_errs() {
        let locator = UnsupportedLocator;
        let err = locator
            .find_process_name(Network::Tcp, "127.0.0.1".parse().unwrap(), 80)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessLookup(_)));
    }

    #[test]
    fn test_should_find_process() {
        assert!(should_find_process(&["DOMAIN", "PROCESS-NAME"]));
        assert!(!should_find_process(&["DOMAIN", "IP-CIDR"]));
    }

    #[test]
    fn test_failure_tracker_caps_logging() {
        let tracker = FailureTracker::default();
        let mut logged = 0;
        for _ in 0..25 {
            if tracker.should_log_failure() {
                logged += 1;
            }
        }
        assert_eq!(logged, 20);
    }

    #[tokio::test]
    async fn test_resolve_process_uses_cache() {
        let locator = UnsupportedLocator;
        let tracker = FailureTracker::default();
        let mut metadata = Metadata::tcp();
        metadata.process = Some("cached".to_string());
        resolve_process(&locator, &tracker, &mut metadata).await;
        assert_eq!(metadata.process.as_deref(), Some("cached"));
    }
}
