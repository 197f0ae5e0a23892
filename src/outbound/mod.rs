//! Outbound adapters.
//!
//! Only `DIRECT`, `REJECT`/`REJECT-DROP`, and the `Pass` marker are real;
//! every concrete proxy-protocol client is an external collaborator outside
//! this crate's scope.

mod direct;
mod pass;
mod reject;

pub use direct::Direct;
pub use pass::Pass;
pub use reject::Reject;

use crate::common::Metadata;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Adapter type, used by the rule evaluator's Pass/UDP-support checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    Direct,
    Reject,
    RejectDrop,
    /// Falls through the rule scan as if it weren't matched at all; used to
    /// let a rule "skip" to the next one without naming a real adapter.
    Pass,
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterType::Direct => write!(f, "Direct"),
            AdapterType::Reject => write!(f, "Reject"),
            AdapterType::RejectDrop => write!(f, "RejectDrop"),
            AdapterType::Pass => write!(f, "Pass"),
        }
    }
}

/// A TCP connection handed back by an adapter's `dial_context`.
pub trait ProxyConnection: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ProxyConnection for T {}

/// A UDP packet conn handed back by an adapter's `listen_packet_context`.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}

/// An outbound transport identified by name; sinks TCP/UDP traffic.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    fn adapter_type(&self) -> AdapterType;

    /// `"host:port"` of the adapter's own endpoint (not the flow's
    /// destination) — `DIRECT`/`REJECT` report their own sentinel name.
    fn addr(&self) -> String;

    fn supports_udp(&self) -> bool;

    async fn dial_context(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>>;

    async fn listen_packet_context(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>>;

    /// The underlying adapter a wrapper (e.g. a proxy-group selector) binds
    /// to for this flow, if any. Built-in leaf adapters return `None`;
    /// group adapters would return `Some(inner)`, but since proxy groups
    /// are out of scope here every adapter in this crate returns `None`.
    fn unwrap(&self, _metadata: &Metadata) -> Option<Arc<dyn Adapter>> {
        None
    }
}

/// Returns true if `adapter`, or its unwrapped underlying adapter, is of
/// type `Pass`. Mirrors the evaluator's Pass-skip check.
pub fn is_pass(adapter: &Arc<dyn Adapter>, metadata: &Metadata) -> bool {
    if adapter.adapter_type() == AdapterType::Pass {
        return true;
    }
    match adapter.unwrap(metadata) {
        Some(inner) => inner.adapter_type() == AdapterType::Pass,
        None => false,
    }
}

/// Holds the flat name -> adapter map. Configuration replacement swaps the
/// whole map under a write lock; readers take a clone of the `Arc` for the
/// duration of one evaluation, matching the configuration-mutex semantics
/// described for the rules vector.
pub struct AdapterManager {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterManager {
    /// The three always-present built-ins plus `Pass`, with no user-defined
    /// adapters. Callers extend this via `insert` once real adapters (out
    /// of scope here) are wired in.
    pub fn new() -> Self {
        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert("DIRECT".to_string(), Arc::new(Direct::new()));
        adapters.insert("REJECT".to_string(), Arc::new(Reject::new(false)));
        adapters.insert("REJECT-DROP".to_string(), Arc::new(Reject::new(true)));
        adapters.insert("PASS".to_string(), Arc::new(Pass::new()));
        AdapterManager { adapters }
    }

    pub fn insert(&mut self, name: String, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(name, adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&String> {
        self.adapters.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_manager_has_builtins() {
        let mgr = AdapterManager::new();
        assert!(mgr.get("DIRECT").is_some());
        assert!(mgr.get("REJECT").is_some());
        assert!(mgr.get("REJECT-DROP").is_some());
        assert!(mgr.get("PASS").is_some());
        assert!(mgr.get("GhostProxy").is_none());
    }

    #[test]
    fn test_is_pass() {
        let mgr = AdapterManager::new();
        let meta = Metadata::tcp();
        assert!(is_pass(&mgr.get("PASS").unwrap(), &meta));
        assert!(!is_pass(&mgr.get("DIRECT").unwrap(), &meta));
    }
}
