//! The `Pass` marker adapter: a rule can route to `PASS` to fall through to
//! the next rule in the scan rather than naming a real adapter. It is
//! never actually dialed — the evaluator filters it out before returning.

use super::{Adapter, AdapterType, PacketConn, ProxyConnection};
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;

pub struct Pass;

impl Pass {
    pub fn new() -> Self {
        Pass
    }
}

impl Default for Pass {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for Pass {
    fn name(&self) -> &str {
        "PASS"
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Pass
    }

    fn addr(&self) -> String {
        "PASS".to_string()
    }

    fn supports_udp(&self) -> bool {
        false
    }

    async fn dial_context(&self, _metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        Err(Error::unsupported("PASS is never dialed directly"))
    }

    async fn listen_packet_context(&self, _metadata: &Metadata) -> Result<Box<dyn PacketConn>> {
        Err(Error::unsupported("PASS is never dialed directly"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_type() {
        assert_eq!(Pass::new().adapter_type(), AdapterType::Pass);
    }
}
