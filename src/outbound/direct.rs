//! Direct outbound (no proxy)

use super::{Adapter, AdapterType, PacketConn, ProxyConnection};
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Direct connection (no proxy)
pub struct Direct {
    name: String,
}

impl Direct {
    pub fn new() -> Self {
        Direct {
            name: "DIRECT".to_string(),
        }
    }

    pub fn with_name(name: String) -> Self {
        Direct { name }
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Direct
    }

    fn addr(&self) -> String {
        "DIRECT".to_string()
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        let addr = metadata.remote_address();
        debug!("Direct connecting to {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;

        debug!("Direct connected to {}", addr);
        Ok(Box::new(stream))
    }

    async fn listen_packet_context(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::connection(format!("Failed to bind UDP socket: {}", e)))?;
        debug!("Direct UDP listening for {}", metadata.remote_address());
        Ok(Box::new(DirectPacketConn { socket }))
    }
}

struct DirectPacketConn {
    socket: UdpSocket,
}

#[async_trait]
impl PacketConn for DirectPacketConn {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        self.socket
            .send_to(buf, target)
            .await
            .map_err(|e| Error::connection(format!("UDP send failed: {}", e)))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| Error::connection(format!("UDP recv failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_creation() {
        let direct = Direct::new();
        assert_eq!(direct.name(), "DIRECT");
        assert_eq!(direct.adapter_type(), AdapterType::Direct);
        assert!(direct.supports_udp());
    }
}
