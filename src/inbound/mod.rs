//! Inbound listener contract and the two intake-queue item shapes the
//! Tunnel consumes. Concrete listener protocols (HTTP CONNECT, SOCKS5,
//! mixed-port sniffing, TUN) are external collaborators outside this
//! crate's scope; only the shape they hand to the dispatcher is defined
//! here.

use crate::common::Metadata;
use crate::outbound::ProxyConnection;
use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;

/// A listener that accepts connections/packets and feeds them to a Tunnel's
/// intake queues.
#[async_trait]
pub trait InboundListener: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// TCP intake-queue element: an opaque connection-context carrying the
/// accepted stream and the metadata the listener parsed from it.
pub struct TcpQueueItem {
    pub conn: Box<dyn ProxyConnection>,
    pub metadata: Metadata,
}

impl TcpQueueItem {
    pub fn new(conn: Box<dyn ProxyConnection>, metadata: Metadata) -> Self {
        TcpQueueItem { conn, metadata }
    }
}

/// UDP intake-queue element: a packet adapter carrying the payload, the
/// metadata, the listener-side local address (the NAT/single-flight flow
/// key), and a way to write a reply back to the original client.
#[async_trait]
pub trait UdpPacketAdapter: Send + Sync {
    fn data(&self) -> &[u8];

    fn metadata(&self) -> &Metadata;

    /// The listener-side local address; doubles as the NAT flow key.
    fn local_addr(&self) -> SocketAddr;

    async fn write_back(&self, data: &[u8], from: SocketAddr) -> Result<()>;
}

pub type UdpQueueItem = Box<dyn UdpPacketAdapter>;
