//! Reject outbound (block connections)

use super::{Adapter, AdapterType, PacketConn, ProxyConnection};
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;
use std::io::{self};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Reject connection - immediately closes or drops
pub struct Reject {
    name: String,
    drop: bool,
}

impl Reject {
    pub fn new(drop: bool) -> Self {
        let name = if drop { "REJECT-DROP" } else { "REJECT" };
        Reject {
            name: name.to_string(),
            drop,
        }
    }
}

#[async_trait]
impl Adapter for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        if self.drop {
            AdapterType::RejectDrop
        } else {
            AdapterType::Reject
        }
    }

    fn addr(&self) -> String {
        self.name.clone()
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial_context(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        debug!("{} connection to {}", self.name, metadata.remote_address());

        if self.drop {
            Ok(Box::new(DropConn))
        } else {
            Ok(Box::new(RejectConn))
        }
    }

    async fn listen_packet_context(&self, metadata: &Metadata) -> Result<Box<dyn PacketConn>> {
        debug!("{} UDP for {}", self.name, metadata.remote_address());
        Ok(Box::new(RejectPacketConn))
    }
}

/// A connection that immediately returns EOF
struct RejectConn;

impl AsyncRead for RejectConn {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for RejectConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A connection that never produces data or accepts a write completing;
/// used for `REJECT-DROP` where the flow is meant to hang until the caller
/// times out rather than observing an immediate close.
struct DropConn;

impl AsyncRead for DropConn {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for DropConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct RejectPacketConn;

#[async_trait]
impl PacketConn for RejectPacketConn {
    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> Result<usize> {
        Ok(buf.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Err(Error::connection("REJECT does not receive packets"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_creation() {
        let reject = Reject::new(false);
        assert_eq!(reject.name(), "REJECT");
        assert_eq!(reject.adapter_type(), AdapterType::Reject);

        let drop = Reject::new(true);
        assert_eq!(drop.name(), "REJECT-DROP");
        assert_eq!(drop.adapter_type(), AdapterType::RejectDrop);
    }
}
