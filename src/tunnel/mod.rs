//! The Tunnel façade: intake queues, TCP per-connection tasks, the UDP
//! worker pool, and the NAT/single-flight relay they share.

use crate::common::{DnsMode, Metadata};
use crate::dns::{FakeIpPool, HostsTree, Resolver};
use crate::inbound::{TcpQueueItem, UdpPacketAdapter, UdpQueueItem};
use crate::locator::{resolve_process, should_find_process, FailureTracker, ProcessLocator};
use crate::nat::NatTable;
use crate::outbound::{Adapter, AdapterManager, PacketConn, ProxyConnection};
use crate::rule::{match_rules, Rule};
use crate::sniffer::Sniffer;
use crate::statistic::{
    ConnectionMetadata as StatConnectionMetadata, StatisticManager, TrackedConnection,
};
use crate::{Error, Result};
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use crate::provider::RuleSetProvider;

/// Routing mode: whether the rule list is consulted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    Rule,
    Global,
    Direct,
}

impl Default for TunnelMode {
    fn default() -> Self {
        TunnelMode::Rule
    }
}

impl TryFrom<&str> for TunnelMode {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rule" => Ok(TunnelMode::Rule),
            "global" => Ok(TunnelMode::Global),
            "direct" => Ok(TunnelMode::Direct),
            _ => Err(Error::config(format!("unknown tunnel mode: {}", s))),
        }
    }
}

/// The rules vector, adapters map, rule-providers map, and sniffer
/// dispatcher, replaced together under one write so an in-flight scan
/// never observes a half-updated snapshot.
pub struct TunnelConfig {
    pub rules: Vec<Arc<dyn Rule>>,
    pub adapters: AdapterManager,
    pub rule_providers: HashMap<String, Arc<RuleSetProvider>>,
    pub sniffer: Arc<dyn Sniffer>,
}

impl TunnelConfig {
    pub fn new(rules: Vec<Arc<dyn Rule>>, adapters: AdapterManager, sniffer: Arc<dyn Sniffer>) -> Self {
        TunnelConfig {
            rules,
            adapters,
            rule_providers: HashMap::new(),
            sniffer,
        }
    }
}

struct TrackedProxyConnection {
    id: String,
    statistic: Arc<StatisticManager>,
    tracked: Arc<TrackedConnection>,
    inner: Box<dyn ProxyConnection>,
}

impl Drop for TrackedProxyConnection {
    fn drop(&mut self) {
        self.statistic.close(&self.id);
    }
}

impl AsyncRead for TrackedProxyConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes = (buf.filled().len() - before) as u64;
            if bytes > 0 {
                this.statistic.add_download(bytes);
                this.tracked.add_download(bytes);
            }
        }
        result
    }
}

impl AsyncWrite for TrackedProxyConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.statistic.add_upload(*n as u64);
                this.tracked.add_upload(*n as u64);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Wraps a dialed `PacketConn` the way `TrackedProxyConnection` wraps a TCP
/// stream: every forwarded byte is added to both the global statistic
/// totals and this flow's `TrackedConnection`, and dropping it (when the
/// owning `NatEntry` is evicted) closes the tracked connection.
struct TrackedPacketConn {
    id: String,
    statistic: Arc<StatisticManager>,
    tracked: Arc<TrackedConnection>,
    inner: Box<dyn PacketConn>,
}

impl Drop for TrackedPacketConn {
    fn drop(&mut self) {
        self.statistic.close(&self.id);
    }
}

#[async_trait::async_trait]
impl PacketConn for TrackedPacketConn {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        let n = self.inner.send_to(buf, target).await?;
        if n > 0 {
            self.statistic.add_upload(n as u64);
            self.tracked.add_upload(n as u64);
        }
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (n, from) = self.inner.recv_from(buf).await?;
        if n > 0 {
            self.statistic.add_download(n as u64);
            self.tracked.add_download(n as u64);
        }
        Ok((n, from))
    }
}

fn format_clause(rule_type: &str, payload: &str) -> String {
    if payload.is_empty() {
        rule_type.to_string()
    } else {
        format!("{}({})", rule_type, payload)
    }
}

fn to_stat_metadata(metadata: &Metadata) -> StatConnectionMetadata {
    let dns_mode = match metadata.dns_mode {
        DnsMode::Normal => "normal",
        DnsMode::FakeIP => "fakeip",
        DnsMode::Mapping => "mapping",
        DnsMode::Hosts => "hosts",
    };
    StatConnectionMetadata {
        network: metadata.network.to_string().to_lowercase(),
        conn_type: metadata.conn_type.to_string(),
        source_ip: metadata.src_ip.to_string(),
        destination_ip: metadata.dst_ip.map(|ip| ip.to_string()).unwrap_or_default(),
        source_port: metadata.src_port.to_string(),
        destination_port: metadata.dst_port.to_string(),
        host: metadata.host.clone(),
        dns_mode: dns_mode.to_string(),
        process_path: metadata.process_path.clone().unwrap_or_default(),
        special_proxy: metadata.special_proxy.clone().unwrap_or_default(),
    }
}

/// Process-wide dispatch singleton: owns the intake queues and the NAT
/// table; rules/adapters/providers/sniffer live under a swappable snapshot.
pub struct Tunnel {
    config: SyncRwLock<Arc<TunnelConfig>>,
    mode: SyncRwLock<TunnelMode>,
    nat: Arc<NatTable>,
    statistic: Arc<StatisticManager>,
    hosts: Arc<dyn HostsTree>,
    resolver: Arc<dyn Resolver>,
    fake_ip_pool: Arc<dyn FakeIpPool>,
    locator: Arc<dyn ProcessLocator>,
    failure_tracker: FailureTracker,
    mapping_enabled: bool,
    tcp_tx: mpsc::Sender<TcpQueueItem>,
    tcp_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TcpQueueItem>>>,
    udp_tx: mpsc::Sender<UdpQueueItem>,
    udp_rx: tokio::sync::Mutex<Option<mpsc::Receiver<UdpQueueItem>>>,
    tcp_timeout: Duration,
    udp_timeout: Duration,
}

impl Tunnel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TunnelConfig,
        statistic: Arc<StatisticManager>,
        hosts: Arc<dyn HostsTree>,
        resolver: Arc<dyn Resolver>,
        fake_ip_pool: Arc<dyn FakeIpPool>,
        locator: Arc<dyn ProcessLocator>,
        mapping_enabled: bool,
    ) -> Arc<Self> {
        Self::with_dispatch_config(
            config,
            statistic,
            hosts,
            resolver,
            fake_ip_pool,
            locator,
            mapping_enabled,
            &crate::config::DispatchConfig::default(),
        )
    }

    /// Like `new`, but takes the intake queue capacities, NAT idle timeout,
    /// and dial timeouts from a loaded `DispatchConfig` instead of the
    /// built-in defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn with_dispatch_config(
        config: TunnelConfig,
        statistic: Arc<StatisticManager>,
        hosts: Arc<dyn HostsTree>,
        resolver: Arc<dyn Resolver>,
        fake_ip_pool: Arc<dyn FakeIpPool>,
        locator: Arc<dyn ProcessLocator>,
        mapping_enabled: bool,
        dispatch: &crate::config::DispatchConfig,
    ) -> Arc<Self> {
        let (tcp_tx, tcp_rx) = mpsc::channel(dispatch.tcp_queue_capacity);
        let (udp_tx, udp_rx) = mpsc::channel(dispatch.udp_queue_capacity);
        let nat = NatTable::new(Duration::from_secs(dispatch.nat_idle_timeout_secs));
        nat.start_sweeper();

        Arc::new(Tunnel {
            config: SyncRwLock::new(Arc::new(config)),
            mode: SyncRwLock::new(TunnelMode::Rule),
            nat,
            statistic,
            hosts,
            resolver,
            fake_ip_pool,
            locator,
            failure_tracker: FailureTracker::default(),
            mapping_enabled,
            tcp_tx,
            tcp_rx: tokio::sync::Mutex::new(Some(tcp_rx)),
            udp_tx,
            udp_rx: tokio::sync::Mutex::new(Some(udp_rx)),
            tcp_timeout: Duration::from_secs(dispatch.tcp_dial_timeout_secs),
            udp_timeout: Duration::from_secs(dispatch.udp_dial_timeout_secs),
        })
    }

    /// Starts the TCP fan-out task and the fixed UDP worker pool. Call once
    /// after construction.
    pub fn start(self: &Arc<Self>) {
        let tcp_self = self.clone();
        tokio::spawn(async move {
            let mut rx = tcp_self
                .tcp_rx
                .lock()
                .await
                .take()
                .expect("tcp intake already started");
            while let Some(item) = rx.recv().await {
                let worker = tcp_self.clone();
                tokio::spawn(async move { worker.handle_tcp(item).await });
            }
        });

        let workers = std::cmp::max(4, num_cpus::get());
        for _ in 0..workers {
            let udp_self = self.clone();
            tokio::spawn(async move {
                let mut rx = loop {
                    let mut guard = udp_self.udp_rx.lock().await;
                    if let Some(rx) = guard.take() {
                        break rx;
                    }
                    drop(guard);
                    // Another worker holds the receiver momentarily during
                    // startup; this only races at construction time.
                    tokio::task::yield_now().await;
                };
                while let Some(item) = rx.recv().await {
                    udp_self.handle_udp(item).await;
                }
            });
        }
    }

    pub async fn submit_tcp(&self, item: TcpQueueItem) -> Result<()> {
        self.tcp_tx
            .send(item)
            .await
            .map_err(|_| Error::internal("tcp intake queue closed"))
    }

    pub async fn submit_udp(&self, item: UdpQueueItem) -> Result<()> {
        self.udp_tx
            .send(item)
            .await
            .map_err(|_| Error::internal("udp intake queue closed"))
    }

    pub fn set_mode(&self, mode: TunnelMode) {
        *self.mode.write() = mode;
        info!("tunnel mode changed to {:?}", mode);
    }

    pub fn mode(&self) -> TunnelMode {
        *self.mode.read()
    }

    pub fn replace_config(&self, config: TunnelConfig) {
        *self.config.write() = Arc::new(config);
    }

    pub fn config_snapshot(&self) -> Arc<TunnelConfig> {
        self.config.read().clone()
    }

    /// Literal-host rewrite, enhanced-mode reverse lookup, then process/uid
    /// resolution.
    async fn pre_handle(&self, metadata: &mut Metadata) -> Result<()> {
        metadata.rewrite_literal_host();

        if self.mapping_enabled && metadata.host.is_empty() {
            if let Some(dst_ip) = metadata.dst_ip {
                match self.resolver.reverse_lookup(dst_ip).await {
                    Some(host) => {
                        metadata.host = host.clone();
                        metadata.addr_type = crate::common::AddrType::Domain;
                        metadata.dns_mode = DnsMode::Mapping;
                        if self.fake_ip_pool.is_fake_ip(dst_ip) {
                            metadata.dst_ip = None;
                            metadata.dns_mode = DnsMode::FakeIP;
                        } else if let Some(ip) = self.hosts.lookup(&host) {
                            metadata.dst_ip = Some(ip);
                        }
                    }
                    None => {
                        if self.fake_ip_pool.is_fake_ip(dst_ip) {
                            return Err(Error::fake_ip_missing(dst_ip.to_string()));
                        }
                    }
                }
            }
        }

        if metadata.src_port > 0 {
            let rule_types: Vec<&str> = self
                .config_snapshot()
                .rules
                .iter()
                .map(|r| r.rule_type())
                .collect();
            if should_find_process(&rule_types) {
                resolve_process(self.locator.as_ref(), &self.failure_tracker, metadata).await;
            }
        }

        Ok(())
    }

    /// Resolves (adapter, rule-type, rule-payload) per the tunnel mode;
    /// `Rule` mode delegates to the ordered evaluator.
    async fn resolve(
        &self,
        config: &TunnelConfig,
        metadata: &mut Metadata,
    ) -> (Arc<dyn Adapter>, String, String) {
        match self.mode() {
            TunnelMode::Direct => (
                config.adapters.get("DIRECT").expect("DIRECT always present"),
                "DIRECT".to_string(),
                String::new(),
            ),
            TunnelMode::Global => {
                // No proxy-group concept is implemented here (out of
                // scope); a configured "GLOBAL" adapter is used if
                // present, otherwise this degrades like a missing adapter
                // anywhere else in dispatch.
                let adapter = config
                    .adapters
                    .get("GLOBAL")
                    .or_else(|| config.adapters.get("REJECT"))
                    .expect("REJECT always present");
                (adapter, "GLOBAL".to_string(), String::new())
            }
            TunnelMode::Rule => {
                let outcome = match_rules(
                    &config.rules,
                    &config.adapters,
                    self.hosts.as_ref(),
                    self.resolver.as_ref(),
                    metadata,
                )
                .await;
                let (rule_type, payload) = match &outcome.rule {
                    Some(r) => (r.rule_type().to_string(), r.payload().to_string()),
                    None => ("no rule".to_string(), String::new()),
                };
                (outcome.adapter, rule_type, payload)
            }
        }
    }

    /// TCP per-connection task.
    async fn handle_tcp(self: Arc<Self>, item: TcpQueueItem) {
        let TcpQueueItem {
            conn: mut inbound,
            mut metadata,
        } = item;

        if !metadata.valid() {
            warn!("invalid TCP metadata, dropping flow: {}", metadata);
            return;
        }

        if let Err(e) = self.pre_handle(&mut metadata).await {
            warn!("TCP pre-handle failed for {}: {}", metadata, e);
            return;
        }

        let config = self.config_snapshot();
        if config.sniffer.enabled() {
            config.sniffer.tcp_sniff(&mut metadata);
        }

        let (adapter, rule_type, rule_payload) = self.resolve(&config, &mut metadata).await;

        let dial = tokio::time::timeout(self.tcp_timeout, adapter.dial_context(&metadata)).await;
        let outbound = match dial {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(
                    "[TCP] {} -> {} via {} (rule {}) failed: {}",
                    metadata.source_detail(),
                    metadata.remote_address(),
                    adapter.name(),
                    format_clause(&rule_type, &rule_payload),
                    e
                );
                return;
            }
            Err(_) => {
                warn!(
                    "[TCP] {} -> {} via {} timed out",
                    metadata.source_detail(),
                    metadata.remote_address(),
                    adapter.name()
                );
                return;
            }
        };

        metadata.remote_dst = Some(metadata.remote_address());

        let conn_id = self.statistic.generate_id();
        let tracked = TrackedConnection::new(
            conn_id.clone(),
            to_stat_metadata(&metadata),
            vec![adapter.name().to_string()],
            rule_type.clone(),
            rule_payload.clone(),
        );
        let conn_id = self.statistic.track(tracked);
        let Some(tracked) = self.statistic.get(&conn_id) else {
            warn!("tracked connection {} vanished immediately", conn_id);
            return;
        };

        info!(
            "[TCP] {} --> {} match {} using {}",
            metadata.source_detail(),
            metadata.remote_address(),
            format_clause(&rule_type, &rule_payload),
            adapter.name()
        );

        let mut outbound = TrackedProxyConnection {
            id: conn_id,
            statistic: self.statistic.clone(),
            tracked,
            inner: outbound,
        };

        if let Err(e) = crate::common::net::copy_bidirectional(&mut inbound, &mut outbound).await {
            debug!("TCP bridge for {} ended: {}", metadata, e);
        }
    }

    async fn try_forward(&self, key: &str, data: &[u8], target: SocketAddr) -> bool {
        if let Some(entry) = self.nat.get(key) {
            if let Err(e) = entry.conn.send_to(data, target).await {
                debug!("UDP forward on {} failed: {}", key, e);
            }
            true
        } else {
            false
        }
    }

    async fn flow_target(&self, metadata: &Metadata) -> Result<SocketAddr> {
        let ip = match metadata.dst_ip {
            Some(ip) => ip,
            None => self.resolver.resolve(&metadata.host).await?,
        };
        Ok(SocketAddr::new(ip, metadata.dst_port))
    }

    fn spawn_udp_relay(
        self: &Arc<Self>,
        entry: Arc<crate::nat::NatEntry>,
        writer: Arc<dyn UdpPacketAdapter>,
        fake_ip: Option<std::net::IpAddr>,
        reply_port: u16,
    ) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    res = entry.conn.recv_from(&mut buf) => {
                        match res {
                            Ok((n, from)) => {
                                entry.touch();
                                let report_from = match fake_ip {
                                    Some(ip) => SocketAddr::new(ip, reply_port),
                                    None => from,
                                };
                                if writer.write_back(&buf[..n], report_from).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    _ = entry.closed.notified() => break,
                }
            }
        });
    }

    /// UDP single-flight dispatch.
    async fn handle_udp(self: Arc<Self>, item: UdpQueueItem) {
        let key = item.local_addr().to_string();
        let mut metadata = item.metadata().clone();

        if let Err(e) = self.pre_handle(&mut metadata).await {
            debug!("UDP pre-handle failed, dropping packet: {}", e);
            return;
        }

        let fake_ip = metadata
            .dst_ip
            .filter(|ip| self.fake_ip_pool.is_fake_ip(*ip));
        let reply_port = metadata.dst_port;
        let writer: Arc<dyn UdpPacketAdapter> = Arc::from(item);

        let target = match self.flow_target(&metadata).await {
            Ok(addr) => addr,
            Err(e) => {
                debug!("UDP flow target unresolved, dropping packet: {}", e);
                return;
            }
        };

        if self.try_forward(&key, writer.data(), target).await {
            return;
        }

        let (barrier, loaded) = self.nat.get_or_create_lock(&key);
        if loaded {
            let succeeded = barrier.wait().await;
            if succeeded {
                self.try_forward(&key, writer.data(), target).await;
            }
            return;
        }

        let config = self.config_snapshot();
        let (adapter, rule_type, rule_payload) = self.resolve(&config, &mut metadata).await;

        let dial = tokio::time::timeout(self.udp_timeout, adapter.listen_packet_context(&metadata))
            .await;
        let conn: Box<dyn PacketConn> = match dial {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(
                    "[UDP] {} -> {} via {} (rule {}) failed: {}",
                    metadata.source_detail(),
                    metadata.remote_address(),
                    adapter.name(),
                    format_clause(&rule_type, &rule_payload),
                    e
                );
                self.nat.delete_lock(&key);
                barrier.complete(false);
                return;
            }
            Err(_) => {
                warn!(
                    "[UDP] {} -> {} via {} timed out",
                    metadata.source_detail(),
                    metadata.remote_address(),
                    adapter.name()
                );
                self.nat.delete_lock(&key);
                barrier.complete(false);
                return;
            }
        };

        metadata.remote_dst = Some(metadata.remote_address());
        info!(
            "[UDP] {} --> {} match {} using {}",
            metadata.source_detail(),
            metadata.remote_address(),
            format_clause(&rule_type, &rule_payload),
            adapter.name()
        );

        let tracked = TrackedConnection::new(
            self.statistic.generate_id(),
            to_stat_metadata(&metadata),
            vec![adapter.name().to_string()],
            rule_type.clone(),
            rule_payload.clone(),
        );
        let conn_id = self.statistic.track(tracked);
        let conn: Arc<dyn PacketConn> = match self.statistic.get(&conn_id) {
            Some(tracked) => Arc::new(TrackedPacketConn {
                id: conn_id,
                statistic: self.statistic.clone(),
                tracked,
                inner: conn,
            }),
            None => Arc::from(conn),
        };

        let entry = self.nat.insert(key.clone(), conn);
        self.spawn_udp_relay(entry, writer.clone(), fake_ip, reply_port);

        self.nat.delete_lock(&key);
        barrier.complete(true);

        self.try_forward(&key, writer.data(), target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{NullFakeIpPool, StaticHostsTree, StaticResolver};
    use crate::locator::UnsupportedLocator;
    use crate::outbound::AdapterType;
    use crate::sniffer::NoopSniffer;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    #[test]
    fn test_tunnel_mode_parse() {
        assert_eq!(TunnelMode::try_from("rule").unwrap(), TunnelMode::Rule);
        assert_eq!(TunnelMode::try_from("global").unwrap(), TunnelMode::Global);
        assert_eq!(TunnelMode::try_from("direct").unwrap(), TunnelMode::Direct);
        assert!(TunnelMode::try_from("bogus").is_err());
    }

    #[test]
    fn test_format_clause() {
        assert_eq!(format_clause("MATCH", ""), "MATCH");
        assert_eq!(format_clause("DOMAIN", "a.com"), "DOMAIN(a.com)");
    }

    struct DelayedUdpAdapter {
        dial_calls: Arc<AtomicUsize>,
    }

    struct DelayedPacketConn {
        sends: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PacketConn for DelayedPacketConn {
        async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> Result<usize> {
            self.sends.fetch_add(1, Ordering::Relaxed);
            Ok(buf.len())
        }
        async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[async_trait]
    impl Adapter for DelayedUdpAdapter {
        fn name(&self) -> &str {
            "DELAYED"
        }
        fn adapter_type(&self) -> AdapterType {
            AdapterType::Direct
        }
        fn addr(&self) -> String {
            "DELAYED".to_string()
        }
        fn supports_udp(&self) -> bool {
            true
        }
        async fn dial_context(&self, _metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
            Err(Error::unsupported("tcp not used in this test"))
        }
        async fn listen_packet_context(&self, _metadata: &Metadata) -> Result<Box<dyn PacketConn>> {
            self.dial_calls.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Box::new(DelayedPacketConn {
                sends: Arc::new(AtomicUsize::new(0)),
            }))
        }
    }

    struct RecordingWriter {
        payload: Vec<u8>,
        metadata: Metadata,
        local: SocketAddr,
        writes: Arc<AsyncMutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl UdpPacketAdapter for RecordingWriter {
        fn data(&self) -> &[u8] {
            &self.payload
        }
        fn metadata(&self) -> &Metadata {
            &self.metadata
        }
        fn local_addr(&self) -> SocketAddr {
            self.local
        }
        async fn write_back(&self, data: &[u8], _from: SocketAddr) -> Result<()> {
            self.writes.lock().await.push(data.to_vec());
            Ok(())
        }
    }

    fn test_tunnel(dial_calls: Arc<AtomicUsize>) -> Arc<Tunnel> {
        let mut adapters = AdapterManager::new();
        adapters.insert(
            "DIRECT".to_string(),
            Arc::new(DelayedUdpAdapter { dial_calls }),
        );
        let config = TunnelConfig::new(vec![], adapters, Arc::new(NoopSniffer));
        Tunnel::new(
            config,
            Arc::new(StatisticManager::new()),
            Arc::new(StaticHostsTree::new()),
            Arc::new(StaticResolver::new()),
            Arc::new(NullFakeIpPool),
            Arc::new(UnsupportedLocator),
            false,
        )
    }

    #[tokio::test]
    async fn test_udp_single_flight_one_dial_both_forwarded() {
        let dial_calls = Arc::new(AtomicUsize::new(0));
        let tunnel = test_tunnel(dial_calls.clone());
        tunnel.set_mode(TunnelMode::Direct);

        let local: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let metadata = Metadata::udp()
            .with_dst_ip("10.0.0.1".parse::<IpAddr>().unwrap())
            .with_dst_port(53);

        let writes = Arc::new(AsyncMutex::new(Vec::new()));
        let p1: UdpQueueItem = Box::new(RecordingWriter {
            payload: b"one".to_vec(),
            metadata: metadata.clone(),
            local,
            writes: writes.clone(),
        });
        let p2: UdpQueueItem = Box::new(RecordingWriter {
            payload: b"two".to_vec(),
            metadata,
            local,
            writes: writes.clone(),
        });

        let t1 = tunnel.clone();
        let h1 = tokio::spawn(async move { t1.handle_udp(p1).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let t2 = tunnel.clone();
        let h2 = tokio::spawn(async move { t2.handle_udp(p2).await });

        h1.await.unwrap();
        h2.await.unwrap();

        assert_eq!(dial_calls.load(Ordering::Relaxed), 1);
        assert_eq!(tunnel.nat.len(), 1);
    }
}
