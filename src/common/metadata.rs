//! Connection metadata

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "TCP"),
            Network::Udp => write!(f, "UDP"),
        }
    }
}

/// Connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    Http,
    Https,
    Socks5,
    Mixed,
    Tun,
    Inner,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnType::Http => write!(f, "HTTP"),
            ConnType::Https => write!(f, "HTTPS"),
            ConnType::Socks5 => write!(f, "SOCKS5"),
            ConnType::Mixed => write!(f, "Mixed"),
            ConnType::Tun => write!(f, "TUN"),
            ConnType::Inner => write!(f, "Inner"),
        }
    }
}

/// DNS mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DnsMode {
    #[default]
    Normal,
    FakeIP,
    Mapping,
    Hosts,
}

/// How the destination address was supplied, mirrored from the inbound wire
/// format onto the flow so later stages (fake-IP rewrite, logging) know
/// whether `host` or `dst_ip` is the authoritative field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrType {
    #[default]
    IPv4,
    IPv6,
    Domain,
}

/// Connection metadata containing all routing information
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Network type (TCP/UDP)
    pub network: Network,

    /// Connection type
    pub conn_type: ConnType,

    /// Source IP address
    pub src_ip: IpAddr,

    /// Source port
    pub src_port: u16,

    /// Destination IP address (may be unset if only host is known)
    pub dst_ip: Option<IpAddr>,

    /// Destination port
    pub dst_port: u16,

    /// Destination host (domain name)
    pub host: String,

    /// How the destination was addressed on the wire
    pub addr_type: AddrType,

    /// Process name (if available)
    pub process: Option<String>,

    /// Process path (if available)
    pub process_path: Option<String>,

    /// User ID (if available). Signed to match the locator's native return
    /// type and the uid-rule range representation.
    pub uid: Option<i32>,

    /// DNS mode
    pub dns_mode: DnsMode,

    /// Special proxy to use (bypasses rules)
    pub special_proxy: Option<String>,

    /// Special rules to use
    pub special_rules: Option<String>,

    /// The address actually dialed, recorded after a successful dial for
    /// logging; distinct from `dst_ip`/`host` which may be a domain.
    pub remote_dst: Option<String>,
}

impl Metadata {
    /// Create new metadata
    pub fn new(network: Network, conn_type: ConnType) -> Self {
        Metadata {
            network,
            conn_type,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_ip: None,
            dst_port: 0,
            host: String::new(),
            addr_type: AddrType::IPv4,
            process: None,
            process_path: None,
            uid: None,
            dns_mode: DnsMode::Normal,
            special_proxy: None,
            special_rules: None,
            remote_dst: None,
        }
    }

    /// Create TCP metadata
    pub fn tcp() -> Self {
        Self::new(Network::Tcp, ConnType::Mixed)
    }

    /// Create UDP metadata
    pub fn udp() -> Self {
        Self::new(Network::Udp, ConnType::Mixed)
    }

    /// Set source address
    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.src_ip = addr.ip();
        self.src_port = addr.port();
        self
    }

    /// Set destination IP
    pub fn with_dst_ip(mut self, ip: IpAddr) -> Self {
        self.dst_ip = Some(ip);
        self.addr_type = match ip {
            IpAddr::V4(_) => AddrType::IPv4,
            IpAddr::V6(_) => AddrType::IPv6,
        };
        self
    }

    /// Set destination port
    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    /// Set destination host
    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self.addr_type = AddrType::Domain;
        self
    }

    /// Check if destination is resolved
    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// Rewrite a literal-IP host onto `dst_ip` so later stages never need to
    /// resolve it. Mirrors the pre-handle literal-host step: a host that
    /// parses as an IP address is not a domain at all.
    pub fn rewrite_literal_host(&mut self) {
        if self.host.is_empty() {
            return;
        }
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            self.dst_ip = Some(ip);
            self.addr_type = match ip {
                IpAddr::V4(_) => AddrType::IPv4,
                IpAddr::V6(_) => AddrType::IPv6,
            };
            self.host.clear();
        }
    }

    /// Get remote address string (for dialing)
    pub fn remote_address(&self) -> String {
        if !self.host.is_empty() {
            format!("{}:{}", self.host, self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            format!("{}:{}", ip, self.dst_port)
        } else {
            format!("0.0.0.0:{}", self.dst_port)
        }
    }

    /// Get destination address string (host or IP)
    pub fn destination(&self) -> String {
        if !self.host.is_empty() {
            self.host.clone()
        } else if let Some(ip) = self.dst_ip {
            ip.to_string()
        } else {
            String::new()
        }
    }

    /// Get source detail string
    pub fn source_detail(&self) -> String {
        let mut detail = format!("{}:{}", self.src_ip, self.src_port);
        if let Some(ref process) = self.process {
            detail.push_str(&format!(" ({})", process));
        }
        detail
    }

    /// Check if metadata is valid
    pub fn valid(&self) -> bool {
        self.dst_port > 0 && (!self.host.is_empty() || self.dst_ip.is_some())
    }

    /// Get a pure copy for dialing (without process info)
    pub fn pure(&self) -> Self {
        Metadata {
            network: self.network,
            conn_type: self.conn_type,
            src_ip: self.src_ip,
            src_port: self.src_port,
            dst_ip: self.dst_ip,
            dst_port: self.dst_port,
            host: self.host.clone(),
            addr_type: self.addr_type,
            process: None,
            process_path: None,
            uid: None,
            dns_mode: self.dns_mode,
            special_proxy: None,
            special_rules: None,
            remote_dst: None,
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} --> {}",
            self.network,
            self.source_detail(),
            self.remote_address()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn test_metadata_creation() {
        let meta = Metadata::tcp()
            .with_source(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(192, 168, 1, 1),
                12345,
            )))
            .with_host("example.com".to_string())
            .with_dst_port(443);

        assert_eq!(meta.network, Network::Tcp);
        assert_eq!(meta.host, "example.com");
        assert_eq!(meta.dst_port, 443);
        assert_eq!(meta.remote_address(), "example.com:443");
    }

    #[test]
    fn test_metadata_validation() {
        let meta = Metadata::tcp().with_dst_port(443).with_host("example.com".to_string());
        assert!(meta.valid());

        let meta_invalid = Metadata::tcp();
        assert!(!meta_invalid.valid());
    }

    #[test]
    fn test_rewrite_literal_host() {
        let mut meta = Metadata::tcp()
            .with_host("93.184.216.34".to_string())
            .with_dst_port(80);
        assert_eq!(meta.addr_type, AddrType::Domain);

        meta.rewrite_literal_host();
        assert_eq!(meta.dst_ip, Some("93.184.216.34".parse().unwrap()));
        assert_eq!(meta.addr_type, AddrType::IPv4);
        assert_eq!(meta.host, "");
    }

    #[test]
    fn test_rewrite_literal_host_leaves_domain_alone() {
        let mut meta = Metadata::tcp()
            .with_host("example.com".to_string())
            .with_dst_port(80);
        meta.rewrite_literal_host();
        assert_eq!(meta.dst_ip, None);
        assert_eq!(meta.addr_type, AddrType::Domain);
    }
}
