//! `/proc`-based socket-to-process resolution, Linux only.

#![cfg(target_os = "linux")]

use super::ProcessLocator;
use crate::common::Network;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::Path;

/// Scans `/proc/net/{tcp,tcp6,udp,udp6}` for the socket inode bound to a
/// local `(ip, port)` pair, then walks `/proc/*/fd` to find the pid holding
/// that inode.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxLocator;

#[async_trait]
impl ProcessLocator for LinuxLocator {
    async fn find_process_name(&self, network: Network, ip: IpAddr, port: u16) -> Result<String> {
        let pid = find_pid(network, ip, port).await?;
        std::fs::read_link(format!("/proc/{}/exe", pid))
            .map(|p| p.to_string_lossy().to_string())
            .map_err(|_| Error::platform_not_supported())
    }

    async fn find_uid(&self, network: Network, ip: IpAddr, port: u16) -> Result<i32> {
        let pid = find_pid(network, ip, port).await?;
        let status = tokio::fs::read_to_string(format!("/proc/{}/status", pid))
            .await
            .map_err(|_| Error::platform_not_supported())?;
        status
            .lines()
            .find(|l| l.starts_with("Uid:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse::<i32>().ok())
            .ok_or_else(Error::platform_not_supported)
    }
}

async fn find_pid(network: Network, ip: IpAddr, port: u16) -> Result<u32> {
    let inode = find_inode(network, ip, port)
        .await
        .ok_or_else(Error::platform_not_supported)?;
    find_pid_for_inode(inode)
        .await
        .ok_or_else(Error::platform_not_supported)
}

async fn find_inode(network: Network, ip: IpAddr, port: u16) -> Option<u64> {
    let proc_file = match (network, ip.is_ipv6()) {
        (Network::Tcp, false) => "/proc/net/tcp",
        (Network::Tcp, true) => "/proc/net/tcp6",
        (Network::Udp, false) => "/proc/net/udp",
        (Network::Udp, true) => "/proc/net/udp6",
    };
    let content = tokio::fs::read_to_string(proc_file).await.ok()?;
    let target_port = format!("{:04X}", port);

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let local = fields[1];
        let Some((_, hex_port)) = local.split_once(':') else {
            continue;
        };
        if hex_port.eq_ignore_ascii_case(&target_port) {
            if let Ok(inode) = fields[9].parse::<u64>() {
                return Some(inode);
            }
        }
    }
    None
}

async fn find_pid_for_inode(inode: u64) -> Option<u32> {
    let needle = format!("socket:[{}]", inode);
    let mut entries = tokio::fs::read_dir("/proc").await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let fd_dir = Path::new("/proc").join(name).join("fd");
        let Ok(mut fds) = tokio::fs::read_dir(&fd_dir).await else {
            continue;
        };
        while let Ok(Some(fd)) = fds.next_entry().await {
            if let Ok(link) = tokio::fs::read_link(fd.path()).await {
                if link.to_string_lossy() == needle {
                    return Some(pid);
                }
            }
        }
    }
    None
}
