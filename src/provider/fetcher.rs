//! HTTP/file vehicle for rule-set content, with content-hash dedup.

use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Fetches rule-set bytes over HTTP, caching the result to disk so a
/// restart can load the last-known-good content if the network is down.
pub struct Fetcher {
    url: String,
    path: PathBuf,
    interval: Duration,
}

impl Fetcher {
    pub fn new(url: String, path: PathBuf, interval: Duration) -> Self {
        Fetcher { url, path, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fetch content from URL
    pub async fn fetch(&self) -> Result<(Vec<u8>, reqwest::header::HeaderMap)> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::network(e.to_string()))?;

        let resp = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let headers = resp.headers().clone();
        let content = resp
            .bytes()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        if let Err(e) = tokio::fs::write(&self.path, &content).await {
            tracing::warn!("Failed to cache content: {}", e);
        }

        Ok((content.to_vec(), headers))
    }

    /// Load content from cache
    pub async fn load_cache(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::io_error(e.to_string()))
    }
}

/// A local-file vehicle: the file is itself the source of truth, no
/// separate cache is kept.
pub struct FileVehicle {
    path: PathBuf,
}

impl FileVehicle {
    pub fn new(path: PathBuf) -> Self {
        FileVehicle { path }
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::io_error(format!("reading {}: {}", self.path.display(), e)))
    }
}

/// Content hash used to decide whether a freshly fetched rule-set actually
/// changed, per the provider update-idempotence guarantee.
pub fn content_hash(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash(b"hello");
        let b = content_hash(b"hello");
        let c = content_hash(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
