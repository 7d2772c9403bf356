//! Ban List Store
//!
//! A durable set of banned client IPs: loaded once at startup, written
//! through on every change. The on-disk format is a JSON object
//! `{"ip": true, ...}`.

use std::collections::HashMap;
use std::path::PathBuf;

use dashmap::DashSet;
use tracing::{info, warn};

/// Durable set of banned client IP strings.
pub struct BanList {
    path: PathBuf,
    ips: DashSet<String>,
}

impl BanList {
    /// Load the ban list from `path`. A missing file is tolerated and
    /// yields an empty set; a malformed file is logged and ignored.
    pub async fn load(path: PathBuf) -> Self {
        let ips = DashSet::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, bool>>(&bytes) {
                Ok(map) => {
                    for (ip, banned) in map {
                        if banned {
                            ips.insert(ip);
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Malformed ban list file, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read ban list, starting empty");
            }
        }

        info!(path = %path.display(), count = ips.len(), "Ban list loaded");

        Self { path, ips }
    }

    /// Set membership.
    pub fn is_banned(&self, ip: &str) -> bool {
        self.ips.contains(ip)
    }

    /// Insert `ip` and write the set through to disk. A persistence
    /// failure is logged; the in-memory insert stands regardless.
    pub async fn ban(&self, ip: &str) {
        self.ips.insert(ip.to_string());
        info!(ip = %ip, "BAN");

        if let Err(e) = self.persist().await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist ban list");
        }
    }

    /// Number of banned IPs.
    pub fn len(&self) -> usize {
        self.ips.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    async fn persist(&self) -> std::io::Result<()> {
        let map: HashMap<String, bool> = self
            .ips
            .iter()
            .map(|entry| (entry.key().clone(), true))
            .collect();
        let json = serde_json::to_vec_pretty(&map)?;
        tokio::fs::write(&self.path, json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_empty_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let list = BanList::load(dir.path().join("banned_ips.json")).await;

        assert!(list.is_empty());
        assert!(!list.is_banned("203.0.113.9"));
    }

    #[tokio::test]
    async fn ban_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("banned_ips.json");

        let list = BanList::load(path.clone()).await;
        list.ban("203.0.113.9").await;
        assert!(list.is_banned("203.0.113.9"));

        let reloaded = BanList::load(path).await;
        assert!(reloaded.is_banned("203.0.113.9"));
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn malformed_file_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("banned_ips.json");
        tokio::fs::write(&path, b"not json").await.expect("write");

        let list = BanList::load(path).await;
        assert!(list.is_empty());
    }
}
