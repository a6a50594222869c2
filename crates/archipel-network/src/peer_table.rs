//! Peer directory with time-based liveness
//!
//! Records are keyed by `ip:tcp_port` and refreshed by every valid
//! announcement. Callers only ever receive copies.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// A peer learned from a discovery announcement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    /// Always `ip:tcp_port`
    pub key: String,
    /// Informational only
    pub display_name: String,
    pub ip: IpAddr,
    pub tcp_port: u16,
    /// Last time an announcement refreshed this record
    pub last_seen: Instant,
}

impl PeerRecord {
    fn new(ip: IpAddr, display_name: &str, tcp_port: u16, last_seen: Instant) -> Self {
        Self {
            key: PeerRecord::key_for(ip, tcp_port),
            display_name: display_name.to_string(),
            ip,
            tcp_port,
            last_seen,
        }
    }

    /// Directory key for an address/port pair
    pub fn key_for(ip: IpAddr, tcp_port: u16) -> String {
        format!("{}:{}", ip, tcp_port)
    }

    /// Time elapsed since the last refresh
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_seen)
    }
}

/// Concurrent peer directory.
///
/// Cloning is cheap and every clone observes the same table.
#[derive(Clone, Default)]
pub struct PeerTable {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the record for `ip:tcp_port`.
    ///
    /// Returns `true` if the peer was not known before. Inputs are stored
    /// as given; validation belongs to the caller.
    pub async fn add_or_update(&self, ip: IpAddr, name: &str, tcp_port: u16) -> bool {
        let record = PeerRecord::new(ip, name, tcp_port, Instant::now());
        let mut peers = self.peers.write().await;
        peers.insert(record.key.clone(), record).is_none()
    }

    /// Delete every record older than `ttl`, returning the evicted ones
    pub async fn remove_stale(&self, ttl: Duration) -> Vec<PeerRecord> {
        let now = Instant::now();
        let mut removed = Vec::new();
        let mut peers = self.peers.write().await;
        peers.retain(|_, peer| {
            let alive = now.saturating_duration_since(peer.last_seen) <= ttl;
            if !alive {
                removed.push(peer.clone());
            }
            alive
        });
        removed
    }

    /// Independent copy of every current record
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Copy of a single record
    pub async fn get(&self, key: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
