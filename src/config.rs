use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::network::identity::PRIV_KEY_FILE;
use crate::network::{
    P2PError, PeerAddr, PeerSettings, DEFAULT_BUCKET_SIZE, DEFAULT_LISTEN_PORT,
    DEFAULT_MAILBOX_CAPACITY, DEFAULT_MAX_NEIGHBORS, DEFAULT_MAX_STREAMS,
    DEFAULT_MIN_WRITE_THROUGHPUT, DEFAULT_ROUTING_SYNC_INTERVAL, DEFAULT_SNAPSHOT_INTERVAL,
    ROUTING_TABLE_FILE,
};

/// Configuration of the p2p network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2PConfig {
    pub listen_port: u16,
    /// Bind this address instead of discovering the external IPv4 address.
    pub listen_ip: Option<IpAddr>,
    /// `<transport-address>/peer/<PeerID>` strings.
    pub seed_nodes: Vec<String>,
    pub version: u16,
    pub chain_id: u32,
    pub data_path: PathBuf,

    pub max_streams: usize,
    pub mailbox_capacity: usize,
    pub max_neighbors: usize,
    pub bucket_size: usize,
    /// Bytes per second assumed when computing write deadlines.
    pub min_write_throughput: u64,
    pub snapshot_interval_secs: u64,
    pub routing_sync_interval_secs: u64,
    pub nat_port_map: bool,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            listen_ip: None,
            seed_nodes: Vec::new(),
            version: 1,
            chain_id: 1,
            data_path: PathBuf::from("data/p2p"),
            max_streams: DEFAULT_MAX_STREAMS,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
            bucket_size: DEFAULT_BUCKET_SIZE,
            min_write_throughput: DEFAULT_MIN_WRITE_THROUGHPUT,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL.as_secs(),
            routing_sync_interval_secs: DEFAULT_ROUTING_SYNC_INTERVAL.as_secs(),
            nat_port_map: true,
        }
    }
}

impl P2PConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), P2PError> {
        let positive = [
            ("max_streams", self.max_streams as u64),
            ("mailbox_capacity", self.mailbox_capacity as u64),
            ("max_neighbors", self.max_neighbors as u64),
            ("bucket_size", self.bucket_size as u64),
            ("min_write_throughput", self.min_write_throughput),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
            ("routing_sync_interval_secs", self.routing_sync_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(P2PError::Config(format!("{} must be positive", name)));
            }
        }
        self.seeds()?;
        Ok(())
    }

    /// Parses every seed; one bad entry fails the whole list.
    pub fn seeds(&self) -> Result<Vec<PeerAddr>, P2PError> {
        self.seed_nodes.iter().map(|s| s.parse()).collect()
    }

    pub fn peer_settings(&self) -> PeerSettings {
        PeerSettings {
            chain_id: self.chain_id,
            version: self.version,
            max_streams: self.max_streams,
            mailbox_capacity: self.mailbox_capacity,
            min_write_throughput: self.min_write_throughput,
        }
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn routing_sync_interval(&self) -> Duration {
        Duration::from_secs(self.routing_sync_interval_secs)
    }

    pub fn routing_table_path(&self) -> PathBuf {
        self.data_path.join(ROUTING_TABLE_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_path.join(PRIV_KEY_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p2p.json");
        fs::write(&path, r#"{ "listen_port": 4000, "chain_id": 7, "seed_nodes": [] }"#).unwrap();

        let config = P2PConfig::from_file(&path).unwrap();
        assert_eq!(config.listen_port, 4000);
        assert_eq!(config.chain_id, 7);
        assert_eq!(config.max_streams, DEFAULT_MAX_STREAMS);
        assert_eq!(config.snapshot_interval(), DEFAULT_SNAPSHOT_INTERVAL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = P2PConfig {
            max_streams: 0,
            ..P2PConfig::default()
        };
        assert!(matches!(config.validate(), Err(P2PError::Config(_))));

        let config = P2PConfig {
            seed_nodes: vec!["/ip4/1.2.3.4/tcp/1".to_string()],
            ..P2PConfig::default()
        };
        assert!(matches!(config.validate(), Err(P2PError::InvalidAddress(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(P2PConfig::from_file(&dir.path().join("absent.json")).is_err());
    }
}
