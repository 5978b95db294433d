//! Configuration types for the consensus engine.
//!
//! This module defines the configuration structures used to initialize a
//! Maat node: identity, addresses, storage location, TLS material, and the
//! Raft timing/snapshot knobs.

use maat_common::{Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single Maat node.
///
/// # Examples
///
/// ```
/// use maat_raft::NodeConfig;
/// use std::path::PathBuf;
///
/// let config = NodeConfig {
///     id: 1,
///     bind_addr: "127.0.0.1:8786".to_string(),
///     advertise_addr: None,
///     data_dir: PathBuf::from("/var/lib/maat/node1"),
///     in_memory: false,
///     cert_file: PathBuf::from("/etc/maat/node.crt"),
///     key_file: PathBuf::from("/etc/maat/node.key"),
///     ca_file: None,
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier. Must be > 0.
    pub id: NodeId,

    /// Address the consensus transport binds to.
    /// Example: "0.0.0.0:8786"
    pub bind_addr: String,

    /// Address other nodes use to reach this one. Falls back to `bind_addr`,
    /// which must then be a concrete, routable address.
    pub advertise_addr: Option<String>,

    /// Directory for persisting snapshots. Ignored when `in_memory` is set.
    pub data_dir: PathBuf,

    /// Keep all state in memory only; nothing is written to `data_dir`.
    pub in_memory: bool,

    /// PEM certificate (or chain) presented to inbound consensus connections.
    pub cert_file: PathBuf,

    /// PEM private key for `cert_file`.
    pub key_file: PathBuf,

    /// Optional CA bundle used to verify peer certificates on outbound dials.
    /// Without it, peers are trusted at the transport level (cluster-internal
    /// traffic routed by advertise address).
    pub ca_file: Option<PathBuf>,
}

impl NodeConfig {
    /// Validates the node configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `id` is 0
    /// - `bind_addr` is empty or missing a port
    /// - `data_dir` is empty while persistence is enabled
    /// - certificate or key paths are empty
    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(Error::Config("node id must be > 0".to_string()));
        }

        if self.bind_addr.is_empty() {
            return Err(Error::Config("bind_addr cannot be empty".to_string()));
        }

        if !self.bind_addr.contains(':') {
            return Err(Error::Config(
                "bind_addr must contain port (e.g., '0.0.0.0:8786')".to_string(),
            ));
        }

        if let Some(advertise) = &self.advertise_addr {
            if !advertise.contains(':') {
                return Err(Error::Config(
                    "advertise_addr must contain port (e.g., '10.0.0.1:8786')".to_string(),
                ));
            }
        }

        if !self.in_memory && self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "data_dir is required unless in_memory is set".to_string(),
            ));
        }

        if self.cert_file.as_os_str().is_empty() || self.key_file.as_os_str().is_empty() {
            return Err(Error::Config(
                "cert_file and key_file are required".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective address peers should dial: advertise if set, else bind.
    pub fn effective_advertise(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.bind_addr)
    }

    /// Path of the snapshot file, when persistence is enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        if self.in_memory {
            None
        } else {
            Some(self.data_dir.join("snapshot.bin"))
        }
    }
}

/// Raft timing and resource configuration.
///
/// Ticks are the logical clock unit: the node ticks every
/// `tick_interval_ms`, followers start elections after `election_tick`
/// quiet ticks, and leaders heartbeat every `heartbeat_tick` ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Interval between logical clock ticks in milliseconds.
    /// Default: 100ms
    pub tick_interval_ms: u64,

    /// Ticks without leader contact before a follower starts an election.
    /// Default: 10
    pub election_tick: usize,

    /// Ticks between leader heartbeats.
    /// Default: 3
    pub heartbeat_tick: usize,

    /// Applied entries between snapshots (and log compaction).
    /// Default: 8,192
    pub snapshot_interval_entries: u64,

    /// Upper bound on a proposal waiting for commit, in milliseconds.
    /// Expiry is reported as a timeout with unknown outcome.
    /// Default: 5,000ms
    pub commit_timeout_ms: u64,

    /// Upper bound on an outbound dial, in milliseconds.
    /// Default: 3,000ms
    pub dial_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            snapshot_interval_entries: 8_192,
            commit_timeout_ms: 5_000,
            dial_timeout_ms: 3_000,
        }
    }
}

impl RaftConfig {
    /// Validates the Raft configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `tick_interval_ms` is 0
    /// - `election_tick` is not greater than `2 * heartbeat_tick`
    /// - `commit_timeout_ms` or `dial_timeout_ms` is 0
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be > 0".to_string()));
        }

        // Elections must be strictly slower than heartbeats or a healthy
        // leader cannot suppress them
        if self.election_tick <= self.heartbeat_tick * 2 {
            return Err(Error::Config(format!(
                "election_tick ({}) must be greater than 2x heartbeat_tick ({})",
                self.election_tick,
                self.heartbeat_tick * 2
            )));
        }

        if self.commit_timeout_ms == 0 {
            return Err(Error::Config("commit_timeout_ms must be > 0".to_string()));
        }

        if self.dial_timeout_ms == 0 {
            return Err(Error::Config("dial_timeout_ms must be > 0".to_string()));
        }

        Ok(())
    }

    /// Tick interval as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Commit timeout as a `Duration`.
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Dial timeout as a `Duration`.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_node_config() -> NodeConfig {
        NodeConfig {
            id: 1,
            bind_addr: "127.0.0.1:8786".to_string(),
            advertise_addr: None,
            data_dir: PathBuf::from("/tmp/maat/node1"),
            in_memory: false,
            cert_file: PathBuf::from("/tmp/maat/node.crt"),
            key_file: PathBuf::from("/tmp/maat/node.key"),
            ca_file: None,
        }
    }

    #[test]
    fn test_node_config_validation() {
        assert!(base_node_config().validate().is_ok());

        // Invalid: node id = 0
        let mut config = base_node_config();
        config.id = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("node id must be > 0"));
    }

    #[test]
    fn test_node_config_empty_bind_addr() {
        let mut config = base_node_config();
        config.bind_addr = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_config_bind_addr_missing_port() {
        let mut config = base_node_config();
        config.bind_addr = "127.0.0.1".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must contain port"));
    }

    #[test]
    fn test_node_config_advertise_missing_port() {
        let mut config = base_node_config();
        config.advertise_addr = Some("10.0.0.1".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_config_in_memory_skips_data_dir() {
        let mut config = base_node_config();
        config.data_dir = PathBuf::new();
        assert!(config.validate().is_err());

        config.in_memory = true;
        assert!(config.validate().is_ok());
        assert_eq!(config.snapshot_path(), None);
    }

    #[test]
    fn test_node_config_effective_advertise() {
        let mut config = base_node_config();
        assert_eq!(config.effective_advertise(), "127.0.0.1:8786");

        config.advertise_addr = Some("10.0.0.1:8786".to_string());
        assert_eq!(config.effective_advertise(), "10.0.0.1:8786");
    }

    #[test]
    fn test_snapshot_path_under_data_dir() {
        let config = base_node_config();
        assert_eq!(
            config.snapshot_path(),
            Some(PathBuf::from("/tmp/maat/node1/snapshot.bin"))
        );
    }

    #[test]
    fn test_raft_config_default_is_valid() {
        let config = RaftConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.commit_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_raft_config_election_tick_too_small() {
        let config = RaftConfig {
            election_tick: 6,
            heartbeat_tick: 3,
            ..RaftConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("election_tick"));
    }

    #[test]
    fn test_raft_config_zero_timeouts_rejected() {
        let config = RaftConfig {
            commit_timeout_ms: 0,
            ..RaftConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RaftConfig {
            dial_timeout_ms: 0,
            ..RaftConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip_node_config() {
        let config = NodeConfig {
            advertise_addr: Some("public.example.com:8786".to_string()),
            ..base_node_config()
        };

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: NodeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.id, deserialized.id);
        assert_eq!(config.bind_addr, deserialized.bind_addr);
        assert_eq!(config.advertise_addr, deserialized.advertise_addr);
        assert_eq!(config.data_dir, deserialized.data_dir);
    }
}
