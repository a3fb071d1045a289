//! Node configuration.
//!
//! Every option has a default so a config file only names what differs.

use std::{collections::HashSet, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::storage::log::{BLANK_THRESHOLD, ENTRY_HEADER_SIZE, INDEX_SIZE};
use crate::types::{GroupId, NodeId};

/// Backing for the data and index logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Memory-mapped files under `base_file_path`.
    #[default]
    File,
    /// Anonymous mappings; nothing survives the process.
    Memory,
}

/// Another member of the log group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    /// `host:port` of the node-to-node RPC listener.
    pub addr: String,
    /// Client-facing port the peer advertises. Carried in the config only;
    /// this crate does not listen on it.
    #[serde(default)]
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub group: GroupId,
    pub store_kind: StoreKind,
    /// Members other than this node.
    pub peers: Vec<PeerConfig>,
    pub self_id: NodeId,
    /// `host:port` this node's RPC listener binds to.
    pub self_addr: String,
    /// Leader to assume at start-up, if any.
    pub leader_id: Option<NodeId>,

    pub base_file_path: PathBuf,
    /// Bytes per data segment file.
    pub store_file_size: u64,
    pub os_page_size: u64,
    pub flush_interval_ms: u64,
    pub index_count_per_file: u64,

    pub min_election_timeout_ms: u64,
    pub max_election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub save_checkpoint_interval_ms: u64,

    pub rpc_timeout_ms: u64,
    /// Upper bound on the pull a follower issues while repairing a divergent log.
    pub pull_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            store_kind: StoreKind::File,
            peers: Vec::new(),
            self_id: String::new(),
            self_addr: "127.0.0.1:7000".to_string(),
            leader_id: None,
            base_file_path: PathBuf::from("./chainlog_data"),
            store_file_size: 40 * 1024 * 1024, // 40MB
            os_page_size: 4 * 1024,
            flush_interval_ms: 1000,
            index_count_per_file: 100_000,
            min_election_timeout_ms: 2000,
            max_election_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            save_checkpoint_interval_ms: 5000,
            rpc_timeout_ms: 1000,
            pull_timeout_ms: 3000,
        }
    }
}

impl NodeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group.is_empty() {
            return Err(ConfigError::Missing("group"));
        }
        if self.self_id.is_empty() {
            return Err(ConfigError::Missing("self_id"));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == self.self_id {
                return Err(ConfigError::Invalid {
                    option: "peers",
                    reason: format!("peer list contains self id {}", peer.id),
                });
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::Invalid {
                    option: "peers",
                    reason: format!("duplicate peer id {}", peer.id),
                });
            }
        }

        if self.min_election_timeout_ms >= self.max_election_timeout_ms {
            return Err(ConfigError::Invalid {
                option: "min_election_timeout_ms",
                reason: format!(
                    "must be below max_election_timeout_ms ({} >= {})",
                    self.min_election_timeout_ms, self.max_election_timeout_ms
                ),
            });
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.min_election_timeout_ms
        {
            return Err(ConfigError::Invalid {
                option: "heartbeat_interval_ms",
                reason: format!(
                    "must be positive and below min_election_timeout_ms ({})",
                    self.min_election_timeout_ms
                ),
            });
        }

        if !self.os_page_size.is_power_of_two() {
            return Err(ConfigError::Invalid {
                option: "os_page_size",
                reason: format!("{} is not a power of two", self.os_page_size),
            });
        }
        let smallest_segment = (ENTRY_HEADER_SIZE as u64) + BLANK_THRESHOLD;
        if self.store_file_size <= smallest_segment {
            return Err(ConfigError::Invalid {
                option: "store_file_size",
                reason: format!("must exceed {} bytes", smallest_segment),
            });
        }
        if self.index_count_per_file == 0 {
            return Err(ConfigError::Invalid {
                option: "index_count_per_file",
                reason: "must be positive".to_string(),
            });
        }
        if self.flush_interval_ms == 0 || self.save_checkpoint_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                option: "flush_interval_ms",
                reason: "background intervals must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Every member id, self included.
    pub fn members(&self) -> Vec<NodeId> {
        std::iter::once(self.self_id.clone())
            .chain(self.peers.iter().map(|p| p.id.clone()))
            .collect()
    }

    /// Agreements (self included) needed to win a round or commit an index.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Bytes per index segment file; always a whole number of records.
    pub fn index_file_size(&self) -> u64 {
        INDEX_SIZE as u64 * self.index_count_per_file
    }

    pub fn min_election_timeout(&self) -> Duration {
        Duration::from_millis(self.min_election_timeout_ms)
    }

    pub fn max_election_timeout(&self) -> Duration {
        Duration::from_millis(self.max_election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.save_checkpoint_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}
