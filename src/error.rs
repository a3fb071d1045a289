use thiserror::Error;

use crate::types::NodeId;

/// 顶层错误类型
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Not leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),
}

/// 存储相关错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot allocate {requested} bytes in a segment of {capacity} bytes")]
    Allocation { requested: u64, capacity: u64 },

    #[error("Corrupted index or data: {0}")]
    Corrupt(String),

    #[error("Position {0} is beyond written data")]
    PositionOutOfRange(u64),

    #[error("Entry index {actual} does not continue the log (expected {expected})")]
    OutOfOrder { expected: u64, actual: u64 },

    #[error("Consistency check failed: {0}")]
    Consistency(String),

    #[error("Checkpoint codec error: {0}")]
    Checkpoint(#[from] serde_json::Error),
}

/// RPC通信相关错误
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Target node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Network(err.to_string())
    }
}

/// Failures of the follower-side replication protocol.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Pull from leader timed out")]
    PullTimeout,

    #[error("Pull from leader failed: {0}")]
    PullFailure(#[source] RpcError),

    #[error("Replayed entry {0} does not continue the checksum chain")]
    ChainMismatch(u64),

    #[error("Group mismatch: local {local}, remote {remote}")]
    GroupMismatch { local: String, remote: String },

    #[error("Stale term {remote} (local term {local})")]
    TermStale { local: u64, remote: u64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    Missing(&'static str),

    #[error("Invalid option {option}: {reason}")]
    Invalid { option: &'static str, reason: String },

    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 状态机应用相关错误
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Command at index {0} already applied")]
    AlreadyApplied(u64),

    #[error("State machine error: {0}")]
    Internal(String),
}
