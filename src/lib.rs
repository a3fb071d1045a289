//! chainlog: a replicated, append-only log for one group of nodes.
//!
//! Entries are stored in memory-mapped segment files and linked by a checksum
//! chain. A leader elected through pre-vote and vote pushes new entries to its
//! followers; a follower whose log has diverged rolls back to its commit point
//! and pulls the missing range from the leader.

pub mod config;
pub mod error;
pub mod message;
pub mod network;
pub mod node;
pub mod state;
pub mod storage;
pub mod traits;
pub mod types;

pub use config::{NodeConfig, PeerConfig, StoreKind};
pub use error::{ApplyError, ConfigError, NodeError, ReplicationError, RpcError, StorageError};
pub use message::Entry;
pub use node::Node;
pub use state::{NodeState, StateInner};
pub use traits::{
    ApplyResult, InboundHandler, NoopStateMachine, NodeResult, RpcChannel, RpcResult,
    StateMachine, StorageResult,
};
pub use types::{GroupId, NodeId, Payload, Role, Verdict};
