use async_trait::async_trait;
use chainlog::error::ApplyError;
use chainlog::{ApplyResult, Entry, StateMachine};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// --- 业务命令定义 ---
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn set(key: &str, value: &str) -> Vec<u8> {
        Self::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
        .encode()
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Failed to serialize KvCommand")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// In-memory KV store fed by committed entries.
#[derive(Default)]
pub struct TestStateMachine {
    data: RwLock<HashMap<String, String>>,
    // 按顺序记录已应用的日志索引
    applied: RwLock<Vec<u64>>,
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn applied_indices(&self) -> Vec<u64> {
        self.applied.read().clone()
    }

    pub fn last_applied(&self) -> u64 {
        self.applied.read().last().copied().unwrap_or(0)
    }
}

#[async_trait]
impl StateMachine for TestStateMachine {
    async fn apply(&self, entry: &Entry) -> ApplyResult<()> {
        let mut applied = self.applied.write();
        if applied.last().is_some_and(|last| *last >= entry.entry_index) {
            return Err(ApplyError::AlreadyApplied(entry.entry_index));
        }
        let command = KvCommand::decode(&entry.data)
            .map_err(|e| ApplyError::Internal(format!("bad command: {}", e)))?;
        debug!("Applying entry {}: {:?}", entry.entry_index, command);
        match command {
            KvCommand::Set { key, value } => {
                self.data.write().insert(key, value);
            }
            KvCommand::Delete { key } => {
                self.data.write().remove(&key);
            }
        }
        applied.push(entry.entry_index);
        Ok(())
    }
}
