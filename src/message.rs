use serde::{Deserialize, Serialize};

use crate::storage::log::{ENTRY_HEADER_SIZE, ENTRY_MAGIC};
use crate::types::{GroupId, NodeId, Payload, Verdict};

/// One replicated log record.
///
/// `term`, `entry_index` and `pre_checksum` are assigned by the leader when the
/// entry is first appended; `pos` is the byte offset in the local data log and
/// is refreshed by whichever node writes the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub magic: u32,
    pub term: u64,
    pub entry_index: u64,
    pub pos: i64,
    /// Checksum of the entry at `entry_index - 1`, zero for the first entry.
    pub pre_checksum: u32,
    pub checksum: u32,
    pub total_size: u32,
    pub data: Payload,
}

impl Entry {
    /// Position of an entry that has not been written.
    pub const NO_POS: i64 = -1;

    pub fn new(data: impl Into<Payload>) -> Self {
        let mut entry = Self {
            magic: ENTRY_MAGIC,
            term: 0,
            entry_index: 0,
            pos: Self::NO_POS,
            pre_checksum: 0,
            checksum: 0,
            total_size: 0,
            data: data.into(),
        };
        entry.compute_size();
        entry
    }

    pub fn compute_size(&mut self) {
        self.total_size = ENTRY_HEADER_SIZE as u32 + self.data.len() as u32;
    }

    /// crc32 over the content fields. `pos` is placement and is left out so the
    /// same entry hashes identically on every replica.
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.term.to_be_bytes());
        hasher.update(&self.entry_index.to_be_bytes());
        hasher.update(&self.pre_checksum.to_be_bytes());
        hasher.update(&self.data);
        hasher.finalize()
    }

    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn is_written(&self) -> bool {
        self.pos != Self::NO_POS
    }

    pub fn is_intact(&self) -> bool {
        self.magic == ENTRY_MAGIC
            && self.total_size as usize == ENTRY_HEADER_SIZE + self.data.len()
            && self.checksum == self.compute_checksum()
    }
}

// === 客户端请求 ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntryRequest {
    pub group: GroupId,
    pub data: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntryResponse {
    pub success: bool,
    pub entry_index: u64,
    pub term: u64,
    /// Set when the request hit a node that is not the leader.
    pub leader_id: Option<NodeId>,
}

// === 节点间请求 ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEntryRequest {
    pub group: GroupId,
    pub leader_id: NodeId,
    pub term: u64,
    pub entries: Vec<Entry>,
    /// Checksum the leader expects at the follower's tail before `entries[0]`.
    pub pre_checksum: u32,
    pub last_commit_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEntryResponse {
    pub group: GroupId,
    pub accept_node_id: NodeId,
    pub term: u64,
    pub index: u64,
    pub result: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullEntryRequest {
    pub group: GroupId,
    pub from_index: u64,
    pub to_index: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullEntryResponse {
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub group: GroupId,
    pub term: u64,
    pub leader_id: NodeId,
    pub commit_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreVoteRequest {
    pub group: GroupId,
    /// The term the candidate would campaign in.
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreVoteResponse {
    pub group: GroupId,
    /// Voter's term after handling the request.
    pub term: u64,
    /// Term of the request being answered.
    pub request_term: u64,
    pub voter_id: NodeId,
    pub result: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub group: GroupId,
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub group: GroupId,
    /// Voter's term after handling the request.
    pub term: u64,
    /// Term of the request being answered.
    pub request_term: u64,
    pub voter_id: NodeId,
    pub result: Verdict,
}
