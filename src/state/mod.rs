//! Node state and the protocols that mutate it.
//!
//! - `mod.rs` - `NodeState`, the single writer domain shared with the log store
//! - `election.rs` - pre-vote, vote and heartbeat handling
//! - `replication.rs` - inbound push/pull/append handling and divergence recovery
//! - `pusher.rs` - leader-side fan-out and commit advancement

pub mod election;
pub mod pusher;
pub mod replication;

use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::config::NodeConfig;
use crate::storage::Checkpoint;
use crate::types::{GroupId, NodeId, Role};

/// Mutable fields of a node, only touched while holding `NodeState::lock`.
#[derive(Debug, Clone)]
pub struct StateInner {
    pub group: GroupId,
    pub self_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    /// Real vote granted in `voted_term`, if any.
    pub voted_for: Option<NodeId>,
    pub voted_term: u64,
    /// Highest index known committed.
    pub commit_id: u64,
    /// Highest index written locally.
    pub write_id: u64,
    /// Highest index handed to the state machine.
    pub applied_id: u64,
    /// Highest index known to agree with the current leader's log.
    pub matched_id: u64,
    /// Checksum of the entry at `write_id`; zero for an empty log.
    pub last_checksum: u32,
    /// Checksum of the entry before it.
    pub pre_checksum: u32,
    pub last_heard_from_leader: Option<Instant>,
}

impl StateInner {
    pub fn is_leader(&self) -> bool {
        self.leader_id.as_ref() == Some(&self.self_id)
    }

    /// Whether a leader was heard from within `window`.
    pub fn heard_from_leader_within(&self, window: Duration) -> bool {
        self.last_heard_from_leader
            .map(|at| at.elapsed() < window)
            .unwrap_or(false)
    }

    /// Adopt a newer term. The vote and the leader belong to the old term and
    /// are dropped.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term <= self.term {
            return false;
        }
        self.term = term;
        self.leader_id = None;
        self.voted_for = None;
        self.role = Role::Follower;
        self.matched_id = self.commit_id;
        true
    }

    /// Follow `leader` in `term`, refreshing the heartbeat timestamp.
    pub fn follow(&mut self, leader: &NodeId, term: u64) {
        self.observe_term(term);
        if self.leader_id.as_ref() != Some(leader) {
            self.matched_id = self.commit_id;
        }
        if leader != &self.self_id {
            self.role = Role::Follower;
        }
        self.leader_id = Some(leader.clone());
        self.last_heard_from_leader = Some(Instant::now());
    }

    /// Raise the commit index, never past the local log.
    pub fn advance_commit(&mut self, commit: u64) -> bool {
        let commit = commit.min(self.write_id);
        if commit > self.commit_id {
            self.commit_id = commit;
            true
        } else {
            false
        }
    }

    /// Record that the log up to `index` agrees with the current leader.
    pub fn mark_matched(&mut self, index: u64) {
        self.matched_id = self.matched_id.max(index.min(self.write_id));
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            term: self.term,
            voted_for: self.voted_for.clone(),
            voted_term: self.voted_term,
            commit_id: self.commit_id,
            applied_id: self.applied_id,
        }
    }
}

/// Shared state of one node in one log group.
///
/// Every mutation of `StateInner` and every log append or trim happens while
/// holding the one lock returned by `lock()`.
pub struct NodeState {
    inner: Mutex<StateInner>,
}

impl NodeState {
    pub fn new(config: &NodeConfig) -> Self {
        let role = if config.leader_id.as_ref() == Some(&config.self_id) {
            Role::Leader
        } else {
            Role::Follower
        };
        Self {
            inner: Mutex::new(StateInner {
                group: config.group.clone(),
                self_id: config.self_id.clone(),
                role,
                term: 0,
                leader_id: config.leader_id.clone(),
                voted_for: None,
                voted_term: 0,
                commit_id: 0,
                write_id: 0,
                applied_id: 0,
                matched_id: 0,
                last_checksum: 0,
                pre_checksum: 0,
                last_heard_from_leader: None,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock()
    }

    /// Copy of the current fields, taken under the lock.
    pub fn snapshot(&self) -> StateInner {
        self.inner.lock().clone()
    }

    /// Apply a checkpoint loaded at start-up. Runs before log recovery, which
    /// clamps the indices to what the log actually holds.
    pub fn restore(&self, checkpoint: &Checkpoint) {
        let mut st = self.inner.lock();
        st.term = st.term.max(checkpoint.term);
        if checkpoint.voted_term == st.term {
            st.voted_for = checkpoint.voted_for.clone();
            st.voted_term = checkpoint.voted_term;
        }
        st.commit_id = checkpoint.commit_id;
        st.applied_id = checkpoint.applied_id;
        st.matched_id = checkpoint.commit_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(leader: Option<&str>) -> NodeConfig {
        NodeConfig {
            self_id: "n1".to_string(),
            leader_id: leader.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_role_follows_configured_leader() {
        assert_eq!(NodeState::new(&config(Some("n1"))).lock().role, Role::Leader);
        assert!(NodeState::new(&config(Some("n1"))).lock().is_leader());
        assert_eq!(NodeState::new(&config(Some("n2"))).lock().role, Role::Follower);
        assert_eq!(NodeState::new(&config(None)).lock().leader_id, None);
    }

    #[test]
    fn test_observe_term_steps_down() {
        let state = NodeState::new(&config(Some("n1")));
        let mut st = state.lock();
        st.term = 3;
        st.voted_for = Some("n1".to_string());

        assert!(!st.observe_term(3));
        assert_eq!(st.role, Role::Leader);

        assert!(st.observe_term(4));
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.leader_id, None);
        assert_eq!(st.voted_for, None);
    }

    #[test]
    fn test_advance_commit_is_monotone_and_bounded() {
        let state = NodeState::new(&config(None));
        let mut st = state.lock();
        st.write_id = 5;
        assert!(st.advance_commit(3));
        assert!(!st.advance_commit(2));
        assert_eq!(st.commit_id, 3);
        assert!(st.advance_commit(9));
        assert_eq!(st.commit_id, 5);
    }

    #[test]
    fn test_matched_resets_on_leader_change() {
        let state = NodeState::new(&config(Some("n2")));
        let mut st = state.lock();
        st.term = 1;
        st.write_id = 6;
        st.commit_id = 2;
        st.follow(&"n2".to_string(), 1);
        st.mark_matched(5);
        assert_eq!(st.matched_id, 5);
        st.mark_matched(9);
        assert_eq!(st.matched_id, 6);

        st.follow(&"n2".to_string(), 1);
        assert_eq!(st.matched_id, 6);
        st.follow(&"n3".to_string(), 2);
        assert_eq!(st.matched_id, 2);
        assert_eq!(st.leader_id.as_deref(), Some("n3"));
        assert!(st.heard_from_leader_within(Duration::from_secs(1)));
    }

    #[test]
    fn test_restore_keeps_vote_of_current_term_only() {
        let state = NodeState::new(&config(None));
        state.restore(&Checkpoint {
            term: 7,
            voted_for: Some("n2".to_string()),
            voted_term: 6,
            commit_id: 4,
            applied_id: 2,
        });
        let st = state.snapshot();
        assert_eq!(st.term, 7);
        assert_eq!(st.voted_for, None);
        assert_eq!(st.commit_id, 4);
        assert_eq!(st.applied_id, 2);
    }
}
