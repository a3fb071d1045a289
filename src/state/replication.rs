//! Inbound replication: client append, leader push, follower pull.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::NodeState;
use super::pusher::Pusher;
use crate::config::NodeConfig;
use crate::error::ReplicationError;
use crate::message::{
    AppendEntryRequest, AppendEntryResponse, Entry, PullEntryRequest, PullEntryResponse,
    PushEntryRequest, PushEntryResponse,
};
use crate::storage::LogStore;
use crate::traits::RpcChannel;
use crate::types::{NodeId, Verdict};

pub struct ReplicationHandler {
    config: Arc<NodeConfig>,
    state: Arc<NodeState>,
    store: Arc<LogStore>,
    channel: Arc<dyn RpcChannel>,
    pusher: Arc<Pusher>,
    commit_notify: Arc<Notify>,
}

impl ReplicationHandler {
    pub fn new(
        config: Arc<NodeConfig>,
        state: Arc<NodeState>,
        store: Arc<LogStore>,
        channel: Arc<dyn RpcChannel>,
        pusher: Arc<Pusher>,
        commit_notify: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            state,
            store,
            channel,
            pusher,
            commit_notify,
        }
    }

    /// Append a client payload on the leader and wake the push workers.
    ///
    /// Success means the entry is in the leader's log; it does not wait for
    /// followers.
    pub fn handle_append(&self, req: AppendEntryRequest) -> AppendEntryResponse {
        let mut st = self.state.lock();
        let rejected = |term: u64, leader_id: Option<NodeId>| AppendEntryResponse {
            success: false,
            entry_index: 0,
            term,
            leader_id,
        };
        if req.group != st.group {
            warn!("Node {} rejecting append for group {}", st.self_id, req.group);
            return rejected(st.term, st.leader_id.clone());
        }
        if !st.is_leader() {
            debug!(
                "Node {} is not leader, redirecting client to {:?}",
                st.self_id, st.leader_id
            );
            return rejected(st.term, st.leader_id.clone());
        }

        let mut entry = Entry::new(req.data);
        if let Err(e) = self.store.append_with(&mut st, &mut entry) {
            warn!("Node {} local append failed: {}", st.self_id, e);
            return rejected(st.term, st.leader_id.clone());
        }
        self.pusher.notify_appended();
        if self.pusher.advance_commit_with(&mut st) {
            self.commit_notify.notify_one();
        }
        AppendEntryResponse {
            success: true,
            entry_index: entry.entry_index,
            term: entry.term,
            leader_id: Some(st.self_id.clone()),
        }
    }

    /// Serve `[from_index, to_index)` to a follower.
    pub fn handle_pull(&self, req: &PullEntryRequest) -> PullEntryResponse {
        if req.group != self.config.group {
            warn!("Ignoring pull for group {}", req.group);
            return PullEntryResponse::default();
        }
        PullEntryResponse {
            entries: self.store.batch_get_by_index(req.from_index, req.to_index),
        }
    }

    /// Process a leader push, entry by entry. The first REJECT ends the batch.
    pub async fn handle_push(&self, req: PushEntryRequest) -> PushEntryResponse {
        let precheck = {
            let mut st = self.state.lock();
            if req.group != st.group {
                Err(ReplicationError::GroupMismatch {
                    local: st.group.clone(),
                    remote: req.group.clone(),
                })
            } else if req.term < st.term {
                Err(ReplicationError::TermStale {
                    local: st.term,
                    remote: req.term,
                })
            } else {
                st.follow(&req.leader_id, req.term);
                Ok(())
            }
        };
        if let Err(e) = precheck {
            warn!("Rejecting push from {}: {}", req.leader_id, e);
            return self.push_response(0, Verdict::Reject);
        }

        let mut pre_checksum = req.pre_checksum;
        let mut index = 0;
        let mut result = Verdict::Agree;
        for entry in req.entries {
            index = entry.entry_index;
            let checksum = entry.checksum;
            result = self
                .accept_entry(&req.leader_id, entry, pre_checksum, req.last_commit_index)
                .await;
            if !result.is_agree() {
                break;
            }
            pre_checksum = checksum;
        }
        self.push_response(index, result)
    }

    fn push_response(&self, index: u64, result: Verdict) -> PushEntryResponse {
        let st = self.state.lock();
        PushEntryResponse {
            group: st.group.clone(),
            accept_node_id: st.self_id.clone(),
            term: st.term,
            index,
            result,
        }
    }

    fn adopt_commit(&self, st: &mut super::StateInner, index: u64, last_commit_index: u64) {
        st.mark_matched(index);
        if st.advance_commit(last_commit_index.min(index)) {
            self.commit_notify.notify_one();
        }
    }

    async fn accept_entry(
        &self,
        leader: &NodeId,
        mut entry: Entry,
        pre_checksum: u32,
        last_commit_index: u64,
    ) -> Verdict {
        let index = entry.entry_index;
        let (from_index, expected_tail) = {
            let mut st = self.state.lock();

            // already committed
            if st.commit_id >= index {
                st.mark_matched(index);
                return Verdict::Agree;
            }

            // already written with the same content
            if st.write_id >= index {
                let same = self
                    .store
                    .get_by_index(index)
                    .is_some_and(|local| local.checksum == entry.checksum);
                if same {
                    self.adopt_commit(&mut st, index, last_commit_index);
                    return Verdict::Agree;
                }
            }

            // continues the chain
            if st.last_checksum == pre_checksum && index == st.write_id + 1 {
                return match self.store.append_with(&mut st, &mut entry) {
                    Ok(_) => {
                        self.adopt_commit(&mut st, index, last_commit_index);
                        Verdict::Agree
                    }
                    Err(e) => {
                        warn!("Node {} failed to append entry {}: {}", st.self_id, index, e);
                        Verdict::Reject
                    }
                };
            }

            // diverged: roll back to the commit point
            let commit = st.commit_id;
            info!(
                "Node {} diverged at entry {} (write {}, commit {}), rolling back",
                st.self_id, index, st.write_id, commit
            );
            if let Err(e) = self.store.trim_after_with(&mut st, commit) {
                warn!("Node {} rollback to {} failed: {}", st.self_id, commit, e);
                return Verdict::Reject;
            }
            (commit + 1, (st.write_id, st.last_checksum))
        };

        let fetched = match self.pull_from(leader, from_index, index + 1).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Recovery pull [{}, {}) failed: {}", from_index, index + 1, e);
                return Verdict::Reject;
            }
        };

        let mut st = self.state.lock();
        if (st.write_id, st.last_checksum) == expected_tail {
            for mut replayed in fetched {
                if replayed.entry_index != st.write_id + 1
                    || replayed.pre_checksum != st.last_checksum
                {
                    warn!(
                        "Node {} stopping replay: {}",
                        st.self_id,
                        ReplicationError::ChainMismatch(replayed.entry_index)
                    );
                    break;
                }
                if let Err(e) = self.store.append_with(&mut st, &mut replayed) {
                    warn!(
                        "Node {} replay of entry {} failed: {}",
                        st.self_id, replayed.entry_index, e
                    );
                    break;
                }
            }
        } else {
            debug!(
                "Node {} log moved during recovery pull, skipping replay",
                st.self_id
            );
        }

        let recovered = st.write_id >= index
            && self
                .store
                .get_by_index(index)
                .is_some_and(|local| local.checksum == entry.checksum);
        if recovered {
            info!("Node {} recovered up to entry {}", st.self_id, index);
            self.adopt_commit(&mut st, index, last_commit_index);
            Verdict::Agree
        } else {
            Verdict::Reject
        }
    }

    async fn pull_from(
        &self,
        leader: &NodeId,
        from_index: u64,
        to_index: u64,
    ) -> Result<Vec<Entry>, ReplicationError> {
        let req = PullEntryRequest {
            group: self.config.group.clone(),
            from_index,
            to_index,
        };
        match timeout(
            self.config.pull_timeout(),
            self.channel.pull_entries(&self.config.self_id, leader, req),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response.entries),
            Ok(Err(e)) => Err(ReplicationError::PullFailure(e)),
            Err(_) => Err(ReplicationError::PullTimeout),
        }
    }
}
