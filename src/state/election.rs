//! Leader election: pre-vote, vote, heartbeats and the election timer.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{NodeState, StateInner};
use crate::config::NodeConfig;
use crate::message::{
    HeartbeatRequest, PreVoteRequest, PreVoteResponse, VoteRequest, VoteResponse,
};
use crate::storage::CheckpointStore;
use crate::traits::RpcChannel;
use crate::types::{NodeId, Role, Verdict};

/// What a node knows about itself when judging a vote request.
#[derive(Debug, Clone, Copy)]
pub struct LocalView<'a> {
    pub group: &'a str,
    pub term: u64,
    pub last_index: u64,
    /// A leader was heard from within the minimum election timeout, or this
    /// node is the leader.
    pub leader_alive: bool,
}

/// What a candidate claims about itself.
#[derive(Debug, Clone, Copy)]
pub struct Candidacy<'a> {
    pub group: &'a str,
    pub term: u64,
    pub last_index: u64,
}

/// Vote decision shared by pre-vote and vote.
///
/// Grant iff the groups match, the candidate is not behind on term or log, and
/// no live leader is known.
pub fn decide_vote(local: &LocalView<'_>, remote: &Candidacy<'_>) -> Verdict {
    if local.group != remote.group {
        return Verdict::Reject;
    }
    if local.leader_alive {
        return Verdict::Reject;
    }
    Verdict::from_bool(remote.term >= local.term && remote.last_index >= local.last_index)
}

pub struct LeaderElector {
    config: Arc<NodeConfig>,
    state: Arc<NodeState>,
    channel: Arc<dyn RpcChannel>,
    checkpoints: CheckpointStore,
}

impl LeaderElector {
    pub fn new(
        config: Arc<NodeConfig>,
        state: Arc<NodeState>,
        channel: Arc<dyn RpcChannel>,
        checkpoints: CheckpointStore,
    ) -> Self {
        Self {
            config,
            state,
            channel,
            checkpoints,
        }
    }

    fn local_view<'a>(&self, st: &'a StateInner) -> LocalView<'a> {
        LocalView {
            group: &st.group,
            term: st.term,
            last_index: st.write_id,
            leader_alive: st.role == Role::Leader
                || st.heard_from_leader_within(self.config.min_election_timeout()),
        }
    }

    fn persist(&self, st: &StateInner) {
        if let Err(e) = self.checkpoints.save(&st.checkpoint()) {
            warn!("Node {} failed to persist vote: {}", st.self_id, e);
        }
    }

    /// 处理预投票请求; never changes local state
    pub fn handle_pre_vote(&self, req: &PreVoteRequest) -> PreVoteResponse {
        let st = self.state.lock();
        let result = decide_vote(
            &self.local_view(&st),
            &Candidacy {
                group: &req.group,
                term: req.term,
                last_index: req.last_index,
            },
        );
        debug!(
            "Node {} pre-vote for {} (term {}, last index {}): {}",
            st.self_id, req.candidate_id, req.term, req.last_index, result
        );
        PreVoteResponse {
            group: st.group.clone(),
            term: st.term,
            request_term: req.term,
            voter_id: st.self_id.clone(),
            result,
        }
    }

    /// 处理投票请求
    pub fn handle_vote(&self, req: &VoteRequest) -> VoteResponse {
        let mut st = self.state.lock();
        let candidacy = Candidacy {
            group: &req.group,
            term: req.term,
            last_index: req.last_index,
        };

        // without a live leader a higher term is adopted whatever the verdict
        let leader_alive = self.local_view(&st).leader_alive;
        if req.group == st.group && !leader_alive && st.observe_term(req.term) {
            info!(
                "Node {} stepping down to Follower, term now {}",
                st.self_id, st.term
            );
            self.persist(&st);
        }

        let mut result = decide_vote(&self.local_view(&st), &candidacy);
        if result.is_agree() {
            let already_voted = st.voted_term == st.term
                && st.voted_for.as_ref().is_some_and(|v| v != &req.candidate_id);
            if already_voted {
                result = Verdict::Reject;
            } else {
                st.voted_for = Some(req.candidate_id.clone());
                st.voted_term = st.term;
                self.persist(&st);
            }
        }
        info!(
            "Node {} vote for {} in term {}: {}",
            st.self_id, req.candidate_id, req.term, result
        );
        VoteResponse {
            group: st.group.clone(),
            term: st.term,
            request_term: req.term,
            voter_id: st.self_id.clone(),
            result,
        }
    }

    /// Accept a heartbeat from the current or a newer term's leader.
    pub fn handle_heartbeat(&self, req: &HeartbeatRequest) -> Verdict {
        let mut st = self.state.lock();
        if req.group != st.group {
            warn!(
                "Node {} ignoring heartbeat for group {}",
                st.self_id, req.group
            );
            return Verdict::Reject;
        }
        if req.term < st.term {
            debug!(
                "Node {} ignoring heartbeat from {} with stale term {} (local {})",
                st.self_id, req.leader_id, req.term, st.term
            );
            return Verdict::Reject;
        }
        if req.leader_id == st.self_id {
            return Verdict::Agree;
        }
        if st.leader_id.as_ref() != Some(&req.leader_id) {
            info!(
                "Node {} following leader {} in term {}",
                st.self_id, req.leader_id, req.term
            );
        }
        st.follow(&req.leader_id, req.term);
        let commit = req.commit_index.min(st.matched_id);
        st.advance_commit(commit);
        Verdict::Agree
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.config.min_election_timeout_ms;
        let max = self.config.max_election_timeout_ms.max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Election timer and heartbeat emitter; returns once `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let role = self.state.lock().role;
            let wait = match role {
                Role::Leader => self.config.heartbeat_interval(),
                _ => self.random_election_timeout(),
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick(wait).await;
        }
        debug!("Elector loop for {} stopped", self.config.self_id);
    }

    /// One timer expiry: a leader sends heartbeats, anyone else starts an
    /// election if no leader was heard from during `elapsed`.
    pub async fn tick(&self, elapsed: Duration) {
        let (role, quiet) = {
            let st = self.state.lock();
            (st.role, !st.heard_from_leader_within(elapsed))
        };
        match role {
            Role::Leader => self.broadcast_heartbeat(),
            _ if quiet => {
                if self.run_pre_vote().await {
                    self.run_election().await;
                }
            }
            _ => {}
        }
    }

    fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.config.peers.iter().map(|p| &p.id)
    }

    /// Non-binding round at `term + 1`. Returns whether a majority agreed.
    pub async fn run_pre_vote(&self) -> bool {
        let req = {
            let mut st = self.state.lock();
            st.role = Role::PreCandidate;
            PreVoteRequest {
                group: st.group.clone(),
                term: st.term + 1,
                candidate_id: st.self_id.clone(),
                last_index: st.write_id,
            }
        };
        info!(
            "Node {} starting pre-vote for term {}",
            req.candidate_id, req.term
        );

        let rpc_timeout = self.config.rpc_timeout();
        let calls = self.peers().map(|peer| {
            let req = req.clone();
            async move {
                let sent = self.channel.request_pre_vote(&req.candidate_id, peer, req.clone());
                match timeout(rpc_timeout, sent).await {
                    Ok(Ok(response)) => Some(response),
                    Ok(Err(e)) => {
                        debug!("Pre-vote to {} failed: {}", peer, e);
                        None
                    }
                    Err(_) => {
                        debug!("Pre-vote to {} timed out", peer);
                        None
                    }
                }
            }
        });
        let responses = join_all(calls).await;

        let mut st = self.state.lock();
        let agrees = 1 + responses
            .iter()
            .flatten()
            .filter(|r| r.request_term == req.term && r.result.is_agree())
            .count();
        let highest_term = responses.iter().flatten().map(|r| r.term).max().unwrap_or(0);
        if st.observe_term(highest_term) {
            info!(
                "Node {} saw term {} during pre-vote, back to Follower",
                st.self_id, st.term
            );
            return false;
        }
        if st.role != Role::PreCandidate {
            return false;
        }
        if agrees >= self.config.quorum() {
            true
        } else {
            info!(
                "Node {} pre-vote failed ({} of {} needed)",
                st.self_id,
                agrees,
                self.config.quorum()
            );
            st.role = Role::Follower;
            false
        }
    }

    /// Binding round: bump the term, vote for self, collect votes.
    pub async fn run_election(&self) -> bool {
        let req = {
            let mut st = self.state.lock();
            if st.role != Role::PreCandidate {
                return false;
            }
            st.term += 1;
            st.role = Role::Candidate;
            st.leader_id = None;
            st.voted_for = Some(st.self_id.clone());
            st.voted_term = st.term;
            self.persist(&st);
            VoteRequest {
                group: st.group.clone(),
                term: st.term,
                candidate_id: st.self_id.clone(),
                last_index: st.write_id,
            }
        };
        info!(
            "Node {} starting election for term {}",
            req.candidate_id, req.term
        );

        let rpc_timeout = self.config.rpc_timeout();
        let calls = self.peers().map(|peer| {
            let req = req.clone();
            async move {
                let sent = self.channel.request_vote(&req.candidate_id, peer, req.clone());
                match timeout(rpc_timeout, sent).await {
                    Ok(Ok(response)) => Some(response),
                    Ok(Err(e)) => {
                        debug!("Vote request to {} failed: {}", peer, e);
                        None
                    }
                    Err(_) => None,
                }
            }
        });
        let responses = join_all(calls).await;

        let won = {
            let mut st = self.state.lock();
            let highest_term = responses.iter().flatten().map(|r| r.term).max().unwrap_or(0);
            if st.observe_term(highest_term) {
                info!(
                    "Node {} saw term {} during election, back to Follower",
                    st.self_id, st.term
                );
                return false;
            }
            if st.term != req.term || st.role != Role::Candidate {
                return false;
            }
            // a reply to an earlier round is not a vote in this one
            let agrees = 1 + responses
                .iter()
                .flatten()
                .filter(|r| r.request_term == req.term && r.result.is_agree())
                .count();
            if agrees >= self.config.quorum() {
                st.role = Role::Leader;
                st.leader_id = Some(st.self_id.clone());
                st.matched_id = st.write_id;
                info!(
                    "Node {} became leader for term {} with {} votes",
                    st.self_id, st.term, agrees
                );
                true
            } else {
                info!(
                    "Node {} lost election for term {} ({} votes)",
                    st.self_id, st.term, agrees
                );
                st.role = Role::Follower;
                false
            }
        };
        if won {
            self.broadcast_heartbeat();
        }
        won
    }

    /// Fire-and-forget heartbeat to every peer.
    pub fn broadcast_heartbeat(&self) {
        let req = {
            let st = self.state.lock();
            if !st.is_leader() {
                return;
            }
            HeartbeatRequest {
                group: st.group.clone(),
                term: st.term,
                leader_id: st.self_id.clone(),
                commit_index: st.commit_id,
            }
        };
        let rpc_timeout = self.config.rpc_timeout();
        for peer in self.peers() {
            let channel = self.channel.clone();
            let peer = peer.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let from = req.leader_id.clone();
                match timeout(rpc_timeout, channel.send_heartbeat(&from, &peer, req)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Heartbeat to {} failed: {}", peer, e),
                    Err(_) => debug!("Heartbeat to {} timed out", peer),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerConfig, StoreKind};
    use crate::network::{MockNetworkConfig, MockNetworkHub};
    use std::time::Instant;

    fn view(term: u64, last_index: u64, leader_alive: bool) -> LocalView<'static> {
        LocalView {
            group: "g",
            term,
            last_index,
            leader_alive,
        }
    }

    fn candidacy(group: &str, term: u64, last_index: u64) -> Candidacy<'_> {
        Candidacy {
            group,
            term,
            last_index,
        }
    }

    #[test]
    fn test_decide_vote_grants_up_to_date_candidate() {
        assert_eq!(decide_vote(&view(2, 5, false), &candidacy("g", 3, 5)), Verdict::Agree);
        assert_eq!(decide_vote(&view(2, 5, false), &candidacy("g", 2, 9)), Verdict::Agree);
    }

    #[test]
    fn test_decide_vote_rejects() {
        // shorter log
        assert_eq!(decide_vote(&view(2, 5, false), &candidacy("g", 3, 4)), Verdict::Reject);
        // older term
        assert_eq!(decide_vote(&view(2, 5, false), &candidacy("g", 1, 9)), Verdict::Reject);
        // foreign group
        assert_eq!(decide_vote(&view(2, 5, false), &candidacy("h", 3, 9)), Verdict::Reject);
        // live leader
        assert_eq!(decide_vote(&view(2, 5, true), &candidacy("g", 3, 9)), Verdict::Reject);
    }

    fn elector(self_id: &str, peers: &[&str], hub: &MockNetworkHub) -> LeaderElector {
        let config = Arc::new(NodeConfig {
            self_id: self_id.to_string(),
            group: "g".to_string(),
            store_kind: StoreKind::Memory,
            peers: peers
                .iter()
                .map(|id| PeerConfig {
                    id: id.to_string(),
                    addr: String::new(),
                    api_port: 0,
                })
                .collect(),
            min_election_timeout_ms: 200,
            max_election_timeout_ms: 400,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            ..Default::default()
        });
        let state = Arc::new(NodeState::new(&config));
        let checkpoints = CheckpointStore::new(StoreKind::Memory, &config.base_file_path);
        LeaderElector::new(config, state, Arc::new(hub.clone()), checkpoints)
    }

    fn vote_request(candidate: &str, term: u64, last_index: u64) -> VoteRequest {
        VoteRequest {
            group: "g".into(),
            term,
            candidate_id: candidate.into(),
            last_index,
        }
    }

    #[test]
    fn test_one_vote_per_term() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let elector = elector("n1", &["n2", "n3"], &hub);

        let first = elector.handle_vote(&vote_request("n2", 1, 0));
        assert_eq!(first.result, Verdict::Agree);
        assert_eq!(first.term, 1);

        let second = elector.handle_vote(&vote_request("n3", 1, 0));
        assert_eq!(second.result, Verdict::Reject);

        // same candidate may ask again
        let again = elector.handle_vote(&vote_request("n2", 1, 0));
        assert_eq!(again.result, Verdict::Agree);

        // a newer term frees the vote
        let later = elector.handle_vote(&vote_request("n3", 2, 0));
        assert_eq!(later.result, Verdict::Agree);
        assert_eq!(elector.state.lock().voted_for.as_deref(), Some("n3"));
    }

    #[test]
    fn test_pre_vote_leaves_state_alone() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let elector = elector("n1", &["n2"], &hub);
        let response = elector.handle_pre_vote(&PreVoteRequest {
            group: "g".into(),
            term: 5,
            candidate_id: "n2".into(),
            last_index: 0,
        });
        assert_eq!(response.result, Verdict::Agree);
        let st = elector.state.snapshot();
        assert_eq!(st.term, 0);
        assert_eq!(st.voted_for, None);
    }

    #[test]
    fn test_heartbeat_blocks_votes_and_advances_commit() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let elector = elector("n1", &["n2", "n3"], &hub);
        {
            let mut st = elector.state.lock();
            st.write_id = 4;
        }

        let beat = HeartbeatRequest {
            group: "g".into(),
            term: 3,
            leader_id: "n2".into(),
            commit_index: 10,
        };
        assert_eq!(elector.handle_heartbeat(&beat), Verdict::Agree);
        {
            let mut st = elector.state.lock();
            assert_eq!(st.term, 3);
            assert_eq!(st.leader_id.as_deref(), Some("n2"));
            // nothing confirmed against n2 yet
            assert_eq!(st.commit_id, 0);
            st.mark_matched(3);
        }
        elector.handle_heartbeat(&beat);
        assert_eq!(elector.state.lock().commit_id, 3);

        let vote = elector.handle_vote(&vote_request("n3", 4, 10));
        assert_eq!(vote.result, Verdict::Reject);
        assert_eq!(vote.term, 3);

        let stale = HeartbeatRequest { term: 2, ..beat.clone() };
        assert_eq!(elector.handle_heartbeat(&stale), Verdict::Reject);
        let foreign = HeartbeatRequest {
            group: "other".into(),
            ..beat
        };
        assert_eq!(elector.handle_heartbeat(&foreign), Verdict::Reject);
    }

    #[test]
    fn test_higher_term_vote_demotes_candidate_even_when_rejected() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let elector = elector("n1", &["n2", "n3"], &hub);
        {
            let mut st = elector.state.lock();
            st.term = 2;
            st.role = Role::Candidate;
            st.leader_id = None;
            st.voted_for = Some("n1".into());
            st.voted_term = 2;
            st.write_id = 7;
        }

        // shorter log: no vote, but the term is adopted
        let response = elector.handle_vote(&vote_request("n2", 5, 3));
        assert_eq!(response.result, Verdict::Reject);
        assert_eq!(response.term, 5);
        let st = elector.state.snapshot();
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.term, 5);
        assert_eq!(st.voted_for, None);
    }

    #[test]
    fn test_live_leader_keeps_term_on_vote_request() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let elector = elector("n1", &["n2"], &hub);
        {
            let mut st = elector.state.lock();
            st.term = 2;
            st.role = Role::Leader;
            st.leader_id = Some("n1".into());
        }
        let response = elector.handle_vote(&vote_request("n2", 5, 0));
        assert_eq!(response.result, Verdict::Reject);
        assert_eq!(elector.state.lock().term, 2);
        assert_eq!(elector.state.lock().role, Role::Leader);
    }

    /// Answers every request AGREE, but for the term before the one asked.
    struct LaggingVoter;

    #[async_trait::async_trait]
    impl RpcChannel for LaggingVoter {
        async fn push_entries(
            &self,
            _from: &NodeId,
            _target: &NodeId,
            _req: crate::message::PushEntryRequest,
        ) -> crate::traits::RpcResult<crate::message::PushEntryResponse> {
            Err(crate::error::RpcError::Timeout)
        }

        async fn pull_entries(
            &self,
            _from: &NodeId,
            _target: &NodeId,
            _req: crate::message::PullEntryRequest,
        ) -> crate::traits::RpcResult<crate::message::PullEntryResponse> {
            Err(crate::error::RpcError::Timeout)
        }

        async fn send_heartbeat(
            &self,
            _from: &NodeId,
            _target: &NodeId,
            _req: HeartbeatRequest,
        ) -> crate::traits::RpcResult<()> {
            Ok(())
        }

        async fn request_pre_vote(
            &self,
            _from: &NodeId,
            target: &NodeId,
            req: PreVoteRequest,
        ) -> crate::traits::RpcResult<PreVoteResponse> {
            Ok(PreVoteResponse {
                group: req.group,
                term: 0,
                request_term: req.term - 1,
                voter_id: target.clone(),
                result: Verdict::Agree,
            })
        }

        async fn request_vote(
            &self,
            _from: &NodeId,
            target: &NodeId,
            req: VoteRequest,
        ) -> crate::traits::RpcResult<VoteResponse> {
            Ok(VoteResponse {
                group: req.group,
                term: req.term - 1,
                request_term: req.term - 1,
                voter_id: target.clone(),
                result: Verdict::Agree,
            })
        }
    }

    #[tokio::test]
    async fn test_replies_for_other_terms_are_not_counted() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let base = elector("n1", &["n2", "n3"], &hub);
        let elector = LeaderElector::new(
            base.config.clone(),
            base.state.clone(),
            Arc::new(LaggingVoter),
            base.checkpoints.clone(),
        );

        assert!(!elector.run_pre_vote().await);
        assert_eq!(elector.state.lock().role, Role::Follower);

        elector.state.lock().role = Role::PreCandidate;
        assert!(!elector.run_election().await);
        let st = elector.state.snapshot();
        assert_eq!(st.term, 1);
        assert_ne!(st.role, Role::Leader);
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let elector = elector("solo", &[], &hub);
        assert!(elector.run_pre_vote().await);
        assert!(elector.run_election().await);
        let st = elector.state.snapshot();
        assert_eq!(st.role, Role::Leader);
        assert_eq!(st.term, 1);
        assert!(st.is_leader());
    }

    #[tokio::test]
    async fn test_unreachable_peers_count_as_reject() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let elector = elector("n1", &["n2", "n3"], &hub);
        assert!(!elector.run_pre_vote().await);
        let st = elector.state.snapshot();
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.term, 0);
    }

    #[tokio::test]
    async fn test_tick_skips_election_while_leader_is_heard() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let elector = elector("solo", &[], &hub);
        {
            let mut st = elector.state.lock();
            st.leader_id = Some("someone".into());
            st.last_heard_from_leader = Some(Instant::now());
        }
        elector.tick(Duration::from_secs(10)).await;
        assert_eq!(elector.state.lock().role, Role::Follower);

        elector.state.lock().last_heard_from_leader = None;
        elector.tick(Duration::from_secs(10)).await;
        assert_eq!(elector.state.lock().role, Role::Leader);
    }
}
