//! Leader-side replication fan-out.
//!
//! Each peer has its own worker holding a cursor: the next index to send. The
//! worker reads batches from the log store starting at the cursor, so a slow
//! or unreachable follower costs one cursor, not a copy of every entry.
//! Agreements are counted per peer; a majority holding an entry of the
//! current term commits it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{NodeState, StateInner};
use crate::config::NodeConfig;
use crate::message::{Entry, PushEntryRequest, PushEntryResponse};
use crate::storage::LogStore;
use crate::traits::RpcChannel;
use crate::types::NodeId;

/// Most entries carried by one push.
pub const MAX_PUSH_BATCH: usize = 64;

pub struct Pusher {
    config: Arc<NodeConfig>,
    state: Arc<NodeState>,
    store: Arc<LogStore>,
    channel: Arc<dyn RpcChannel>,
    commit_notify: Arc<Notify>,
    wakers: HashMap<NodeId, Arc<Notify>>,
    started: AtomicBool,
    /// peer -> (term, next index to send in that term)
    cursors: Mutex<HashMap<NodeId, (u64, u64)>>,
    /// peer -> (term, highest index it agreed to in that term)
    acks: Mutex<HashMap<NodeId, (u64, u64)>>,
}

impl Pusher {
    pub fn new(
        config: Arc<NodeConfig>,
        state: Arc<NodeState>,
        store: Arc<LogStore>,
        channel: Arc<dyn RpcChannel>,
        commit_notify: Arc<Notify>,
    ) -> Self {
        let wakers = config
            .peers
            .iter()
            .map(|peer| (peer.id.clone(), Arc::new(Notify::new())))
            .collect();
        Self {
            config,
            state,
            store,
            channel,
            commit_notify,
            wakers,
            started: AtomicBool::new(false),
            cursors: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
        }
    }

    /// Wake every peer worker after a local append. Repeated wakes before a
    /// worker runs collapse into one.
    pub fn notify_appended(&self) {
        for waker in self.wakers.values() {
            waker.notify_one();
        }
    }

    /// Spawn one worker per peer. Only the first call spawns anything.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        self.wakers
            .iter()
            .map(|(peer, waker)| {
                let pusher = self.clone();
                tokio::spawn(pusher.run_peer(peer.clone(), waker.clone(), shutdown.clone()))
            })
            .collect()
    }

    async fn run_peer(
        self: Arc<Self>,
        peer: NodeId,
        waker: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            // the timer retries a follower that is still behind
            tokio::select! {
                _ = waker.notified() => {}
                _ = sleep(self.config.heartbeat_interval()) => {}
                _ = shutdown.changed() => break,
            }
            self.catch_up(&peer).await;
        }
        debug!("Push worker for {} stopped", peer);
    }

    /// Next index to send to `peer` in `term`. A new term starts after the
    /// commit point.
    fn cursor(&self, peer: &NodeId, st: &StateInner) -> u64 {
        let mut cursors = self.cursors.lock();
        let slot = cursors
            .entry(peer.clone())
            .or_insert((st.term, st.commit_id + 1));
        if slot.0 != st.term {
            *slot = (st.term, st.commit_id + 1);
        }
        slot.1
    }

    /// Next index to send to `peer`, if it has one in the current term.
    pub fn next_index(&self, peer: &NodeId) -> Option<u64> {
        let term = self.state.lock().term;
        self.cursors
            .lock()
            .get(peer)
            .filter(|(cursor_term, _)| *cursor_term == term)
            .map(|(_, next)| *next)
    }

    fn advance_cursor(&self, peer: &NodeId, term: u64, next: u64) {
        let mut cursors = self.cursors.lock();
        let slot = cursors.entry(peer.clone()).or_insert((term, next));
        if slot.0 == term {
            slot.1 = slot.1.max(next);
        }
    }

    /// Push from the peer's cursor to the log tail, one batch at a time.
    /// Stops at the first failed or rejected push; the next wake retries.
    pub async fn catch_up(&self, peer: &NodeId) {
        loop {
            let (term, next) = {
                let st = self.state.lock();
                if !st.is_leader() {
                    return;
                }
                (st.term, self.cursor(peer, &st))
            };
            let max_index = self.store.get_max_index();
            if next > max_index {
                return;
            }
            let to = max_index.min(next + MAX_PUSH_BATCH as u64 - 1) + 1;
            let entries = self.store.batch_get_by_index(next, to);
            if entries.is_empty() {
                warn!("Cannot read entries [{}, {}) for {}", next, to, peer);
                return;
            }
            match self.push_batch(peer, entries).await {
                Some(response) if response.result.is_agree() && response.term == term => {
                    self.advance_cursor(peer, term, response.index + 1);
                }
                _ => return,
            }
        }
    }

    /// Push `entries` (consecutive, ascending) to `peer` and account for the reply.
    pub async fn push_batch(&self, peer: &NodeId, entries: Vec<Entry>) -> Option<PushEntryResponse> {
        let first = entries.first()?;
        let (req, term) = {
            let st = self.state.lock();
            if !st.is_leader() {
                debug!("Node {} no longer leads, dropping push to {}", st.self_id, peer);
                return None;
            }
            let req = PushEntryRequest {
                group: st.group.clone(),
                leader_id: st.self_id.clone(),
                term: st.term,
                pre_checksum: first.pre_checksum,
                last_commit_index: st.commit_id,
                entries,
            };
            (req, st.term)
        };
        let from = req.leader_id.clone();

        // a follower may pull from us before it answers
        let budget = self.config.rpc_timeout() + self.config.pull_timeout();
        let response = match timeout(budget, self.channel.push_entries(&from, peer, req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!("Push to {} failed: {}", peer, e);
                return None;
            }
            Err(_) => {
                debug!("Push to {} timed out", peer);
                return None;
            }
        };

        if response.term > term {
            let mut st = self.state.lock();
            if st.observe_term(response.term) {
                info!(
                    "Node {} saw term {} from {}, stepping down",
                    st.self_id, response.term, peer
                );
            }
            return Some(response);
        }
        if response.result.is_agree() {
            self.record_ack(peer, term, response.index);
            let mut st = self.state.lock();
            if self.advance_commit_with(&mut st) {
                self.commit_notify.notify_one();
            }
        } else {
            warn!("Peer {} rejected push up to index {}", peer, response.index);
        }
        Some(response)
    }

    fn record_ack(&self, peer: &NodeId, term: u64, index: u64) {
        let mut acks = self.acks.lock();
        let slot = acks.entry(peer.clone()).or_insert((term, 0));
        if slot.0 != term {
            *slot = (term, 0);
        }
        slot.1 = slot.1.max(index);
    }

    /// Highest index agreed by `peer` in `term`.
    pub fn acked_index(&self, peer: &NodeId, term: u64) -> u64 {
        self.acks
            .lock()
            .get(peer)
            .filter(|(acked_term, _)| *acked_term == term)
            .map(|(_, index)| *index)
            .unwrap_or(0)
    }

    /// Commit the highest index a majority holds, if it belongs to the
    /// current term. Returns whether the commit index moved.
    pub fn advance_commit_with(&self, st: &mut StateInner) -> bool {
        if !st.is_leader() {
            return false;
        }
        let mut held: Vec<u64> = vec![st.write_id];
        held.extend(
            self.config
                .peers
                .iter()
                .map(|peer| self.acked_index(&peer.id, st.term)),
        );
        held.sort_unstable_by(|a, b| b.cmp(a));
        let Some(&candidate) = held.get(self.config.quorum() - 1) else {
            return false;
        };
        if candidate <= st.commit_id {
            return false;
        }
        match self.store.get_by_index(candidate) {
            Some(entry) if entry.term == st.term => {}
            _ => return false,
        }
        if st.advance_commit(candidate) {
            debug!("Node {} committed up to {}", st.self_id, st.commit_id);
            true
        } else {
            false
        }
    }
}
