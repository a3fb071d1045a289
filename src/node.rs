//! One member of a log group: storage, state, election and replication wired
//! together, plus the background loops that keep them moving.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::message::{AppendEntryRequest, Entry};
use crate::network::{Request, Response};
use crate::state::election::LeaderElector;
use crate::state::pusher::Pusher;
use crate::state::replication::ReplicationHandler;
use crate::state::{NodeState, StateInner};
use crate::storage::{CheckpointStore, LogStore, LogStoreOptions};
use crate::traits::{InboundHandler, NodeResult, RpcChannel, StateMachine};
use crate::types::{NodeId, Role};

pub struct Node {
    config: Arc<NodeConfig>,
    state: Arc<NodeState>,
    store: Arc<LogStore>,
    checkpoints: CheckpointStore,
    elector: Arc<LeaderElector>,
    replication: Arc<ReplicationHandler>,
    pusher: Arc<Pusher>,
    state_machine: Arc<dyn StateMachine>,
    commit_notify: Arc<Notify>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Validate the config, restore the checkpoint and open the log.
    pub fn new(
        config: NodeConfig,
        state_machine: Arc<dyn StateMachine>,
        channel: Arc<dyn RpcChannel>,
    ) -> NodeResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let state = Arc::new(NodeState::new(&config));

        let checkpoints = CheckpointStore::new(config.store_kind, &config.base_file_path);
        if let Some(checkpoint) = checkpoints.load()? {
            state.restore(&checkpoint);
        }
        let store = Arc::new(LogStore::open(
            LogStoreOptions::from(&*config),
            state.clone(),
        )?);

        let commit_notify = Arc::new(Notify::new());
        let pusher = Arc::new(Pusher::new(
            config.clone(),
            state.clone(),
            store.clone(),
            channel.clone(),
            commit_notify.clone(),
        ));
        let elector = Arc::new(LeaderElector::new(
            config.clone(),
            state.clone(),
            channel.clone(),
            checkpoints.clone(),
        ));
        let replication = Arc::new(ReplicationHandler::new(
            config.clone(),
            state.clone(),
            store.clone(),
            channel,
            pusher.clone(),
            commit_notify.clone(),
        ));

        {
            let st = state.lock();
            info!(
                "Node {} opened: role {}, term {}, write {}, commit {}, applied {}",
                st.self_id, st.role, st.term, st.write_id, st.commit_id, st.applied_id
            );
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            state,
            store,
            checkpoints,
            elector,
            replication,
            pusher,
            state_machine,
            commit_notify,
            started: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the flush, election, applier, checkpoint and push loops.
    /// Only the first call does anything.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        // give a configured leader one election timeout before anyone runs
        self.state.lock().last_heard_from_leader = Some(Instant::now());

        let mut tasks = vec![
            tokio::spawn(self.clone().flush_loop(self.shutdown.subscribe())),
            tokio::spawn(self.elector.clone().run(self.shutdown.subscribe())),
            tokio::spawn(self.clone().apply_loop(self.shutdown.subscribe())),
            tokio::spawn(self.clone().checkpoint_loop(self.shutdown.subscribe())),
        ];
        tasks.extend(self.pusher.start(self.shutdown.subscribe()));
        self.tasks.lock().extend(tasks);
        info!("Node {} started", self.config.self_id);
    }

    /// Stop every loop, then flush the logs and write a final checkpoint.
    pub async fn shutdown(&self) -> NodeResult<()> {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Node {} task ended abnormally: {}", self.config.self_id, e);
            }
        }
        self.store.flush(0)?;
        self.save_checkpoint()?;
        info!("Node {} shut down", self.config.self_id);
        Ok(())
    }

    /// Append a payload through this node. Fails with `NotLeader` on a follower.
    pub fn append(&self, payload: impl Into<Vec<u8>>) -> NodeResult<u64> {
        let response = self.replication.handle_append(AppendEntryRequest {
            group: self.config.group.clone(),
            data: payload.into(),
        });
        if response.success {
            Ok(response.entry_index)
        } else {
            Err(NodeError::NotLeader(response.leader_id))
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.config.self_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().is_leader()
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader_id.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_id
    }

    pub fn write_index(&self) -> u64 {
        self.state.lock().write_id
    }

    pub fn applied_index(&self) -> u64 {
        self.state.lock().applied_id
    }

    /// Copy of all state fields.
    pub fn status(&self) -> StateInner {
        self.state.snapshot()
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    pub fn get_entry(&self, entry_index: u64) -> Option<Entry> {
        self.store.get_by_index(entry_index)
    }

    fn save_checkpoint(&self) -> NodeResult<()> {
        // checkpoint writes are serialized by the node lock
        let st = self.state.lock();
        self.checkpoints.save(&st.checkpoint())?;
        Ok(())
    }

    async fn flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.store.flush(0) {
                Ok(bytes) if bytes > 0 => debug!("Node {} flushed {} bytes", self.config.self_id, bytes),
                Ok(_) => {}
                Err(e) => error!("Node {} flush failed: {}", self.config.self_id, e),
            }
        }
    }

    async fn checkpoint_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.checkpoint_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.save_checkpoint() {
                error!("Node {} checkpoint failed: {}", self.config.self_id, e);
            }
        }
    }

    async fn apply_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.commit_notify.notified() => {}
                // heartbeats move the commit index without a notification
                _ = sleep(self.config.heartbeat_interval()) => {}
                _ = shutdown.changed() => break,
            }
            self.apply_committed().await;
        }
    }

    /// Hand `(applied, min(commit, write)]` to the state machine in order.
    /// Returns how many entries were applied.
    pub async fn apply_committed(&self) -> usize {
        let (from, to) = {
            let st = self.state.lock();
            (st.applied_id + 1, st.commit_id.min(st.write_id))
        };
        if to < from {
            return 0;
        }

        let mut applied = 0;
        for entry in self.store.batch_get_by_index(from, to + 1) {
            if entry.entry_index != from + applied as u64 {
                warn!(
                    "Node {} expected entry {} but read {}, pausing apply",
                    self.config.self_id,
                    from + applied as u64,
                    entry.entry_index
                );
                break;
            }
            if let Err(e) = self.state_machine.apply(&entry).await {
                error!(
                    "Node {} state machine failed on entry {}: {}",
                    self.config.self_id, entry.entry_index, e
                );
                break;
            }
            let mut st = self.state.lock();
            st.applied_id = st.applied_id.max(entry.entry_index);
            applied += 1;
        }
        if applied > 0 {
            debug!(
                "Node {} applied {} entries up to {}",
                self.config.self_id,
                applied,
                from + applied as u64 - 1
            );
        }
        applied
    }
}

#[async_trait]
impl InboundHandler for Node {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Append(req) => Response::Append(self.replication.handle_append(req)),
            Request::Push(req) => Response::Push(self.replication.handle_push(req).await),
            Request::Pull(req) => Response::Pull(self.replication.handle_pull(&req)),
            Request::Heartbeat(req) => {
                if self.elector.handle_heartbeat(&req).is_agree() {
                    Response::Ack
                } else {
                    Response::Error(format!("heartbeat from {} rejected", req.leader_id))
                }
            }
            Request::PreVote(req) => Response::PreVote(self.elector.handle_pre_vote(&req)),
            Request::Vote(req) => Response::Vote(self.elector.handle_vote(&req)),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
