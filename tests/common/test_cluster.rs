// test_cluster.rs
use crate::common::test_statemachine::TestStateMachine;
use chainlog::network::{MockNetworkConfig, MockNetworkHub};
use chainlog::{Node, NodeConfig, NodeId, PeerConfig, StoreKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{Instant, sleep};
use tracing::info;

#[derive(Clone)]
pub struct TestClusterConfig {
    pub node_ids: Vec<NodeId>,
    /// Node every member assumes leads at start-up; `None` forces an election.
    pub leader: Option<NodeId>,
    pub store_kind: StoreKind,
    pub hub: MockNetworkConfig,
}

impl TestClusterConfig {
    pub fn new(size: usize) -> Self {
        Self {
            node_ids: (1..=size).map(|i| format!("node{}", i)).collect(),
            leader: Some("node1".to_string()),
            store_kind: StoreKind::Memory,
            hub: MockNetworkConfig::default(),
        }
    }
}

pub struct TestCluster {
    pub hub: MockNetworkHub,
    config: TestClusterConfig,
    nodes: HashMap<NodeId, Arc<Node>>,
    machines: HashMap<NodeId, Arc<TestStateMachine>>,
    // 文件存储时每个节点一个子目录
    dir: TempDir,
}

impl TestCluster {
    pub fn new(config: TestClusterConfig) -> Self {
        let mut cluster = TestCluster {
            hub: MockNetworkHub::new(config.hub.clone()),
            config,
            nodes: HashMap::new(),
            machines: HashMap::new(),
            dir: TempDir::new().expect("temp dir"),
        };
        for id in cluster.config.node_ids.clone() {
            cluster.open_node(&id);
        }
        info!("TestCluster created with {} nodes", cluster.nodes.len());
        cluster
    }

    pub fn node_config(&self, id: &str) -> NodeConfig {
        NodeConfig {
            group: "test_group".to_string(),
            store_kind: self.config.store_kind,
            peers: self
                .config
                .node_ids
                .iter()
                .filter(|peer| peer.as_str() != id)
                .map(|peer| PeerConfig {
                    id: peer.clone(),
                    addr: String::new(),
                    api_port: 0,
                })
                .collect(),
            self_id: id.to_string(),
            leader_id: self.config.leader.clone(),
            base_file_path: self.dir.path().join(id),
            store_file_size: 64 * 1024,
            index_count_per_file: 256,
            flush_interval_ms: 100,
            min_election_timeout_ms: 300,
            max_election_timeout_ms: 600,
            heartbeat_interval_ms: 100,
            save_checkpoint_interval_ms: 200,
            rpc_timeout_ms: 200,
            pull_timeout_ms: 300,
            ..Default::default()
        }
    }

    fn open_node(&mut self, id: &str) {
        let machine = Arc::new(TestStateMachine::new());
        let node = Node::new(
            self.node_config(id),
            machine.clone(),
            Arc::new(self.hub.clone()),
        )
        .unwrap_or_else(|e| panic!("Failed to create node {}: {}", id, e));
        self.hub.register_node(id.to_string(), node.clone());
        self.nodes.insert(id.to_string(), node);
        self.machines.insert(id.to_string(), machine);
    }

    pub fn start(&self) {
        info!("Starting TestCluster...");
        for node in self.nodes.values() {
            node.start();
        }
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.config.node_ids
    }

    pub fn node(&self, id: &str) -> &Arc<Node> {
        self.nodes
            .get(id)
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    pub fn machine(&self, id: &str) -> &Arc<TestStateMachine> {
        self.machines
            .get(id)
            .unwrap_or_else(|| panic!("no state machine for {}", id))
    }

    pub fn isolate(&self, id: &str) {
        info!("Isolating node {}", id);
        self.hub.isolate(&id.to_string());
    }

    pub fn heal(&self, id: &str) {
        info!("Restoring node {}", id);
        self.hub.heal(&id.to_string());
    }

    /// Poll `check` every 20ms until it holds or `limit` passes.
    pub async fn wait_until<F>(&self, limit: Duration, mut check: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            if check(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until exactly one of `among` leads and the others follow it.
    pub async fn wait_for_leader(&self, among: &[&str], limit: Duration) -> Option<NodeId> {
        let mut found = None;
        self.wait_until(limit, |cluster| {
            let leaders: Vec<&str> = among
                .iter()
                .copied()
                .filter(|id| cluster.node(id).is_leader())
                .collect();
            let [leader] = leaders.as_slice() else {
                return false;
            };
            let agreed = among
                .iter()
                .all(|id| cluster.node(id).leader_id().as_deref() == Some(*leader));
            if agreed {
                found = Some(leader.to_string());
            }
            agreed
        })
        .await;
        found
    }

    /// Wait until every node in `among` has written and committed `index`.
    pub async fn wait_for_commit(&self, among: &[&str], index: u64, limit: Duration) -> bool {
        self.wait_until(limit, |cluster| {
            among.iter().all(|id| {
                let node = cluster.node(id);
                node.write_index() >= index && node.commit_index() >= index
            })
        })
        .await
    }

    /// Checksums of entries `1..=upto` on `id`.
    pub fn checksums(&self, id: &str, upto: u64) -> Vec<u32> {
        self.node(id)
            .store()
            .batch_get_by_index(1, upto + 1)
            .iter()
            .map(|entry| entry.checksum)
            .collect()
    }

    pub async fn shutdown(&self) {
        for (id, node) in &self.nodes {
            if let Err(e) = node.shutdown().await {
                panic!("Failed to shut down {}: {}", id, e);
            }
        }
    }

    /// Shut every node down and reopen it from its data directory.
    pub async fn restart(&mut self) {
        self.shutdown().await;
        for id in self.config.node_ids.clone() {
            self.hub.unregister_node(&id);
            self.nodes.remove(&id);
            self.machines.remove(&id);
        }
        for id in self.config.node_ids.clone() {
            self.open_node(&id);
        }
        info!("TestCluster reopened");
    }
}
