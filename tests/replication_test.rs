use chainlog::NodeError;
use std::time::Duration;

mod common;
use common::test_cluster::{TestCluster, TestClusterConfig};
use common::test_statemachine::KvCommand;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_leader_replicates_and_commits() {
    let cluster = TestCluster::new(TestClusterConfig::new(3));
    cluster.start();
    let all = ["node1", "node2", "node3"];

    let leader = cluster.node("node1");
    for i in 1..=10u64 {
        let index = leader.append(KvCommand::set(&format!("k{}", i), "v")).unwrap();
        assert_eq!(index, i);
    }

    assert!(cluster.wait_for_commit(&all, 10, WAIT).await);
    let expected = cluster.checksums("node1", 10);
    assert_eq!(expected.len(), 10);
    for id in all {
        assert_eq!(cluster.checksums(id, 10), expected, "log of {}", id);
    }

    // every replica applies the same commands in order
    assert!(
        cluster
            .wait_until(WAIT, |c| all.iter().all(|id| c.machine(id).last_applied() == 10))
            .await
    );
    for id in all {
        assert_eq!(cluster.machine(id).applied_indices(), (1..=10).collect::<Vec<_>>());
        assert_eq!(cluster.machine(id).get("k7").as_deref(), Some("v"));
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_rejects_client_append() {
    let cluster = TestCluster::new(TestClusterConfig::new(3));
    cluster.start();

    match cluster.node("node2").append(KvCommand::set("a", "1")) {
        Err(NodeError::NotLeader(leader)) => assert_eq!(leader.as_deref(), Some("node1")),
        other => panic!("expected NotLeader, got {:?}", other.map(|_| ())),
    }
    assert_eq!(cluster.node("node2").write_index(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_commit_needs_majority() {
    let cluster = TestCluster::new(TestClusterConfig::new(3));
    cluster.start();
    cluster.isolate("node2");
    cluster.isolate("node3");

    let leader = cluster.node("node1");
    leader.append(KvCommand::set("a", "1")).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    // written locally, acknowledged by nobody
    assert_eq!(leader.write_index(), 1);
    assert_eq!(leader.commit_index(), 0);
    assert_eq!(cluster.machine("node1").last_applied(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lagging_follower_catches_up_by_pull() {
    let cluster = TestCluster::new(TestClusterConfig::new(3));
    cluster.start();
    let leader = cluster.node("node1");

    leader.append(KvCommand::set("a", "1")).unwrap();
    assert!(cluster.wait_for_commit(&["node1", "node2", "node3"], 1, WAIT).await);

    // node3 misses entries 2..=6
    cluster.isolate("node3");
    for i in 2..=6 {
        leader.append(KvCommand::set("a", &i.to_string())).unwrap();
    }
    assert!(cluster.wait_for_commit(&["node1", "node2"], 6, WAIT).await);
    assert_eq!(cluster.node("node3").write_index(), 1);

    // node3 is resent what it missed, or pulls it when a later push finds a gap
    cluster.heal("node3");
    leader.append(KvCommand::set("a", "7")).unwrap();
    assert!(cluster.wait_for_commit(&["node1", "node2", "node3"], 7, WAIT).await);
    assert_eq!(cluster.checksums("node3", 7), cluster.checksums("node1", 7));
    assert!(
        cluster
            .wait_until(WAIT, |c| c.machine("node3").get("a").as_deref() == Some("7"))
            .await
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_isolated_follower_recovers_without_new_appends() {
    let cluster = TestCluster::new(TestClusterConfig::new(3));
    cluster.start();
    let leader = cluster.node("node1");

    cluster.isolate("node3");
    for i in 1..=200 {
        leader.append(KvCommand::set("k", &i.to_string())).unwrap();
    }
    assert!(cluster.wait_for_commit(&["node1", "node2"], 200, WAIT).await);
    assert_eq!(cluster.node("node3").write_index(), 0);

    cluster.heal("node3");
    assert!(cluster.wait_for_commit(&["node3"], 200, WAIT).await);
    assert_eq!(cluster.checksums("node3", 200), cluster.checksums("node1", 200));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replication_with_network_latency() {
    let mut config = TestClusterConfig::new(3);
    config.hub.base_latency_ms = 2;
    config.hub.jitter_max_ms = 5;
    let cluster = TestCluster::new(config);
    cluster.start();

    let leader = cluster.node("node1");
    for i in 0..20 {
        leader.append(KvCommand::set("k", &i.to_string())).unwrap();
    }
    assert!(cluster.wait_for_commit(&["node1", "node2", "node3"], 20, WAIT).await);
    assert_eq!(cluster.checksums("node2", 20), cluster.checksums("node1", 20));
    cluster.shutdown().await;
}
