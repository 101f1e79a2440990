//! Leader failover tests.
//!
//! These tests verify that the cluster elects a new leader when the current
//! one stops, that committed entries survive, and that terms only move forward.


use std::collections::HashMap;
use std::time::Duration;
use test_harness::TestCluster;

/// Test 1: A new leader is elected after the leader stops
#[tokio::test]
async fn test_new_leader_after_leader_stops() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    assert!(cluster.shutdown_node(leader).await);

    let new_leader = cluster
        .wait_for_new_leader(leader, Duration::from_secs(5))
        .await
        .expect("Remaining nodes should elect a new leader");
    assert_ne!(new_leader, leader);

    cluster.shutdown();
}

/// Test 2: Committed entries survive a leader failure
#[tokio::test]
async fn test_committed_entries_survive_failover() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    for i in 0..3 {
        cluster
            .submit(format!("before-{}", i).as_bytes())
            .await
            .expect("commit should succeed");
    }
    assert!(
        cluster
            .wait_for_applied_on_all(3, Duration::from_secs(5))
            .await
    );

    cluster.shutdown_node(leader).await;
    let new_leader = cluster
        .wait_for_new_leader(leader, Duration::from_secs(5))
        .await
        .expect("Remaining nodes should elect a new leader");

    for i in 0..2 {
        cluster
            .submit_to(new_leader, format!("after-{}", i).as_bytes())
            .await
            .expect("commit on the new leader should succeed");
    }

    let remaining = cluster.active_node_ids();
    assert!(
        cluster
            .wait_for_applied_on_nodes(&remaining, 5, Duration::from_secs(5))
            .await,
        "Remaining nodes should apply all 5 entries"
    );
    assert!(cluster.verify_applied_consistency(&remaining));

    let payloads = cluster.applied_payloads(new_leader);
    assert_eq!(payloads[0], b"before-0");
    assert_eq!(payloads[2], b"before-2");
    assert_eq!(payloads[4], b"after-1");

    cluster.shutdown();
}

/// Test 3: The term increases across a failover
#[tokio::test]
async fn test_term_increases_after_failover() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let old_term = cluster.status(leader).await.unwrap().term;

    cluster.shutdown_node(leader).await;
    let new_leader = cluster
        .wait_for_new_leader(leader, Duration::from_secs(5))
        .await
        .expect("Remaining nodes should elect a new leader");

    let new_term = cluster.status(new_leader).await.unwrap().term;
    assert!(
        new_term > old_term,
        "New leader term {} should exceed {}",
        new_term,
        old_term
    );

    cluster.shutdown();
}

/// Test 4: At most one leader exists per term
#[tokio::test]
async fn test_single_leader_per_term() {
    let mut cluster = TestCluster::new(5).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    let check = |statuses: Vec<consensus_lite::NodeStatus>| {
        let mut leaders_per_term: HashMap<u64, usize> = HashMap::new();
        for s in statuses
            .into_iter()
            .filter(|s| s.role == consensus_lite::RaftRole::Leader)
        {
            *leaders_per_term.entry(s.term).or_default() += 1;
        }
        assert!(leaders_per_term.values().all(|&n| n == 1));
    };

    for _ in 0..10 {
        check(cluster.cluster.statuses().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cluster.shutdown_node(leader).await;
    for _ in 0..25 {
        check(cluster.cluster.statuses().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cluster.shutdown();
}

/// Test 5: Repeated failovers keep a majority cluster available
#[tokio::test]
async fn test_cascading_failover() {
    let mut cluster = TestCluster::new(5).await;

    for round in 0..2 {
        let leader = cluster
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("Leader should be elected");
        cluster
            .submit_to(leader, format!("round-{}", round).as_bytes())
            .await
            .expect("commit should succeed");
        cluster.shutdown_node(leader).await;
        cluster
            .wait_for_new_leader(leader, Duration::from_secs(5))
            .await
            .expect("A new leader should be elected");
    }

    cluster
        .submit(b"final")
        .await
        .expect("Three of five nodes should still commit");

    let remaining = cluster.active_node_ids();
    assert_eq!(remaining.len(), 3);
    assert!(
        cluster
            .wait_for_applied_on_nodes(&remaining, 3, Duration::from_secs(5))
            .await
    );
    assert!(cluster.verify_applied_consistency(&remaining));

    cluster.shutdown();
}
