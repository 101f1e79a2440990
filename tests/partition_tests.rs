//! Network partition tests.
//!
//! These tests verify correct behavior when the network is partitioned:
//! majority elects leader, minority cannot, logs converge after healing.


use std::time::Duration;
use consensus_lite::RaftRole;
use test_harness::TestCluster;

/// Split `1..=size` so the leader is always on the majority side.
fn split_around(leader: u64, size: u64, majority_len: usize) -> (Vec<u64>, Vec<u64>) {
    let mut majority = vec![leader];
    let mut minority = Vec::new();
    for id in (1..=size).filter(|&id| id != leader) {
        if majority.len() < majority_len {
            majority.push(id);
        } else {
            minority.push(id);
        }
    }
    (majority, minority)
}

/// Test 1: Majority partition elects a leader
#[tokio::test]
async fn test_majority_partition_elects_leader() {
    let cluster = TestCluster::new(5).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    // Put the current leader in the minority so the majority must elect anew.
    let (minority, majority) = split_around(leader, 5, 2);
    cluster.create_partition(&majority, &minority);

    let new_leader = cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(5))
        .await
        .expect("Majority partition should elect a leader");
    assert!(majority.contains(&new_leader));

    cluster.shutdown();
}

/// Test 2: Minority partition cannot elect a leader
#[tokio::test]
async fn test_minority_partition_cannot_elect_leader() {
    let cluster = TestCluster::new(5).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    let (majority, minority) = split_around(leader, 5, 3);
    cluster.create_partition(&majority, &minority);

    // Let the minority run through several election timeouts.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let minority_leader = cluster
        .wait_for_leader_in_group(&minority, Duration::from_millis(300))
        .await;
    assert!(
        minority_leader.is_none(),
        "Minority partition should not be able to elect a leader"
    );

    cluster.shutdown();
}

/// Test 3: An isolated leader cannot commit
#[tokio::test]
async fn test_isolated_leader_cannot_commit() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    cluster.isolate_node(leader);

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        cluster.submit_to(leader, b"lost"),
    )
    .await;
    assert!(
        !matches!(result, Ok(Ok(_))),
        "Commit on an isolated leader should not succeed"
    );
    assert!(cluster.applied(leader).is_empty());

    cluster.shutdown();
}

/// Test 4: Leader isolated triggers new election in remaining nodes
#[tokio::test]
async fn test_leader_isolated_new_election() {
    let cluster = TestCluster::new(5).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    cluster.isolate_node(leader);

    let remaining: Vec<u64> = (1..=5).filter(|&id| id != leader).collect();
    let new_leader = cluster
        .wait_for_leader_in_group(&remaining, Duration::from_secs(5))
        .await
        .expect("Remaining nodes should elect a new leader");
    assert_ne!(new_leader, leader);

    cluster.shutdown();
}

/// Test 5: An isolated leader steps down once healed and catches up
#[tokio::test]
async fn test_isolated_leader_steps_down_after_heal() {
    let cluster = TestCluster::new(3).await;
    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    cluster.submit(b"first").await.expect("commit should succeed");
    cluster.isolate_node(old_leader);

    let remaining: Vec<u64> = (1..=3).filter(|&id| id != old_leader).collect();
    let new_leader = cluster
        .wait_for_leader_in_group(&remaining, Duration::from_secs(5))
        .await
        .expect("Remaining nodes should elect a new leader");
    cluster
        .submit_to(new_leader, b"second")
        .await
        .expect("Majority should commit");

    cluster.heal_node(old_leader);

    test_harness::assert_eventually(
        || async {
            matches!(
                cluster.status(old_leader).await,
                Some(s) if s.role == RaftRole::Follower && s.leader == Some(new_leader)
            )
        },
        Duration::from_secs(5),
        "Old leader should follow the new leader after healing",
    )
    .await;

    assert!(
        cluster
            .wait_for_applied_on_all(2, Duration::from_secs(5))
            .await,
        "Old leader should catch up after healing"
    );
    assert!(cluster.verify_applied_consistency(&[1, 2, 3]));

    cluster.shutdown();
}

/// Test 6: Logs converge after partition healing
#[tokio::test]
async fn test_partition_healing_logs_converge() {
    let cluster = TestCluster::new(5).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    let (majority, minority) = split_around(leader, 5, 3);
    cluster.create_partition(&majority, &minority);

    for i in 0..5 {
        cluster
            .submit_to(leader, format!("partitioned-{}", i).as_bytes())
            .await
            .expect("Majority side should keep committing");
    }
    assert!(
        cluster
            .wait_for_applied_on_nodes(&majority, 5, Duration::from_secs(5))
            .await
    );
    assert!(minority.iter().all(|&id| cluster.applied(id).is_empty()));

    cluster.heal_partition(&majority, &minority);

    assert!(
        cluster
            .wait_for_applied_on_all(5, Duration::from_secs(5))
            .await,
        "Minority should catch up after healing"
    );
    assert!(cluster.verify_applied_consistency(&[1, 2, 3, 4, 5]));

    test_harness::assert_eventually(
        || async { cluster.count_leaders().await == 1 },
        Duration::from_secs(5),
        "Cluster should settle on a single leader",
    )
    .await;

    cluster.shutdown();
}
