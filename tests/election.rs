mod common;

use std::time::Duration;

use quorum_raft::testing::eventually;
use quorum_raft::testing::LocalRaftGroup;
use quorum_raft::QueryPolicy;
use quorum_raft::RaftError;
use quorum_raft::RaftNodeRole;

#[tokio::test]
async fn three_node_group_elects_a_single_leader() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    let leader_endpoint = leader.endpoint().clone();

    eventually(Duration::from_secs(5), || {
        group
            .nodes()
            .iter()
            .all(|node| node.report().term.leader.as_ref() == Some(&leader_endpoint))
    })
    .await;

    let leaders = group
        .nodes()
        .iter()
        .filter(|node| node.report().role == RaftNodeRole::Leader)
        .count();
    assert_eq!(leaders, 1);
    group.destroy();
}

#[tokio::test]
async fn single_node_group_leads_and_commits_alone() {
    common::init_tracing();
    let group = LocalRaftGroup::new(1);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    let result = leader.replicate(b"solo".to_vec()).await.unwrap();
    assert_eq!(result.value, b"solo".to_vec());
    assert_eq!(result.commit_index, 1);

    let read = leader
        .query(Vec::new(), QueryPolicy::Linearizable)
        .await
        .unwrap();
    assert_eq!(read.value, b"solo".to_vec());
    group.destroy();
}

#[tokio::test]
async fn new_leader_emerges_after_leader_crash() {
    common::init_tracing();
    let mut group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    for i in 0..3u8 {
        leader.replicate(vec![i]).await.unwrap();
    }
    let old_leader = leader.endpoint().clone();
    group.terminate_node(&old_leader);

    let new_leader = group.wait_until_leader_elected().await;
    assert_ne!(new_leader.endpoint(), &old_leader);

    // The committed prefix survives the failover.
    assert!(new_leader.report().last_log_index >= 3);
    let result = new_leader.replicate(vec![9]).await.unwrap();
    assert_eq!(result.value, vec![9]);

    let machine = group.state_machine(new_leader.endpoint());
    eventually(Duration::from_secs(5), || machine.applied_count() == 4).await;
    assert_eq!(machine.applied(), vec![vec![0], vec![1], vec![2], vec![9]]);
    group.destroy();
}

#[tokio::test]
async fn leadership_transfers_to_chosen_follower() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    leader.replicate(b"before".to_vec()).await.unwrap();

    let target = group.followers(leader.endpoint()).remove(0);
    leader
        .transfer_leadership(target.endpoint().clone())
        .await
        .unwrap();

    eventually(Duration::from_secs(5), || {
        target.report().role == RaftNodeRole::Leader
    })
    .await;
    eventually(Duration::from_secs(5), || {
        leader.report().role == RaftNodeRole::Follower
    })
    .await;

    let result = target.replicate(b"after".to_vec()).await.unwrap();
    assert_eq!(result.value, b"after".to_vec());
    group.destroy();
}

#[tokio::test]
async fn follower_rejects_client_operations_with_leader_hint() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    leader.replicate(vec![1]).await.unwrap();

    let follower = group.followers(leader.endpoint()).remove(0);
    eventually(Duration::from_secs(5), || {
        follower.report().term.leader.is_some()
    })
    .await;

    let rejection = follower.replicate(vec![2]).await.unwrap_err();
    match &rejection {
        RaftError::NotLeader { leader: hint } => {
            assert_eq!(hint.as_ref(), Some(leader.endpoint()));
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }
    assert!(rejection.is_retryable());

    let local = follower.query(Vec::new(), QueryPolicy::LeaderLocal).await;
    assert!(matches!(local, Err(RaftError::NotLeader { .. })));

    // Eventual reads are served from any node's local state.
    let eventual = follower
        .query(Vec::new(), QueryPolicy::Eventual)
        .await
        .unwrap();
    assert!(eventual.value.is_empty() || eventual.value == vec![1]);
    group.destroy();
}
