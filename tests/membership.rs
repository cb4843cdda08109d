mod common;

use std::sync::Arc;
use std::time::Duration;

use quorum_raft::testing::eventually;
use quorum_raft::testing::AlterFn;
use quorum_raft::testing::LocalRaftGroup;
use quorum_raft::MembershipChangeMode;
use quorum_raft::MessageKind;
use quorum_raft::RaftEndpoint;
use quorum_raft::RaftError;
use quorum_raft::RaftMessage;
use quorum_raft::RaftNodeRole;
use quorum_raft::RaftNodeStatus;

#[tokio::test]
async fn added_member_joins_and_receives_the_replicated_log() {
    common::init_tracing();
    let mut group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    for i in 0..5u8 {
        leader.replicate(vec![i]).await.unwrap();
    }

    let newcomer = group.create_new_node();
    let members = leader
        .change_membership(
            newcomer.endpoint().clone(),
            MembershipChangeMode::Add,
            0,
        )
        .await
        .unwrap();
    assert_eq!(members.value.member_count(), 4);
    assert!(members.value.contains(newcomer.endpoint()));

    let machine = group.state_machine(newcomer.endpoint());
    let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i]).collect();
    eventually(Duration::from_secs(5), || machine.applied() == expected).await;
    eventually(Duration::from_secs(5), || {
        newcomer.report().committed_members.contains(newcomer.endpoint())
    })
    .await;
    group.destroy();
}

#[tokio::test]
async fn removed_member_terminates_once_the_removal_commits() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    leader.replicate(b"before".to_vec()).await.unwrap();

    let removed = group.followers(leader.endpoint()).remove(0);
    let members = leader
        .change_membership(
            removed.endpoint().clone(),
            MembershipChangeMode::Remove,
            0,
        )
        .await
        .unwrap();
    assert_eq!(members.value.member_count(), 2);
    assert!(!members.value.contains(removed.endpoint()));

    // The leader sends one final append so the removed member learns its
    // removal committed and shuts itself down.
    eventually(Duration::from_secs(5), || {
        removed.report().status == RaftNodeStatus::Terminated
    })
    .await;

    // The shrunk group keeps committing with a two-member quorum.
    let ordered = leader.replicate(b"after".to_vec()).await.unwrap();
    assert_eq!(ordered.value, b"after".to_vec());
    group.destroy();
}

#[tokio::test]
async fn stale_expected_members_commit_index_is_rejected() {
    common::init_tracing();
    let mut group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    let newcomer = group.create_new_node();
    let rejection = leader
        .change_membership(
            newcomer.endpoint().clone(),
            MembershipChangeMode::Add,
            999,
        )
        .await
        .unwrap_err();
    match rejection {
        RaftError::MismatchingGroupMembersCommitIndex { expected, actual } => {
            assert_eq!(expected, 999);
            assert_eq!(actual, 0);
        }
        other => panic!("unexpected rejection: {other}"),
    }
    group.destroy();
}

#[tokio::test]
async fn membership_change_completes_only_after_the_entry_replicates() {
    common::init_tracing();
    let mut group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    for i in 0..3u8 {
        leader.replicate(vec![i]).await.unwrap();
    }

    // Strip membership entries out of every append the leader sends, so
    // the change entry sits in the leader's log but never replicates.
    let strip_membership_entries: AlterFn = Arc::new(|message| {
        let RaftMessage::AppendEntriesRequest(request) = message else {
            return None;
        };
        let position = request
            .entries
            .iter()
            .position(|entry| entry.operation.is_membership_change())?;
        let mut altered = request.clone();
        altered.entries.truncate(position);
        Some(RaftMessage::AppendEntriesRequest(altered))
    });
    for follower in group.followers(leader.endpoint()) {
        group.network().alter_messages(
            leader.endpoint(),
            follower.endpoint(),
            MessageKind::AppendEntriesRequest,
            strip_membership_entries.clone(),
        );
    }

    let newcomer = group.create_new_node();
    let change = tokio::spawn({
        let leader = leader.clone();
        let target = newcomer.endpoint().clone();
        async move {
            leader
                .change_membership(target, MembershipChangeMode::Add, 0)
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = leader.report();
    assert_eq!(report.commit_index, 3);
    assert_eq!(report.last_log_index, 4);
    assert_eq!(report.status, RaftNodeStatus::UpdatingMembers);

    // Only one change may be in flight at a time.
    let second = leader
        .change_membership(
            RaftEndpoint::new("n99"),
            MembershipChangeMode::Add,
            0,
        )
        .await
        .unwrap_err();
    assert!(matches!(second, RaftError::CannotReplicate { .. }));

    group.network().reset_all_rules();
    let members = change.await.unwrap().unwrap();
    assert_eq!(members.commit_index, 4);
    assert_eq!(members.value.member_count(), 4);
    eventually(Duration::from_secs(5), || {
        let report = leader.report();
        report.status == RaftNodeStatus::Active
            && report.committed_members.contains(newcomer.endpoint())
    })
    .await;
    group.destroy();
}

#[tokio::test]
async fn overwritten_membership_change_clears_the_updating_status() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    leader.replicate(vec![0]).await.unwrap();

    // The isolated leader appends a membership change that will never
    // commit.
    group.network().split(&[leader.endpoint().clone()]);
    let change = tokio::spawn({
        let leader = leader.clone();
        async move {
            leader
                .change_membership(RaftEndpoint::new("n9"), MembershipChangeMode::Add, 0)
                .await
        }
    });
    eventually(Duration::from_secs(5), || {
        leader.report().status == RaftNodeStatus::UpdatingMembers
    })
    .await;

    // The healthy pair commits a different entry at the change's index.
    eventually(Duration::from_secs(10), || {
        group.nodes().iter().any(|node| {
            node.endpoint() != leader.endpoint() && node.report().role == RaftNodeRole::Leader
        })
    })
    .await;
    let interim = group
        .nodes()
        .iter()
        .find(|node| {
            node.endpoint() != leader.endpoint() && node.report().role == RaftNodeRole::Leader
        })
        .cloned()
        .unwrap();
    interim.replicate(vec![7]).await.unwrap();
    group.network().merge();

    // Overwriting the pending change entry reverts the node to the
    // committed membership and out of the updating state.
    eventually(Duration::from_secs(10), || {
        let report = leader.report();
        report.status == RaftNodeStatus::Active
            && report.effective_members.member_count() == 3
            && report.commit_index == 2
    })
    .await;
    let outcome = change.await.unwrap();
    assert!(
        matches!(outcome, Err(RaftError::IndeterminateState)),
        "expected indeterminate outcome, got {outcome:?}"
    );

    // Once re-elected, the node accepts membership changes again.
    interim
        .transfer_leadership(leader.endpoint().clone())
        .await
        .unwrap();
    eventually(Duration::from_secs(10), || {
        leader.report().role == RaftNodeRole::Leader
    })
    .await;
    let members = leader
        .change_membership(RaftEndpoint::new("n8"), MembershipChangeMode::Add, 0)
        .await
        .unwrap();
    assert_eq!(members.value.member_count(), 4);
    group.destroy();
}

#[tokio::test]
async fn terminate_group_halts_every_member() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    leader.replicate(b"payload".to_vec()).await.unwrap();
    leader.terminate_group().await.unwrap();

    for node in group.nodes() {
        let node = node.clone();
        eventually(Duration::from_secs(5), || {
            node.report().status == RaftNodeStatus::Terminated
        })
        .await;
    }

    let rejection = leader.replicate(b"late".to_vec()).await.unwrap_err();
    assert!(matches!(rejection, RaftError::Terminated));
    group.destroy();
}
