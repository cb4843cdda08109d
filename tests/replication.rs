mod common;

use std::sync::Arc;
use std::time::Duration;

use quorum_raft::testing::eventually;
use quorum_raft::testing::AlterFn;
use quorum_raft::testing::LocalNetwork;
use quorum_raft::testing::LocalRaftGroup;
use quorum_raft::testing::SimpleStateMachine;
use quorum_raft::AppendEntriesRequest;
use quorum_raft::InMemoryLogStore;
use quorum_raft::LogEntry;
use quorum_raft::MembershipChangeMode;
use quorum_raft::MessageKind;
use quorum_raft::Operation;
use quorum_raft::QueryPolicy;
use quorum_raft::RaftEndpoint;
use quorum_raft::RaftError;
use quorum_raft::RaftMessage;
use quorum_raft::RaftNode;
use quorum_raft::RaftNodeRole;

#[tokio::test]
async fn replicated_commands_apply_in_order_on_every_node() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    for i in 0..10u8 {
        let result = leader.replicate(vec![i]).await.unwrap();
        assert_eq!(result.value, vec![i]);
        assert_eq!(result.commit_index, u64::from(i) + 1);
    }
    // No hidden entries: ten replicates commit exactly ten indices.
    assert_eq!(leader.report().commit_index, 10);

    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
    for node in group.nodes() {
        let machine = group.state_machine(node.endpoint());
        eventually(Duration::from_secs(5), || machine.applied_count() == 10).await;
        assert_eq!(machine.applied(), expected);
    }
    group.destroy();
}

#[tokio::test]
async fn linearizable_query_reflects_committed_writes() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    leader.replicate(vec![7]).await.unwrap();

    let read = leader
        .query(Vec::new(), QueryPolicy::Linearizable)
        .await
        .unwrap();
    assert_eq!(read.value, vec![7]);
    assert_eq!(read.commit_index, 1);
    group.destroy();
}

#[tokio::test]
async fn disconnected_follower_catches_up_from_the_log() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    let lagging = group.followers(leader.endpoint()).remove(0);
    group.network().split(&[lagging.endpoint().clone()]);

    for i in 0..20u8 {
        leader.replicate(vec![i]).await.unwrap();
    }
    group.network().merge();

    let machine = group.state_machine(lagging.endpoint());
    eventually(Duration::from_secs(5), || machine.applied_count() == 20).await;
    eventually(Duration::from_secs(5), || {
        lagging.report().commit_index == 20
    })
    .await;
    // Repaired from the log, not a snapshot.
    assert_eq!(lagging.report().snapshot_index, 0);
    group.destroy();
}

#[tokio::test]
async fn in_flight_replicates_become_indeterminate_when_leader_is_deposed() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    leader.replicate(vec![0]).await.unwrap();

    group.network().split(&[leader.endpoint().clone()]);
    let mut in_flight = Vec::new();
    for i in 1..=5u8 {
        let handle = leader.clone();
        in_flight.push(tokio::spawn(async move { handle.replicate(vec![i]).await }));
    }
    eventually(Duration::from_secs(5), || {
        leader.report().last_log_index == 6
    })
    .await;

    // The healthy majority moves on without the isolated leader.
    eventually(Duration::from_secs(10), || {
        group
            .nodes()
            .iter()
            .any(|node| {
                node.endpoint() != leader.endpoint()
                    && node.report().role == RaftNodeRole::Leader
            })
    })
    .await;
    group.network().merge();

    for handle in in_flight {
        let outcome = handle.await.unwrap();
        assert!(
            matches!(outcome, Err(RaftError::IndeterminateState)),
            "expected indeterminate outcome, got {outcome:?}"
        );
    }

    // The deposed leader rejoins as a follower and the group still works.
    eventually(Duration::from_secs(5), || {
        leader.report().role == RaftNodeRole::Follower
    })
    .await;
    let new_leader = group.wait_until_leader_elected().await;
    new_leader.replicate(vec![9]).await.unwrap();

    let machine = group.state_machine(leader.endpoint());
    eventually(Duration::from_secs(5), || {
        machine.applied() == vec![vec![0], vec![9]]
    })
    .await;
    group.destroy();
}

#[tokio::test]
async fn uncommitted_cap_rejects_commands_but_reserves_a_membership_slot() {
    common::init_tracing();
    let mut config = LocalRaftGroup::test_config();
    config.max_uncommitted_log_entry_count = 10;
    let group = LocalRaftGroup::with_config(3, config);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    group.network().split(&[leader.endpoint().clone()]);

    // Nine uncommitted commands fill everything but the reserved slot.
    let mut pending = Vec::new();
    for i in 0..9u8 {
        let handle = leader.clone();
        pending.push(tokio::spawn(async move { handle.replicate(vec![i]).await }));
    }
    eventually(Duration::from_secs(5), || {
        leader.report().last_log_index == 9
    })
    .await;

    let rejected = leader.replicate(vec![99]).await.unwrap_err();
    assert!(
        matches!(rejected, RaftError::CannotReplicate { .. }),
        "expected CannotReplicate, got {rejected:?}"
    );

    // The reserved slot still admits a membership change.
    let change_leader = leader.clone();
    let change = tokio::spawn(async move {
        change_leader
            .change_membership(RaftEndpoint::new("n9"), MembershipChangeMode::Add, 0)
            .await
    });
    eventually(Duration::from_secs(5), || {
        leader.report().last_log_index == 10
    })
    .await;

    // A second change is turned away while the first one is pending.
    let second = leader
        .change_membership(RaftEndpoint::new("n8"), MembershipChangeMode::Add, 0)
        .await
        .unwrap_err();
    assert!(matches!(second, RaftError::CannotReplicate { .. }));

    drop(change);
    drop(pending);
    group.destroy();
}

#[tokio::test]
async fn heartbeat_commit_is_capped_at_the_matched_prefix() {
    common::init_tracing();
    let follower = RaftEndpoint::new("n1");
    let members = vec![
        follower.clone(),
        RaftEndpoint::new("n2"),
        RaftEndpoint::new("n3"),
    ];
    let machine = SimpleStateMachine::new();
    let network = LocalNetwork::new();
    let node = RaftNode::builder()
        .endpoint(follower.clone())
        .initial_members(members)
        .log_store(InMemoryLogStore::new())
        .state_machine(machine.clone())
        .transport(network.transport_for(follower))
        .build()
        .unwrap();
    node.start().unwrap();

    let entry = |index: u64, term: u64, payload: &[u8]| LogEntry {
        index,
        term,
        operation: Operation::Command(payload.to_vec()),
    };
    let append = |sender: &str,
                  term: u64,
                  prev_log_term: u64,
                  prev_log_index: u64,
                  commit_index: u64,
                  entries: Vec<LogEntry>| {
        RaftMessage::AppendEntriesRequest(AppendEntriesRequest {
            group_id: "default".into(),
            sender: RaftEndpoint::new(sender),
            term,
            prev_log_term,
            prev_log_index,
            commit_index,
            entries,
            query_seq_no: 0,
            flow_control_seq_no: 0,
        })
    };

    // An uncommitted suffix left behind by the first leader.
    node.handle_message(append(
        "n2",
        1,
        0,
        0,
        0,
        vec![entry(1, 1, b"a"), entry(2, 1, b"doomed")],
    ));
    eventually(Duration::from_secs(5), || {
        node.report().last_log_index == 2
    })
    .await;

    // The next leader's heartbeat only verifies index 1; its commit index
    // must not drag the unverified suffix in.
    node.handle_message(append("n3", 2, 1, 1, 2, Vec::new()));
    eventually(Duration::from_secs(5), || node.report().commit_index == 1).await;
    assert_eq!(machine.applied(), vec![b"a".to_vec()]);

    // The entry actually committed at index 2 replaces the suffix.
    node.handle_message(append("n3", 2, 1, 1, 2, vec![entry(2, 2, b"b")]));
    eventually(Duration::from_secs(5), || node.report().commit_index == 2).await;
    assert_eq!(machine.applied(), vec![b"a".to_vec(), b"b".to_vec()]);
    node.terminate();
}

#[tokio::test]
async fn conflicting_equal_length_log_is_repaired_after_leadership_changes() {
    common::init_tracing();
    let group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    leader.replicate(vec![0]).await.unwrap();

    // The isolated leader appends an entry that will never commit.
    group.network().split(&[leader.endpoint().clone()]);
    let doomed_leader = leader.clone();
    let doomed = tokio::spawn(async move { doomed_leader.replicate(vec![1]).await });
    eventually(Duration::from_secs(5), || {
        leader.report().last_log_index == 2
    })
    .await;

    // The healthy pair commits a different entry at the same index, then
    // hands leadership over so the new leader starts past the conflict.
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
    let successor = group
        .nodes()
        .iter()
        .find(|node| {
            node.endpoint() != leader.endpoint() && node.endpoint() != interim.endpoint()
        })
        .cloned()
        .unwrap();
    interim
        .transfer_leadership(successor.endpoint().clone())
        .await
        .unwrap();
    eventually(Duration::from_secs(10), || {
        successor.report().role == RaftNodeRole::Leader
    })
    .await;

    group.network().merge();

    // The rejoining node's log is as long as the leader's but conflicts at
    // its tip; the leader must back off below it and overwrite the entry.
    let machine = group.state_machine(leader.endpoint());
    eventually(Duration::from_secs(10), || {
        machine.applied() == vec![vec![0], vec![7]]
    })
    .await;
    let outcome = doomed.await.unwrap();
    assert!(
        matches!(outcome, Err(RaftError::IndeterminateState)),
        "expected indeterminate outcome, got {outcome:?}"
    );
    group.destroy();
}

#[tokio::test]
async fn linearizable_read_waits_for_a_commit_of_the_leaders_own_term() {
    common::init_tracing();
    let mut group = LocalRaftGroup::new(3);
    group.start();

    let leader = group.wait_until_leader_elected().await;
    // Withhold the commit index so the followers replicate the write
    // without learning that it committed.
    let withhold: AlterFn = Arc::new(|message| {
        let RaftMessage::AppendEntriesRequest(request) = message else {
            return None;
        };
        let mut altered = request.clone();
        altered.commit_index = 0;
        Some(RaftMessage::AppendEntriesRequest(altered))
    });
    for follower in group.followers(leader.endpoint()) {
        group.network().alter_messages(
            leader.endpoint(),
            follower.endpoint(),
            MessageKind::AppendEntriesRequest,
            withhold.clone(),
        );
    }
    leader.replicate(vec![5]).await.unwrap();

    let deposed = leader.endpoint().clone();
    group.terminate_node(&deposed);
    let new_leader = group.wait_until_leader_elected().await;
    assert_eq!(new_leader.report().commit_index, 0);

    // The acknowledged write must not be invisible to a read served
    // before the new leader commits anything of its own term.
    let reader = new_leader.clone();
    let read = tokio::spawn(async move { reader.query(Vec::new(), QueryPolicy::Linearizable).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!read.is_finished());

    new_leader.replicate(vec![6]).await.unwrap();
    let result = read.await.unwrap().unwrap();
    assert_eq!(result.value, vec![6]);
    assert_eq!(result.commit_index, 2);

    let machine = group.state_machine(new_leader.endpoint());
    assert_eq!(machine.applied(), vec![vec![5], vec![6]]);
    group.destroy();
}
