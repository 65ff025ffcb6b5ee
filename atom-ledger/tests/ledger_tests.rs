//! Ledger integration tests against an in-process node

mod common;

use atom_ledger::network::{ConnectionState, NodeEvent, SubmissionEvent, SubmissionFailure};
use atom_ledger::particle::SpunParticle;
use atom_ledger::{Address, AtomStatus, AtomStore, Config, Ledger};
use common::{atom_of, settle, tokens, MockNode, MockProvider};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

async fn create_test_ledger(node: &Arc<MockNode>) -> Ledger {
    let store = AtomStore::in_memory().unwrap();
    let provider = Arc::new(MockProvider { node: node.clone() });
    Ledger::new(store, provider, Duration::from_secs(60))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_history_replayed_before_live_updates() {
    let node = MockNode::new();
    let ledger = create_test_ledger(&node).await;
    let alice = Address::new("alice");

    let mut history = Vec::new();
    for i in 0..3 {
        let atom = atom_of(vec![SpunParticle::up(tokens("alice", 10, i))], i as i64);
        ledger.store().insert(atom.clone(), AtomStatus::Stored).await.unwrap();
        history.push(atom.aid());
    }

    let mut observations = ledger.get_atom_observations(&alice).await.unwrap();
    settle().await;

    let live = atom_of(vec![SpunParticle::up(tokens("alice", 5, 9))], 9);
    assert!(node.push_atom(&alice, &live, AtomStatus::Stored));

    for aid in &history {
        assert_eq!(observations.next().await.unwrap().aid(), *aid);
    }
    let next = observations.next().await.unwrap();
    assert_eq!(next.aid(), live.aid());
    assert_eq!(next.status, AtomStatus::Stored);
}

#[tokio::test]
async fn test_one_network_subscription_per_address() {
    let node = MockNode::new();
    let ledger = create_test_ledger(&node).await;
    let alice = Address::new("alice");

    let _first = ledger.get_atom_observations(&alice).await.unwrap();
    let _second = ledger.get_atom_observations(&alice).await.unwrap();
    settle().await;
    assert_eq!(node.subscribe_calls(), 1);
    assert_eq!(ledger.metrics().network_subscriptions.get(), 1);

    let _bob = ledger.get_atom_observations(&Address::new("bob")).await.unwrap();
    settle().await;
    assert_eq!(node.subscribe_calls(), 2);
}

#[tokio::test]
async fn test_node_updates_written_to_store() {
    let node = MockNode::new();
    let ledger = create_test_ledger(&node).await;
    let alice = Address::new("alice");
    let _observations = ledger.get_atom_observations(&alice).await.unwrap();
    settle().await;

    let atom = atom_of(vec![SpunParticle::up(tokens("alice", 10, 1))], 1);
    node.push_atom(&alice, &atom, AtomStatus::Stored);
    node.push_atom(&alice, &atom, AtomStatus::Stored);
    node.push_atom(&alice, &atom, AtomStatus::EvictedConflictLoser);
    settle().await;

    assert_eq!(ledger.store().len().await.unwrap(), 1);
    assert_eq!(
        ledger.store().get_status(atom.aid()).await.unwrap(),
        Some(AtomStatus::EvictedConflictLoser)
    );
}

#[tokio::test]
async fn test_head_marks_address_synced() {
    let node = MockNode::new();
    let ledger = create_test_ledger(&node).await;
    let alice = Address::new("alice");
    let mut synced = ledger.is_synced(&alice);
    assert!(!*synced.borrow());

    let _observations = ledger.get_atom_observations(&alice).await.unwrap();
    settle().await;
    node.push(&alice, NodeEvent::Head);

    synced.changed().await.unwrap();
    assert!(*synced.borrow());
}

#[tokio::test]
async fn test_closed_connection_resubscribes_on_demand() {
    let node = MockNode::new();
    let ledger = create_test_ledger(&node).await;
    let alice = Address::new("alice");

    let _observations = ledger.get_atom_observations(&alice).await.unwrap();
    settle().await;
    node.push(&alice, NodeEvent::Head);
    settle().await;
    assert!(*ledger.is_synced(&alice).borrow());

    node.set_state(ConnectionState::Closed);
    settle().await;
    assert!(!ledger.is_subscribed(&alice));
    assert!(!*ledger.is_synced(&alice).borrow());

    let _again = ledger.get_atom_observations(&alice).await.unwrap();
    settle().await;
    assert_eq!(node.subscribe_calls(), 2);
    assert!(ledger.is_subscribed(&alice));
}

#[tokio::test]
async fn test_ended_feed_dropped_from_cache() {
    let node = MockNode::new();
    let ledger = create_test_ledger(&node).await;
    let alice = Address::new("alice");

    let _observations = ledger.get_atom_observations(&alice).await.unwrap();
    settle().await;
    node.end_feed(&alice);
    settle().await;

    assert!(!ledger.is_subscribed(&alice));
    assert_eq!(ledger.metrics().network_subscriptions.get(), 0);
}

#[tokio::test]
async fn test_submission_statuses_tracked() {
    let node = MockNode::new();
    node.script_submission(vec![
        SubmissionEvent::Status(AtomStatus::Submitted),
        SubmissionEvent::Status(AtomStatus::Stored),
    ]);
    let ledger = create_test_ledger(&node).await;
    let atom = atom_of(vec![SpunParticle::up(tokens("alice", 10, 1))], 1);

    let updates = ledger.submit_atom(atom.clone(), node.clone()).await.unwrap();
    let statuses: Vec<AtomStatus> = updates.take(4).collect().await;

    assert_eq!(
        statuses,
        vec![
            AtomStatus::Pending,
            AtomStatus::Submitting,
            AtomStatus::Submitted,
            AtomStatus::Stored
        ]
    );
    assert_eq!(node.submissions().len(), 1);
    assert_eq!(node.submissions()[0].aid(), atom.aid());
}

#[tokio::test]
async fn test_submission_failure_becomes_status() {
    let node = MockNode::new();
    node.script_submission(vec![
        SubmissionEvent::Status(AtomStatus::Submitted),
        SubmissionEvent::Failed(SubmissionFailure::Collision),
    ]);
    let ledger = create_test_ledger(&node).await;
    let atom = atom_of(vec![SpunParticle::up(tokens("alice", 10, 1))], 2);

    let updates = ledger.submit_atom(atom.clone(), node.clone()).await.unwrap();
    let statuses: Vec<AtomStatus> = updates.take(4).collect().await;

    assert_eq!(statuses.last(), Some(&AtomStatus::SubmissionError));
    assert_eq!(
        ledger.store().get_status(atom.aid()).await.unwrap(),
        Some(AtomStatus::SubmissionError)
    );
}

#[tokio::test]
async fn test_open_uses_configured_finality() {
    let node = MockNode::new();
    let mut config = Config::default();
    config.finality_time_ms = 5;
    let store = AtomStore::open(&config).unwrap();
    let provider = Arc::new(MockProvider { node: node.clone() });
    let ledger = Ledger::open(&config, store, provider).await.unwrap();

    let atom = atom_of(vec![SpunParticle::up(tokens("alice", 10, 1))], 3);
    let mut updates = ledger.store().get_atom_status_updates(atom.aid()).await.unwrap();
    ledger.store().insert(atom, AtomStatus::Stored).await.unwrap();

    assert_eq!(updates.next().await, Some(AtomStatus::Stored));
    let promoted = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .unwrap();
    assert_eq!(promoted, Some(AtomStatus::StoredFinal));
}

#[tokio::test]
async fn test_slow_observer_receives_every_atom() {
    let node = MockNode::new();
    let ledger = create_test_ledger(&node).await;
    let alice = Address::new("alice");

    let mut observations = ledger.get_atom_observations(&alice).await.unwrap();

    // Not polled while the store publishes past the channel buffer
    let mut expected = HashSet::new();
    for i in 0..1500u64 {
        let atom = atom_of(vec![SpunParticle::up(tokens("alice", 1, i))], i as i64);
        expected.insert(atom.aid());
        ledger.store().insert(atom, AtomStatus::Stored).await.unwrap();
    }

    let mut seen = HashSet::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while seen.len() < expected.len() {
            let observation = observations.next().await.unwrap();
            assert_eq!(observation.status, AtomStatus::Stored);
            seen.insert(observation.aid());
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, expected);

    let late = atom_of(vec![SpunParticle::up(tokens("alice", 1, 9999))], 9999);
    ledger.store().insert(late.clone(), AtomStatus::Stored).await.unwrap();
    loop {
        if observations.next().await.unwrap().aid() == late.aid() {
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_eviction_racing_finality_is_final() {
    let node = MockNode::new();
    let ledger = create_test_ledger(&node).await;
    let alice = Address::new("alice");
    let _observations = ledger.get_atom_observations(&alice).await.unwrap();
    settle().await;

    let atom = atom_of(vec![SpunParticle::up(tokens("alice", 10, 1))], 1);
    node.push_atom(&alice, &atom, AtomStatus::Stored);
    settle().await;
    assert!(ledger.is_finality_pending(&atom.aid()));

    tokio::time::advance(Duration::from_secs(60)).await;
    node.push_atom(&alice, &atom, AtomStatus::EvictedConflictLoser);
    settle().await;

    tokio::time::sleep(Duration::from_secs(180)).await;
    settle().await;
    assert_eq!(
        ledger.store().get_status(atom.aid()).await.unwrap(),
        Some(AtomStatus::EvictedConflictLoserFinal)
    );

    // A late STORED_FINAL promotion has nothing to act on
    assert!(!ledger
        .store()
        .promote(atom.aid(), AtomStatus::Stored, AtomStatus::StoredFinal)
        .await
        .unwrap());
    assert_eq!(
        ledger.store().get_status(atom.aid()).await.unwrap(),
        Some(AtomStatus::EvictedConflictLoserFinal)
    );
}
