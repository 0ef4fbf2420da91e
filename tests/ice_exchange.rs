mod common;

use std::sync::Arc;

use common::{candidate_named, eventually, FakePeer, Party};
use peercall::call::ice::IceExchanger;
use peercall::call::CallStatus;
use peercall::events::{create_event_bus, PeerEventSink};
use peercall::media::peer::PeerConnection;
use peercall::signaling::{MemoryChannel, SessionDescription};
use serde_json::{json, Value};

fn fake_peer() -> FakePeer {
    let (tx, _rx) = create_event_bus();
    FakePeer::new(0, PeerEventSink::new(1, tx))
}

fn list(names: &[&str]) -> Option<Value> {
    Some(Value::Array(
        names
            .iter()
            .map(|name| serde_json::to_value(candidate_named(name)).unwrap())
            .collect(),
    ))
}

fn applied_names(peer: &FakePeer) -> Vec<String> {
    peer.applied()
        .into_iter()
        .map(|c| c.split_whitespace().next().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn backlog_written_before_answer_is_applied_in_order() {
    let relay = Arc::new(MemoryChannel::new());
    let alice = Party::spawn("alice", &relay);
    let bob = Party::spawn("bob", &relay);

    alice.handle.set_contact(Some("bob".into())).await.unwrap();
    alice.handle.place_call(false).await.unwrap();
    let caller_peer = alice.connector.last();
    for name in ["c1", "c2", "c3"] {
        caller_peer.discover(name);
    }
    eventually(|| {
        relay
            .get("calls/alice-bob/candidates/alice")
            .and_then(|v| v.as_array().map(Vec::len))
            == Some(3)
    })
    .await;

    bob.wait_status(CallStatus::Receiving).await;
    bob.handle.answer().await.unwrap();
    let callee_peer = bob.connector.last();
    eventually(|| callee_peer.applied().len() == 3).await;
    assert_eq!(applied_names(&callee_peer), ["candidate:c1", "candidate:c2", "candidate:c3"]);

    callee_peer.discover("b1");
    caller_peer.discover("c4");
    eventually(|| caller_peer.applied().len() == 1 && callee_peer.applied().len() == 4).await;
    assert_eq!(applied_names(&caller_peer), ["candidate:b1"]);
    assert_eq!(applied_names(&callee_peer).last().map(String::as_str), Some("candidate:c4"));
}

#[tokio::test]
async fn hang_up_removes_candidate_lists_with_the_record() {
    let relay = Arc::new(MemoryChannel::new());
    let alice = Party::spawn("alice", &relay);
    let bob = Party::spawn("bob", &relay);
    common::establish(&alice, &bob, false).await;

    alice.connector.last().discover("c1");
    bob.connector.last().discover("b1");
    eventually(|| relay.get("calls/alice-bob/candidates/bob").is_some()).await;

    alice.handle.hang_up().await.unwrap();
    assert_eq!(relay.get("calls/alice-bob"), None);
    bob.wait_status(CallStatus::Idle).await;
}

#[tokio::test]
async fn remote_candidates_wait_for_the_remote_description() {
    let peer = fake_peer();
    let mut ice = IceExchanger::new();

    assert_eq!(ice.on_remote_snapshot(&peer, &list(&["c1", "c2"])).await, 0);
    assert_eq!(ice.pending_remote(), 2);
    assert_eq!(ice.consumed(), 2);
    assert!(peer.applied().is_empty());

    assert_eq!(ice.on_remote_snapshot(&peer, &list(&["c1", "c2", "c3"])).await, 0);
    assert_eq!(ice.pending_remote(), 3);

    peer.set_remote_description(&SessionDescription::answer("answer")).await.unwrap();
    assert_eq!(ice.flush_pending(&peer).await, 3);
    assert_eq!(ice.pending_remote(), 0);
    assert_eq!(applied_names(&peer), ["candidate:c1", "candidate:c2", "candidate:c3"]);
}

#[tokio::test]
async fn only_the_unseen_suffix_is_applied() {
    let peer = fake_peer();
    peer.set_remote_description(&SessionDescription::offer("offer")).await.unwrap();
    let mut ice = IceExchanger::new();

    assert_eq!(ice.on_remote_snapshot(&peer, &list(&["c1"])).await, 1);
    assert_eq!(ice.on_remote_snapshot(&peer, &list(&["c1", "c2", "c3"])).await, 2);
    assert_eq!(ice.on_remote_snapshot(&peer, &list(&["c1", "c2", "c3"])).await, 0);
    assert_eq!(ice.on_remote_snapshot(&peer, &list(&["c1"])).await, 0);
    assert_eq!(ice.on_remote_snapshot(&peer, &None).await, 0);
    assert_eq!(ice.consumed(), 3);
    assert_eq!(applied_names(&peer), ["candidate:c1", "candidate:c2", "candidate:c3"]);
}

#[tokio::test]
async fn malformed_entries_keep_their_position() {
    let peer = fake_peer();
    peer.set_remote_description(&SessionDescription::offer("offer")).await.unwrap();
    let mut ice = IceExchanger::new();

    let mut items = list(&["c1"]).unwrap();
    let entries = items.as_array_mut().unwrap();
    entries.push(json!("not a candidate"));
    entries.push(serde_json::to_value(candidate_named("c3")).unwrap());
    assert_eq!(ice.on_remote_snapshot(&peer, &Some(items.clone())).await, 2);
    assert_eq!(ice.consumed(), 3);

    items
        .as_array_mut()
        .unwrap()
        .push(serde_json::to_value(candidate_named("c4")).unwrap());
    assert_eq!(ice.on_remote_snapshot(&peer, &Some(items)).await, 1);
    assert_eq!(applied_names(&peer), ["candidate:c1", "candidate:c3", "candidate:c4"]);
}

#[tokio::test]
async fn rejected_duplicates_do_not_stop_the_rest() {
    let peer = fake_peer();
    peer.set_remote_description(&SessionDescription::offer("offer")).await.unwrap();
    let mut ice = IceExchanger::new();

    assert_eq!(ice.on_remote_snapshot(&peer, &list(&["c1", "c1", "c2"])).await, 2);
    assert_eq!(applied_names(&peer), ["candidate:c1", "candidate:c2"]);
}

#[tokio::test]
async fn local_candidates_are_held_until_bound() {
    let relay = MemoryChannel::new();
    let key = "calls/alice-bob/candidates/alice";
    let mut ice = IceExchanger::new();

    ice.on_local_candidate(&relay, candidate_named("c1")).await;
    ice.on_local_candidate(&relay, candidate_named("c2")).await;
    assert_eq!(relay.get(key), None);
    assert_eq!(ice.local_key(), None);

    ice.bind(&relay, key.to_string()).await;
    assert_eq!(relay.get(key), list(&["c1", "c2"]));

    ice.on_local_candidate(&relay, candidate_named("c3")).await;
    assert_eq!(relay.get(key), list(&["c1", "c2", "c3"]));
    assert_eq!(ice.local_key(), Some(key));
}

#[tokio::test]
async fn refused_candidates_are_retried_in_discovery_order() {
    let relay = MemoryChannel::new();
    let key = "calls/a-b/candidates/a";
    let mut ice = IceExchanger::new();
    ice.bind(&relay, key.into()).await;

    relay.set_unavailable(true);
    ice.on_local_candidate(&relay, candidate_named("c1")).await;
    assert_eq!(ice.unsent(), 1);

    relay.set_unavailable(false);
    ice.on_local_candidate(&relay, candidate_named("c2")).await;
    assert_eq!(relay.get(key), list(&["c1", "c2"]));
    assert_eq!(ice.unsent(), 0);
}

#[tokio::test]
async fn refused_candidates_flush_without_a_new_discovery() {
    let relay = MemoryChannel::new();
    let key = "calls/a-b/candidates/a";
    let mut ice = IceExchanger::new();
    ice.bind(&relay, key.into()).await;

    relay.set_unavailable(true);
    ice.on_local_candidate(&relay, candidate_named("c1")).await;
    ice.on_local_candidate(&relay, candidate_named("c2")).await;
    assert_eq!(ice.flush_outbox(&relay).await, 0);
    assert_eq!(ice.unsent(), 2);

    relay.set_unavailable(false);
    assert_eq!(ice.flush_outbox(&relay).await, 2);
    assert_eq!(relay.get(key), list(&["c1", "c2"]));
}
