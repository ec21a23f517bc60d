//! Two-party calls: a single remote peer whose loss ends the session, over
//! the shared-record transport and the hub.

mod common;

use std::sync::Arc;
use std::time::Duration;

use huddle_media::loopback::LoopbackNetwork;
use huddle_media::{LinkState, SessionConfig, SessionError, SessionEvent, Topology};
use huddle_net::{LocalHub, RecordStore, SessionRecord};
use huddle_shared::types::{PeerId, SessionId};

use common::{disturbed, Participant};

fn call_config() -> SessionConfig {
    SessionConfig {
        topology: Topology::Call,
        ..SessionConfig::default()
    }
}

fn record_participant(store: &RecordStore, net: &LoopbackNetwork, id: &str) -> Participant {
    Participant::with_transport(
        Arc::new(store.transport(PeerId::from(id))),
        net,
        call_config(),
    )
}

async fn record_call(store: &RecordStore, net: &LoopbackNetwork) -> (Participant, Participant) {
    let session = SessionId::from("room-1");
    let mut a = record_participant(store, net, "a");
    let mut b = record_participant(store, net, "b");

    a.handle.join_session("room-1", "Ada").await.unwrap();
    assert_eq!(store.get(&session).caller, Some(a.id.clone()));
    b.handle.join_session("room-1", "Bob").await.unwrap();
    assert_eq!(store.get(&session).callee, Some(b.id.clone()));

    let (a_id, b_id) = (a.id.clone(), b.id.clone());
    a.wait_connected(&b_id).await;
    b.wait_connected(&a_id).await;
    (a, b)
}

#[tokio::test]
async fn record_call_connects_through_slots() {
    let store = RecordStore::new();
    let net = LoopbackNetwork::new();
    let (a, mut b) = record_call(&store, &net).await;

    let record = store.get(&SessionId::from("room-1"));
    assert!(record.offer.is_some());
    assert!(record.answer.is_some());
    assert!(!record.caller_ice.is_empty());
    assert!(!record.callee_ice.is_empty());
    assert!(net.is_connected(&a.id, &b.id));

    let sent = a.handle.send_chat_message("hello").await.unwrap();
    b.wait_for(|e| matches!(e, SessionEvent::ChatMessage(m) if m.id == sent.id))
        .await;
}

#[tokio::test]
async fn third_caller_is_turned_away() {
    let store = RecordStore::new();
    let net = LoopbackNetwork::new();
    let (_a, _b) = record_call(&store, &net).await;

    let mut c = record_participant(&store, &net, "c");
    let joined = c.handle.join_session("room-1", "Cy").await;
    assert!(matches!(joined, Err(SessionError::Transport(_))));
    c.wait_for(|e| matches!(e, SessionEvent::FatalSessionError(SessionError::Transport(_))))
        .await;
    assert!(c.media.live().is_empty());
    assert!(c.handle.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn lost_peer_ends_the_call() {
    let store = RecordStore::new();
    let net = LoopbackNetwork::new();
    let (mut a, b) = record_call(&store, &net).await;

    net.kill(&b.id);

    let b_id = b.id.clone();
    a.wait_for(|e| matches!(e, SessionEvent::PeerDisconnected(p) if *p == b_id))
        .await;
    let fatal = a
        .wait_for(|e| matches!(e, SessionEvent::FatalSessionError(_)))
        .await;
    assert!(matches!(
        fatal,
        SessionEvent::FatalSessionError(SessionError::PeerLinkFailure { peer, .. }) if peer == b_id
    ));
    assert!(a.handle.peers().await.unwrap().is_empty());
    assert!(a.media.live().is_empty());
    assert_eq!(
        a.handle.send_chat_message("hello?").await,
        Err(SessionError::NotJoined)
    );
}

#[tokio::test]
async fn caller_leaving_resets_the_record() {
    let store = RecordStore::new();
    let net = LoopbackNetwork::new();
    let (a, mut b) = record_call(&store, &net).await;

    a.handle.leave_session().await.unwrap();

    let a_id = a.id.clone();
    b.wait_for(|e| matches!(e, SessionEvent::PeerDisconnected(p) if *p == a_id))
        .await;
    b.wait_for(|e| {
        matches!(e, SessionEvent::FatalSessionError(SessionError::PeerLinkFailure { peer, .. }) if *peer == a_id)
    })
    .await;
    assert_eq!(store.get(&SessionId::from("room-1")), SessionRecord::default());
}

#[tokio::test]
async fn call_ignores_a_second_joiner() {
    let hub = LocalHub::new();
    let net = LoopbackNetwork::new();
    let mut a = Participant::start(&hub, &net, "a", call_config());
    let mut b = Participant::start(&hub, &net, "b", call_config());
    a.handle.join_session("room-1", "Ada").await.unwrap();
    b.handle.join_session("room-1", "Bob").await.unwrap();
    let (a_id, b_id) = (a.id.clone(), b.id.clone());
    a.wait_connected(&b_id).await;
    b.wait_connected(&a_id).await;

    let mut c = Participant::start(&hub, &net, "c", call_config());
    c.handle.join_session("room-1", "Cy").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    for p in [&mut a, &mut b] {
        let late = p.drain();
        assert!(!disturbed(&late), "unexpected events {late:?}");
        assert!(late
            .iter()
            .all(|e| !matches!(e, SessionEvent::PeerConnected(_))));
        let links = p.handle.peers().await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].state, LinkState::Connected);
    }
    assert!(c.handle.peers().await.unwrap().is_empty());
    assert!(!net.is_connected(&a_id, &c.id));
}
