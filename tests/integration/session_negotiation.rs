//! Peer session negotiation tests.
//!
//! Two session managers talk over the loopback network. Relay traffic is
//! routed by hand between them (stamping `from` the way the relay does), so
//! every step of the state machine can be observed.
//!
//! Verification command: `cargo test --test session_negotiation`

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use tasksync::session::{
    CloseReason, PeerSessionManager, SessionError, SessionSettings, SessionState, SessionUpdate,
};
use tasksync::transport::loopback::LoopbackNetwork;
use tasksync::transport::relay::RelayOutbound;
use tasksync::transport::{LinkEvent, PeerId};
use tasksync_proto::relay::{Negotiation, RelayMessage};

// =============================================================================
// Harness
// =============================================================================

struct Peer {
    id: PeerId,
    mgr: PeerSessionManager<LoopbackNetwork>,
    links: mpsc::UnboundedReceiver<LinkEvent>,
    outbox: mpsc::UnboundedReceiver<RelayMessage>,
}

fn peer(net: &LoopbackNetwork, id: &str) -> Peer {
    let (tx, outbox) = mpsc::unbounded_channel();
    let (mgr, links) = PeerSessionManager::new(
        PeerId::new(id),
        net.clone(),
        RelayOutbound::new(tx),
        SessionSettings::default(),
    );
    Peer {
        id: PeerId::new(id),
        mgr,
        links,
        outbox,
    }
}

/// Hands one relayed message to `to`, as the relay would after stamping.
async fn deliver(to: &mut Peer, from: &PeerId, msg: RelayMessage) {
    let stamp = |neg: Negotiation| Negotiation {
        from: from.as_str().to_string(),
        ..neg
    };
    let _ = match msg {
        RelayMessage::Offer(neg) => to.mgr.on_offer(stamp(neg)).await,
        RelayMessage::Answer(neg) => to.mgr.on_answer(stamp(neg)).await,
        RelayMessage::IceCandidate(neg) => to.mgr.on_ice_candidate(stamp(neg)).await,
        other => panic!("unexpected relay message {other:?}"),
    };
}

/// Routes link events and relay traffic until both sides are quiet.
async fn pump(a: &mut Peer, b: &mut Peer) {
    loop {
        let mut moved = false;
        while let Ok(event) = a.links.try_recv() {
            a.mgr.handle_link_event(event);
            moved = true;
        }
        while let Ok(event) = b.links.try_recv() {
            b.mgr.handle_link_event(event);
            moved = true;
        }
        while let Ok(msg) = a.outbox.try_recv() {
            deliver(b, &a.id.clone(), msg).await;
            moved = true;
        }
        while let Ok(msg) = b.outbox.try_recv() {
            deliver(a, &b.id.clone(), msg).await;
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

fn closed_reasons(updates: &[SessionUpdate]) -> Vec<CloseReason> {
    updates
        .iter()
        .filter_map(|u| match u {
            SessionUpdate::Closed { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

fn past_deadline(n: u32) -> Instant {
    Instant::now() + (Duration::from_secs(16) * n)
}

/// Brings a and b into the same room and runs negotiation to completion.
async fn connected_pair(net: &LoopbackNetwork) -> (Peer, Peer) {
    let mut a = peer(net, "a");
    let mut b = peer(net, "b");
    b.mgr.on_room_peers(&[a.id.clone()]).await;
    a.mgr.on_peer_joined(b.id.clone()).await;
    pump(&mut a, &mut b).await;
    assert_eq!(a.mgr.state(&b.id), SessionState::Connected);
    assert_eq!(b.mgr.state(&a.id), SessionState::Connected);
    (a, b)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn handshake_connects_and_carries_payloads() {
    let net = LoopbackNetwork::new();
    let (mut a, mut b) = connected_pair(&net).await;

    assert_eq!(
        a.mgr.drain_updates(),
        vec![SessionUpdate::Connected(b.id.clone())]
    );
    assert_eq!(
        b.mgr.drain_updates(),
        vec![SessionUpdate::Connected(a.id.clone())]
    );

    b.mgr.send_to(&a.id, b"snapshot").await.unwrap();
    pump(&mut a, &mut b).await;
    assert_eq!(
        a.mgr.drain_updates(),
        vec![SessionUpdate::Frame {
            peer: b.id.clone(),
            payload: b"snapshot".to_vec(),
        }]
    );
}

#[tokio::test]
async fn only_the_smaller_id_initiates() {
    let net = LoopbackNetwork::new();
    let mut a = peer(&net, "a");
    let mut b = peer(&net, "b");

    b.mgr.on_peer_joined(a.id.clone()).await;
    assert_eq!(b.mgr.state(&a.id), SessionState::Idle);
    assert!(b.outbox.try_recv().is_err());

    a.mgr.on_room_peers(&[b.id.clone()]).await;
    assert_eq!(
        a.mgr.state(&b.id),
        SessionState::Negotiating { initiator: true }
    );
}

#[tokio::test]
async fn glare_keeps_the_designated_initiators_offer() {
    let net = LoopbackNetwork::new();
    let mut a = peer(&net, "a");
    a.mgr.on_peer_joined(PeerId::new("b")).await;

    let competing = Negotiation {
        from: "b".to_string(),
        to: "a".to_string(),
        payload: b"loopback/offer".to_vec(),
    };
    a.mgr.on_offer(competing).await.unwrap();

    assert_eq!(
        a.mgr.state(&PeerId::new("b")),
        SessionState::Negotiating { initiator: true }
    );
    assert!(a.mgr.drain_updates().is_empty());
    assert!(matches!(a.outbox.try_recv(), Ok(RelayMessage::Offer(_))));
    assert!(a.outbox.try_recv().is_err(), "competing offer must not be answered");
}

#[tokio::test]
async fn fresh_offer_supersedes_existing_session() {
    let net = LoopbackNetwork::new();
    let (mut a, mut b) = connected_pair(&net).await;
    b.mgr.drain_updates();

    let offer = Negotiation {
        from: "a".to_string(),
        to: "b".to_string(),
        payload: b"loopback/offer".to_vec(),
    };
    b.mgr.on_offer(offer).await.unwrap();

    assert_eq!(
        closed_reasons(&b.mgr.drain_updates()),
        vec![CloseReason::Superseded]
    );
    assert_eq!(
        b.mgr.state(&a.id),
        SessionState::Negotiating { initiator: false }
    );
    // a sees its end of the old link close; b keeps the new negotiation.
    pump(&mut a, &mut b).await;
    assert_eq!(a.mgr.state(&b.id), SessionState::Idle);
    assert_eq!(
        b.mgr.state(&a.id),
        SessionState::Negotiating { initiator: false }
    );
}

#[tokio::test]
async fn candidate_before_offer_is_dropped() {
    let net = LoopbackNetwork::new();
    let mut b = peer(&net, "b");
    let candidate = Negotiation {
        from: "a".to_string(),
        to: "b".to_string(),
        payload: b"loopback:a".to_vec(),
    };
    let result = b.mgr.on_ice_candidate(candidate).await;
    assert!(matches!(result, Err(SessionError::NoSession(_))));
    assert_eq!(b.mgr.state(&PeerId::new("a")), SessionState::Idle);
}

#[tokio::test]
async fn sever_closes_both_sides_without_retry() {
    let net = LoopbackNetwork::new();
    let (mut a, mut b) = connected_pair(&net).await;
    a.mgr.drain_updates();
    b.mgr.drain_updates();

    assert!(net.sever(&a.id, &b.id));
    pump(&mut a, &mut b).await;

    assert!(matches!(
        closed_reasons(&a.mgr.drain_updates()).as_slice(),
        [CloseReason::TransportError(_)]
    ));
    assert!(matches!(
        closed_reasons(&b.mgr.drain_updates()).as_slice(),
        [CloseReason::TransportError(_)]
    ));
    assert_eq!(a.mgr.session_count(), 0);
    assert_eq!(b.mgr.session_count(), 0);
    assert_eq!(a.mgr.broadcast(b"lost").await, 0);
}

#[tokio::test]
async fn stalled_negotiation_times_out_and_retry_connects() {
    let net = LoopbackNetwork::new();
    net.suppress_candidates(true);
    let mut a = peer(&net, "a");
    let mut b = peer(&net, "b");
    b.mgr.on_room_peers(&[a.id.clone()]).await;
    a.mgr.on_peer_joined(b.id.clone()).await;
    pump(&mut a, &mut b).await;
    assert_eq!(
        a.mgr.state(&b.id),
        SessionState::Negotiating { initiator: true }
    );

    a.mgr.expire_stale(past_deadline(1)).await;
    assert_eq!(
        closed_reasons(&a.mgr.drain_updates()),
        vec![CloseReason::NegotiationTimeout]
    );
    assert_eq!(
        a.mgr.state(&b.id),
        SessionState::Negotiating { initiator: true }
    );

    net.suppress_candidates(false);
    a.mgr.expire_stale(past_deadline(2)).await;
    pump(&mut a, &mut b).await;

    assert_eq!(a.mgr.state(&b.id), SessionState::Connected);
    assert_eq!(b.mgr.state(&a.id), SessionState::Connected);
}

#[tokio::test]
async fn peer_left_cancels_pending_retry() {
    let net = LoopbackNetwork::new();
    net.suppress_candidates(true);
    let mut a = peer(&net, "a");
    a.mgr.on_peer_joined(PeerId::new("b")).await;
    assert!(matches!(a.outbox.try_recv(), Ok(RelayMessage::Offer(_))));

    a.mgr.on_peer_left(&PeerId::new("b"));
    assert_eq!(
        closed_reasons(&a.mgr.drain_updates()),
        vec![CloseReason::PeerLeft]
    );

    a.mgr.expire_stale(past_deadline(1)).await;
    assert_eq!(a.mgr.session_count(), 0);
    assert!(a.outbox.try_recv().is_err());
}

#[tokio::test]
async fn local_leave_closes_every_session() {
    let net = LoopbackNetwork::new();
    let (mut a, mut b) = connected_pair(&net).await;
    a.mgr.drain_updates();
    b.mgr.drain_updates();

    a.mgr.close_all(&CloseReason::LocalLeave);
    assert_eq!(
        closed_reasons(&a.mgr.drain_updates()),
        vec![CloseReason::LocalLeave]
    );

    // The remote sees the link close.
    pump(&mut a, &mut b).await;
    assert_eq!(b.mgr.state(&a.id), SessionState::Idle);
    assert_eq!(a.mgr.member_count(), 0);
}

#[tokio::test]
async fn offer_from_previous_room_is_ignored() {
    let net = LoopbackNetwork::new();
    let mut a = peer(&net, "a");
    let mut b = peer(&net, "b");
    b.mgr.on_room_peers(&[a.id.clone()]).await;
    a.mgr.on_peer_joined(b.id.clone()).await;

    // b switches rooms before a's offer is delivered.
    b.mgr.close_all(&CloseReason::LocalLeave);
    b.mgr.on_room_peers(&[PeerId::new("c")]).await;
    let Ok(RelayMessage::Offer(offer)) = a.outbox.try_recv() else {
        panic!("expected an offer from a");
    };
    let stamped = Negotiation {
        from: a.id.as_str().to_string(),
        ..offer
    };

    let result = b.mgr.on_offer(stamped).await;
    assert!(matches!(result, Err(SessionError::NotMember(p)) if p == a.id));
    assert_eq!(b.mgr.state(&a.id), SessionState::Idle);
    let answered = std::iter::from_fn(|| b.outbox.try_recv().ok())
        .any(|msg| matches!(msg, RelayMessage::Answer(_)));
    assert!(!answered);
}
