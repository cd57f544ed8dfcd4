//! Integration tests for the signaling relay.
//!
//! Drives real WebSocket clients against an in-process relay and checks
//! room membership announcements, directed negotiation routing, and
//! mutation broadcast.
//!
//! Verification command: `cargo test --test relay_signaling`

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use tasksync_proto::relay::{self, Negotiation, RelayMessage};
use tasksync_proto::task::{Priority, Task, TaskId, TaskMutation};
use tasksync_relay::relay::{RelayState, start_server, start_server_with_state};

// =============================================================================
// Helpers
// =============================================================================

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects a client and returns it with the id from its welcome.
async fn connect(addr: std::net::SocketAddr) -> (WsStream, String) {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    match recv(&mut ws).await {
        RelayMessage::Welcome { conn_id } => (ws, conn_id),
        other => panic!("expected Welcome, got {other:?}"),
    }
}

async fn send(ws: &mut WsStream, msg: &RelayMessage) {
    let bytes = relay::encode(msg).unwrap();
    ws.send(tungstenite::Message::Binary(bytes.into()))
        .await
        .unwrap();
}

async fn recv(ws: &mut WsStream) -> RelayMessage {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("recv timed out")
        .unwrap()
        .unwrap();
    relay::decode(&msg.into_data()).unwrap()
}

/// Asserts nothing arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    let result = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "expected no message, got {result:?}");
}

async fn join(ws: &mut WsStream, room: &str) -> Vec<String> {
    send(
        ws,
        &RelayMessage::JoinRoom {
            room_id: room.to_string(),
        },
    )
    .await;
    match recv(ws).await {
        RelayMessage::RoomPeers { room_id, peers } => {
            assert_eq!(room_id, room);
            peers
        }
        other => panic!("expected RoomPeers, got {other:?}"),
    }
}

fn buy_milk() -> Task {
    Task {
        id: TaskId::from_string("t1"),
        title: "Buy milk".to_string(),
        description: None,
        priority: Priority::Low,
        completed: false,
        created_at: 1_000,
        updated_at: 1_000,
    }
}

// =============================================================================
// Membership
// =============================================================================

#[tokio::test]
async fn join_announces_membership_both_ways() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let (mut a, id_a) = connect(addr).await;
    let (mut b, id_b) = connect(addr).await;

    assert!(join(&mut a, "r1").await.is_empty());
    assert_eq!(join(&mut b, "r1").await, vec![id_a.clone()]);
    assert_eq!(
        recv(&mut a).await,
        RelayMessage::PeerJoined {
            room_id: "r1".to_string(),
            conn_id: id_b.clone(),
        }
    );

    // A third member sees both, sorted.
    let (mut c, _id_c) = connect(addr).await;
    let mut expected = vec![id_a, id_b];
    expected.sort();
    assert_eq!(join(&mut c, "r1").await, expected);
}

#[tokio::test]
async fn leave_and_disconnect_announce_peer_left() {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    let (mut a, _id_a) = connect(addr).await;
    let (mut b, id_b) = connect(addr).await;
    let (mut c, id_c) = connect(addr).await;
    join(&mut a, "r1").await;
    join(&mut b, "r1").await;
    recv(&mut a).await;
    join(&mut c, "r1").await;
    recv(&mut a).await;
    recv(&mut b).await;

    send(
        &mut b,
        &RelayMessage::LeaveRoom {
            room_id: "r1".to_string(),
        },
    )
    .await;
    let left = RelayMessage::PeerLeft {
        room_id: "r1".to_string(),
        conn_id: id_b,
    };
    assert_eq!(recv(&mut a).await, left);
    assert_eq!(recv(&mut c).await, left);

    c.close(None).await.unwrap();
    assert_eq!(
        recv(&mut a).await,
        RelayMessage::PeerLeft {
            room_id: "r1".to_string(),
            conn_id: id_c,
        }
    );

    a.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.rooms.room_count().await, 0);
}

#[tokio::test]
async fn switching_rooms_leaves_the_first() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let (mut a, _id_a) = connect(addr).await;
    let (mut b, id_b) = connect(addr).await;
    join(&mut a, "r1").await;
    join(&mut b, "r1").await;
    recv(&mut a).await;

    assert!(join(&mut b, "r2").await.is_empty());
    assert_eq!(
        recv(&mut a).await,
        RelayMessage::PeerLeft {
            room_id: "r1".to_string(),
            conn_id: id_b,
        }
    );
}

// =============================================================================
// Directed negotiation
// =============================================================================

#[tokio::test]
async fn offer_is_routed_with_stamped_sender() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let (mut a, id_a) = connect(addr).await;
    let (mut b, id_b) = connect(addr).await;

    let offer = Negotiation {
        from: "forged".to_string(),
        to: id_b.clone(),
        payload: b"sdp".to_vec(),
    };
    send(&mut a, &RelayMessage::Offer(offer)).await;

    assert_eq!(
        recv(&mut b).await,
        RelayMessage::Offer(Negotiation {
            from: id_a,
            to: id_b,
            payload: b"sdp".to_vec(),
        })
    );
}

#[tokio::test]
async fn unknown_target_is_dropped_without_harm() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let (mut a, id_a) = connect(addr).await;
    let (mut b, id_b) = connect(addr).await;

    send(
        &mut a,
        &RelayMessage::IceCandidate(Negotiation::to("nobody", b"cand".to_vec())),
    )
    .await;
    assert_silent(&mut a).await;

    // The relay still routes for everyone.
    send(
        &mut b,
        &RelayMessage::Answer(Negotiation::to(id_a.as_str(), b"ans".to_vec())),
    )
    .await;
    match recv(&mut a).await {
        RelayMessage::Answer(neg) => assert_eq!(neg.from, id_b),
        other => panic!("expected Answer, got {other:?}"),
    }
}

// =============================================================================
// Mutation broadcast
// =============================================================================

#[tokio::test]
async fn mutation_reaches_room_except_sender() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let (mut a, id_a) = connect(addr).await;
    let (mut b, _id_b) = connect(addr).await;
    let (mut outsider, _) = connect(addr).await;
    join(&mut a, "r1").await;
    join(&mut b, "r1").await;
    recv(&mut a).await;
    join(&mut outsider, "elsewhere").await;

    let mutation = TaskMutation::Added(buy_milk());
    send(
        &mut a,
        &RelayMessage::Mutation {
            room_id: "r1".to_string(),
            from: String::new(),
            mutation: mutation.clone(),
        },
    )
    .await;

    assert_eq!(
        recv(&mut b).await,
        RelayMessage::Mutation {
            room_id: "r1".to_string(),
            from: id_a,
            mutation,
        }
    );
    assert_silent(&mut a).await;
    assert_silent(&mut outsider).await;
}

#[tokio::test]
async fn malformed_frames_do_not_disconnect() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let (mut a, _id_a) = connect(addr).await;

    a.send(tungstenite::Message::Binary(vec![0xff, 0x00, 0x13].into()))
        .await
        .unwrap();
    send(
        &mut a,
        &RelayMessage::Welcome {
            conn_id: "spoof".to_string(),
        },
    )
    .await;
    send(
        &mut a,
        &RelayMessage::JoinRoom {
            room_id: String::new(),
        },
    )
    .await;
    assert_silent(&mut a).await;

    assert!(join(&mut a, "r1").await.is_empty());
}
