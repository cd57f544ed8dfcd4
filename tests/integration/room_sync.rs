//! End-to-end room sync tests.
//!
//! Two or three clients run the full sync event loop against an in-process
//! relay. Direct links use the loopback network (or real TCP) so both the
//! relay path and the direct path are exercised.
//!
//! Verification command: `cargo test --test room_sync`

use std::time::Duration;

use tasksync::net::{SyncCommand, SyncConfig, SyncEvent, SyncHandle, spawn_sync};
use tasksync::tasks::{InMemoryTaskStore, TaskPatch};
use tasksync::transport::DirectTransportProvider;
use tasksync::transport::PeerId;
use tasksync::transport::loopback::LoopbackNetwork;
use tasksync::transport::tcp::TcpProvider;
use tasksync_proto::task::{Priority, Task};
use tasksync_relay::relay::start_server;

// =============================================================================
// Helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> String {
    let (addr, _handle) = start_server("127.0.0.1:0")
        .await
        .expect("failed to start test relay");
    format!("ws://{addr}/ws")
}

async fn client<P: DirectTransportProvider>(url: &str, provider: P) -> SyncHandle {
    let mut config = SyncConfig::new(url);
    config.tick_interval = Duration::from_millis(50);
    spawn_sync(config, provider, InMemoryTaskStore::new())
        .await
        .expect("client failed to connect")
}

/// Waits for an event matching `pred`, skipping everything else.
async fn wait_for(handle: &mut SyncHandle, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let event = tokio::time::timeout_at(deadline, handle.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("sync loop ended");
        if pred(&event) {
            return event;
        }
    }
}

/// Polls the task list until `pred` holds.
async fn eventually(handle: &SyncHandle, pred: impl Fn(&[Task]) -> bool) -> Vec<Task> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let tasks = handle.list_tasks().await.unwrap();
        if pred(&tasks) {
            return tasks;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition never held, last list: {tasks:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn join(handle: &mut SyncHandle, room: &str) -> Vec<PeerId> {
    handle
        .send(SyncCommand::JoinRoom(room.to_string()))
        .await
        .unwrap();
    match wait_for(handle, |e| matches!(e, SyncEvent::RoomJoined { .. })).await {
        SyncEvent::RoomJoined { peers, .. } => peers,
        _ => unreachable!(),
    }
}

async fn add(handle: &SyncHandle, title: &str, priority: Priority) {
    handle
        .send(SyncCommand::AddTask {
            title: title.to_string(),
            description: None,
            priority,
        })
        .await
        .unwrap();
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn two_clients_converge_on_add_toggle_delete() {
    let url = start_relay().await;
    let net = LoopbackNetwork::new();
    let mut a = client(&url, net.clone()).await;
    let mut b = client(&url, net.clone()).await;

    assert!(join(&mut a, "r1").await.is_empty());
    assert_eq!(join(&mut b, "r1").await, vec![a.local_id().clone()]);
    let b_id = b.local_id().clone();
    wait_for(&mut a, |e| *e == SyncEvent::PeerJoined(b_id.clone())).await;

    add(&a, "Buy milk", Priority::Low).await;
    let on_b = eventually(&b, |tasks| tasks.len() == 1).await;
    let t1 = on_b[0].clone();
    assert_eq!(t1.title, "Buy milk");
    assert_eq!(t1.priority, Priority::Low);
    assert!(!t1.completed);

    b.send(SyncCommand::ToggleTask(t1.id.clone())).await.unwrap();
    let on_a = eventually(&a, |tasks| tasks.first().is_some_and(|t| t.completed)).await;
    assert!(on_a[0].updated_at > t1.updated_at);

    a.send(SyncCommand::DeleteTask(t1.id.clone())).await.unwrap();
    eventually(&a, <[Task]>::is_empty).await;
    eventually(&b, <[Task]>::is_empty).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn relay_carries_sync_while_direct_link_is_stuck() {
    let url = start_relay().await;
    let net = LoopbackNetwork::new();
    net.suppress_candidates(true);
    let mut a = client(&url, net.clone()).await;
    let mut b = client(&url, net.clone()).await;

    join(&mut a, "r1").await;
    join(&mut b, "r1").await;

    add(&a, "Buy milk", Priority::Low).await;
    let on_b = eventually(&b, |tasks| tasks.len() == 1).await;
    assert_eq!(on_b[0].title, "Buy milk");

    let patch = TaskPatch {
        title: Some("Buy oat milk".to_string()),
        ..TaskPatch::default()
    };
    b.send(SyncCommand::UpdateTask {
        id: on_b[0].id.clone(),
        patch,
    })
    .await
    .unwrap();
    eventually(&a, |tasks| {
        tasks.first().is_some_and(|t| t.title == "Buy oat milk")
    })
    .await;

    let a_id = a.local_id().clone();
    let b_id = b.local_id().clone();
    assert!(!net.is_connected(&a_id, &b_id));
}

#[tokio::test]
async fn direct_link_comes_up_and_survives_a_sever() {
    let url = start_relay().await;
    let net = LoopbackNetwork::new();
    let mut a = client(&url, net.clone()).await;
    let mut b = client(&url, net.clone()).await;

    join(&mut a, "r1").await;
    join(&mut b, "r1").await;
    let a_id = a.local_id().clone();
    let b_id = b.local_id().clone();
    wait_for(&mut a, |e| *e == SyncEvent::SessionConnected(b_id.clone())).await;
    wait_for(&mut b, |e| *e == SyncEvent::SessionConnected(a_id.clone())).await;

    assert!(net.sever(&a_id, &b_id));
    wait_for(&mut a, |e| matches!(e, SyncEvent::SessionClosed { .. })).await;

    add(&b, "after sever", Priority::High).await;
    let on_a = eventually(&a, |tasks| tasks.len() == 1).await;
    assert_eq!(on_a[0].priority, Priority::High);
}

#[tokio::test]
async fn late_joiner_catches_up_through_snapshot() {
    let url = start_relay().await;
    let net = LoopbackNetwork::new();
    let mut a = client(&url, net.clone()).await;
    join(&mut a, "r1").await;
    add(&a, "one", Priority::Low).await;
    add(&a, "two", Priority::Medium).await;
    eventually(&a, |tasks| tasks.len() == 2).await;

    let mut b = client(&url, net.clone()).await;
    join(&mut b, "r1").await;
    let a_id = a.local_id().clone();
    wait_for(&mut b, |e| *e == SyncEvent::SessionConnected(a_id.clone())).await;

    let on_b = eventually(&b, |tasks| tasks.len() == 2).await;
    assert_eq!(on_b, a.list_tasks().await.unwrap());
}

#[tokio::test]
async fn late_joiner_catches_up_over_relay_without_direct_link() {
    let url = start_relay().await;
    let net = LoopbackNetwork::new();
    net.suppress_candidates(true);
    let mut a = client(&url, net.clone()).await;
    join(&mut a, "r1").await;
    add(&a, "before b", Priority::High).await;
    eventually(&a, |tasks| tasks.len() == 1).await;

    let mut b = client(&url, net.clone()).await;
    join(&mut b, "r1").await;
    let on_b = eventually(&b, |tasks| tasks.len() == 1).await;
    assert_eq!(on_b, a.list_tasks().await.unwrap());
    assert!(!net.is_connected(a.local_id(), b.local_id()));
}

#[tokio::test]
async fn joiner_shares_tasks_made_before_joining() {
    let url = start_relay().await;
    let net = LoopbackNetwork::new();
    net.suppress_candidates(true);
    let mut a = client(&url, net.clone()).await;
    join(&mut a, "r1").await;

    let mut b = client(&url, net.clone()).await;
    add(&b, "offline draft", Priority::Low).await;
    eventually(&b, |tasks| tasks.len() == 1).await;
    join(&mut b, "r1").await;

    let on_a = eventually(&a, |tasks| tasks.len() == 1).await;
    assert_eq!(on_a[0].title, "offline draft");
}

#[tokio::test]
async fn leaving_stops_sync_with_the_room() {
    let url = start_relay().await;
    let net = LoopbackNetwork::new();
    let mut a = client(&url, net.clone()).await;
    let mut b = client(&url, net.clone()).await;
    join(&mut a, "r1").await;
    join(&mut b, "r1").await;

    b.send(SyncCommand::LeaveRoom).await.unwrap();
    let b_id = b.local_id().clone();
    wait_for(&mut a, |e| *e == SyncEvent::PeerLeft(b_id.clone())).await;

    add(&a, "only for a", Priority::Low).await;
    eventually(&a, |tasks| tasks.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn tcp_direct_link_carries_mutations() {
    let url = start_relay().await;
    let mut a = client(&url, TcpProvider::new("127.0.0.1", Vec::new())).await;
    let mut b = client(&url, TcpProvider::new("127.0.0.1", Vec::new())).await;

    join(&mut a, "r1").await;
    join(&mut b, "r1").await;
    let a_id = a.local_id().clone();
    let b_id = b.local_id().clone();
    wait_for(&mut a, |e| *e == SyncEvent::SessionConnected(b_id.clone())).await;
    wait_for(&mut b, |e| *e == SyncEvent::SessionConnected(a_id.clone())).await;

    add(&a, "over tcp", Priority::Medium).await;
    let on_b = eventually(&b, |tasks| tasks.len() == 1).await;
    assert_eq!(on_b[0].title, "over tcp");
}
