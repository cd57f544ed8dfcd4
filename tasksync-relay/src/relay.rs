//! Relay server core: shared state, WebSocket handler, and signaling routes.
//!
//! Every accepted WebSocket gets a fresh connection id, announced to the
//! client in a `Welcome` frame. The relay then tracks room membership,
//! forwards negotiation envelopes to the connection named in `to`, and fans
//! task mutations out to the rest of the sender's room. It holds no task
//! state of its own.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tasksync_proto::relay::{self, Negotiation, RelayMessage};
use tasksync_proto::task::TaskMutation;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::rooms::{Departure, RoomRegistry};

/// Default maximum accepted frame size in bytes (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Shared relay server state holding the connection map and room registry.
pub struct RelayState {
    /// Maps connection id to a channel sender for its WebSocket writer.
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    /// Room membership.
    pub rooms: RoomRegistry,
    /// Frames larger than this are dropped unread.
    max_frame_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with the default frame size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a relay state with a custom frame size limit.
    #[must_use]
    pub fn with_config(max_frame_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            rooms: RoomRegistry::new(),
            max_frame_size,
        }
    }

    /// Registers a connection, storing the sender half of its message channel.
    pub async fn register(&self, conn_id: &str, sender: mpsc::UnboundedSender<Message>) {
        let mut conns = self.connections.write().await;
        conns.insert(conn_id.to_string(), sender);
    }

    /// Removes a connection from the map, returning the sender if it existed.
    pub async fn unregister(&self, conn_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        let mut conns = self.connections.write().await;
        conns.remove(conn_id)
    }

    /// Returns a clone of the sender for the given connection, if live.
    pub async fn get_sender(&self, conn_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        let conns = self.connections.read().await;
        conns.get(conn_id).cloned()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a WebSocket Close frame to every live connection.
    ///
    /// Each writer task forwards the close frame, which makes the client-side
    /// reader observe the disconnect.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn_id, sender) in conns.iter() {
            tracing::info!(conn_id = %conn_id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }
}

/// Generates a process-unique connection id.
fn next_conn_id() -> String {
    Uuid::now_v7().to_string()
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Assign a connection id and send `Welcome`.
/// 2. Forward queued outbound frames from a writer task.
/// 3. Dispatch inbound frames until the socket closes.
/// 4. Drop the connection from its room and tell the remaining members.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let conn_id = next_conn_id();

    let welcome = RelayMessage::Welcome {
        conn_id: conn_id.clone(),
    };
    if let Err(e) = send_relay_msg(&mut ws_sender, &welcome).await {
        tracing::warn!(conn_id = %conn_id, error = %e, "failed to send welcome");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.register(&conn_id, tx).await;
    tracing::info!(conn_id = %conn_id, "connection accepted");

    let writer_conn_id = conn_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn_id = %writer_conn_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_conn_id = conn_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(&reader_conn_id, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(conn_id = %reader_conn_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(&conn_id).await;
    on_disconnect(&state, &conn_id).await;
    tracing::info!(conn_id = %conn_id, "connection closed");
}

/// Decodes, validates, and dispatches one inbound frame.
///
/// Malformed frames are dropped without a reply.
async fn handle_binary_message(conn_id: &str, data: &[u8], state: &Arc<RelayState>) {
    if data.len() > state.max_frame_size {
        tracing::warn!(
            conn_id = %conn_id,
            size = data.len(),
            max = state.max_frame_size,
            "dropping oversized frame"
        );
        return;
    }

    let msg = match relay::decode(data) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, error = %e, "failed to decode frame");
            return;
        }
    };

    if let Err(e) = msg.validate() {
        tracing::warn!(conn_id = %conn_id, kind = msg.kind(), error = %e, "dropping invalid envelope");
        return;
    }

    match msg {
        RelayMessage::JoinRoom { room_id } => on_join(state, conn_id, &room_id).await,
        RelayMessage::LeaveRoom { room_id } => on_leave(state, conn_id, &room_id).await,
        RelayMessage::Offer(n) => on_directed(state, conn_id, n, RelayMessage::Offer).await,
        RelayMessage::Answer(n) => on_directed(state, conn_id, n, RelayMessage::Answer).await,
        RelayMessage::IceCandidate(n) => {
            on_directed(state, conn_id, n, RelayMessage::IceCandidate).await;
        }
        RelayMessage::Mutation {
            room_id, mutation, ..
        } => on_broadcast_mutation(state, &room_id, mutation, conn_id).await,
        RelayMessage::Welcome { .. }
        | RelayMessage::RoomPeers { .. }
        | RelayMessage::PeerJoined { .. }
        | RelayMessage::PeerLeft { .. } => {
            tracing::warn!(conn_id = %conn_id, "relay-only message from client");
        }
    }
}

/// Adds the connection to a room, replies with the other members, and
/// announces the joiner to them.
pub async fn on_join(state: &Arc<RelayState>, conn_id: &str, room_id: &str) {
    let outcome = state.rooms.join(room_id, conn_id).await;
    tracing::info!(
        conn_id = %conn_id,
        room_id = %room_id,
        peers = outcome.peers.len(),
        "joined room"
    );

    if let Some(previous) = outcome.previous {
        announce_departure(state, conn_id, &previous).await;
    }

    let reply = RelayMessage::RoomPeers {
        room_id: room_id.to_string(),
        peers: outcome.peers.clone(),
    };
    send_to_conn(state, conn_id, &reply).await;

    let joined = RelayMessage::PeerJoined {
        room_id: room_id.to_string(),
        conn_id: conn_id.to_string(),
    };
    broadcast(state, &outcome.peers, &joined).await;
}

/// Removes the connection from a room and tells the remaining members.
pub async fn on_leave(state: &Arc<RelayState>, conn_id: &str, room_id: &str) {
    let Some(remaining) = state.rooms.leave(room_id, conn_id).await else {
        tracing::debug!(conn_id = %conn_id, room_id = %room_id, "leave for a room not joined");
        return;
    };
    tracing::info!(conn_id = %conn_id, room_id = %room_id, "left room");
    let departure = Departure {
        room_id: room_id.to_string(),
        remaining,
    };
    announce_departure(state, conn_id, &departure).await;
}

/// Removes a closed connection from every room it was in.
pub async fn on_disconnect(state: &Arc<RelayState>, conn_id: &str) {
    for departure in state.rooms.drop_connection(conn_id).await {
        announce_departure(state, conn_id, &departure).await;
    }
}

/// Forwards a negotiation envelope to its target with `from` stamped.
///
/// The sender-provided `from` is discarded. An unknown target is a routing
/// failure and the envelope is dropped.
pub async fn on_directed(
    state: &Arc<RelayState>,
    conn_id: &str,
    envelope: Negotiation,
    wrap: fn(Negotiation) -> RelayMessage,
) {
    let to = envelope.to.clone();
    let stamped = wrap(Negotiation {
        from: conn_id.to_string(),
        to: envelope.to,
        payload: envelope.payload,
    });

    if state.get_sender(&to).await.is_none() {
        tracing::debug!(
            from = %conn_id,
            to = %to,
            kind = stamped.kind(),
            "routing failure: target not connected"
        );
        return;
    }

    tracing::debug!(from = %conn_id, to = %to, kind = stamped.kind(), "forwarding envelope");
    send_to_conn(state, &to, &stamped).await;
}

/// Forwards a mutation to every member of `room_id` except the sender.
///
/// A sender that is not currently in `room_id` is dropped, so in-flight
/// mutations from a connection that switched rooms never reach the old one.
pub async fn on_broadcast_mutation(
    state: &Arc<RelayState>,
    room_id: &str,
    mutation: TaskMutation,
    exclude_conn_id: &str,
) {
    if state.rooms.room_of(exclude_conn_id).await.as_deref() != Some(room_id) {
        tracing::debug!(
            from = %exclude_conn_id,
            room_id = %room_id,
            kind = mutation.kind(),
            "dropping mutation from a non-member"
        );
        return;
    }

    let targets: Vec<String> = state
        .rooms
        .members(room_id)
        .await
        .into_iter()
        .filter(|m| m != exclude_conn_id)
        .collect();

    tracing::debug!(
        from = %exclude_conn_id,
        room_id = %room_id,
        kind = mutation.kind(),
        task_id = %mutation.task_id(),
        targets = targets.len(),
        "broadcasting mutation"
    );

    let msg = RelayMessage::Mutation {
        room_id: room_id.to_string(),
        from: exclude_conn_id.to_string(),
        mutation,
    };
    broadcast(state, &targets, &msg).await;
}

async fn announce_departure(state: &Arc<RelayState>, conn_id: &str, departure: &Departure) {
    let left = RelayMessage::PeerLeft {
        room_id: departure.room_id.clone(),
        conn_id: conn_id.to_string(),
    };
    broadcast(state, &departure.remaining, &left).await;
}

/// Encodes once and sends to each listed connection that is still live.
async fn broadcast(state: &Arc<RelayState>, targets: &[String], msg: &RelayMessage) {
    if targets.is_empty() {
        return;
    }
    let bytes = match relay::encode(msg) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, kind = msg.kind(), "failed to encode broadcast");
            return;
        }
    };
    let conns = state.connections.read().await;
    for target in targets {
        if let Some(sender) = conns.get(target) {
            let _ = sender.send(Message::Binary(bytes.clone().into()));
        }
    }
}

/// Sends a relay message to a live connection via its channel.
async fn send_to_conn(state: &Arc<RelayState>, conn_id: &str, msg: &RelayMessage) {
    if let Some(sender) = state.get_sender(conn_id).await
        && let Ok(bytes) = relay::encode(msg)
    {
        let _ = sender.send(Message::Binary(bytes.into()));
    }
}

/// Encodes and sends a relay message directly on a WebSocket sender.
async fn send_relay_msg(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &RelayMessage,
) -> Result<(), String> {
    let bytes = relay::encode(msg).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Use [`RelayState::with_config`] to apply the frame size limit from the
/// resolved [`crate::config::RelayConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
