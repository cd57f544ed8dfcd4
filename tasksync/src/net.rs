//! Networking event loop tying the relay, the peer sessions and the task
//! list together.
//!
//! [`spawn_sync`] connects to the relay and spawns a single task that owns
//! the [`PeerSessionManager`] and the [`SyncCoordinator`]. The caller talks
//! to it through channels:
//!
//! ```text
//! caller  ─── SyncCommand ──▶  event loop  ◀── relay frames
//!         ◀── SyncEvent ────              ◀── link events
//!                                         ◀── tick (timeouts, tombstones)
//! ```
//!
//! Whenever the room membership changes, the local list is also relayed to
//! the room so a newcomer catches up even if no direct link forms.
//!
//! No session or task state is shared across tasks; every lookup happens
//! inside the loop at the moment it is needed.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tasksync_proto::relay::RelayMessage;
use tasksync_proto::task::{Priority, Task, TaskId, TaskMutation};

use crate::session::{CloseReason, PeerSessionManager, SessionSettings, SessionUpdate};
use crate::sync::{Channel, SyncCoordinator};
use crate::tasks::merge::DEFAULT_TOMBSTONE_TTL;
use crate::tasks::{TaskError, TaskManager, TaskPatch, TaskStore};
use crate::transport::relay::{RelayClient, RelayOptions, RelayOutbound};
use crate::transport::{DirectTransportProvider, LinkEvent, PeerId, TransportError};

/// Default channel capacity for commands and events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default period of the housekeeping tick.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent from the caller to the event loop.
#[derive(Debug)]
pub enum SyncCommand {
    /// Join a room, leaving the current one if any.
    JoinRoom(String),
    /// Leave the current room.
    LeaveRoom,
    /// Create a task.
    AddTask {
        /// Task title.
        title: String,
        /// Optional longer description.
        description: Option<String>,
        /// Priority.
        priority: Priority,
    },
    /// Change fields of a task.
    UpdateTask {
        /// Task to change.
        id: TaskId,
        /// Fields to change.
        patch: TaskPatch,
    },
    /// Flip a task's completed flag.
    ToggleTask(TaskId),
    /// Delete a task.
    DeleteTask(TaskId),
    /// Ask for the current task list.
    ListTasks {
        /// Where to send the list.
        reply: oneshot::Sender<Vec<Task>>,
    },
    /// Stop the event loop.
    Shutdown,
}

/// Events sent from the event loop to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The relay confirmed a join.
    RoomJoined {
        /// The room.
        room_id: String,
        /// Other members at the time of joining.
        peers: Vec<PeerId>,
    },
    /// Another connection joined the room.
    PeerJoined(PeerId),
    /// Another connection left the room.
    PeerLeft(PeerId),
    /// A direct link to a peer came up.
    SessionConnected(PeerId),
    /// A direct link ended; sync to that peer continues over the relay.
    SessionClosed {
        /// The remote peer.
        peer: PeerId,
        /// Why it ended.
        reason: CloseReason,
    },
    /// The local task list changed.
    TasksChanged {
        /// The full list, oldest first.
        tasks: Vec<Task>,
    },
    /// Connection summary.
    ConnectionStatus {
        /// Whether the relay connection is up.
        connected: bool,
        /// Other members in the current room.
        peers: usize,
        /// Members reachable over a direct link.
        direct: usize,
    },
    /// A command failed or the relay went away.
    Error(String),
}

/// Configuration for the sync event loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket URL of the relay server (e.g. `ws://127.0.0.1:9000/ws`).
    pub relay_url: String,
    /// Relay connection timeouts.
    pub relay: RelayOptions,
    /// Direct link negotiation settings.
    pub session: SessionSettings,
    /// How long deleted task ids are remembered.
    pub tombstone_ttl: Duration,
    /// Period of the housekeeping tick.
    pub tick_interval: Duration,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl SyncConfig {
    /// Creates a `SyncConfig` with default settings.
    #[must_use]
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            relay: RelayOptions::default(),
            session: SessionSettings::default(),
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Caller's side of a running event loop.
pub struct SyncHandle {
    local_id: PeerId,
    commands: mpsc::Sender<SyncCommand>,
    events: mpsc::Receiver<SyncEvent>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Connection id the relay assigned to this client.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// A cloneable sender for commands.
    #[must_use]
    pub fn commands(&self) -> mpsc::Sender<SyncCommand> {
        self.commands.clone()
    }

    /// Sends a command to the event loop.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the loop has exited.
    pub async fn send(&self, command: SyncCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Waits for the next event. `None` once the loop has exited.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Fetches the current task list.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the loop has exited.
    pub async fn list_tasks(&self) -> Result<Vec<Task>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncCommand::ListTasks { reply }).await?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)
    }

    /// Stops the event loop and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SyncCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "sync task ended abnormally");
        }
    }
}

/// Connects to the relay and spawns the sync event loop.
///
/// # Errors
///
/// Returns a [`TransportError`] if the relay cannot be reached or does not
/// send its welcome in time.
pub async fn spawn_sync<P, S>(
    config: SyncConfig,
    provider: P,
    store: S,
) -> Result<SyncHandle, TransportError>
where
    P: DirectTransportProvider,
    S: TaskStore,
{
    let relay = RelayClient::connect(&config.relay_url, config.relay).await?;
    let local_id = relay.local_id().clone();
    let outbound = relay.outbound();
    let (sessions, link_events) =
        PeerSessionManager::new(local_id.clone(), provider, outbound.clone(), config.session);
    let sync = SyncCoordinator::new(TaskManager::new(store, config.tombstone_ttl));

    let capacity = config.channel_capacity.max(1);
    let (cmd_tx, cmd_rx) = mpsc::channel::<SyncCommand>(capacity);
    let (evt_tx, evt_rx) = mpsc::channel::<SyncEvent>(capacity);

    let event_loop = EventLoop {
        relay,
        outbound,
        sessions,
        sync,
        room: None,
        events: evt_tx,
    };
    let task = tokio::spawn(event_loop.run(cmd_rx, link_events, config.tick_interval));

    Ok(SyncHandle {
        local_id,
        commands: cmd_tx,
        events: evt_rx,
        task,
    })
}

struct EventLoop<P: DirectTransportProvider, S: TaskStore> {
    relay: RelayClient,
    outbound: RelayOutbound,
    sessions: PeerSessionManager<P>,
    sync: SyncCoordinator<S>,
    room: Option<String>,
    events: mpsc::Sender<SyncEvent>,
}

impl<P: DirectTransportProvider, S: TaskStore> EventLoop<P, S> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SyncCommand>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        tick_interval: Duration,
    ) {
        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.emit_status();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SyncCommand::Shutdown) | None => {
                        tracing::info!("sync loop shutting down");
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                },
                msg = self.relay.recv() => if let Some(msg) = msg {
                    self.on_relay_message(msg).await;
                } else {
                    tracing::warn!("relay connection lost");
                    self.sessions.close_all(&CloseReason::LocalLeave);
                    self.flush_session_updates().await;
                    self.emit_status();
                    self.emit(SyncEvent::Error("relay connection lost".to_string()));
                    break;
                },
                Some(event) = link_events.recv() => self.sessions.handle_link_event(event),
                _ = tick.tick() => {
                    self.sessions.expire_stale(Instant::now()).await;
                    let pruned = self.sync.tasks_mut().prune_tombstones();
                    if pruned > 0 {
                        tracing::trace!(pruned, "pruned tombstones");
                    }
                }
            }
            self.flush_session_updates().await;
        }

        if let Some(room_id) = self.room.take() {
            let _ = self.outbound.send(RelayMessage::LeaveRoom { room_id });
        }
        self.sessions.close_all(&CloseReason::LocalLeave);
    }

    async fn on_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::JoinRoom(room_id) => self.join_room(room_id),
            SyncCommand::LeaveRoom => self.leave_room(),
            SyncCommand::AddTask {
                title,
                description,
                priority,
            } => {
                let result = self
                    .sync
                    .tasks_mut()
                    .create_task(&title, description, priority);
                self.after_local_edit(result).await;
            }
            SyncCommand::UpdateTask { id, patch } => {
                let result = self.sync.tasks_mut().update_task(&id, patch);
                self.after_local_edit(result).await;
            }
            SyncCommand::ToggleTask(id) => {
                let result = self.sync.tasks_mut().toggle_task(&id);
                self.after_local_edit(result).await;
            }
            SyncCommand::DeleteTask(id) => {
                let result = self.sync.tasks_mut().delete_task(&id);
                self.after_local_edit(result).await;
            }
            SyncCommand::ListTasks { reply } => {
                let _ = reply.send(self.sync.list());
            }
            SyncCommand::Shutdown => {}
        }
    }

    fn join_room(&mut self, room_id: String) {
        if room_id.is_empty() {
            self.emit(SyncEvent::Error("room id cannot be empty".to_string()));
            return;
        }
        if self.room.as_deref().is_some_and(|current| current != room_id) {
            // The relay moves us out of the old room on join.
            self.sessions.close_all(&CloseReason::LocalLeave);
        }
        tracing::info!(room_id = %room_id, "joining room");
        if let Err(e) = self.outbound.send(RelayMessage::JoinRoom {
            room_id: room_id.clone(),
        }) {
            self.emit(SyncEvent::Error(format!("join failed: {e}")));
            return;
        }
        self.room = Some(room_id);
    }

    fn leave_room(&mut self) {
        let Some(room_id) = self.room.take() else {
            return;
        };
        tracing::info!(room_id = %room_id, "leaving room");
        if let Err(e) = self.outbound.send(RelayMessage::LeaveRoom { room_id }) {
            tracing::warn!(error = %e, "failed to send leave");
        }
        self.sessions.close_all(&CloseReason::LocalLeave);
    }

    async fn after_local_edit(&mut self, result: Result<TaskMutation, TaskError>) {
        let mutation = match result {
            Ok(mutation) => mutation,
            Err(e) => {
                self.emit(SyncEvent::Error(e.to_string()));
                return;
            }
        };
        if let Some(room_id) = &self.room {
            self.sync
                .publish(room_id, &mutation, &self.outbound, &mut self.sessions)
                .await;
        } else {
            tracing::debug!(kind = mutation.kind(), "not in a room, edit kept local");
        }
        self.emit_tasks();
    }

    fn in_room(&self, room_id: &str) -> bool {
        self.room.as_deref() == Some(room_id)
    }

    async fn on_relay_message(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::RoomPeers { room_id, peers } => {
                if !self.in_room(&room_id) {
                    tracing::debug!(room_id = %room_id, "ignoring peers of a room we left");
                    return;
                }
                let peers: Vec<PeerId> = peers.into_iter().map(PeerId::new).collect();
                tracing::info!(room_id = %room_id, peers = peers.len(), "joined room");
                self.sessions.on_room_peers(&peers).await;
                if !peers.is_empty() {
                    self.sync.relay_snapshot(&room_id, &self.outbound);
                }
                self.emit(SyncEvent::RoomJoined { room_id, peers });
                self.emit_status();
            }
            RelayMessage::PeerJoined { room_id, conn_id } => {
                if self.in_room(&room_id) {
                    let peer = PeerId::new(conn_id);
                    tracing::info!(room_id = %room_id, peer = %peer, "peer joined");
                    self.sessions.on_peer_joined(peer.clone()).await;
                    self.sync.relay_snapshot(&room_id, &self.outbound);
                    self.emit(SyncEvent::PeerJoined(peer));
                    self.emit_status();
                }
            }
            RelayMessage::PeerLeft { room_id, conn_id } => {
                if self.in_room(&room_id) {
                    let peer = PeerId::new(conn_id);
                    tracing::info!(room_id = %room_id, peer = %peer, "peer left");
                    self.sessions.on_peer_left(&peer);
                    self.emit(SyncEvent::PeerLeft(peer));
                    self.emit_status();
                }
            }
            RelayMessage::Offer(offer) => {
                if let Err(e) = self.sessions.on_offer(offer).await {
                    tracing::debug!(error = %e, "offer not answered");
                }
            }
            RelayMessage::Answer(answer) => {
                if let Err(e) = self.sessions.on_answer(answer).await {
                    tracing::debug!(error = %e, "answer dropped");
                }
            }
            RelayMessage::IceCandidate(candidate) => {
                if let Err(e) = self.sessions.on_ice_candidate(candidate).await {
                    tracing::debug!(error = %e, "candidate dropped");
                }
            }
            RelayMessage::Mutation {
                room_id,
                from,
                mutation,
            } => {
                if !self.in_room(&room_id) {
                    return;
                }
                tracing::trace!(from = %from, "mutation via relay");
                if self
                    .sync
                    .on_remote_mutation(&mutation, &Channel::Relay)
                    .changed()
                {
                    self.emit_tasks();
                }
            }
            RelayMessage::Welcome { .. }
            | RelayMessage::JoinRoom { .. }
            | RelayMessage::LeaveRoom { .. } => {
                tracing::warn!(kind = msg.kind(), "unexpected relay message");
            }
        }
    }

    async fn flush_session_updates(&mut self) {
        loop {
            let updates = self.sessions.drain_updates();
            if updates.is_empty() {
                break;
            }
            for update in updates {
                self.on_session_update(update).await;
            }
        }
    }

    async fn on_session_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Connected(peer) => {
                if let Some(snapshot) = self.sync.snapshot_frame()
                    && let Err(e) = self.sessions.send_to(&peer, &snapshot).await
                {
                    tracing::warn!(peer = %peer, error = %e, "failed to send snapshot");
                }
                self.emit(SyncEvent::SessionConnected(peer));
                self.emit_status();
            }
            SessionUpdate::Closed { peer, reason } => {
                self.emit(SyncEvent::SessionClosed { peer, reason });
                self.emit_status();
            }
            SessionUpdate::Frame { peer, payload } => {
                if self.sync.on_peer_frame(&peer, &payload) {
                    self.emit_tasks();
                }
            }
        }
    }

    fn emit_tasks(&self) {
        self.emit(SyncEvent::TasksChanged {
            tasks: self.sync.list(),
        });
    }

    fn emit_status(&self) {
        self.emit(SyncEvent::ConnectionStatus {
            connected: self.relay.is_connected(),
            peers: self.sessions.member_count(),
            direct: self.sessions.connected_count(),
        });
    }

    /// Queues an event for the caller. A full queue drops the event; the
    /// list and status can always be re-read.
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(error = %e, "sync event dropped");
        }
    }
}
