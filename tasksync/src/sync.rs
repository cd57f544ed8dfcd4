//! Sync coordinator: dual-path replication of task mutations.
//!
//! Every local mutation is published twice: once through the relay to the
//! whole room, and once over each established direct link. Receivers apply
//! whichever copy arrives first; the merge rule makes the second a no-op.
//!
//! Catch-up also runs on both paths: a snapshot frame when a direct link
//! comes up, and the list relayed as `Updated` mutations when the room
//! membership changes, so a room whose links never connect still converges.

use std::fmt;

use tasksync_proto::task::{self, PeerFrame, Task, TaskMutation};
use tasksync_proto::relay::RelayMessage;

use crate::session::PeerSessionManager;
use crate::tasks::{InMemoryTaskStore, MergeOutcome, TaskManager, TaskStore};
use crate::transport::relay::RelayOutbound;
use crate::transport::{DirectTransportProvider, PeerId};

/// The path a remote mutation arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Forwarded by the relay.
    Relay,
    /// Received over the direct link with this peer.
    Direct(PeerId),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => write!(f, "relay"),
            Self::Direct(peer) => write!(f, "direct:{peer}"),
        }
    }
}

/// How a mutation was fanned out by [`SyncCoordinator::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Whether the relay copy was queued.
    pub relayed: bool,
    /// Number of direct links the copy reached.
    pub direct: usize,
}

/// Replicates the local task list to the room and merges what comes back.
pub struct SyncCoordinator<S: TaskStore = InMemoryTaskStore> {
    tasks: TaskManager<S>,
}

impl<S: TaskStore> SyncCoordinator<S> {
    /// Wraps a task manager.
    #[must_use]
    pub const fn new(tasks: TaskManager<S>) -> Self {
        Self { tasks }
    }

    /// The local task list.
    #[must_use]
    pub const fn tasks(&self) -> &TaskManager<S> {
        &self.tasks
    }

    /// Mutable access for local edits.
    pub const fn tasks_mut(&mut self) -> &mut TaskManager<S> {
        &mut self.tasks
    }

    /// Sends a local mutation to the room over both paths.
    ///
    /// The relay copy is always sent; the direct copy goes to every
    /// connected session. Failures on either path are logged, never fatal.
    pub async fn publish<P: DirectTransportProvider>(
        &self,
        room_id: &str,
        mutation: &TaskMutation,
        relay: &RelayOutbound,
        sessions: &mut PeerSessionManager<P>,
    ) -> PublishReport {
        let relayed = match relay.send(RelayMessage::Mutation {
            room_id: room_id.to_string(),
            from: String::new(),
            mutation: mutation.clone(),
        }) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(room_id, error = %e, "failed to relay mutation");
                false
            }
        };

        let direct = match task::encode_frame(&PeerFrame::Mutation(mutation.clone())) {
            Ok(frame) => sessions.broadcast(&frame).await,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode peer frame");
                0
            }
        };

        tracing::debug!(
            room_id,
            kind = mutation.kind(),
            task_id = %mutation.task_id(),
            relayed,
            direct,
            "published mutation"
        );
        PublishReport { relayed, direct }
    }

    /// Applies a mutation from the room.
    pub fn on_remote_mutation(&mut self, mutation: &TaskMutation, channel: &Channel) -> MergeOutcome {
        let outcome = self.tasks.apply_remote(mutation);
        tracing::debug!(
            kind = mutation.kind(),
            task_id = %mutation.task_id(),
            %channel,
            ?outcome,
            "remote mutation"
        );
        outcome
    }

    /// Decodes and applies a frame received over a direct link.
    ///
    /// Returns whether the local list changed. Undecodable frames are
    /// logged and dropped.
    pub fn on_peer_frame(&mut self, from: &PeerId, payload: &[u8]) -> bool {
        match task::decode_frame(payload) {
            Ok(PeerFrame::Mutation(mutation)) => self
                .on_remote_mutation(&mutation, &Channel::Direct(from.clone()))
                .changed(),
            Ok(PeerFrame::Snapshot(tasks)) => {
                let changed = self.tasks.merge_snapshot(&tasks);
                tracing::debug!(peer = %from, received = tasks.len(), changed, "merged snapshot");
                changed > 0
            }
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "dropping malformed peer frame");
                false
            }
        }
    }

    /// Sends the full local list to the room over the relay, one `Updated`
    /// mutation per task.
    ///
    /// Receivers merge each entry the way they merge a snapshot frame.
    /// Returns how many mutations were queued.
    pub fn relay_snapshot(&self, room_id: &str, relay: &RelayOutbound) -> usize {
        let mut queued = 0;
        for task in self.tasks.tasks() {
            let msg = RelayMessage::Mutation {
                room_id: room_id.to_string(),
                from: String::new(),
                mutation: TaskMutation::Updated(task),
            };
            if let Err(e) = relay.send(msg) {
                tracing::warn!(room_id, error = %e, "failed to relay snapshot");
                break;
            }
            queued += 1;
        }
        if queued > 0 {
            tracing::debug!(room_id, queued, "relayed snapshot");
        }
        queued
    }

    /// Encodes the full local list for a newly connected peer.
    #[must_use]
    pub fn snapshot_frame(&self) -> Option<Vec<u8>> {
        task::encode_frame(&PeerFrame::Snapshot(self.tasks.tasks()))
            .inspect_err(|e| tracing::error!(error = %e, "failed to encode snapshot"))
            .ok()
    }

    /// Current task list, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Task> {
        self.tasks.tasks()
    }
}
