//! Task model and mutation events shared by every `TaskSync` node.
//!
//! A [`TaskMutation`] is what travels between peers, either inside a
//! [`crate::relay::RelayMessage::Mutation`] broadcast or inside a
//! [`PeerFrame`] on a direct link.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, CodecError};

/// Maximum allowed task title length in characters.
pub const MAX_TASK_TITLE_LENGTH: usize = 256;

/// Globally unique task identifier, assigned at creation and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new time-ordered task identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wraps an existing identifier string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Can wait.
    Low,
    /// The default.
    #[default]
    Medium,
    /// Do it first.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// A single entry in the shared task list.
///
/// `updated_at` only moves forward for a given id. Whichever record carries
/// the latest `updated_at` is authoritative at a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Non-empty title.
    pub title: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Priority bucket.
    pub priority: Priority,
    /// Whether the task is done.
    pub completed: bool,
    /// Creation time in milliseconds since epoch.
    pub created_at: u64,
    /// Last modification time in milliseconds since epoch.
    pub updated_at: u64,
}

/// A change to the task list, as broadcast to the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskMutation {
    /// A task was created.
    Added(Task),
    /// Title, description or priority changed.
    Updated(Task),
    /// The completed flag flipped.
    Toggled(Task),
    /// A task was removed.
    Deleted(TaskId),
}

impl TaskMutation {
    /// Returns the id of the task this mutation concerns.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        match self {
            Self::Added(task) | Self::Updated(task) | Self::Toggled(task) => &task.id,
            Self::Deleted(id) => id,
        }
    }

    /// Short lowercase name of the mutation kind, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated(_) => "updated",
            Self::Toggled(_) => "toggled",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Payload carried over a direct peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerFrame {
    /// A single mutation, mirrored from the relay broadcast.
    Mutation(TaskMutation),
    /// The sender's full task list, sent once when a link comes up.
    Snapshot(Vec<Task>),
}

/// Encodes a [`PeerFrame`] for a direct link.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if serialization fails.
pub fn encode_frame(frame: &PeerFrame) -> Result<Vec<u8>, CodecError> {
    codec::encode(frame)
}

/// Decodes a [`PeerFrame`] received on a direct link.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes are not a valid frame.
pub fn decode_frame(bytes: &[u8]) -> Result<PeerFrame, CodecError> {
    codec::decode(bytes)
}
