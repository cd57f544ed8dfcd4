//! The shared task list: local operations, storage, and the merge rule.
//!
//! Local edits go through [`TaskManager`], which validates them, stamps
//! timestamps, and returns the [`TaskMutation`](tasksync_proto::task::TaskMutation)
//! to broadcast. Remote mutations are folded in with the last-write-wins
//! rule in [`merge`].

pub mod manager;
pub mod merge;
pub mod store;

pub use manager::{TaskManager, TaskPatch};
pub use merge::{MergeOutcome, Tombstones, apply_mutation};
pub use store::{InMemoryTaskStore, TaskStore};

use tasksync_proto::task::{MAX_TASK_TITLE_LENGTH, Task};
use thiserror::Error;

/// Errors that can occur during local task operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Task title cannot be empty.
    #[error("task title cannot be empty")]
    TitleEmpty,
    /// Task title exceeds the maximum length.
    #[error("task title too long (max 256 characters)")]
    TitleTooLong,
    /// Task with the given ID was not found.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// A task arrived without an id.
    #[error("task id cannot be empty")]
    IdEmpty,
}

/// Checks a title: not blank, at most 256 characters.
///
/// # Errors
///
/// Returns [`TaskError::TitleEmpty`] or [`TaskError::TitleTooLong`].
pub fn validate_title(title: &str) -> Result<(), TaskError> {
    if title.trim().is_empty() {
        return Err(TaskError::TitleEmpty);
    }
    if title.chars().count() > MAX_TASK_TITLE_LENGTH {
        return Err(TaskError::TitleTooLong);
    }
    Ok(())
}

/// Checks a whole task received from the room.
///
/// # Errors
///
/// Returns [`TaskError::IdEmpty`] or a title error.
pub fn validate_task(task: &Task) -> Result<(), TaskError> {
    if task.id.as_str().is_empty() {
        return Err(TaskError::IdEmpty);
    }
    validate_title(&task.title)
}
