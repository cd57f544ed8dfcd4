//! Task manager: validated local edits and remote merges over a [`TaskStore`].
//!
//! Every local operation returns the [`TaskMutation`] that should be
//! published to the room. Remote mutations and snapshots go through the
//! merge rule in [`super::merge`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tasksync_proto::task::{Priority, Task, TaskId, TaskMutation};
use tokio::time::Instant;

use super::{TaskError, validate_title};
use super::merge::{MergeOutcome, Tombstones, apply_mutation};
use super::store::{InMemoryTaskStore, TaskStore};

/// A partial update to a task. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New description; `Some(None)` clears it.
    pub description: Option<Option<String>>,
    /// New priority.
    pub priority: Option<Priority>,
    /// New completed flag.
    pub completed: Option<bool>,
}

impl TaskPatch {
    /// Whether the patch changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.completed.is_none()
    }
}

/// Owns the local copy of the task list.
pub struct TaskManager<S: TaskStore = InMemoryTaskStore> {
    store: S,
    tombstones: Tombstones,
}

impl<S: TaskStore> TaskManager<S> {
    /// Creates a manager over `store` with the given tombstone lifetime.
    #[must_use]
    pub fn new(store: S, tombstone_ttl: Duration) -> Self {
        Self {
            store,
            tombstones: Tombstones::new(tombstone_ttl),
        }
    }

    /// Returns the current timestamp in milliseconds since epoch.
    fn now_ms() -> u64 {
        u64::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        )
        .unwrap_or(u64::MAX)
    }

    /// Next `updated_at` for a record last stamped at `previous`.
    ///
    /// Strictly greater than `previous` even if the wall clock went backwards.
    fn next_stamp(previous: u64) -> u64 {
        Self::now_ms().max(previous.saturating_add(1))
    }

    fn existing(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.store
            .get(id)
            .ok_or_else(|| TaskError::TaskNotFound(id.to_string()))
    }

    /// Creates a new task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TitleEmpty`] if the title is blank, or
    /// [`TaskError::TitleTooLong`] if it exceeds 256 characters.
    pub fn create_task(
        &mut self,
        title: &str,
        description: Option<String>,
        priority: Priority,
    ) -> Result<TaskMutation, TaskError> {
        validate_title(title)?;
        let now = Self::now_ms();
        let task = Task {
            id: TaskId::new(),
            title: title.to_string(),
            description,
            priority,
            completed: false,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(task.clone());
        tracing::debug!(task_id = %task.id, "task created");
        Ok(TaskMutation::Added(task))
    }

    /// Applies a patch to an existing task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for an unknown id, or a title
    /// validation error if the patch sets an invalid title.
    pub fn update_task(&mut self, id: &TaskId, patch: TaskPatch) -> Result<TaskMutation, TaskError> {
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }
        let mut task = self.existing(id)?;
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(completed) = patch.completed {
            task.completed = completed;
        }
        task.updated_at = Self::next_stamp(task.updated_at);
        self.store.replace(task.clone());
        Ok(TaskMutation::Updated(task))
    }

    /// Flips the completed flag of a task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for an unknown id.
    pub fn toggle_task(&mut self, id: &TaskId) -> Result<TaskMutation, TaskError> {
        let mut task = self.existing(id)?;
        task.completed = !task.completed;
        task.updated_at = Self::next_stamp(task.updated_at);
        self.store.replace(task.clone());
        Ok(TaskMutation::Toggled(task))
    }

    /// Deletes a task and tombstones its id.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for an unknown id.
    pub fn delete_task(&mut self, id: &TaskId) -> Result<TaskMutation, TaskError> {
        self.store
            .delete(id)
            .ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;
        self.tombstones.record(id.clone(), Instant::now());
        Ok(TaskMutation::Deleted(id.clone()))
    }

    /// Folds a mutation received from the room into the local list.
    pub fn apply_remote(&mut self, mutation: &TaskMutation) -> MergeOutcome {
        apply_mutation(
            &mut self.store,
            &mut self.tombstones,
            mutation,
            Instant::now(),
        )
    }

    /// Merges a peer's full list, treating each entry as an update.
    ///
    /// Entries that fail validation are skipped. Returns how many records
    /// changed.
    pub fn merge_snapshot(&mut self, tasks: &[Task]) -> usize {
        let now = Instant::now();
        tasks
            .iter()
            .map(|task| {
                apply_mutation(
                    &mut self.store,
                    &mut self.tombstones,
                    &TaskMutation::Updated(task.clone()),
                    now,
                )
            })
            .filter(|outcome| outcome.changed())
            .count()
    }

    /// Drops expired tombstones.
    pub fn prune_tombstones(&mut self) -> usize {
        self.tombstones.prune(Instant::now())
    }

    /// Returns a task by id.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.store.get(id)
    }

    /// All tasks, oldest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.store.snapshot()
    }
}
