//! Task storage boundary.
//!
//! The sync layer only needs keyed get/put/delete over task records, so
//! storage sits behind [`TaskStore`]. [`InMemoryTaskStore`] backs the demo
//! binary and the tests.

use std::collections::HashMap;

use tasksync_proto::task::{Task, TaskId};

/// Keyed record store for tasks.
pub trait TaskStore: Send + Sync + 'static {
    /// Returns a copy of the task with the given id.
    fn get(&self, id: &TaskId) -> Option<Task>;

    /// Inserts a task that is not yet present. Returns `false` (and leaves
    /// the store unchanged) if the id already exists.
    fn insert(&mut self, task: Task) -> bool;

    /// Inserts or overwrites a task, returning the previous record.
    fn replace(&mut self, task: Task) -> Option<Task>;

    /// Removes a task, returning it if it existed.
    fn delete(&mut self, id: &TaskId) -> Option<Task>;

    /// All tasks, oldest first.
    fn snapshot(&self) -> Vec<Task>;
}

/// [`TaskStore`] backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: HashMap<TaskId, Task>,
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).cloned()
    }

    fn insert(&mut self, task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        self.tasks.insert(task.id.clone(), task);
        true
    }

    fn replace(&mut self, task: Task) -> Option<Task> {
        self.tasks.insert(task.id.clone(), task)
    }

    fn delete(&mut self, id: &TaskId) -> Option<Task> {
        self.tasks.remove(id)
    }

    fn snapshot(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }
}
