//! Last-write-wins merge rule for remote task mutations.
//!
//! Every mutation, whether it arrived over the relay or a direct link, is
//! folded into the local store by [`apply_mutation`]:
//!
//! - `Added` is skipped if the id already exists (first writer wins).
//! - `Updated` and `Toggled` replace the local record unless the incoming
//!   `updated_at` is older than the local one. An unknown id is inserted.
//! - `Deleted` removes the id and leaves a tombstone, so a late `Added`,
//!   `Updated` or `Toggled` for the same id is discarded while the
//!   tombstone lives.
//!
//! A task without an id or with an invalid title is rejected before any of
//! the above, so a remote peer can never store what a local edit could not.
//!
//! Applying the same mutation twice is a no-op the second time, which is
//! what makes dual-path delivery safe.

use std::collections::HashMap;
use std::time::Duration;

use tasksync_proto::task::{Task, TaskId, TaskMutation};
use tokio::time::Instant;

use super::store::TaskStore;
use super::{TaskError, validate_task};

/// Default lifetime of a delete tombstone.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// What [`apply_mutation`] did with a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The store changed.
    Applied,
    /// The store already reflected this mutation.
    Duplicate,
    /// The local record is newer; the mutation was discarded.
    Stale,
    /// The id was recently deleted; the mutation was discarded.
    Tombstoned,
    /// The task failed validation; the mutation was discarded.
    Invalid,
}

impl MergeOutcome {
    /// Whether the store changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Recently deleted task ids.
#[derive(Debug)]
pub struct Tombstones {
    ttl: Duration,
    deleted: HashMap<TaskId, Instant>,
}

impl Default for Tombstones {
    fn default() -> Self {
        Self::new(DEFAULT_TOMBSTONE_TTL)
    }
}

impl Tombstones {
    /// Creates an empty set whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            deleted: HashMap::new(),
        }
    }

    /// Records that `id` was deleted at `now`.
    pub fn record(&mut self, id: TaskId, now: Instant) {
        self.deleted.insert(id, now);
    }

    /// Whether `id` was deleted less than `ttl` before `now`.
    #[must_use]
    pub fn is_live(&self, id: &TaskId, now: Instant) -> bool {
        self.deleted
            .get(id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.ttl)
    }

    /// Drops expired entries, returning how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.deleted.len();
        let ttl = self.ttl;
        self.deleted
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
        before - self.deleted.len()
    }

    /// Number of tombstones held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deleted.len()
    }

    /// Whether no tombstones are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
    }
}

/// Folds one remote mutation into `store`.
pub fn apply_mutation<S: TaskStore + ?Sized>(
    store: &mut S,
    tombstones: &mut Tombstones,
    mutation: &TaskMutation,
    now: Instant,
) -> MergeOutcome {
    if let Err(e) = check(mutation) {
        tracing::debug!(
            kind = mutation.kind(),
            task_id = %mutation.task_id(),
            error = %e,
            "rejecting invalid mutation"
        );
        return MergeOutcome::Invalid;
    }
    match mutation {
        TaskMutation::Added(task) => {
            if tombstones.is_live(&task.id, now) {
                MergeOutcome::Tombstoned
            } else if store.insert(task.clone()) {
                MergeOutcome::Applied
            } else {
                MergeOutcome::Duplicate
            }
        }
        TaskMutation::Updated(task) | TaskMutation::Toggled(task) => {
            if tombstones.is_live(&task.id, now) {
                return MergeOutcome::Tombstoned;
            }
            apply_newer(store, task)
        }
        TaskMutation::Deleted(id) => {
            tombstones.record(id.clone(), now);
            if store.delete(id).is_some() {
                MergeOutcome::Applied
            } else {
                MergeOutcome::Duplicate
            }
        }
    }
}

fn check(mutation: &TaskMutation) -> Result<(), TaskError> {
    match mutation {
        TaskMutation::Added(task) | TaskMutation::Updated(task) | TaskMutation::Toggled(task) => {
            validate_task(task)
        }
        TaskMutation::Deleted(id) if id.as_str().is_empty() => Err(TaskError::IdEmpty),
        TaskMutation::Deleted(_) => Ok(()),
    }
}

fn apply_newer<S: TaskStore + ?Sized>(store: &mut S, incoming: &Task) -> MergeOutcome {
    match store.get(&incoming.id) {
        Some(local) if incoming.updated_at < local.updated_at => MergeOutcome::Stale,
        Some(local) if local == *incoming => MergeOutcome::Duplicate,
        _ => {
            store.replace(incoming.clone());
            MergeOutcome::Applied
        }
    }
}
