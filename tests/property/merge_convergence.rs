//! Property-based convergence tests for the task merge rule.
//!
//! A history of mutations is generated for a handful of tasks: one add,
//! a few updates or toggles with increasing timestamps, and possibly a
//! delete. Replicas receive the history shuffled and with duplicates, the
//! way dual-path delivery produces it, and must all end up with the same
//! list: the newest version of every task that was not deleted.

use proptest::prelude::*;
use tasksync::tasks::merge::DEFAULT_TOMBSTONE_TTL;
use tasksync::tasks::{InMemoryTaskStore, TaskManager};
use tasksync_proto::task::{Priority, Task, TaskId, TaskMutation};

/// Per task: a list of `(is_toggle, completed)` edits, and whether it ends
/// deleted.
type TaskPlan = (Vec<(bool, bool)>, bool);

/// Builds the mutation history and the list every replica should reach.
fn history(plans: Vec<TaskPlan>) -> (Vec<TaskMutation>, Vec<Task>) {
    let mut mutations = Vec::new();
    let mut expected = Vec::new();

    for (i, (edits, deleted)) in plans.into_iter().enumerate() {
        let created_at = 1_000 + i as u64 * 100;
        let base = Task {
            id: TaskId::from_string(format!("t{i}")),
            title: format!("task {i}"),
            description: None,
            priority: Priority::Medium,
            completed: false,
            created_at,
            updated_at: created_at,
        };
        mutations.push(TaskMutation::Added(base.clone()));

        let mut latest = base.clone();
        for (j, (toggle, completed)) in edits.into_iter().enumerate() {
            let mut next = base.clone();
            next.updated_at = created_at + j as u64 + 1;
            next.title = format!("task {i} v{}", j + 1);
            next.completed = completed;
            mutations.push(if toggle {
                TaskMutation::Toggled(next.clone())
            } else {
                TaskMutation::Updated(next.clone())
            });
            latest = next;
        }

        if deleted {
            mutations.push(TaskMutation::Deleted(base.id.clone()));
        } else {
            expected.push(latest);
        }
    }
    (mutations, expected)
}

/// A shuffled history with some mutations delivered twice.
fn arb_delivery() -> impl Strategy<Value = (Vec<TaskMutation>, Vec<Task>)> {
    let plan = (
        prop::collection::vec((any::<bool>(), any::<bool>()), 0..4),
        any::<bool>(),
    );
    prop::collection::vec(plan, 1..5)
        .prop_map(history)
        .prop_flat_map(|(mutations, expected)| {
            let len = mutations.len();
            (
                Just(mutations),
                Just(expected),
                prop::collection::vec(0..len, 0..4),
            )
        })
        .prop_flat_map(|(mut mutations, expected, duplicates)| {
            for i in duplicates {
                mutations.push(mutations[i].clone());
            }
            (Just(mutations).prop_shuffle(), Just(expected))
        })
}

fn replay(mutations: &[TaskMutation]) -> Vec<Task> {
    let mut replica = TaskManager::new(InMemoryTaskStore::new(), DEFAULT_TOMBSTONE_TTL);
    for mutation in mutations {
        replica.apply_remote(mutation);
    }
    replica.tasks()
}

proptest! {
    /// Any delivery order, with duplicates, converges to the newest
    /// surviving version of every task.
    #[test]
    fn shuffled_delivery_converges((mutations, expected) in arb_delivery()) {
        prop_assert_eq!(replay(&mutations), expected);
    }

    /// Two replicas fed different orders agree.
    #[test]
    fn replicas_agree(
        (first, _) in arb_delivery(),
        seed in any::<u64>(),
    ) {
        let mut second = first.clone();
        let len = second.len();
        if len > 1 {
            let split = usize::try_from(seed % len as u64).unwrap_or(0);
            second.rotate_left(split);
        }
        prop_assert_eq!(replay(&first), replay(&second));
    }

    /// Delivering the whole history a second time changes nothing.
    #[test]
    fn redelivery_is_idempotent((mutations, expected) in arb_delivery()) {
        let mut twice = mutations.clone();
        twice.extend(mutations);
        prop_assert_eq!(replay(&twice), expected);
    }
}
