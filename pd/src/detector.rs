//! Parallel task detector: select ready tasks under all constraints.
//!
//! Ranking: REWORK before QUEUED (reworks drain first), then priority
//! P0 > P1 > P2, then created_at ascending. A candidate is ready when all
//! dependencies are COMPLETED and its target files conflict neither with
//! the lock table nor with an earlier pick in the same batch (greedy, so a
//! batch is internally consistent).

use std::collections::HashSet;

use pmstore::task::Task;
use pmstore::{dependency, lock, Store, TaskStatus};
use tracing::debug;

/// Up to `limit` launchable tasks for the order, in ranking order.
pub fn find_launchable(
    store: &Store,
    project_id: &str,
    order_id: &str,
    limit: usize,
) -> pmstore::Result<Vec<Task>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    store.read(|conn| {
        let mut candidates: Vec<Task> = Vec::new();
        for status in [TaskStatus::Rework, TaskStatus::Queued] {
            candidates.extend(pmstore::task::list_tasks(conn, project_id, order_id, Some(status))?);
        }

        // REWORK outranks QUEUED; within a bucket priority then age
        candidates.sort_by(|a, b| {
            let bucket = |t: &Task| if t.status == TaskStatus::Rework { 0 } else { 1 };
            bucket(a)
                .cmp(&bucket(b))
                .then(a.priority.rank().cmp(&b.priority.rank()))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let mut selected: Vec<Task> = Vec::new();
        let mut batch_paths: HashSet<String> = HashSet::new();

        for task in candidates {
            if selected.len() == limit {
                break;
            }

            if !dependency::deps_all_completed(conn, project_id, &task.id)? {
                debug!(task_id = %task.id, "find_launchable: dependencies pending, skipping");
                continue;
            }

            if task
                .target_files
                .iter()
                .any(|path| batch_paths.contains(path))
            {
                debug!(task_id = %task.id, "find_launchable: conflicts with earlier pick, skipping");
                continue;
            }

            let (can_start, blockers) =
                lock::can_task_start(conn, project_id, &task.id, &task.target_files)?;
            if !can_start {
                debug!(task_id = %task.id, ?blockers, "find_launchable: lock conflict, skipping");
                continue;
            }

            batch_paths.extend(task.target_files.iter().cloned());
            selected.push(task);
        }

        debug!(
            project_id,
            order_id,
            selected = selected.len(),
            "find_launchable: done"
        );
        Ok(selected)
    })
}
