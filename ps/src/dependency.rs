//! Task dependency edges. Set at plan time; immutable except by redesign.

use rusqlite::Connection;

use crate::error::Result;
use crate::task::Task;

/// Insert one dependency edge.
pub fn add_dependency(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    depends_on: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id, project_id)
         VALUES (?1, ?2, ?3)",
        rusqlite::params![task_id, depends_on, project_id],
    )?;
    Ok(())
}

/// Remove every dependency edge of a task (redesign only).
pub fn clear_dependencies(conn: &Connection, project_id: &str, task_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM task_dependencies WHERE task_id = ?1 AND project_id = ?2",
        rusqlite::params![task_id, project_id],
    )?)
}

/// Ids this task depends on.
pub fn deps_of(conn: &Connection, project_id: &str, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_task_id FROM task_dependencies
         WHERE task_id = ?1 AND project_id = ?2 ORDER BY depends_on_task_id",
    )?;
    let mut deps = Vec::new();
    for row in stmt.query_map(rusqlite::params![task_id, project_id], |row| {
        row.get::<_, String>(0)
    })? {
        deps.push(row?);
    }
    Ok(deps)
}

/// Ids of tasks that depend on this task.
pub fn dependents_of(conn: &Connection, project_id: &str, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT task_id FROM task_dependencies
         WHERE depends_on_task_id = ?1 AND project_id = ?2 ORDER BY task_id",
    )?;
    let mut deps = Vec::new();
    for row in stmt.query_map(rusqlite::params![task_id, project_id], |row| {
        row.get::<_, String>(0)
    })? {
        deps.push(row?);
    }
    Ok(deps)
}

/// Whether every dependency of the task is COMPLETED.
pub fn deps_all_completed(conn: &Connection, project_id: &str, task_id: &str) -> Result<bool> {
    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM task_dependencies d
         JOIN tasks t ON t.id = d.depends_on_task_id AND t.project_id = d.project_id
         WHERE d.task_id = ?1 AND d.project_id = ?2 AND t.status != 'COMPLETED'",
        rusqlite::params![task_id, project_id],
        |row| row.get(0),
    )?;
    Ok(pending == 0)
}

/// BLOCKED tasks in the order whose dependencies are in fact all COMPLETED.
/// These are either freshly unblocked or drift the reconciliation pass heals.
pub fn ready_blocked_tasks(
    conn: &Connection,
    project_id: &str,
    order_id: &str,
) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM tasks t
         WHERE t.project_id = ?1 AND t.order_id = ?2 AND t.status = 'BLOCKED'
           AND NOT EXISTS (
               SELECT 1 FROM task_dependencies d
               JOIN tasks dep ON dep.id = d.depends_on_task_id AND dep.project_id = d.project_id
               WHERE d.task_id = t.id AND d.project_id = t.project_id
                 AND dep.status != 'COMPLETED'
           )
         ORDER BY t.id",
    )?;
    let mut tasks = Vec::new();
    for row in stmt.query_map(rusqlite::params![project_id, order_id], Task::from_row)? {
        tasks.push(row?);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{create_task, transition_task, NewTask};
    use crate::testutil::{seed_order, seed_project};
    use crate::types::{Role, TaskStatus};
    use crate::Store;

    fn new_task(order: &str, title: &str, deps: &[&str]) -> NewTask {
        NewTask {
            order_id: order.to_string(),
            title: title.to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            ..NewTask::default()
        }
    }

    #[test]
    fn test_deps_and_dependents() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");

        let a = create_task(&store, "demo", &new_task("ORDER_001", "A", &[])).unwrap();
        let b = create_task(&store, "demo", &new_task("ORDER_001", "B", &[&a.id])).unwrap();

        store
            .read(|conn| {
                assert_eq!(deps_of(conn, "demo", &b.id)?, vec![a.id.clone()]);
                assert_eq!(dependents_of(conn, "demo", &a.id)?, vec![b.id.clone()]);
                assert!(deps_all_completed(conn, "demo", &a.id)?);
                assert!(!deps_all_completed(conn, "demo", &b.id)?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_ready_blocked_tasks() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");

        let a = create_task(&store, "demo", &new_task("ORDER_001", "A", &[])).unwrap();
        let b = create_task(&store, "demo", &new_task("ORDER_001", "B", &[&a.id])).unwrap();

        store
            .with_txn(|txn| {
                assert!(ready_blocked_tasks(txn, "demo", "ORDER_001")?.is_empty());

                transition_task(txn, "demo", &a.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &a.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &a.id, TaskStatus::Completed, Role::Pm, "PM", None)?;

                let ready = ready_blocked_tasks(txn, "demo", "ORDER_001")?;
                assert_eq!(ready.len(), 1);
                assert_eq!(ready[0].id, b.id);
                Ok(())
            })
            .unwrap();
    }
}
