//! Task records and the task state machine.
//!
//! Every status mutation flows through [`transition_task`], which validates
//! against the rule table, applies the transition's side effects
//! (reject counter, reviewed_at, lock release), and records history — all
//! inside the caller's transaction.

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::db::now_iso;
use crate::dependency;
use crate::error::{Result, StoreError};
use crate::history;
use crate::ids;
use crate::lock;
use crate::transition;
use crate::types::{EntityKind, Model, Priority, Role, TaskStatus};
use crate::Store;

/// A task row.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub order_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assignee: Option<String>,
    pub recommended_model: Option<Model>,
    pub complexity_score: Option<i64>,
    pub target_files: Vec<String>,
    pub is_destructive_db_change: bool,
    pub reject_count: u32,
    pub reviewed_at: Option<String>,
    pub static_analysis_score: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status_text: String = row.get("status")?;
        let priority_text: String = row.get("priority")?;
        let model_text: Option<String> = row.get("recommended_model")?;
        let target_files_json: Option<String> = row.get("target_files")?;

        let parse_err = |e: Box<dyn std::error::Error + Send + Sync>| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e)
        };

        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            order_id: row.get("order_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            status: status_text
                .parse()
                .map_err(|e: StoreError| parse_err(Box::new(e)))?,
            priority: priority_text
                .parse()
                .map_err(|e: StoreError| parse_err(Box::new(e)))?,
            assignee: row.get("assignee")?,
            recommended_model: match model_text {
                Some(text) => Some(text.parse().map_err(|e: StoreError| parse_err(Box::new(e)))?),
                None => None,
            },
            complexity_score: row.get("complexity_score")?,
            target_files: match target_files_json {
                Some(json) if !json.is_empty() => {
                    serde_json::from_str(&json).map_err(|e| parse_err(Box::new(e)))?
                }
                _ => Vec::new(),
            },
            is_destructive_db_change: row.get::<_, i64>("is_destructive_db_change")? != 0,
            reject_count: row.get::<_, i64>("reject_count")? as u32,
            reviewed_at: row.get("reviewed_at")?,
            static_analysis_score: row.get("static_analysis_score")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for task creation.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub order_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub recommended_model: Option<Model>,
    pub complexity_score: Option<i64>,
    pub depends_on: Vec<String>,
    pub target_files: Vec<String>,
    pub is_destructive_db_change: bool,
}

/// Result of a [`transition_task`] call.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// false when from == to (idempotent re-execution; no history row)
    pub changed: bool,
    /// Locks released because the task left IN_PROGRESS
    pub released_locks: usize,
    /// reject_count after the transition
    pub reject_count: u32,
}

/// Create a task with an allocated id. Initial status is QUEUED when the
/// task has no dependencies, BLOCKED otherwise.
///
/// The id allocation races with concurrent writers, so the whole creation
/// runs in a small retry loop that re-allocates on a unique-key violation.
pub fn create_task(store: &Store, project_id: &str, new: &NewTask) -> Result<Task> {
    ids::validate_project_id(project_id)?;
    ids::validate_order_id(&new.order_id)?;
    for dep in &new.depends_on {
        ids::validate_task_id(dep)?;
    }

    const MAX_ATTEMPTS: u32 = 3;
    for attempt in 1..=MAX_ATTEMPTS {
        let result = store.with_txn(|txn| insert_task(txn, project_id, new));
        match result {
            Ok(task) => return Ok(task),
            Err(e) if e.is_constraint_violation() && attempt < MAX_ATTEMPTS => {
                debug!(attempt, "create_task: id allocation race, retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::IdAllocation {
        kind: EntityKind::Task,
        attempts: MAX_ATTEMPTS,
    })
}

fn insert_task(conn: &Connection, project_id: &str, new: &NewTask) -> Result<Task> {
    let order_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM orders WHERE id = ?1 AND project_id = ?2",
            rusqlite::params![new.order_id, project_id],
            |row| row.get(0),
        )
        .optional()?;
    if order_exists.is_none() {
        return Err(StoreError::NotFound {
            kind: EntityKind::Order,
            id: new.order_id.clone(),
            project_id: project_id.to_string(),
        });
    }

    for dep in &new.depends_on {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM tasks WHERE id = ?1 AND project_id = ?2",
                rusqlite::params![dep, project_id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Err(StoreError::DependencyMissing {
                task_id: new.title.clone(),
                depends_on: dep.clone(),
            });
        }
    }

    let task_id = ids::next_task_id(conn, project_id)?;
    let initial = if new.depends_on.is_empty() {
        TaskStatus::Queued
    } else {
        TaskStatus::Blocked
    };
    transition::validate(conn, EntityKind::Task, None, initial.as_str(), Role::Pm)?;

    let now = now_iso();
    let target_files_json = serde_json::to_string(&new.target_files)?;
    conn.execute(
        "INSERT INTO tasks
             (id, project_id, order_id, title, description, status, priority,
              recommended_model, complexity_score, target_files,
              is_destructive_db_change, reject_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?12)",
        rusqlite::params![
            task_id,
            project_id,
            new.order_id,
            new.title,
            new.description,
            initial.as_str(),
            new.priority.as_str(),
            new.recommended_model.map(|m| m.as_str()),
            new.complexity_score,
            target_files_json,
            new.is_destructive_db_change as i64,
            now,
        ],
    )?;

    for dep in &new.depends_on {
        dependency::add_dependency(conn, project_id, &task_id, dep)?;
    }

    history::record(
        conn,
        EntityKind::Task,
        &task_id,
        "status",
        None,
        Some(initial.as_str()),
        "PM",
        Some("task created"),
        project_id,
    )?;

    get_task(conn, project_id, &task_id)?.ok_or_else(|| StoreError::NotFound {
        kind: EntityKind::Task,
        id: task_id,
        project_id: project_id.to_string(),
    })
}

/// Fetch one task.
pub fn get_task(conn: &Connection, project_id: &str, task_id: &str) -> Result<Option<Task>> {
    Ok(conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1 AND project_id = ?2",
            rusqlite::params![task_id, project_id],
            Task::from_row,
        )
        .optional()?)
}

/// Fetch one task, erroring when absent.
pub fn get_task_required(conn: &Connection, project_id: &str, task_id: &str) -> Result<Task> {
    get_task(conn, project_id, task_id)?.ok_or_else(|| StoreError::NotFound {
        kind: EntityKind::Task,
        id: task_id.to_string(),
        project_id: project_id.to_string(),
    })
}

/// Tasks in an order, optionally filtered by status, ordered by id.
pub fn list_tasks(
    conn: &Connection,
    project_id: &str,
    order_id: &str,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE project_id = ?1 AND order_id = ?2 AND status = ?3
                 ORDER BY id",
            )?;
            for row in stmt.query_map(
                rusqlite::params![project_id, order_id, status.as_str()],
                Task::from_row,
            )? {
                tasks.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks WHERE project_id = ?1 AND order_id = ?2 ORDER BY id",
            )?;
            for row in stmt.query_map(rusqlite::params![project_id, order_id], Task::from_row)? {
                tasks.push(row?);
            }
        }
    }
    Ok(tasks)
}

/// Tasks with status DONE and reviewed_at still null: awaiting review.
pub fn find_reviewable(conn: &Connection, project_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM tasks
         WHERE project_id = ?1 AND status = 'DONE' AND reviewed_at IS NULL
         ORDER BY updated_at",
    )?;
    let mut tasks = Vec::new();
    for row in stmt.query_map([project_id], Task::from_row)? {
        tasks.push(row?);
    }
    Ok(tasks)
}

/// Apply a status transition with its side effects. See module docs.
pub fn transition_task(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    to: TaskStatus,
    role: Role,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<TransitionOutcome> {
    let task = get_task_required(conn, project_id, task_id)?;
    let from = task.status;
    let now = now_iso();

    if from == to {
        // Idempotent re-execution: touch the timestamp, no history row.
        conn.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2 AND project_id = ?3",
            rusqlite::params![now, task_id, project_id],
        )?;
        return Ok(TransitionOutcome {
            from,
            to,
            changed: false,
            released_locks: 0,
            reject_count: task.reject_count,
        });
    }

    transition::validate(conn, EntityKind::Task, Some(from.as_str()), to.as_str(), role)?;

    let mut reject_count = task.reject_count;
    match (from, to) {
        (TaskStatus::Done, TaskStatus::Rework) => {
            // reviewed_at stays set here; it is cleared on the subsequent
            // REWORK -> IN_PROGRESS so the task becomes reviewable again.
            reject_count += 1;
            conn.execute(
                "UPDATE tasks SET status = ?1, reject_count = reject_count + 1, updated_at = ?2
                 WHERE id = ?3 AND project_id = ?4",
                rusqlite::params![to.as_str(), now, task_id, project_id],
            )?;
        }
        (TaskStatus::Rework, TaskStatus::InProgress) => {
            conn.execute(
                "UPDATE tasks SET status = ?1, reviewed_at = NULL, updated_at = ?2
                 WHERE id = ?3 AND project_id = ?4",
                rusqlite::params![to.as_str(), now, task_id, project_id],
            )?;
        }
        _ => {
            conn.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND project_id = ?4",
                rusqlite::params![to.as_str(), now, task_id, project_id],
            )?;
        }
    }

    let released_locks = if from == TaskStatus::InProgress && to != TaskStatus::InProgress {
        lock::release_locks(conn, project_id, task_id)?
    } else {
        0
    };

    history::record(
        conn,
        EntityKind::Task,
        task_id,
        "status",
        Some(from.as_str()),
        Some(to.as_str()),
        changed_by,
        reason,
        project_id,
    )?;

    debug!(
        project_id,
        task_id,
        from = from.as_str(),
        to = to.as_str(),
        released_locks,
        "transition_task: applied"
    );

    Ok(TransitionOutcome {
        from,
        to,
        changed: true,
        released_locks,
        reject_count,
    })
}

/// Update the assignee (audited, no status change).
pub fn set_assignee(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    assignee: &str,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<()> {
    let task = get_task_required(conn, project_id, task_id)?;
    conn.execute(
        "UPDATE tasks SET assignee = ?1, updated_at = ?2 WHERE id = ?3 AND project_id = ?4",
        rusqlite::params![assignee, now_iso(), task_id, project_id],
    )?;
    history::record(
        conn,
        EntityKind::Task,
        task_id,
        "assignee",
        task.assignee.as_deref(),
        Some(assignee),
        changed_by,
        reason,
        project_id,
    )?;
    Ok(())
}

/// Claim a review: set reviewed_at. A task is reviewable iff status = DONE
/// and reviewed_at is null; the set is atomic within the caller's txn.
pub fn set_reviewed_at(conn: &Connection, project_id: &str, task_id: &str) -> Result<String> {
    let now = now_iso();
    conn.execute(
        "UPDATE tasks SET reviewed_at = ?1, updated_at = ?1 WHERE id = ?2 AND project_id = ?3",
        rusqlite::params![now, task_id, project_id],
    )?;
    Ok(now)
}

/// Upgrade the recommended model (audited).
pub fn set_recommended_model(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    model: Model,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<()> {
    let task = get_task_required(conn, project_id, task_id)?;
    conn.execute(
        "UPDATE tasks SET recommended_model = ?1, updated_at = ?2
         WHERE id = ?3 AND project_id = ?4",
        rusqlite::params![model.as_str(), now_iso(), task_id, project_id],
    )?;
    history::record(
        conn,
        EntityKind::Task,
        task_id,
        "recommended_model",
        task.recommended_model.map(|m| m.as_str()),
        Some(model.as_str()),
        changed_by,
        reason,
        project_id,
    )?;
    Ok(())
}

/// Persist the static-analysis score from the worker's quality hook.
pub fn set_static_analysis_score(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    score: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET static_analysis_score = ?1, updated_at = ?2
         WHERE id = ?3 AND project_id = ?4",
        rusqlite::params![score, now_iso(), task_id, project_id],
    )?;
    Ok(())
}

/// Rewrite a task's description (used by the post-approval replan hook and
/// PM redesign; audited).
pub fn set_description(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    description: &str,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<()> {
    let task = get_task_required(conn, project_id, task_id)?;
    conn.execute(
        "UPDATE tasks SET description = ?1, updated_at = ?2 WHERE id = ?3 AND project_id = ?4",
        rusqlite::params![description, now_iso(), task_id, project_id],
    )?;
    history::record(
        conn,
        EntityKind::Task,
        task_id,
        "description",
        task.description.as_deref(),
        Some(description),
        changed_by,
        reason,
        project_id,
    )?;
    Ok(())
}

/// Replace the target-file list (PM redesign only; audited).
pub fn set_target_files(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    target_files: &[String],
    changed_by: &str,
    reason: Option<&str>,
) -> Result<()> {
    let task = get_task_required(conn, project_id, task_id)?;
    let new_json = serde_json::to_string(target_files)?;
    let old_json = serde_json::to_string(&task.target_files)?;
    conn.execute(
        "UPDATE tasks SET target_files = ?1, updated_at = ?2 WHERE id = ?3 AND project_id = ?4",
        rusqlite::params![new_json, now_iso(), task_id, project_id],
    )?;
    history::record(
        conn,
        EntityKind::Task,
        task_id,
        "target_files",
        Some(&old_json),
        Some(&new_json),
        changed_by,
        reason,
        project_id,
    )?;
    Ok(())
}

/// Reset the reject counter (redesign success path; audited).
pub fn reset_reject_count(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<()> {
    let task = get_task_required(conn, project_id, task_id)?;
    conn.execute(
        "UPDATE tasks SET reject_count = 0, updated_at = ?1 WHERE id = ?2 AND project_id = ?3",
        rusqlite::params![now_iso(), task_id, project_id],
    )?;
    history::record(
        conn,
        EntityKind::Task,
        task_id,
        "reject_count",
        Some(&task.reject_count.to_string()),
        Some("0"),
        changed_by,
        reason,
        project_id,
    )?;
    Ok(())
}

/// Record a reviewer's rework comment in history so later worker prompts
/// can replay past reject reasons with timestamps.
pub fn record_rework_comment(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    comment: &str,
) -> Result<()> {
    history::record(
        conn,
        EntityKind::Task,
        task_id,
        "rework_comment",
        None,
        Some(comment),
        "PM",
        Some("review rejected"),
        project_id,
    )?;
    Ok(())
}

/// Past rework comments, oldest first, as (timestamp, comment).
pub fn rework_history(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
) -> Result<Vec<(String, String)>> {
    let _ = project_id;
    let records = history::for_entity(conn, EntityKind::Task, task_id, Some("rework_comment"))?;
    Ok(records
        .into_iter()
        .filter_map(|r| r.new_value.map(|v| (r.changed_at, v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_order, seed_project};
    use crate::Store;

    fn simple_task(order_id: &str, title: &str) -> NewTask {
        NewTask {
            order_id: order_id.to_string(),
            title: title.to_string(),
            ..NewTask::default()
        }
    }

    #[test]
    fn test_create_without_deps_is_queued() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");

        let task = create_task(&store, "demo", &simple_task("ORDER_001", "First")).unwrap();
        assert_eq!(task.id, "TASK_001");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.reject_count, 0);
    }

    #[test]
    fn test_create_with_deps_is_blocked() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");

        let a = create_task(&store, "demo", &simple_task("ORDER_001", "A")).unwrap();
        let b = create_task(
            &store,
            "demo",
            &NewTask {
                depends_on: vec![a.id.clone()],
                ..simple_task("ORDER_001", "B")
            },
        )
        .unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);
    }

    #[test]
    fn test_create_with_missing_dep_fails() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");

        let err = create_task(
            &store,
            "demo",
            &NewTask {
                depends_on: vec!["TASK_999".to_string()],
                ..simple_task("ORDER_001", "B")
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::DependencyMissing { .. }));
    }

    #[test]
    fn test_done_to_rework_increments_reject_count_keeps_reviewed_at() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let task = create_task(&store, "demo", &simple_task("ORDER_001", "T")).unwrap();

        store
            .with_txn(|txn| {
                transition_task(txn, "demo", &task.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &task.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                set_reviewed_at(txn, "demo", &task.id)?;
                let outcome =
                    transition_task(txn, "demo", &task.id, TaskStatus::Rework, Role::Pm, "PM", Some("rejected"))?;
                assert_eq!(outcome.reject_count, 1);

                let reloaded = get_task_required(txn, "demo", &task.id)?;
                assert_eq!(reloaded.reject_count, 1);
                assert!(reloaded.reviewed_at.is_some(), "reviewed_at survives DONE->REWORK");

                // REWORK -> IN_PROGRESS clears it, making the task reviewable again
                transition_task(txn, "demo", &task.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                let reloaded = get_task_required(txn, "demo", &task.id)?;
                assert!(reloaded.reviewed_at.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_leaving_in_progress_releases_locks() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let task = create_task(
            &store,
            "demo",
            &NewTask {
                target_files: vec!["src/a.py".to_string()],
                ..simple_task("ORDER_001", "T")
            },
        )
        .unwrap();

        store
            .with_txn(|txn| {
                transition_task(txn, "demo", &task.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                assert!(lock::acquire_locks(txn, "demo", &task.id, &task.target_files)?);

                let outcome =
                    transition_task(txn, "demo", &task.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                assert_eq!(outcome.released_locks, 1);
                assert!(lock::list_locks(txn, "demo")?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_same_state_reentry_writes_no_history() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let task = create_task(&store, "demo", &simple_task("ORDER_001", "T")).unwrap();

        store
            .with_txn(|txn| {
                transition_task(txn, "demo", &task.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                let before =
                    history::for_entity(txn, EntityKind::Task, &task.id, Some("status"))?.len();

                let outcome = transition_task(
                    txn, "demo", &task.id, TaskStatus::InProgress, Role::Worker, "Worker", None,
                )?;
                assert!(!outcome.changed);

                let after =
                    history::for_entity(txn, EntityKind::Task, &task.id, Some("status"))?.len();
                assert_eq!(before, after, "re-entry must not duplicate history");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_done_to_rejected_is_refused() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let task = create_task(&store, "demo", &simple_task("ORDER_001", "T")).unwrap();

        let result = store.with_txn(|txn| {
            transition_task(txn, "demo", &task.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
            transition_task(txn, "demo", &task.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
            transition_task(txn, "demo", &task.id, TaskStatus::Rejected, Role::Any, "PM", None)
        });
        assert!(matches!(result, Err(StoreError::Transition(_))));
    }

    #[test]
    fn test_find_reviewable() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let task = create_task(&store, "demo", &simple_task("ORDER_001", "T")).unwrap();

        store
            .with_txn(|txn| {
                transition_task(txn, "demo", &task.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &task.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                Ok(())
            })
            .unwrap();

        store
            .read(|conn| {
                assert_eq!(find_reviewable(conn, "demo")?.len(), 1);
                Ok(())
            })
            .unwrap();

        store
            .with_txn(|txn| {
                set_reviewed_at(txn, "demo", &task.id)?;
                Ok(())
            })
            .unwrap();

        store
            .read(|conn| {
                assert!(find_reviewable(conn, "demo")?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_rework_history_round_trip() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let task = create_task(&store, "demo", &simple_task("ORDER_001", "T")).unwrap();

        store
            .with_txn(|txn| {
                record_rework_comment(txn, "demo", &task.id, "issues: missing tests")?;
                record_rework_comment(txn, "demo", &task.id, "issues: broken import")?;
                Ok(())
            })
            .unwrap();

        store
            .read(|conn| {
                let comments = rework_history(conn, "demo", &task.id)?;
                assert_eq!(comments.len(), 2);
                assert_eq!(comments[0].1, "issues: missing tests");
                Ok(())
            })
            .unwrap();
    }
}
