//! File-lock manager: per-(project, file-path) exclusive leases owned by a
//! task for the duration of its IN_PROGRESS state.
//!
//! The UNIQUE(project_id, file_path) constraint is the critical section;
//! acquisition is all-or-none inside a single transaction.

use rusqlite::Connection;
use tracing::debug;

use crate::db::now_iso;
use crate::error::Result;

/// A held lease.
#[derive(Debug, Clone)]
pub struct FileLock {
    pub project_id: String,
    pub file_path: String,
    pub task_id: String,
    pub acquired_at: String,
}

/// A conflicting path and the task holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub file_path: String,
    pub task_id: String,
}

/// Acquire leases on every path for `task_id`, atomically: either all rows
/// are inserted or none is. Returns false (inserting nothing) on conflict.
///
/// Rows already owned by the same task are re-acquired idempotently, so a
/// rework re-entry that lost track of its locks cannot deadlock itself.
pub fn acquire_locks(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    paths: &[String],
) -> Result<bool> {
    if paths.is_empty() {
        return Ok(true);
    }

    let conflicts = check_conflicts(conn, project_id, paths)?;
    let foreign: Vec<_> = conflicts
        .iter()
        .filter(|c| c.task_id != task_id)
        .collect();
    if !foreign.is_empty() {
        debug!(
            project_id,
            task_id,
            conflicts = foreign.len(),
            "acquire_locks: conflict, acquiring nothing"
        );
        return Ok(false);
    }

    let now = now_iso();
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO file_locks (project_id, file_path, task_id, acquired_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for path in paths {
        stmt.execute(rusqlite::params![project_id, path, task_id, now])?;
    }

    debug!(project_id, task_id, count = paths.len(), "acquire_locks: acquired");
    Ok(true)
}

/// Delete every lease owned by `task_id`. Idempotent; returns the number
/// of leases released.
pub fn release_locks(conn: &Connection, project_id: &str, task_id: &str) -> Result<usize> {
    let released = conn.execute(
        "DELETE FROM file_locks WHERE project_id = ?1 AND task_id = ?2",
        rusqlite::params![project_id, task_id],
    )?;
    if released > 0 {
        debug!(project_id, task_id, released, "release_locks: released");
    }
    Ok(released)
}

/// Advisory: which of `paths` are currently leased, and by whom.
pub fn check_conflicts(
    conn: &Connection,
    project_id: &str,
    paths: &[String],
) -> Result<Vec<LockConflict>> {
    let mut conflicts = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT file_path, task_id FROM file_locks
         WHERE project_id = ?1 AND file_path = ?2",
    )?;
    for path in paths {
        let mut rows = stmt.query(rusqlite::params![project_id, path])?;
        while let Some(row) = rows.next()? {
            conflicts.push(LockConflict {
                file_path: row.get(0)?,
                task_id: row.get(1)?,
            });
        }
    }
    Ok(conflicts)
}

/// Whether `task_id` could acquire all of `paths` right now; if not,
/// which tasks are blocking it.
pub fn can_task_start(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    paths: &[String],
) -> Result<(bool, Vec<String>)> {
    let mut blocking: Vec<String> = check_conflicts(conn, project_id, paths)?
        .into_iter()
        .filter(|c| c.task_id != task_id)
        .map(|c| c.task_id)
        .collect();
    blocking.sort();
    blocking.dedup();
    Ok((blocking.is_empty(), blocking))
}

/// Every lease held in the project.
pub fn list_locks(conn: &Connection, project_id: &str) -> Result<Vec<FileLock>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, file_path, task_id, acquired_at FROM file_locks
         WHERE project_id = ?1 ORDER BY file_path",
    )?;
    let mut locks = Vec::new();
    for row in stmt.query_map([project_id], |row| {
        Ok(FileLock {
            project_id: row.get(0)?,
            file_path: row.get(1)?,
            task_id: row.get(2)?,
            acquired_at: row.get(3)?,
        })
    })? {
        locks.push(row?);
    }
    Ok(locks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_acquire_then_release_leaves_table_unchanged() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                assert!(acquire_locks(txn, "demo", "TASK_001", &paths(&["src/a.py", "src/b.py"]))?);
                assert_eq!(list_locks(txn, "demo")?.len(), 2);
                assert_eq!(release_locks(txn, "demo", "TASK_001")?, 2);
                assert!(list_locks(txn, "demo")?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_conflict_acquires_nothing() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                assert!(acquire_locks(txn, "demo", "TASK_001", &paths(&["src/a.py"]))?);

                // Overlapping set: all-or-none means not even src/c.py is taken
                assert!(!acquire_locks(txn, "demo", "TASK_002", &paths(&["src/a.py", "src/c.py"]))?);
                let locks = list_locks(txn, "demo")?;
                assert_eq!(locks.len(), 1);
                assert_eq!(locks[0].task_id, "TASK_001");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_reacquire_by_owner_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                assert!(acquire_locks(txn, "demo", "TASK_001", &paths(&["src/a.py"]))?);
                assert!(acquire_locks(txn, "demo", "TASK_001", &paths(&["src/a.py", "src/b.py"]))?);
                // No duplicate rows for src/a.py
                assert_eq!(list_locks(txn, "demo")?.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_release_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                assert_eq!(release_locks(txn, "demo", "TASK_404")?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_can_task_start_reports_blockers() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                acquire_locks(txn, "demo", "TASK_001", &paths(&["src/a.py"]))?;
                acquire_locks(txn, "demo", "TASK_002", &paths(&["src/b.py"]))?;

                let (ok, blockers) =
                    can_task_start(txn, "demo", "TASK_003", &paths(&["src/a.py", "src/b.py"]))?;
                assert!(!ok);
                assert_eq!(blockers, vec!["TASK_001".to_string(), "TASK_002".to_string()]);

                let (ok, blockers) = can_task_start(txn, "demo", "TASK_003", &paths(&["src/c.py"]))?;
                assert!(ok);
                assert!(blockers.is_empty());

                // A task never blocks itself
                let (ok, _) = can_task_start(txn, "demo", "TASK_001", &paths(&["src/a.py"]))?;
                assert!(ok);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_projects_are_isolated() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                assert!(acquire_locks(txn, "alpha", "TASK_001", &paths(&["src/a.py"]))?);
                assert!(acquire_locks(txn, "beta", "TASK_001", &paths(&["src/a.py"]))?);
                Ok(())
            })
            .unwrap();
    }
}
