//! Standalone consistency verifier. Surfaces storage-integrity problems;
//! never auto-corrects.

use rusqlite::Connection;

use crate::error::Result;
use crate::types::{OrderStatus, TaskStatus};

/// One detected inconsistency.
#[derive(Debug, Clone)]
pub struct Finding {
    pub code: &'static str,
    pub message: String,
}

/// Run every check and collect findings. An empty vec means the store is
/// consistent.
pub fn verify_consistency(conn: &Connection) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    check_task_order_fk(conn, &mut findings)?;
    check_dependency_fk(conn, &mut findings)?;
    check_status_values(conn, &mut findings)?;
    check_lock_owners_in_progress(conn, &mut findings)?;
    check_dependency_safety(conn, &mut findings)?;
    check_blocked_but_ready(conn, &mut findings)?;
    check_completed_orders_frozen(conn, &mut findings)?;
    Ok(findings)
}

/// Tasks pointing at orders that do not exist.
fn check_task_order_fk(conn: &Connection, findings: &mut Vec<Finding>) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.project_id, t.order_id FROM tasks t
         LEFT JOIN orders o ON o.id = t.order_id AND o.project_id = t.project_id
         WHERE o.id IS NULL",
    )?;
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })? {
        let (task, project, order) = row?;
        findings.push(Finding {
            code: "FK_TASK_ORDER",
            message: format!("task {} ({}) references missing order {}", task, project, order),
        });
    }
    Ok(())
}

/// Dependency edges pointing at absent tasks.
fn check_dependency_fk(conn: &Connection, findings: &mut Vec<Finding>) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT d.task_id, d.depends_on_task_id, d.project_id FROM task_dependencies d
         LEFT JOIN tasks t ON t.id = d.depends_on_task_id AND t.project_id = d.project_id
         WHERE t.id IS NULL",
    )?;
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })? {
        let (task, dep, project) = row?;
        findings.push(Finding {
            code: "FK_DEPENDENCY",
            message: format!("task {} ({}) depends on missing task {}", task, project, dep),
        });
    }
    Ok(())
}

/// Status strings outside the known sets (possible after hand edits).
fn check_status_values(conn: &Connection, findings: &mut Vec<Finding>) -> Result<()> {
    let mut stmt = conn.prepare("SELECT id, project_id, status FROM tasks")?;
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })? {
        let (id, project, status) = row?;
        if status.parse::<TaskStatus>().is_err() {
            findings.push(Finding {
                code: "BAD_TASK_STATUS",
                message: format!("task {} ({}) has unknown status '{}'", id, project, status),
            });
        }
    }

    let mut stmt = conn.prepare("SELECT id, project_id, status FROM orders")?;
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })? {
        let (id, project, status) = row?;
        if status.parse::<OrderStatus>().is_err() {
            findings.push(Finding {
                code: "BAD_ORDER_STATUS",
                message: format!("order {} ({}) has unknown status '{}'", id, project, status),
            });
        }
    }
    Ok(())
}

/// Every file lock's owner must be IN_PROGRESS.
fn check_lock_owners_in_progress(conn: &Connection, findings: &mut Vec<Finding>) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT l.file_path, l.task_id, l.project_id, COALESCE(t.status, '(missing)')
         FROM file_locks l
         LEFT JOIN tasks t ON t.id = l.task_id AND t.project_id = l.project_id
         WHERE t.status IS NULL OR t.status != 'IN_PROGRESS'",
    )?;
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })? {
        let (path, task, project, status) = row?;
        findings.push(Finding {
            code: "LOCK_OWNER_NOT_IN_PROGRESS",
            message: format!(
                "lock on {} ({}) owned by {} whose status is {}",
                path, project, task, status
            ),
        });
    }
    Ok(())
}

/// Tasks in flight or beyond must have every dependency COMPLETED.
fn check_dependency_safety(conn: &Connection, findings: &mut Vec<Finding>) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.project_id, t.status, d.depends_on_task_id, dep.status
         FROM tasks t
         JOIN task_dependencies d ON d.task_id = t.id AND d.project_id = t.project_id
         JOIN tasks dep ON dep.id = d.depends_on_task_id AND dep.project_id = t.project_id
         WHERE t.status IN ('IN_PROGRESS','DONE','COMPLETED') AND dep.status != 'COMPLETED'",
    )?;
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })? {
        let (task, project, status, dep, dep_status) = row?;
        findings.push(Finding {
            code: "DEPENDENCY_VIOLATION",
            message: format!(
                "task {} ({}) is {} but dependency {} is {}",
                task, project, status, dep, dep_status
            ),
        });
    }
    Ok(())
}

/// BLOCKED tasks whose dependencies are all COMPLETED: drift the resolver
/// should have healed.
fn check_blocked_but_ready(conn: &Connection, findings: &mut Vec<Finding>) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.project_id FROM tasks t
         WHERE t.status = 'BLOCKED'
           AND NOT EXISTS (
               SELECT 1 FROM task_dependencies d
               JOIN tasks dep ON dep.id = d.depends_on_task_id AND dep.project_id = d.project_id
               WHERE d.task_id = t.id AND d.project_id = t.project_id
                 AND dep.status != 'COMPLETED'
           )",
    )?;
    for row in stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })? {
        let (task, project) = row?;
        findings.push(Finding {
            code: "BLOCKED_BUT_READY",
            message: format!("task {} ({}) is BLOCKED with all dependencies COMPLETED", task, project),
        });
    }
    Ok(())
}

/// A COMPLETED order must not contain non-terminal tasks.
fn check_completed_orders_frozen(conn: &Connection, findings: &mut Vec<Finding>) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT o.id, o.project_id, t.id, t.status FROM orders o
         JOIN tasks t ON t.order_id = o.id AND t.project_id = o.project_id
         WHERE o.status = 'COMPLETED'
           AND t.status IN ('QUEUED','BLOCKED','IN_PROGRESS','DONE','REWORK','ESCALATED','INTERRUPTED')",
    )?;
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })? {
        let (order_id, project, task, status) = row?;
        findings.push(Finding {
            code: "COMPLETED_ORDER_ACTIVE_TASK",
            message: format!(
                "order {} ({}) is COMPLETED but task {} is {}",
                order_id, project, task, status
            ),
        });
    }
    Ok(())
}
