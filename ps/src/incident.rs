//! Incident records: worker/system/data failures with classification.

use rusqlite::Connection;

use crate::db::now_iso;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Incident {
    pub id: i64,
    pub project_id: String,
    pub task_id: Option<String>,
    pub category: String,
    pub severity: String,
    pub pattern_id: Option<String>,
    pub root_cause: Option<String>,
    pub resolution: Option<String>,
    pub occurred_at: String,
    pub resolved_at: Option<String>,
}

impl Incident {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            task_id: row.get("task_id")?,
            category: row.get("category")?,
            severity: row.get("severity")?,
            pattern_id: row.get("pattern_id")?,
            root_cause: row.get("root_cause")?,
            resolution: row.get("resolution")?,
            occurred_at: row.get("occurred_at")?,
            resolved_at: row.get("resolved_at")?,
        })
    }
}

/// Record an incident; returns its row id.
#[allow(clippy::too_many_arguments)]
pub fn record(
    conn: &Connection,
    project_id: &str,
    task_id: Option<&str>,
    category: &str,
    severity: &str,
    pattern_id: Option<&str>,
    root_cause: Option<&str>,
    resolution: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO incidents
             (project_id, task_id, category, severity, pattern_id, root_cause,
              resolution, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            project_id,
            task_id,
            category,
            severity,
            pattern_id,
            root_cause,
            resolution,
            now_iso()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Incidents for a project, newest first.
pub fn list(conn: &Connection, project_id: &str, limit: usize) -> Result<Vec<Incident>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM incidents WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let mut incidents = Vec::new();
    for row in stmt.query_map(rusqlite::params![project_id, limit as i64], Incident::from_row)? {
        incidents.push(row?);
    }
    Ok(incidents)
}

/// Count incidents of one category for a task (AutoRecovery's retry ledger).
pub fn count_for_task(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    category: &str,
) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM incidents
         WHERE project_id = ?1 AND task_id = ?2 AND category = ?3",
        rusqlite::params![project_id, task_id, category],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// Mark an incident resolved.
pub fn resolve(conn: &Connection, incident_id: i64, resolution: &str) -> Result<()> {
    conn.execute(
        "UPDATE incidents SET resolution = ?1, resolved_at = ?2 WHERE id = ?3",
        rusqlite::params![resolution, now_iso(), incident_id],
    )?;
    Ok(())
}
