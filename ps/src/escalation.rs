//! Escalation audit rows: policy-level deviations (model upgrades, criteria
//! relaxation, redesigns, timeout safety valves, replans).

use rusqlite::Connection;
use tracing::debug;

use crate::db::now_iso;
use crate::error::{Result, StoreError};
use crate::types::EscalationType;

#[derive(Debug, Clone)]
pub struct Escalation {
    pub id: i64,
    pub project_id: String,
    pub order_id: Option<String>,
    pub task_id: Option<String>,
    pub escalation_type: EscalationType,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

impl Escalation {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let parse_err = |e: Box<dyn std::error::Error + Send + Sync>| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e)
        };
        let metadata: Option<String> = row.get("metadata")?;
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            order_id: row.get("order_id")?,
            task_id: row.get("task_id")?,
            escalation_type: row
                .get::<_, String>("escalation_type")?
                .parse()
                .map_err(|e: StoreError| parse_err(Box::new(e)))?,
            description: row.get("description")?,
            metadata: match metadata {
                Some(json) => Some(serde_json::from_str(&json).map_err(|e| parse_err(Box::new(e)))?),
                None => None,
            },
            created_at: row.get("created_at")?,
        })
    }
}

/// Record an escalation.
pub fn log_escalation(
    conn: &Connection,
    project_id: &str,
    order_id: Option<&str>,
    task_id: Option<&str>,
    escalation_type: EscalationType,
    description: &str,
    metadata: Option<&serde_json::Value>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO escalations
             (project_id, order_id, task_id, escalation_type, description, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            project_id,
            order_id,
            task_id,
            escalation_type.as_str(),
            description,
            metadata.map(serde_json::Value::to_string),
            now_iso()
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(project_id, ?task_id, escalation_type = escalation_type.as_str(), id, "log_escalation");
    Ok(id)
}

/// Escalations for a task, oldest first.
pub fn for_task(conn: &Connection, project_id: &str, task_id: &str) -> Result<Vec<Escalation>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM escalations WHERE project_id = ?1 AND task_id = ?2 ORDER BY id",
    )?;
    let mut escalations = Vec::new();
    for row in stmt.query_map(rusqlite::params![project_id, task_id], Escalation::from_row)? {
        escalations.push(row?);
    }
    Ok(escalations)
}

/// Count of a given escalation type for a task.
pub fn count_for_task(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    escalation_type: EscalationType,
) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM escalations
         WHERE project_id = ?1 AND task_id = ?2 AND escalation_type = ?3",
        rusqlite::params![project_id, task_id, escalation_type.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn test_log_and_count() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                log_escalation(
                    txn,
                    "demo",
                    Some("ORDER_001"),
                    Some("TASK_001"),
                    EscalationType::ModelUpgrade,
                    "rework 2: model auto-upgraded Sonnet -> Opus",
                    Some(&serde_json::json!({"from_model": "Sonnet", "to_model": "Opus"})),
                )?;
                log_escalation(
                    txn,
                    "demo",
                    Some("ORDER_001"),
                    Some("TASK_001"),
                    EscalationType::CriteriaRelaxation,
                    "rework 2: relaxed review criteria",
                    None,
                )?;

                assert_eq!(
                    count_for_task(txn, "demo", "TASK_001", EscalationType::ModelUpgrade)?,
                    1
                );
                let all = for_task(txn, "demo", "TASK_001")?;
                assert_eq!(all.len(), 2);
                assert_eq!(
                    all[0].metadata.as_ref().and_then(|m| m["to_model"].as_str()),
                    Some("Opus")
                );
                Ok(())
            })
            .unwrap();
    }
}
