//! Append-only audit of every field mutation.

use rusqlite::Connection;

use crate::db::now_iso;
use crate::error::Result;
use crate::types::EntityKind;

/// One audit row.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: String,
    pub change_reason: Option<String>,
    pub changed_at: String,
    pub project_id: String,
}

impl ChangeRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            entity_type: row.get("entity_type")?,
            entity_id: row.get("entity_id")?,
            field_name: row.get("field_name")?,
            old_value: row.get("old_value")?,
            new_value: row.get("new_value")?,
            changed_by: row.get("changed_by")?,
            change_reason: row.get("change_reason")?,
            changed_at: row.get("changed_at")?,
            project_id: row.get("project_id")?,
        })
    }
}

/// Record a field mutation. Callers performing a status transition must do
/// this within the same transaction as the transition itself.
#[allow(clippy::too_many_arguments)]
pub fn record(
    conn: &Connection,
    entity: EntityKind,
    entity_id: &str,
    field: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    changed_by: &str,
    reason: Option<&str>,
    project_id: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO change_history
             (entity_type, entity_id, field_name, old_value, new_value,
              changed_by, change_reason, changed_at, project_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            entity.as_str(),
            entity_id,
            field,
            old_value,
            new_value,
            changed_by,
            reason,
            now_iso(),
            project_id,
        ],
    )?;
    Ok(())
}

/// History rows for one entity, oldest first.
pub fn for_entity(
    conn: &Connection,
    entity: EntityKind,
    entity_id: &str,
    field: Option<&str>,
) -> Result<Vec<ChangeRecord>> {
    let mut records = Vec::new();
    match field {
        Some(field) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM change_history
                 WHERE entity_type = ?1 AND entity_id = ?2 AND field_name = ?3
                 ORDER BY id",
            )?;
            for row in stmt.query_map(
                rusqlite::params![entity.as_str(), entity_id, field],
                ChangeRecord::from_row,
            )? {
                records.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT * FROM change_history
                 WHERE entity_type = ?1 AND entity_id = ?2
                 ORDER BY id",
            )?;
            for row in stmt.query_map(
                rusqlite::params![entity.as_str(), entity_id],
                ChangeRecord::from_row,
            )? {
                records.push(row?);
            }
        }
    }
    Ok(records)
}

/// Count history rows where `field` entered `new_value` — e.g. how many
/// times a task transitioned into REWORK or ESCALATED.
pub fn count_entries_into(
    conn: &Connection,
    entity: EntityKind,
    entity_id: &str,
    field: &str,
    new_value: &str,
) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM change_history
         WHERE entity_type = ?1 AND entity_id = ?2 AND field_name = ?3 AND new_value = ?4",
        rusqlite::params![entity.as_str(), entity_id, field, new_value],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}
