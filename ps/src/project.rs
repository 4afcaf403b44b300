//! Project records. Projects are created externally (CLI) and carry a
//! pointer to the order currently being driven.

use rusqlite::{Connection, OptionalExtension};

use crate::db::now_iso;
use crate::error::{Result, StoreError};
use crate::ids;
use crate::types::EntityKind;

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub is_active: bool,
    pub current_order_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Project {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            path: row.get("path")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            current_order_id: row.get("current_order_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

pub fn create_project(conn: &Connection, id: &str, name: &str, path: &str) -> Result<Project> {
    ids::validate_project_id(id)?;
    let now = now_iso();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO projects (id, name, path, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?4)",
        rusqlite::params![id, name, path, now],
    )?;
    if inserted == 0 {
        return Err(StoreError::Duplicate {
            kind: EntityKind::Project,
            id: id.to_string(),
            project_id: id.to_string(),
        });
    }
    get_project_required(conn, id)
}

pub fn get_project(conn: &Connection, id: &str) -> Result<Option<Project>> {
    Ok(conn
        .query_row(
            "SELECT * FROM projects WHERE id = ?1",
            [id],
            Project::from_row,
        )
        .optional()?)
}

pub fn get_project_required(conn: &Connection, id: &str) -> Result<Project> {
    get_project(conn, id)?.ok_or_else(|| StoreError::NotFound {
        kind: EntityKind::Project,
        id: id.to_string(),
        project_id: id.to_string(),
    })
}

pub fn list_projects(conn: &Connection) -> Result<Vec<Project>> {
    let mut stmt = conn.prepare("SELECT * FROM projects ORDER BY id")?;
    let mut projects = Vec::new();
    for row in stmt.query_map([], Project::from_row)? {
        projects.push(row?);
    }
    Ok(projects)
}

pub fn set_current_order(conn: &Connection, project_id: &str, order_id: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE projects SET current_order_id = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![order_id, now_iso(), project_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn test_create_and_fetch() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                let project = create_project(txn, "demo", "Demo", "/tmp/demo")?;
                assert!(project.is_active);
                assert!(project.current_order_id.is_none());

                set_current_order(txn, "demo", Some("ORDER_001"))?;
                let reloaded = get_project_required(txn, "demo")?;
                assert_eq!(reloaded.current_order_id.as_deref(), Some("ORDER_001"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = Store::open_in_memory().unwrap();
        let result = store.with_txn(|txn| {
            create_project(txn, "demo", "Demo", "/tmp/demo")?;
            create_project(txn, "demo", "Demo again", "/tmp/demo2")
        });
        assert!(matches!(result, Err(StoreError::Duplicate { .. })));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let store = Store::open_in_memory().unwrap();
        let result = store.with_txn(|txn| create_project(txn, "9bad", "Bad", "/tmp/bad"));
        assert!(matches!(result, Err(StoreError::Validation { .. })));
    }
}
