//! ID grammar enforcement and zero-padded allocation.
//!
//! Grammar:
//! - project: `^[A-Za-z][A-Za-z0-9_]*$`
//! - order:   `^ORDER_\d{3,}$`
//! - task:    `^TASK_\d{3,}(_INT(_\d{2})?)?$`
//! - backlog: `^BACKLOG_\d{3,}$`

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;

use crate::error::{Result, StoreError};

static PROJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("static regex"));
static ORDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ORDER_\d{3,}$").expect("static regex"));
static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^TASK_\d{3,}(_INT(_\d{2})?)?$").expect("static regex"));
static BACKLOG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^BACKLOG_\d{3,}$").expect("static regex"));

pub fn validate_project_id(id: &str) -> Result<()> {
    if PROJECT_RE.is_match(id) {
        Ok(())
    } else {
        Err(StoreError::validation("project_id", format!("invalid id: {}", id)))
    }
}

pub fn validate_order_id(id: &str) -> Result<()> {
    if ORDER_RE.is_match(id) {
        Ok(())
    } else {
        Err(StoreError::validation("order_id", format!("invalid id: {}", id)))
    }
}

pub fn validate_task_id(id: &str) -> Result<()> {
    if TASK_RE.is_match(id) {
        Ok(())
    } else {
        Err(StoreError::validation("task_id", format!("invalid id: {}", id)))
    }
}

pub fn validate_backlog_id(id: &str) -> Result<()> {
    if BACKLOG_RE.is_match(id) {
        Ok(())
    } else {
        Err(StoreError::validation("backlog_id", format!("invalid id: {}", id)))
    }
}

/// Numeric payload of an id like `TASK_188` or `TASK_188_INT_01`.
/// Returns the primary sequence number (188).
fn numeric_part(id: &str, prefix: &str) -> Option<u64> {
    let rest = id.strip_prefix(prefix)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn next_number(conn: &Connection, table: &str, prefix: &str, project_id: &str) -> Result<u64> {
    let mut stmt = conn.prepare(&format!("SELECT id FROM {} WHERE project_id = ?1", table))?;
    let rows = stmt.query_map([project_id], |row| row.get::<_, String>(0))?;

    let mut max = 0u64;
    for row in rows {
        if let Some(n) = numeric_part(&row?, prefix) {
            max = max.max(n);
        }
    }
    Ok(max + 1)
}

/// Next free order id for the project, zero-padded to 3 digits.
pub fn next_order_id(conn: &Connection, project_id: &str) -> Result<String> {
    Ok(format!("ORDER_{:03}", next_number(conn, "orders", "ORDER_", project_id)?))
}

/// Next free task id for the project. Numbering is project-global, not
/// per-order, so ids stay unique across the whole history.
pub fn next_task_id(conn: &Connection, project_id: &str) -> Result<String> {
    Ok(format!("TASK_{:03}", next_number(conn, "tasks", "TASK_", project_id)?))
}

/// Next free backlog id for the project.
pub fn next_backlog_id(conn: &Connection, project_id: &str) -> Result<String> {
    Ok(format!(
        "BACKLOG_{:03}",
        next_number(conn, "backlog", "BACKLOG_", project_id)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_grammar() {
        assert!(validate_project_id("ai_pm_manager").is_ok());
        assert!(validate_project_id("Demo2").is_ok());
        assert!(validate_project_id("2demo").is_err());
        assert!(validate_project_id("demo-app").is_err());
        assert!(validate_project_id("").is_err());
    }

    #[test]
    fn test_order_grammar() {
        assert!(validate_order_id("ORDER_036").is_ok());
        assert!(validate_order_id("ORDER_1036").is_ok());
        assert!(validate_order_id("ORDER_36").is_err());
        assert!(validate_order_id("order_036").is_err());
    }

    #[test]
    fn test_task_grammar() {
        assert!(validate_task_id("TASK_188").is_ok());
        assert!(validate_task_id("TASK_188_INT").is_ok());
        assert!(validate_task_id("TASK_188_INT_02").is_ok());
        assert!(validate_task_id("TASK_188_INT_2").is_err());
        assert!(validate_task_id("TASK_88").is_err());
        assert!(validate_task_id("TASK_").is_err());
    }

    #[test]
    fn test_backlog_grammar() {
        assert!(validate_backlog_id("BACKLOG_029").is_ok());
        assert!(validate_backlog_id("BACKLOG_29").is_err());
    }

    #[test]
    fn test_numeric_part() {
        assert_eq!(numeric_part("TASK_188", "TASK_"), Some(188));
        assert_eq!(numeric_part("TASK_188_INT_01", "TASK_"), Some(188));
        assert_eq!(numeric_part("ORDER_007", "ORDER_"), Some(7));
        assert_eq!(numeric_part("TASK_x", "TASK_"), None);
    }

    #[test]
    fn test_next_ids_zero_padded() {
        let store = crate::Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                txn.execute(
                    "INSERT INTO projects (id, name, path, created_at, updated_at)
                     VALUES ('demo', 'Demo', '/tmp/demo', ?1, ?1)",
                    [crate::db::now_iso()],
                )?;
                assert_eq!(next_order_id(txn, "demo")?, "ORDER_001");
                txn.execute(
                    "INSERT INTO orders (id, project_id, title, status, created_at, updated_at)
                     VALUES ('ORDER_009', 'demo', 'O', 'PLANNING', ?1, ?1)",
                    [crate::db::now_iso()],
                )?;
                assert_eq!(next_order_id(txn, "demo")?, "ORDER_010");
                assert_eq!(next_task_id(txn, "demo")?, "TASK_001");
                Ok(())
            })
            .unwrap();
    }
}
