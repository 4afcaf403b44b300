//! Backlog intake: project-scoped items with per-priority FIFO ordering,
//! convertible into Orders.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::now_iso;
use crate::error::{Result, StoreError};
use crate::history;
use crate::ids;
use crate::order;
use crate::transition;
use crate::types::{BacklogPriority, BacklogStatus, EntityKind, Priority, Role};

#[derive(Debug, Clone)]
pub struct BacklogItem {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: BacklogPriority,
    pub sort_order: i64,
    pub status: BacklogStatus,
    pub related_order_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl BacklogItem {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let parse_err = |e: StoreError| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        };
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            category: row.get("category")?,
            priority: row.get::<_, String>("priority")?.parse().map_err(parse_err)?,
            sort_order: row.get("sort_order")?,
            status: row.get::<_, String>("status")?.parse().map_err(parse_err)?,
            related_order_id: row.get("related_order_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Add an item; sort_order is the next FIFO position within its priority.
pub fn add_item(
    conn: &Connection,
    project_id: &str,
    title: &str,
    description: Option<&str>,
    category: Option<&str>,
    priority: BacklogPriority,
) -> Result<BacklogItem> {
    ids::validate_project_id(project_id)?;
    let id = ids::next_backlog_id(conn, project_id)?;
    transition::validate(conn, EntityKind::Backlog, None, BacklogStatus::Todo.as_str(), Role::Any)?;

    let next_sort: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM backlog
         WHERE project_id = ?1 AND priority = ?2",
        rusqlite::params![project_id, priority.as_str()],
        |row| row.get(0),
    )?;

    let now = now_iso();
    conn.execute(
        "INSERT INTO backlog (id, project_id, title, description, category, priority,
                              sort_order, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'TODO', ?8, ?8)",
        rusqlite::params![
            id,
            project_id,
            title,
            description,
            category,
            priority.as_str(),
            next_sort,
            now
        ],
    )?;
    history::record(
        conn,
        EntityKind::Backlog,
        &id,
        "status",
        None,
        Some(BacklogStatus::Todo.as_str()),
        "PM",
        Some("backlog intake"),
        project_id,
    )?;

    get_item_required(conn, project_id, &id)
}

pub fn get_item(conn: &Connection, project_id: &str, id: &str) -> Result<Option<BacklogItem>> {
    Ok(conn
        .query_row(
            "SELECT * FROM backlog WHERE id = ?1 AND project_id = ?2",
            rusqlite::params![id, project_id],
            BacklogItem::from_row,
        )
        .optional()?)
}

pub fn get_item_required(conn: &Connection, project_id: &str, id: &str) -> Result<BacklogItem> {
    get_item(conn, project_id, id)?.ok_or_else(|| StoreError::NotFound {
        kind: EntityKind::Backlog,
        id: id.to_string(),
        project_id: project_id.to_string(),
    })
}

/// Items ordered High → Medium → Low, FIFO within a priority.
pub fn list_items(
    conn: &Connection,
    project_id: &str,
    status: Option<BacklogStatus>,
) -> Result<Vec<BacklogItem>> {
    let order_clause = "ORDER BY CASE priority
            WHEN 'High' THEN 0 WHEN 'Medium' THEN 1 ELSE 2 END, sort_order";
    let mut items = Vec::new();
    match status {
        Some(status) => {
            let sql = format!(
                "SELECT * FROM backlog WHERE project_id = ?1 AND status = ?2 {}",
                order_clause
            );
            let mut stmt = conn.prepare(&sql)?;
            for row in stmt.query_map(
                rusqlite::params![project_id, status.as_str()],
                BacklogItem::from_row,
            )? {
                items.push(row?);
            }
        }
        None => {
            let sql = format!("SELECT * FROM backlog WHERE project_id = ?1 {}", order_clause);
            let mut stmt = conn.prepare(&sql)?;
            for row in stmt.query_map([project_id], BacklogItem::from_row)? {
                items.push(row?);
            }
        }
    }
    Ok(items)
}

/// Validated status update with history.
pub fn update_status(
    conn: &Connection,
    project_id: &str,
    id: &str,
    to: BacklogStatus,
    role: Role,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<()> {
    let item = get_item_required(conn, project_id, id)?;
    if item.status == to {
        return Ok(());
    }
    transition::validate(
        conn,
        EntityKind::Backlog,
        Some(item.status.as_str()),
        to.as_str(),
        role,
    )?;
    conn.execute(
        "UPDATE backlog SET status = ?1, updated_at = ?2 WHERE id = ?3 AND project_id = ?4",
        rusqlite::params![to.as_str(), now_iso(), id, project_id],
    )?;
    history::record(
        conn,
        EntityKind::Backlog,
        id,
        "status",
        Some(item.status.as_str()),
        Some(to.as_str()),
        changed_by,
        reason,
        project_id,
    )?;
    Ok(())
}

/// Convert a TODO backlog item into a new Order (PLANNING) and mark the
/// item IN_PROGRESS with a back-reference.
pub fn to_order(conn: &Connection, project_id: &str, id: &str) -> Result<order::Order> {
    let item = get_item_required(conn, project_id, id)?;
    if item.status != BacklogStatus::Todo {
        return Err(StoreError::validation(
            "status",
            format!("backlog item {} is {}, expected TODO", id, item.status),
        ));
    }

    let order_priority = match item.priority {
        BacklogPriority::High => Priority::P0,
        BacklogPriority::Medium => Priority::P1,
        BacklogPriority::Low => Priority::P2,
    };
    let new_order = order::create_order(conn, project_id, &item.title, order_priority)?;

    update_status(
        conn,
        project_id,
        id,
        BacklogStatus::InProgress,
        Role::Any,
        "PM",
        Some(&format!("converted to {}", new_order.id)),
    )?;
    conn.execute(
        "UPDATE backlog SET related_order_id = ?1, updated_at = ?2
         WHERE id = ?3 AND project_id = ?4",
        rusqlite::params![new_order.id, now_iso(), id, project_id],
    )?;

    info!(project_id, backlog_id = id, order_id = %new_order.id, "Backlog item converted to order");
    Ok(new_order)
}

/// When an Order reaches COMPLETED, auto-transition the associated backlog
/// item to DONE. Returns the item id when one was closed.
pub fn close_for_order(
    conn: &Connection,
    project_id: &str,
    order_id: &str,
) -> Result<Option<String>> {
    let item: Option<String> = conn
        .query_row(
            "SELECT id FROM backlog
             WHERE project_id = ?1 AND related_order_id = ?2 AND status = 'IN_PROGRESS'",
            rusqlite::params![project_id, order_id],
            |row| row.get(0),
        )
        .optional()?;

    match item {
        Some(id) => {
            update_status(
                conn,
                project_id,
                &id,
                BacklogStatus::Done,
                Role::System,
                "Daemon",
                Some(&format!("order {} completed", order_id)),
            )?;
            debug!(project_id, backlog_id = %id, order_id, "close_for_order: backlog item done");
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::seed_project;
    use crate::types::OrderStatus;
    use crate::Store;

    #[test]
    fn test_fifo_within_priority() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");

        store
            .with_txn(|txn| {
                add_item(txn, "demo", "low one", None, None, BacklogPriority::Low)?;
                add_item(txn, "demo", "high one", None, None, BacklogPriority::High)?;
                add_item(txn, "demo", "high two", None, None, BacklogPriority::High)?;
                add_item(txn, "demo", "medium one", None, None, BacklogPriority::Medium)?;

                let items = list_items(txn, "demo", None)?;
                let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
                assert_eq!(titles, vec!["high one", "high two", "medium one", "low one"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_to_order_links_and_transitions() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");

        store
            .with_txn(|txn| {
                let item = add_item(txn, "demo", "Build the thing", None, Some("feature"), BacklogPriority::High)?;
                let new_order = to_order(txn, "demo", &item.id)?;
                assert_eq!(new_order.status, OrderStatus::Planning);
                assert_eq!(new_order.priority, Priority::P0);

                let reloaded = get_item_required(txn, "demo", &item.id)?;
                assert_eq!(reloaded.status, BacklogStatus::InProgress);
                assert_eq!(reloaded.related_order_id.as_deref(), Some(new_order.id.as_str()));

                // Conversion is one-shot
                assert!(to_order(txn, "demo", &item.id).is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_close_for_order() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");

        store
            .with_txn(|txn| {
                let item = add_item(txn, "demo", "Thing", None, None, BacklogPriority::Medium)?;
                let new_order = to_order(txn, "demo", &item.id)?;

                let closed = close_for_order(txn, "demo", &new_order.id)?;
                assert_eq!(closed.as_deref(), Some(item.id.as_str()));

                let reloaded = get_item_required(txn, "demo", &item.id)?;
                assert_eq!(reloaded.status, BacklogStatus::Done);

                // Idempotent: second call finds nothing in flight
                assert!(close_for_order(txn, "demo", &new_order.id)?.is_none());
                Ok(())
            })
            .unwrap();
    }
}
