//! Order records and completion detection.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::db::now_iso;
use crate::error::{Result, StoreError};
use crate::history;
use crate::ids;
use crate::transition;
use crate::types::{EntityKind, OrderStatus, Priority, Role, TaskStatus};

#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub priority: Priority,
    pub status: OrderStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl Order {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let parse_err = |e: StoreError| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        };
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            title: row.get("title")?,
            priority: row.get::<_, String>("priority")?.parse().map_err(parse_err)?,
            status: row.get::<_, String>("status")?.parse().map_err(parse_err)?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Create an order in PLANNING with an allocated id.
pub fn create_order(
    conn: &Connection,
    project_id: &str,
    title: &str,
    priority: Priority,
) -> Result<Order> {
    ids::validate_project_id(project_id)?;
    let order_id = ids::next_order_id(conn, project_id)?;
    transition::validate(
        conn,
        EntityKind::Order,
        None,
        OrderStatus::Planning.as_str(),
        Role::Pm,
    )?;

    let now = now_iso();
    conn.execute(
        "INSERT INTO orders (id, project_id, title, priority, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'PLANNING', ?5, ?5)",
        rusqlite::params![order_id, project_id, title, priority.as_str(), now],
    )?;
    history::record(
        conn,
        EntityKind::Order,
        &order_id,
        "status",
        None,
        Some(OrderStatus::Planning.as_str()),
        "PM",
        Some("order created"),
        project_id,
    )?;

    get_order_required(conn, project_id, &order_id)
}

/// Create an order with a caller-chosen id (backlog conversion and the
/// planner allocate ids; this covers externally-numbered orders).
pub fn create_order_with_id(
    conn: &Connection,
    project_id: &str,
    order_id: &str,
    title: &str,
    priority: Priority,
) -> Result<Order> {
    ids::validate_project_id(project_id)?;
    ids::validate_order_id(order_id)?;
    if get_order(conn, project_id, order_id)?.is_some() {
        return Err(StoreError::Duplicate {
            kind: EntityKind::Order,
            id: order_id.to_string(),
            project_id: project_id.to_string(),
        });
    }
    transition::validate(
        conn,
        EntityKind::Order,
        None,
        OrderStatus::Planning.as_str(),
        Role::Pm,
    )?;

    let now = now_iso();
    conn.execute(
        "INSERT INTO orders (id, project_id, title, priority, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'PLANNING', ?5, ?5)",
        rusqlite::params![order_id, project_id, title, priority.as_str(), now],
    )?;
    history::record(
        conn,
        EntityKind::Order,
        order_id,
        "status",
        None,
        Some(OrderStatus::Planning.as_str()),
        "PM",
        Some("order created"),
        project_id,
    )?;
    get_order_required(conn, project_id, order_id)
}

pub fn get_order(conn: &Connection, project_id: &str, order_id: &str) -> Result<Option<Order>> {
    Ok(conn
        .query_row(
            "SELECT * FROM orders WHERE id = ?1 AND project_id = ?2",
            rusqlite::params![order_id, project_id],
            Order::from_row,
        )
        .optional()?)
}

pub fn get_order_required(conn: &Connection, project_id: &str, order_id: &str) -> Result<Order> {
    get_order(conn, project_id, order_id)?.ok_or_else(|| StoreError::NotFound {
        kind: EntityKind::Order,
        id: order_id.to_string(),
        project_id: project_id.to_string(),
    })
}

pub fn list_orders(conn: &Connection, project_id: &str) -> Result<Vec<Order>> {
    let mut stmt = conn.prepare("SELECT * FROM orders WHERE project_id = ?1 ORDER BY id")?;
    let mut orders = Vec::new();
    for row in stmt.query_map([project_id], Order::from_row)? {
        orders.push(row?);
    }
    Ok(orders)
}

/// Transition an order, maintaining started_at / completed_at.
pub fn transition_order(
    conn: &Connection,
    project_id: &str,
    order_id: &str,
    to: OrderStatus,
    role: Role,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<()> {
    let order = get_order_required(conn, project_id, order_id)?;
    if order.status == to {
        return Ok(());
    }
    transition::validate(
        conn,
        EntityKind::Order,
        Some(order.status.as_str()),
        to.as_str(),
        role,
    )?;

    let now = now_iso();
    match to {
        OrderStatus::InProgress if order.started_at.is_none() => {
            conn.execute(
                "UPDATE orders SET status = ?1, started_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND project_id = ?4",
                rusqlite::params![to.as_str(), now, order_id, project_id],
            )?;
        }
        OrderStatus::Completed => {
            conn.execute(
                "UPDATE orders SET status = ?1, completed_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND project_id = ?4",
                rusqlite::params![to.as_str(), now, order_id, project_id],
            )?;
        }
        _ => {
            conn.execute(
                "UPDATE orders SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND project_id = ?4",
                rusqlite::params![to.as_str(), now, order_id, project_id],
            )?;
        }
    }

    history::record(
        conn,
        EntityKind::Order,
        order_id,
        "status",
        Some(order.status.as_str()),
        Some(to.as_str()),
        changed_by,
        reason,
        project_id,
    )?;

    debug!(project_id, order_id, from = order.status.as_str(), to = to.as_str(), "transition_order");
    Ok(())
}

/// Count of tasks per status within the order.
pub fn status_summary(
    conn: &Connection,
    project_id: &str,
    order_id: &str,
) -> Result<BTreeMap<String, u32>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM tasks
         WHERE project_id = ?1 AND order_id = ?2 GROUP BY status",
    )?;
    let mut summary = BTreeMap::new();
    for row in stmt.query_map(rusqlite::params![project_id, order_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })? {
        let (status, count) = row?;
        summary.insert(status, count as u32);
    }
    Ok(summary)
}

/// An order is complete when no task remains in a non-terminal state.
/// Non-terminal: QUEUED, BLOCKED, IN_PROGRESS, DONE, REWORK, ESCALATED.
pub fn is_order_complete(conn: &Connection, project_id: &str, order_id: &str) -> Result<bool> {
    let summary = status_summary(conn, project_id, order_id)?;
    let non_terminal: u32 = TaskStatus::ALL
        .iter()
        .filter(|s| !s.is_terminal() && **s != TaskStatus::Interrupted)
        .map(|s| summary.get(s.as_str()).copied().unwrap_or(0))
        .sum();
    // INTERRUPTED counts as non-terminal too: it resumes to QUEUED
    let interrupted = summary.get("INTERRUPTED").copied().unwrap_or(0);
    Ok(non_terminal + interrupted == 0)
}
