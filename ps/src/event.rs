//! Small durable events consumed by the daemon loop.

use rusqlite::Connection;
use tracing::debug;

use crate::db::now_iso;
use crate::error::{Result, StoreError};
use crate::types::EventType;

#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub project_id: String,
    pub order_id: Option<String>,
    pub event_type: EventType,
    pub task_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub emitted_at: String,
    pub consumed_at: Option<String>,
}

impl Event {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let parse_err = |e: Box<dyn std::error::Error + Send + Sync>| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e)
        };
        let payload: Option<String> = row.get("payload")?;
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            order_id: row.get("order_id")?,
            event_type: row
                .get::<_, String>("event_type")?
                .parse()
                .map_err(|e: StoreError| parse_err(Box::new(e)))?,
            task_id: row.get("task_id")?,
            payload: match payload {
                Some(json) => Some(serde_json::from_str(&json).map_err(|e| parse_err(Box::new(e)))?),
                None => None,
            },
            emitted_at: row.get("emitted_at")?,
            consumed_at: row.get("consumed_at")?,
        })
    }
}

/// Emit an event.
pub fn emit(
    conn: &Connection,
    project_id: &str,
    order_id: Option<&str>,
    event_type: EventType,
    task_id: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<i64> {
    let payload_json = payload.map(serde_json::Value::to_string);
    conn.execute(
        "INSERT INTO events (project_id, order_id, event_type, task_id, payload, emitted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            project_id,
            order_id,
            event_type.as_str(),
            task_id,
            payload_json,
            now_iso()
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(project_id, event_type = event_type.as_str(), ?task_id, id, "emit: event recorded");
    Ok(id)
}

/// Fetch all unconsumed events for an order and mark them consumed.
pub fn consume(conn: &Connection, project_id: &str, order_id: &str) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT * FROM events
             WHERE project_id = ?1 AND (order_id IS NULL OR order_id = ?2)
               AND consumed_at IS NULL
             ORDER BY id",
        )?;
        for row in stmt.query_map(rusqlite::params![project_id, order_id], Event::from_row)? {
            events.push(row?);
        }
    }

    if !events.is_empty() {
        let now = now_iso();
        let mut stmt = conn.prepare("UPDATE events SET consumed_at = ?1 WHERE id = ?2")?;
        for event in &events {
            stmt.execute(rusqlite::params![now, event.id])?;
        }
        debug!(project_id, order_id, count = events.len(), "consume: events drained");
    }

    Ok(events)
}

/// Delete consumed events emitted before `cutoff` (ISO-8601). Keeps the
/// events table from growing without bound across long orders.
pub fn cleanup_consumed(conn: &Connection, project_id: &str, cutoff: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM events
         WHERE project_id = ?1 AND consumed_at IS NOT NULL AND emitted_at < ?2",
        rusqlite::params![project_id, cutoff],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn test_emit_consume_cycle() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                emit(txn, "demo", Some("ORDER_001"), EventType::TaskCompleted, Some("TASK_001"), None)?;
                emit(
                    txn,
                    "demo",
                    Some("ORDER_001"),
                    EventType::WorkerCrashed,
                    Some("TASK_002"),
                    Some(&serde_json::json!({"detection_method": "pid_alive_check"})),
                )?;

                let events = consume(txn, "demo", "ORDER_001")?;
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].event_type, EventType::TaskCompleted);
                assert_eq!(
                    events[1].payload.as_ref().and_then(|p| p["detection_method"].as_str()),
                    Some("pid_alive_check")
                );

                // Second consume drains nothing
                assert!(consume(txn, "demo", "ORDER_001")?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_other_orders_not_drained() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                emit(txn, "demo", Some("ORDER_001"), EventType::TaskCompleted, Some("TASK_001"), None)?;
                emit(txn, "demo", Some("ORDER_002"), EventType::TaskCompleted, Some("TASK_009"), None)?;

                let events = consume(txn, "demo", "ORDER_001")?;
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].task_id.as_deref(), Some("TASK_001"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_cleanup_consumed() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                emit(txn, "demo", Some("ORDER_001"), EventType::TaskCompleted, Some("TASK_001"), None)?;
                consume(txn, "demo", "ORDER_001")?;

                let far_future = "9999-01-01T00:00:00+00:00";
                assert_eq!(cleanup_consumed(txn, "demo", far_future)?, 1);
                Ok(())
            })
            .unwrap();
    }
}
