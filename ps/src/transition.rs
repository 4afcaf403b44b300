//! Transition engine: validates every status change against the
//! status_transitions rule table.
//!
//! The rule table is the only source of truth for legal transitions.
//! Same-state transitions are always allowed so workers can re-enter
//! IN_PROGRESS idempotently without rolling up a history entry.

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, TransitionError};
use crate::types::{EntityKind, Role};

/// A rule row, as returned by [`allowed_transitions`].
#[derive(Debug, Clone)]
pub struct TransitionRule {
    pub to_status: String,
    pub allowed_role: String,
    pub description: Option<String>,
}

/// Whether `from` → `to` is allowed for `role`.
///
/// `from == to` is always allowed. `Role::Any` skips role filtering
/// (the caller permits any role); a rule row with `allowed_role = 'ANY'`
/// permits every role.
pub fn is_allowed(
    conn: &Connection,
    entity: EntityKind,
    from: Option<&str>,
    to: &str,
    role: Role,
) -> Result<bool> {
    if from == Some(to) {
        return Ok(true);
    }

    let row: Option<i64> = match (from, role) {
        (None, Role::Any) => conn
            .query_row(
                "SELECT id FROM status_transitions
                 WHERE entity_type = ?1 AND from_status IS NULL AND to_status = ?2
                   AND is_active = 1",
                rusqlite::params![entity.as_str(), to],
                |row| row.get(0),
            )
            .optional()?,
        (Some(from), Role::Any) => conn
            .query_row(
                "SELECT id FROM status_transitions
                 WHERE entity_type = ?1 AND from_status = ?2 AND to_status = ?3
                   AND is_active = 1",
                rusqlite::params![entity.as_str(), from, to],
                |row| row.get(0),
            )
            .optional()?,
        (None, role) => conn
            .query_row(
                "SELECT id FROM status_transitions
                 WHERE entity_type = ?1 AND from_status IS NULL AND to_status = ?2
                   AND is_active = 1
                   AND (allowed_role = 'ANY' OR allowed_role = ?3)",
                rusqlite::params![entity.as_str(), to, role.as_str()],
                |row| row.get(0),
            )
            .optional()?,
        (Some(from), role) => conn
            .query_row(
                "SELECT id FROM status_transitions
                 WHERE entity_type = ?1 AND from_status = ?2 AND to_status = ?3
                   AND is_active = 1
                   AND (allowed_role = 'ANY' OR allowed_role = ?4)",
                rusqlite::params![entity.as_str(), from, to, role.as_str()],
                |row| row.get(0),
            )
            .optional()?,
    };

    Ok(row.is_some())
}

/// Validate a transition, returning a [`TransitionError`] that carries the
/// legal successor list when the transition is not allowed.
pub fn validate(
    conn: &Connection,
    entity: EntityKind,
    from: Option<&str>,
    to: &str,
    role: Role,
) -> Result<()> {
    if is_allowed(conn, entity, from, to, role)? {
        return Ok(());
    }

    let allowed = allowed_transitions(conn, entity, from, role)?
        .into_iter()
        .map(|rule| rule.to_status)
        .collect::<Vec<_>>();

    debug!(
        entity = entity.as_str(),
        from = from.unwrap_or("(initial)"),
        to,
        role = role.as_str(),
        ?allowed,
        "validate: transition refused"
    );

    Err(TransitionError {
        entity,
        from: from.map(str::to_string),
        to: to.to_string(),
        role,
        allowed,
    }
    .into())
}

/// Legal successor rules from `from` for `role`, ordered by target status.
pub fn allowed_transitions(
    conn: &Connection,
    entity: EntityKind,
    from: Option<&str>,
    role: Role,
) -> Result<Vec<TransitionRule>> {
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<TransitionRule> {
        Ok(TransitionRule {
            to_status: row.get(0)?,
            allowed_role: row.get(1)?,
            description: row.get(2)?,
        })
    };

    let mut rules = Vec::new();
    match from {
        None => {
            let mut stmt = conn.prepare(
                "SELECT to_status, allowed_role, description FROM status_transitions
                 WHERE entity_type = ?1 AND from_status IS NULL AND is_active = 1
                   AND (?2 = 'ANY' OR allowed_role = 'ANY' OR allowed_role = ?2)
                 ORDER BY to_status",
            )?;
            for row in stmt.query_map(rusqlite::params![entity.as_str(), role.as_str()], map_row)? {
                rules.push(row?);
            }
        }
        Some(from) => {
            let mut stmt = conn.prepare(
                "SELECT to_status, allowed_role, description FROM status_transitions
                 WHERE entity_type = ?1 AND from_status = ?2 AND is_active = 1
                   AND (?3 = 'ANY' OR allowed_role = 'ANY' OR allowed_role = ?3)
                 ORDER BY to_status",
            )?;
            for row in stmt.query_map(
                rusqlite::params![entity.as_str(), from, role.as_str()],
                map_row,
            )? {
                rules.push(row?);
            }
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::Store;

    fn with_conn(f: impl FnOnce(&Connection)) {
        let store = Store::open_in_memory().unwrap();
        store
            .read(|conn| {
                f(conn);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_same_state_always_allowed() {
        with_conn(|conn| {
            assert!(is_allowed(conn, EntityKind::Task, Some("IN_PROGRESS"), "IN_PROGRESS", Role::Worker).unwrap());
            // Even for states with no outgoing rules at all
            assert!(is_allowed(conn, EntityKind::Task, Some("COMPLETED"), "COMPLETED", Role::Any).unwrap());
        });
    }

    #[test]
    fn test_initial_transitions() {
        with_conn(|conn| {
            assert!(is_allowed(conn, EntityKind::Task, None, "QUEUED", Role::Pm).unwrap());
            assert!(is_allowed(conn, EntityKind::Task, None, "BLOCKED", Role::Pm).unwrap());
            assert!(!is_allowed(conn, EntityKind::Task, None, "DONE", Role::Pm).unwrap());
        });
    }

    #[test]
    fn test_role_gating() {
        with_conn(|conn| {
            // QUEUED -> IN_PROGRESS is a Worker transition
            assert!(is_allowed(conn, EntityKind::Task, Some("QUEUED"), "IN_PROGRESS", Role::Worker).unwrap());
            assert!(!is_allowed(conn, EntityKind::Task, Some("QUEUED"), "IN_PROGRESS", Role::Pm).unwrap());
            // Role::Any skips the filter
            assert!(is_allowed(conn, EntityKind::Task, Some("QUEUED"), "IN_PROGRESS", Role::Any).unwrap());
        });
    }

    #[test]
    fn test_done_to_rejected_forbidden() {
        with_conn(|conn| {
            assert!(!is_allowed(conn, EntityKind::Task, Some("DONE"), "REJECTED", Role::Any).unwrap());
            // The only path to REJECTED from DONE goes through REWORK
            assert!(is_allowed(conn, EntityKind::Task, Some("DONE"), "REWORK", Role::Pm).unwrap());
            assert!(is_allowed(conn, EntityKind::Task, Some("REWORK"), "REJECTED", Role::System).unwrap());
        });
    }

    #[test]
    fn test_error_carries_allowed_list() {
        with_conn(|conn| {
            let err = validate(conn, EntityKind::Task, Some("DONE"), "REJECTED", Role::Pm).unwrap_err();
            match err {
                StoreError::Transition(t) => {
                    assert_eq!(t.to, "REJECTED");
                    assert!(t.allowed.contains(&"COMPLETED".to_string()));
                    assert!(t.allowed.contains(&"REWORK".to_string()));
                    assert!(t.allowed.contains(&"ESCALATED".to_string()));
                    assert!(!t.allowed.contains(&"REJECTED".to_string()));
                }
                other => panic!("expected TransitionError, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_terminal_states_have_no_worker_exits() {
        with_conn(|conn| {
            for terminal in ["COMPLETED", "REJECTED", "SKIPPED"] {
                let allowed = allowed_transitions(conn, EntityKind::Task, Some(terminal), Role::Worker).unwrap();
                assert!(allowed.is_empty(), "{} should be terminal for workers", terminal);
            }
        });
    }

    #[test]
    fn test_order_lifecycle() {
        with_conn(|conn| {
            assert!(is_allowed(conn, EntityKind::Order, None, "PLANNING", Role::Pm).unwrap());
            assert!(is_allowed(conn, EntityKind::Order, Some("PLANNING"), "IN_PROGRESS", Role::Pm).unwrap());
            assert!(is_allowed(conn, EntityKind::Order, Some("IN_PROGRESS"), "COMPLETED", Role::System).unwrap());
            assert!(!is_allowed(conn, EntityKind::Order, Some("COMPLETED"), "IN_PROGRESS", Role::Any).unwrap());
        });
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::Store;
    use crate::types::TaskStatus;
    use proptest::prelude::*;

    // Every edge of the task state chart. Anything outside this set
    // (other than self-loops) must be refused for every role.
    const LEGAL_TASK_EDGES: &[(&str, &str)] = &[
        ("BLOCKED", "QUEUED"),
        ("QUEUED", "IN_PROGRESS"),
        ("REWORK", "IN_PROGRESS"),
        ("IN_PROGRESS", "DONE"),
        ("IN_PROGRESS", "QUEUED"),
        ("IN_PROGRESS", "REWORK"),
        ("IN_PROGRESS", "SKIPPED"),
        ("IN_PROGRESS", "INTERRUPTED"),
        ("INTERRUPTED", "QUEUED"),
        ("DONE", "COMPLETED"),
        ("DONE", "REWORK"),
        ("DONE", "ESCALATED"),
        ("ESCALATED", "QUEUED"),
        ("ESCALATED", "REJECTED"),
        ("REWORK", "REJECTED"),
        ("REWORK", "QUEUED"),
        ("QUEUED", "SKIPPED"),
        ("BLOCKED", "SKIPPED"),
        ("QUEUED", "CANCELLED"),
        ("BLOCKED", "CANCELLED"),
        ("IN_PROGRESS", "CANCELLED"),
        ("DONE", "CANCELLED"),
        ("REWORK", "CANCELLED"),
        ("ESCALATED", "CANCELLED"),
        ("INTERRUPTED", "CANCELLED"),
    ];

    fn status_strategy() -> impl Strategy<Value = TaskStatus> {
        proptest::sample::select(TaskStatus::ALL)
    }

    proptest! {
        #[test]
        fn prop_only_listed_edges_accepted(from in status_strategy(), to in status_strategy()) {
            let store = Store::open_in_memory().unwrap();
            let allowed = store
                .read(|conn| is_allowed(conn, EntityKind::Task, Some(from.as_str()), to.as_str(), Role::Any))
                .unwrap();
            let expected = from == to
                || LEGAL_TASK_EDGES.contains(&(from.as_str(), to.as_str()));
            prop_assert_eq!(allowed, expected, "edge {} -> {}", from, to);
        }
    }
}
