//! Embedded schema, idempotent initialization, and the migration gate.
//!
//! Migrations execute in a distinct disable-FK window so schema
//! recreate-copy-rename patterns do not cascade-delete child rows.

use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// Schema DDL, applied with CREATE IF NOT EXISTS so init is idempotent.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    current_order_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id),
    title TEXT NOT NULL,
    priority TEXT NOT NULL DEFAULT 'P1'
        CHECK (priority IN ('P0','P1','P2')),
    status TEXT NOT NULL
        CHECK (status IN ('PLANNING','IN_PROGRESS','REVIEW','COMPLETED','ON_HOLD','CANCELLED')),
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (id, project_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    order_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL
        CHECK (status IN ('QUEUED','BLOCKED','IN_PROGRESS','DONE','REWORK','COMPLETED',
                          'REJECTED','CANCELLED','SKIPPED','ESCALATED','INTERRUPTED')),
    priority TEXT NOT NULL DEFAULT 'P1'
        CHECK (priority IN ('P0','P1','P2')),
    assignee TEXT,
    recommended_model TEXT
        CHECK (recommended_model IS NULL OR recommended_model IN ('Haiku','Sonnet','Opus')),
    complexity_score INTEGER,
    target_files TEXT,
    is_destructive_db_change INTEGER NOT NULL DEFAULT 0,
    reject_count INTEGER NOT NULL DEFAULT 0,
    reviewed_at TEXT,
    static_analysis_score INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (id, project_id),
    FOREIGN KEY (order_id, project_id) REFERENCES orders(id, project_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_order_status
    ON tasks(project_id, order_id, status);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL,
    depends_on_task_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on_task_id, project_id),
    FOREIGN KEY (task_id, project_id) REFERENCES tasks(id, project_id),
    FOREIGN KEY (depends_on_task_id, project_id) REFERENCES tasks(id, project_id)
);

CREATE TABLE IF NOT EXISTS backlog (
    id TEXT NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id),
    title TEXT NOT NULL,
    description TEXT,
    category TEXT,
    priority TEXT NOT NULL DEFAULT 'Medium'
        CHECK (priority IN ('High','Medium','Low')),
    sort_order INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'TODO'
        CHECK (status IN ('TODO','IN_PROGRESS','DONE','CANCELED','EXTERNAL')),
    related_order_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (id, project_id)
);

CREATE TABLE IF NOT EXISTS status_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    allowed_role TEXT NOT NULL DEFAULT 'ANY',
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (entity_type, from_status, to_status, allowed_role)
);

CREATE TABLE IF NOT EXISTS change_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    field_name TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    changed_by TEXT NOT NULL,
    change_reason TEXT,
    changed_at TEXT NOT NULL,
    project_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_history_entity
    ON change_history(entity_type, entity_id, field_name);

CREATE TABLE IF NOT EXISTS file_locks (
    project_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    task_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    UNIQUE (project_id, file_path)
);

CREATE TABLE IF NOT EXISTS incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    task_id TEXT,
    category TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'medium',
    pattern_id TEXT,
    root_cause TEXT,
    resolution TEXT,
    occurred_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS error_patterns (
    id TEXT PRIMARY KEY,
    pattern_name TEXT NOT NULL,
    regex TEXT NOT NULL,
    category TEXT NOT NULL
        CHECK (category IN ('RETRYABLE','SYSTEM','LOGIC','ENVIRONMENT','UNKNOWN')),
    recommended_action TEXT NOT NULL
        CHECK (recommended_action IN ('RETRY','SKIP','ROLLBACK','ESCALATE')),
    max_retries INTEGER NOT NULL DEFAULT 3,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS bug_patterns (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    title TEXT NOT NULL,
    description TEXT,
    pattern_type TEXT,
    severity TEXT NOT NULL DEFAULT 'medium',
    solution TEXT,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    total_injections INTEGER NOT NULL DEFAULT 0,
    related_failures INTEGER NOT NULL DEFAULT 0,
    effectiveness_score REAL NOT NULL DEFAULT 0.5,
    status TEXT NOT NULL DEFAULT 'ACTIVE'
        CHECK (status IN ('ACTIVE','ARCHIVED')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    order_id TEXT,
    event_type TEXT NOT NULL,
    task_id TEXT,
    payload TEXT,
    emitted_at TEXT NOT NULL,
    consumed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_unconsumed
    ON events(project_id, consumed_at);

CREATE TABLE IF NOT EXISTS escalations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    order_id TEXT,
    task_id TEXT,
    escalation_type TEXT NOT NULL
        CHECK (escalation_type IN ('MODEL_UPGRADE','CRITERIA_RELAXATION','REVIEW_REJECTION',
                                   'REVIEW_ESCALATION','REWORK_LIMIT_EXCEEDED',
                                   'ESCALATION_TIMEOUT','TASK_REPLAN')),
    description TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
"#;

/// Transition rules: (entity, from, to, role, description).
/// The rule table is the only source of truth for legal transitions;
/// same-state transitions are implicitly legal and never listed here.
const TRANSITION_RULES: &[(&str, Option<&str>, &str, &str, &str)] = &[
    // task
    ("task", None, "QUEUED", "PM", "plan creation, no dependencies"),
    ("task", None, "BLOCKED", "PM", "plan creation, with dependencies"),
    ("task", Some("BLOCKED"), "QUEUED", "System", "last dependency completed"),
    ("task", Some("QUEUED"), "IN_PROGRESS", "Worker", "worker assignment"),
    ("task", Some("REWORK"), "IN_PROGRESS", "Worker", "rework re-assignment"),
    ("task", Some("IN_PROGRESS"), "DONE", "Worker", "worker finished"),
    ("task", Some("IN_PROGRESS"), "QUEUED", "System", "crash recovery"),
    ("task", Some("IN_PROGRESS"), "REWORK", "System", "auto-recovery retry"),
    ("task", Some("IN_PROGRESS"), "SKIPPED", "System", "auto-recovery skip"),
    ("task", Some("IN_PROGRESS"), "INTERRUPTED", "System", "shutdown drain"),
    ("task", Some("INTERRUPTED"), "QUEUED", "System", "resume after interruption"),
    ("task", Some("DONE"), "COMPLETED", "PM", "review approved"),
    ("task", Some("DONE"), "REWORK", "PM", "review rejected"),
    ("task", Some("DONE"), "REWORK", "System", "report validation failed"),
    ("task", Some("DONE"), "ESCALATED", "PM", "review escalated"),
    ("task", Some("ESCALATED"), "QUEUED", "PM", "redesign succeeded"),
    ("task", Some("ESCALATED"), "REJECTED", "PM", "redesign exhausted"),
    ("task", Some("ESCALATED"), "REJECTED", "System", "escalation timeout safety valve"),
    ("task", Some("REWORK"), "REJECTED", "System", "rework limit exceeded"),
    ("task", Some("REWORK"), "QUEUED", "PM", "redesign succeeded"),
    ("task", Some("QUEUED"), "SKIPPED", "System", "recovery skip"),
    ("task", Some("BLOCKED"), "SKIPPED", "System", "recovery skip"),
    ("task", Some("QUEUED"), "CANCELLED", "ANY", "administrative cancel"),
    ("task", Some("BLOCKED"), "CANCELLED", "ANY", "administrative cancel"),
    ("task", Some("IN_PROGRESS"), "CANCELLED", "ANY", "administrative cancel"),
    ("task", Some("DONE"), "CANCELLED", "ANY", "administrative cancel"),
    ("task", Some("REWORK"), "CANCELLED", "ANY", "administrative cancel"),
    ("task", Some("ESCALATED"), "CANCELLED", "ANY", "administrative cancel"),
    ("task", Some("INTERRUPTED"), "CANCELLED", "ANY", "administrative cancel"),
    // order
    ("order", None, "PLANNING", "PM", "order created from description"),
    ("order", Some("PLANNING"), "IN_PROGRESS", "PM", "plan persisted"),
    ("order", Some("IN_PROGRESS"), "REVIEW", "PM", "all tasks done, final review"),
    ("order", Some("REVIEW"), "COMPLETED", "PM", "final review passed"),
    ("order", Some("IN_PROGRESS"), "COMPLETED", "System", "all tasks terminal"),
    ("order", Some("PLANNING"), "ON_HOLD", "ANY", "paused"),
    ("order", Some("IN_PROGRESS"), "ON_HOLD", "ANY", "paused"),
    ("order", Some("ON_HOLD"), "IN_PROGRESS", "ANY", "resumed"),
    ("order", Some("PLANNING"), "CANCELLED", "ANY", "administrative cancel"),
    ("order", Some("IN_PROGRESS"), "CANCELLED", "ANY", "administrative cancel"),
    ("order", Some("REVIEW"), "CANCELLED", "ANY", "administrative cancel"),
    ("order", Some("ON_HOLD"), "CANCELLED", "ANY", "administrative cancel"),
    // backlog
    ("backlog", None, "TODO", "ANY", "intake"),
    ("backlog", Some("TODO"), "IN_PROGRESS", "ANY", "converted to order"),
    ("backlog", Some("IN_PROGRESS"), "DONE", "System", "order completed"),
    ("backlog", Some("TODO"), "DONE", "ANY", "resolved without order"),
    ("backlog", Some("TODO"), "CANCELED", "ANY", "administrative cancel"),
    ("backlog", Some("IN_PROGRESS"), "CANCELED", "ANY", "administrative cancel"),
    ("backlog", Some("TODO"), "EXTERNAL", "ANY", "handled outside the framework"),
];

/// Default error patterns seeded on first init.
/// (id, name, regex, category, action, max_retries)
const ERROR_PATTERN_SEEDS: &[(&str, &str, &str, &str, &str, i64)] = &[
    ("EP_001", "runner_timeout", r"(?i)timed?\s?out", "RETRYABLE", "RETRY", 3),
    ("EP_002", "rate_limited", r"(?i)rate.?limit|429|overloaded", "RETRYABLE", "RETRY", 3),
    ("EP_003", "disk_full", r"(?i)no space left on device", "ENVIRONMENT", "ESCALATE", 0),
    ("EP_004", "permission_denied", r"(?i)permission denied", "ENVIRONMENT", "ESCALATE", 0),
    ("EP_005", "lock_conflict", r"(?i)file lock conflict", "RETRYABLE", "RETRY", 2),
    ("EP_006", "db_malformed", r"(?i)database disk image is malformed", "SYSTEM", "ESCALATE", 0),
    ("EP_007", "report_invalid", r"(?i)report (file )?(missing|too small)", "LOGIC", "RETRY", 2),
    ("EP_008", "artifact_corrupted", r"(?i)artifact (corrupt|truncat)", "LOGIC", "ROLLBACK", 1),
];

/// Apply the embedded schema and seed rows. Idempotent.
pub fn init_schema(conn: &Connection) -> Result<()> {
    debug!("init_schema: applying embedded schema");
    conn.execute_batch(SCHEMA_SQL)?;
    seed_transitions(conn)?;
    seed_error_patterns(conn)?;
    Ok(())
}

fn seed_transitions(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO status_transitions
             (entity_type, from_status, to_status, allowed_role, description, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
    )?;
    for (entity, from, to, role, desc) in TRANSITION_RULES {
        stmt.execute(rusqlite::params![entity, from, to, role, desc])?;
    }
    Ok(())
}

fn seed_error_patterns(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO error_patterns
             (id, pattern_name, regex, category, recommended_action, max_retries, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
    )?;
    for (id, name, regex, category, action, retries) in ERROR_PATTERN_SEEDS {
        stmt.execute(rusqlite::params![id, name, regex, category, action, retries])?;
    }
    Ok(())
}

/// Versions already recorded in schema_version, ascending.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_version ORDER BY version")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

/// Split a migration script into individual statements, stripping comments.
/// Needed so PRAGMA statements can run outside the transaction.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut cleaned = String::with_capacity(sql.len());
    let mut in_block_comment = false;
    for line in sql.lines() {
        let mut rest = line;
        loop {
            if in_block_comment {
                match rest.find("*/") {
                    Some(end) => {
                        in_block_comment = false;
                        rest = &rest[end + 2..];
                    }
                    None => {
                        rest = "";
                        break;
                    }
                }
            } else if let Some(start) = rest.find("/*") {
                cleaned.push_str(&rest[..start]);
                in_block_comment = true;
                rest = &rest[start + 2..];
            } else {
                break;
            }
        }
        let trimmed = rest.trim_start();
        if trimmed.starts_with("--") {
            cleaned.push('\n');
            continue;
        }
        cleaned.push_str(rest);
        cleaned.push('\n');
    }

    cleaned
        .split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(str::to_string)
        .collect()
}

/// Run pending `*.sql` migrations from `migrations_dir`.
///
/// File name format: `{version}_{description}.sql`. PRAGMA statements run
/// outside the transaction; foreign keys are re-enabled afterwards.
/// `ALTER TABLE ... ADD COLUMN` collisions with already-present columns are
/// tolerated so a migration can target databases seeded from newer schemas.
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<Vec<String>> {
    if !migrations_dir.exists() {
        debug!(dir = %migrations_dir.display(), "run_migrations: no migrations directory");
        return Ok(Vec::new());
    }

    let applied = applied_migrations(conn)?;

    let mut files: Vec<_> = std::fs::read_dir(migrations_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort();

    let mut newly_applied = Vec::new();

    for file in files {
        let stem = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let Some((version, description)) = stem.split_once('_') else {
            warn!(file = %file.display(), "run_migrations: invalid migration file name, skipping");
            continue;
        };

        if applied.iter().any(|v| v == version) {
            debug!(version, "run_migrations: already applied");
            continue;
        }

        info!(version, description, "Applying migration");
        let sql = std::fs::read_to_string(&file)?;
        apply_migration(conn, version, description, &sql).map_err(|e| {
            StoreError::MigrationFailed {
                version: version.to_string(),
                message: e.to_string(),
            }
        })?;
        newly_applied.push(version.to_string());
    }

    Ok(newly_applied)
}

fn apply_migration(
    conn: &mut Connection,
    version: &str,
    description: &str,
    sql: &str,
) -> Result<()> {
    let statements = split_sql_statements(sql);
    let (pragmas, regular): (Vec<_>, Vec<_>) = statements
        .into_iter()
        .partition(|stmt| stmt.trim_start().to_uppercase().starts_with("PRAGMA"));

    // PRAGMA statements (typically foreign_keys=OFF) take effect outside
    // any transaction.
    for pragma in &pragmas {
        debug!(pragma, "apply_migration: executing pragma");
        conn.execute_batch(pragma)?;
    }

    let result: Result<()> = (|| {
        let txn = conn.transaction()?;
        for stmt in &regular {
            if let Err(e) = txn.execute(stmt, []) {
                let message = e.to_string().to_lowercase();
                if message.contains("duplicate column name") {
                    debug!(stmt, "apply_migration: column already present, skipping");
                    continue;
                }
                return Err(e.into());
            }
        }
        txn.execute(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![version, description, chrono::Utc::now().to_rfc3339()],
        )?;
        txn.commit()?;
        Ok(())
    })();

    // Restore FK enforcement regardless of what the migration toggled.
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    result
}
