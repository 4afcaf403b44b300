//! Error patterns (recovery classification) and bug patterns (learned
//! rules injected into worker prompts).
//!
//! The error-pattern table is read-mostly; callers may cache the parsed
//! list and invalidate only when the operator edits the table.

use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::db::now_iso;
use crate::error::Result;
use crate::types::{BugPatternStatus, ErrorCategory, RecoveryAction};

#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub id: String,
    pub pattern_name: String,
    pub regex: String,
    pub category: ErrorCategory,
    pub recommended_action: RecoveryAction,
    pub max_retries: u32,
    pub is_active: bool,
}

impl ErrorPattern {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let parse_err = |e: crate::error::StoreError| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        };
        Ok(Self {
            id: row.get("id")?,
            pattern_name: row.get("pattern_name")?,
            regex: row.get("regex")?,
            category: row.get::<_, String>("category")?.parse().map_err(parse_err)?,
            recommended_action: row
                .get::<_, String>("recommended_action")?
                .parse()
                .map_err(parse_err)?,
            max_retries: row.get::<_, i64>("max_retries")? as u32,
            is_active: row.get::<_, i64>("is_active")? != 0,
        })
    }
}

/// Active error patterns, in id order.
pub fn list_error_patterns(conn: &Connection) -> Result<Vec<ErrorPattern>> {
    let mut stmt =
        conn.prepare("SELECT * FROM error_patterns WHERE is_active = 1 ORDER BY id")?;
    let mut patterns = Vec::new();
    for row in stmt.query_map([], ErrorPattern::from_row)? {
        patterns.push(row?);
    }
    Ok(patterns)
}

/// First active pattern whose regex matches the error message.
/// Unparsable regexes are skipped with a warning rather than failing the
/// recovery path.
pub fn match_error(patterns: &[ErrorPattern], message: &str) -> Option<ErrorPattern> {
    for pattern in patterns {
        match Regex::new(&pattern.regex) {
            Ok(re) => {
                if re.is_match(message) {
                    debug!(pattern_id = %pattern.id, "match_error: matched");
                    return Some(pattern.clone());
                }
            }
            Err(e) => {
                warn!(pattern_id = %pattern.id, error = %e, "match_error: invalid regex, skipping");
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct BugPattern {
    pub id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub pattern_type: Option<String>,
    pub severity: String,
    pub solution: Option<String>,
    pub occurrence_count: u32,
    pub total_injections: u32,
    pub related_failures: u32,
    pub effectiveness_score: f64,
    pub status: BugPatternStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl BugPattern {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let parse_err = |e: crate::error::StoreError| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        };
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            pattern_type: row.get("pattern_type")?,
            severity: row.get("severity")?,
            solution: row.get("solution")?,
            occurrence_count: row.get::<_, i64>("occurrence_count")? as u32,
            total_injections: row.get::<_, i64>("total_injections")? as u32,
            related_failures: row.get::<_, i64>("related_failures")? as u32,
            effectiveness_score: row.get("effectiveness_score")?,
            status: row.get::<_, String>("status")?.parse().map_err(parse_err)?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Record a bug pattern occurrence: insert, or bump occurrence_count when
/// the id already exists.
#[allow(clippy::too_many_arguments)]
pub fn upsert_bug_pattern(
    conn: &Connection,
    id: &str,
    project_id: Option<&str>,
    title: &str,
    description: Option<&str>,
    pattern_type: Option<&str>,
    severity: &str,
    solution: Option<&str>,
) -> Result<()> {
    let now = now_iso();
    let existing: Option<i64> = conn
        .query_row("SELECT 1 FROM bug_patterns WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    if existing.is_some() {
        conn.execute(
            "UPDATE bug_patterns
             SET occurrence_count = occurrence_count + 1, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![now, id],
        )?;
    } else {
        conn.execute(
            "INSERT INTO bug_patterns
                 (id, project_id, title, description, pattern_type, severity, solution,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            rusqlite::params![id, project_id, title, description, pattern_type, severity, solution, now],
        )?;
    }
    Ok(())
}

/// ACTIVE patterns for the project (project-scoped plus global), most
/// effective first, capped at `limit`.
pub fn active_bug_patterns(
    conn: &Connection,
    project_id: &str,
    limit: usize,
) -> Result<Vec<BugPattern>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM bug_patterns
         WHERE status = 'ACTIVE' AND (project_id IS NULL OR project_id = ?1)
         ORDER BY effectiveness_score DESC, occurrence_count DESC
         LIMIT ?2",
    )?;
    let mut patterns = Vec::new();
    for row in stmt.query_map(rusqlite::params![project_id, limit as i64], BugPattern::from_row)? {
        patterns.push(row?);
    }
    Ok(patterns)
}

/// Each prompt injection counts toward the pattern's exposure so
/// effectiveness can be computed later.
pub fn record_injection(conn: &Connection, pattern_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE bug_patterns
         SET total_injections = total_injections + 1, updated_at = ?1
         WHERE id = ?2",
        rusqlite::params![now_iso(), pattern_id],
    )?;
    Ok(())
}

/// A failure related to an injected pattern lowers its effectiveness:
/// score = 1 - related_failures / max(total_injections, 1), clamped to [0,1].
pub fn record_related_failure(conn: &Connection, pattern_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE bug_patterns
         SET related_failures = related_failures + 1,
             effectiveness_score = MAX(0.0, MIN(1.0,
                 1.0 - CAST(related_failures + 1 AS REAL) / MAX(total_injections, 1))),
             updated_at = ?1
         WHERE id = ?2",
        rusqlite::params![now_iso(), pattern_id],
    )?;
    Ok(())
}

/// Archive a pattern so it stops being injected.
pub fn archive_bug_pattern(conn: &Connection, pattern_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE bug_patterns SET status = 'ARCHIVED', updated_at = ?1 WHERE id = ?2",
        rusqlite::params![now_iso(), pattern_id],
    )?;
    Ok(())
}
