//! Store error types

use crate::types::{EntityKind, Role};

/// Error raised when a status change is not present in the transition rule table.
///
/// Carries the list of legal successor statuses so callers (reviewer, daemon)
/// can reason about what to do next.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "invalid status transition: entity={entity}, current={}, target={to}, role={role}, allowed=[{}]",
    .from.as_deref().unwrap_or("(initial)"),
    .allowed.join(", ")
)]
pub struct TransitionError {
    /// Entity kind the transition was attempted on
    pub entity: EntityKind,
    /// Current status (None for initial-state transitions)
    pub from: Option<String>,
    /// Attempted target status
    pub to: String,
    /// Role that attempted the transition
    pub role: Role,
    /// Legal successor statuses from the current state
    pub allowed: Vec<String>,
}

/// Errors produced by store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("not found: {kind} {id} (project: {project_id})")]
    NotFound {
        kind: EntityKind,
        id: String,
        project_id: String,
    },

    #[error("duplicate id: {kind} {id} (project: {project_id})")]
    Duplicate {
        kind: EntityKind,
        id: String,
        project_id: String,
    },

    #[error("dependency missing: task {task_id} depends on absent task {depends_on}")]
    DependencyMissing { task_id: String, depends_on: String },

    #[error("migration blocked: {0}")]
    MigrationBlocked(String),

    #[error("migration failed ({version}): {message}")]
    MigrationFailed { version: String, message: String },

    #[error("id allocation failed after {attempts} attempts: {kind}")]
    IdAllocation { kind: EntityKind, attempts: u32 },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Convenience constructor for validation failures
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a unique/constraint violation (used by the
    /// id-allocation retry loop to absorb races between writers).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// Result alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
