//! Status, priority, model, and role enums shared across the store.
//!
//! Every enum round-trips through its database string form via `Display` /
//! `FromStr`; unknown strings are validation errors, not panics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

macro_rules! db_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// All variants, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Database string form
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::validation(
                        stringify!($name),
                        format!("unknown value: {}", other),
                    )),
                }
            }
        }
    };
}

db_enum! {
    /// Entity kinds that participate in the transition rule table
    EntityKind {
        Project => "project",
        Order => "order",
        Task => "task",
        Backlog => "backlog",
    }
}

db_enum! {
    /// Task lifecycle states
    TaskStatus {
        Queued => "QUEUED",
        Blocked => "BLOCKED",
        InProgress => "IN_PROGRESS",
        Done => "DONE",
        Rework => "REWORK",
        Completed => "COMPLETED",
        Rejected => "REJECTED",
        Cancelled => "CANCELLED",
        Skipped => "SKIPPED",
        Escalated => "ESCALATED",
        Interrupted => "INTERRUPTED",
    }
}

impl TaskStatus {
    /// Terminal states have no outgoing edges except administrative ones.
    /// An Order is complete once every task is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Rejected
                | TaskStatus::Cancelled
                | TaskStatus::Skipped
        )
    }
}

db_enum! {
    /// Order lifecycle states
    OrderStatus {
        Planning => "PLANNING",
        InProgress => "IN_PROGRESS",
        Review => "REVIEW",
        Completed => "COMPLETED",
        OnHold => "ON_HOLD",
        Cancelled => "CANCELLED",
    }
}

db_enum! {
    /// Backlog item states
    BacklogStatus {
        Todo => "TODO",
        InProgress => "IN_PROGRESS",
        Done => "DONE",
        Canceled => "CANCELED",
        External => "EXTERNAL",
    }
}

db_enum! {
    /// Order/task priority, P0 highest
    Priority {
        P0 => "P0",
        P1 => "P1",
        P2 => "P2",
    }
}

impl Priority {
    /// Ranking key: lower sorts first
    pub fn rank(&self) -> u8 {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P1
    }
}

db_enum! {
    /// Backlog intake priority
    BacklogPriority {
        High => "High",
        Medium => "Medium",
        Low => "Low",
    }
}

db_enum! {
    /// Recommended AI model for a task
    Model {
        Haiku => "Haiku",
        Sonnet => "Sonnet",
        Opus => "Opus",
    }
}

db_enum! {
    /// Actor roles recognized by the transition rule table.
    /// `Any` skips role filtering entirely.
    Role {
        Pm => "PM",
        Worker => "Worker",
        System => "System",
        Any => "ANY",
    }
}

db_enum! {
    /// Durable event types consumed by the daemon loop
    EventType {
        TaskCompleted => "TASK_COMPLETED",
        TaskFailed => "TASK_FAILED",
        DependencyResolved => "DEPENDENCY_RESOLVED",
        WorkerCrashed => "WORKER_CRASHED",
    }
}

db_enum! {
    /// Audited policy deviations
    EscalationType {
        ModelUpgrade => "MODEL_UPGRADE",
        CriteriaRelaxation => "CRITERIA_RELAXATION",
        ReviewRejection => "REVIEW_REJECTION",
        ReviewEscalation => "REVIEW_ESCALATION",
        ReworkLimitExceeded => "REWORK_LIMIT_EXCEEDED",
        EscalationTimeout => "ESCALATION_TIMEOUT",
        TaskReplan => "TASK_REPLAN",
    }
}

db_enum! {
    /// Error classification categories (error_patterns.category)
    ErrorCategory {
        Retryable => "RETRYABLE",
        System => "SYSTEM",
        Logic => "LOGIC",
        Environment => "ENVIRONMENT",
        Unknown => "UNKNOWN",
    }
}

db_enum! {
    /// Recovery actions recommended by error patterns
    RecoveryAction {
        Retry => "RETRY",
        Skip => "SKIP",
        Rollback => "ROLLBACK",
        Escalate => "ESCALATE",
    }
}

db_enum! {
    /// Bug pattern lifecycle
    BugPatternStatus {
        Active => "ACTIVE",
        Archived => "ARCHIVED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_task_status() {
        for status in TaskStatus::ALL {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, *status);
        }
    }

    #[test]
    fn test_unknown_status_is_error() {
        assert!("DOING".parse::<TaskStatus>().is_err());
        assert!("".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Rejected.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Done.is_terminal());
        assert!(!TaskStatus::Escalated.is_terminal());
        assert!(!TaskStatus::Rework.is_terminal());
    }

    #[test]
    fn test_priority_rank() {
        assert!(Priority::P0.rank() < Priority::P1.rank());
        assert!(Priority::P1.rank() < Priority::P2.rank());
    }
}
