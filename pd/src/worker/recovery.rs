//! AutoRecovery: error classification and strategy selection on any worker
//! failure. The engine's decision is the single source of the task's next
//! status — no other code path decides.

use pmstore::pattern::{self, ErrorPattern};
use pmstore::{escalation, incident, task, ErrorCategory, EscalationType, RecoveryAction, Role, Store, TaskStatus};
use tracing::{info, warn};

/// Classification of one error message.
#[derive(Debug, Clone)]
pub struct ErrorAnalysis {
    /// Matched pattern, when the pattern table recognized the error
    pub pattern: Option<ErrorPattern>,
    pub category: ErrorCategory,
    /// 1.0 for a pattern match, lower for heuristics
    pub confidence: f64,
    pub error_message: String,
}

/// Chosen strategy.
#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pub action: RecoveryAction,
    pub max_retries: u32,
    pub current_retry: u32,
    pub should_rollback_files: bool,
    pub reason: String,
}

/// Result of executing a strategy.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub action_taken: RecoveryAction,
    pub next_status: TaskStatus,
    pub retry_count: u32,
    pub message: String,
}

pub struct AutoRecoveryEngine {
    /// Read-mostly cache of the pattern table; refreshed only when the
    /// operator edits patterns (a new engine per subprocess is enough).
    patterns: Vec<ErrorPattern>,
}

impl AutoRecoveryEngine {
    pub fn new(store: &Store) -> pmstore::Result<Self> {
        let patterns = store.read(|conn| pattern::list_error_patterns(conn))?;
        Ok(Self { patterns })
    }

    /// Classify an error message against the pattern table, falling back to
    /// heuristics: fatal/critical -> SYSTEM (0.4), error -> RETRYABLE (0.5),
    /// anything else -> UNKNOWN (0.3).
    pub fn analyze_error(&self, message: &str) -> ErrorAnalysis {
        if let Some(hit) = pattern::match_error(&self.patterns, message) {
            return ErrorAnalysis {
                category: hit.category,
                confidence: 1.0,
                pattern: Some(hit),
                error_message: message.to_string(),
            };
        }

        let lower = message.to_lowercase();
        let (category, confidence) = if lower.contains("fatal") || lower.contains("critical") {
            (ErrorCategory::System, 0.4)
        } else if lower.contains("error") {
            (ErrorCategory::Retryable, 0.5)
        } else {
            (ErrorCategory::Unknown, 0.3)
        };

        info!(category = category.as_str(), confidence, "analyze_error: heuristic classification");
        ErrorAnalysis {
            pattern: None,
            category,
            confidence,
            error_message: message.to_string(),
        }
    }

    /// Choose the strategy for an analysis, given how often this task has
    /// already been retried.
    pub fn determine_strategy(&self, analysis: &ErrorAnalysis, retry_count: u32) -> RecoveryStrategy {
        if let Some(p) = &analysis.pattern {
            return self.strategy_from_pattern(p, retry_count);
        }
        self.strategy_from_heuristic(analysis, retry_count)
    }

    fn strategy_from_pattern(&self, p: &ErrorPattern, retry_count: u32) -> RecoveryStrategy {
        match p.recommended_action {
            RecoveryAction::Retry => {
                if retry_count < p.max_retries {
                    RecoveryStrategy {
                        action: RecoveryAction::Retry,
                        max_retries: p.max_retries,
                        current_retry: retry_count,
                        should_rollback_files: false,
                        reason: format!(
                            "pattern {} ({}): retry {}/{}",
                            p.id,
                            p.pattern_name,
                            retry_count + 1,
                            p.max_retries
                        ),
                    }
                } else {
                    RecoveryStrategy {
                        action: RecoveryAction::Escalate,
                        max_retries: p.max_retries,
                        current_retry: retry_count,
                        should_rollback_files: false,
                        reason: format!(
                            "pattern {} ({}): retry budget exhausted ({}/{}), escalating",
                            p.id, p.pattern_name, retry_count, p.max_retries
                        ),
                    }
                }
            }
            RecoveryAction::Skip => RecoveryStrategy {
                action: RecoveryAction::Skip,
                max_retries: p.max_retries,
                current_retry: retry_count,
                should_rollback_files: false,
                reason: format!("pattern {} ({}): retry unsuitable, skipping", p.id, p.pattern_name),
            },
            RecoveryAction::Rollback => RecoveryStrategy {
                action: RecoveryAction::Rollback,
                max_retries: p.max_retries,
                current_retry: retry_count,
                should_rollback_files: true,
                reason: format!(
                    "pattern {} ({}): restore snapshot then retry",
                    p.id, p.pattern_name
                ),
            },
            RecoveryAction::Escalate => RecoveryStrategy {
                action: RecoveryAction::Escalate,
                max_retries: p.max_retries,
                current_retry: retry_count,
                should_rollback_files: false,
                reason: format!(
                    "pattern {} ({}): operator intervention required",
                    p.id, p.pattern_name
                ),
            },
        }
    }

    fn strategy_from_heuristic(&self, analysis: &ErrorAnalysis, retry_count: u32) -> RecoveryStrategy {
        match analysis.category {
            ErrorCategory::Retryable => {
                let max_retries = 2;
                if retry_count < max_retries {
                    RecoveryStrategy {
                        action: RecoveryAction::Retry,
                        max_retries,
                        current_retry: retry_count,
                        should_rollback_files: false,
                        reason: format!(
                            "heuristic: RETRYABLE (confidence {:.1}), retry {}/{}",
                            analysis.confidence,
                            retry_count + 1,
                            max_retries
                        ),
                    }
                } else {
                    RecoveryStrategy {
                        action: RecoveryAction::Escalate,
                        max_retries,
                        current_retry: retry_count,
                        should_rollback_files: false,
                        reason: format!(
                            "heuristic: RETRYABLE but retry budget exhausted ({}/{})",
                            retry_count, max_retries
                        ),
                    }
                }
            }
            ErrorCategory::System => RecoveryStrategy {
                action: RecoveryAction::Skip,
                max_retries: 0,
                current_retry: retry_count,
                should_rollback_files: false,
                reason: format!(
                    "heuristic: SYSTEM (confidence {:.1}), retry unsuitable",
                    analysis.confidence
                ),
            },
            _ => RecoveryStrategy {
                action: RecoveryAction::Escalate,
                max_retries: 0,
                current_retry: retry_count,
                should_rollback_files: false,
                reason: format!(
                    "heuristic: {} (confidence {:.1}), operator intervention required",
                    analysis.category, analysis.confidence
                ),
            },
        }
    }

    /// How often this task has been auto-retried, counted from incidents.
    pub fn retry_count(&self, store: &Store, project_id: &str, task_id: &str) -> u32 {
        store
            .read(|conn| incident::count_for_task(conn, project_id, task_id, "WORKER_ERROR"))
            .unwrap_or(0)
    }

    /// Execute a strategy: apply the status change, record the incident,
    /// and (for ESCALATE) the escalation row. ESCALATE terminates the task
    /// via the administrative CANCELLED edge since no worker-side edge
    /// reaches ESCALATED.
    pub fn execute(
        &self,
        store: &Store,
        project_id: &str,
        order_id: &str,
        task_id: &str,
        strategy: &RecoveryStrategy,
        analysis: &ErrorAnalysis,
    ) -> pmstore::Result<RecoveryResult> {
        let next_status = match strategy.action {
            RecoveryAction::Retry | RecoveryAction::Rollback => TaskStatus::Rework,
            RecoveryAction::Skip => TaskStatus::Skipped,
            RecoveryAction::Escalate => TaskStatus::Cancelled,
        };

        store.with_txn(|txn| {
            task::transition_task(
                txn,
                project_id,
                task_id,
                next_status,
                Role::System,
                "AutoRecovery",
                Some(&strategy.reason),
            )?;
            incident::record(
                txn,
                project_id,
                Some(task_id),
                "WORKER_ERROR",
                "medium",
                analysis.pattern.as_ref().map(|p| p.id.as_str()),
                Some(&analysis.error_message),
                Some(&strategy.reason),
            )?;
            if strategy.action == RecoveryAction::Escalate {
                escalation::log_escalation(
                    txn,
                    project_id,
                    Some(order_id),
                    Some(task_id),
                    EscalationType::ReviewEscalation,
                    &format!("worker failure escalated: {}", strategy.reason),
                    Some(&serde_json::json!({
                        "error": analysis.error_message,
                        "category": analysis.category.as_str(),
                    })),
                )?;
            }
            Ok(())
        })?;

        warn!(
            task_id,
            action = strategy.action.as_str(),
            next_status = next_status.as_str(),
            "execute: recovery applied"
        );

        Ok(RecoveryResult {
            action_taken: strategy.action,
            next_status,
            retry_count: strategy.current_retry + 1,
            message: strategy.reason.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmstore::task::{create_task, get_task_required, transition_task, NewTask};
    use pmstore::testutil::{seed_order, seed_project};

    fn engine_and_store() -> (AutoRecoveryEngine, Store) {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let engine = AutoRecoveryEngine::new(&store).unwrap();
        (engine, store)
    }

    fn in_progress_task(store: &Store) -> pmstore::Task {
        let t = create_task(
            store,
            "demo",
            &NewTask {
                order_id: "ORDER_001".to_string(),
                title: "T".to_string(),
                ..NewTask::default()
            },
        )
        .unwrap();
        store
            .with_txn(|txn| {
                transition_task(txn, "demo", &t.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                Ok(())
            })
            .unwrap();
        t
    }

    #[test]
    fn test_pattern_match_beats_heuristic() {
        let (engine, _store) = engine_and_store();
        let analysis = engine.analyze_error("request timed out waiting for model");
        assert!(analysis.pattern.is_some());
        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(analysis.category, ErrorCategory::Retryable);
    }

    #[test]
    fn test_heuristic_tiers() {
        let (engine, _store) = engine_and_store();

        let fatal = engine.analyze_error("FATAL: everything is on fire");
        assert_eq!(fatal.category, ErrorCategory::System);
        assert_eq!(fatal.confidence, 0.4);

        let plain = engine.analyze_error("unexpected error in step 3");
        assert_eq!(plain.category, ErrorCategory::Retryable);
        assert_eq!(plain.confidence, 0.5);

        let vague = engine.analyze_error("something odd happened");
        assert_eq!(vague.category, ErrorCategory::Unknown);
        assert_eq!(vague.confidence, 0.3);
    }

    #[test]
    fn test_retry_budget_escalates() {
        let (engine, _store) = engine_and_store();
        let analysis = engine.analyze_error("unexpected error in step 3");

        let fresh = engine.determine_strategy(&analysis, 0);
        assert_eq!(fresh.action, RecoveryAction::Retry);

        let exhausted = engine.determine_strategy(&analysis, 2);
        assert_eq!(exhausted.action, RecoveryAction::Escalate);
    }

    #[test]
    fn test_system_errors_skip() {
        let (engine, _store) = engine_and_store();
        let analysis = engine.analyze_error("CRITICAL failure in disk subsystem");
        let strategy = engine.determine_strategy(&analysis, 0);
        assert_eq!(strategy.action, RecoveryAction::Skip);
    }

    #[test]
    fn test_execute_retry_moves_to_rework() {
        let (engine, store) = engine_and_store();
        let t = in_progress_task(&store);

        let analysis = engine.analyze_error("unexpected error in step 3");
        let strategy = engine.determine_strategy(&analysis, 0);
        let result = engine
            .execute(&store, "demo", "ORDER_001", &t.id, &strategy, &analysis)
            .unwrap();

        assert_eq!(result.next_status, TaskStatus::Rework);
        store
            .read(|conn| {
                assert_eq!(get_task_required(conn, "demo", &t.id)?.status, TaskStatus::Rework);
                Ok(())
            })
            .unwrap();

        // Incident recorded, counted as a retry
        assert_eq!(engine.retry_count(&store, "demo", &t.id), 1);
    }

    #[test]
    fn test_execute_escalate_terminates_via_cancelled() {
        let (engine, store) = engine_and_store();
        let t = in_progress_task(&store);

        let analysis = engine.analyze_error("no idea what this is");
        let strategy = engine.determine_strategy(&analysis, 0);
        assert_eq!(strategy.action, RecoveryAction::Escalate);

        let result = engine
            .execute(&store, "demo", "ORDER_001", &t.id, &strategy, &analysis)
            .unwrap();
        assert_eq!(result.next_status, TaskStatus::Cancelled);
    }
}
