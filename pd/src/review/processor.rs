//! Reviewer: judge a DONE task's report and drive the APPROVED / REJECTED /
//! ESCALATED branch. Reviews are always out-of-process (daemon-spawned);
//! a REJECTED task rests in REWORK until the detector relaunches it.

use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pmstore::task::Task;
use pmstore::{escalation, history, task, EntityKind, EscalationType, Model, Role, Store, TaskStatus};

use crate::config::Config;
use crate::paths::OrderPaths;
use crate::pm::redesign::RedesignHandler;
use crate::prompts;
use crate::resolver;
use crate::runner::{extract_json, Runner, RunnerRequest};

/// Minimum non-whitespace characters for a reviewable report.
pub const MIN_REPORT_CHARS: usize = 50;

static TASK_REF_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"TASK_\d{3,}").expect("static regex"));

/// Parsed review verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub checklist: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Final review outcome.
#[derive(Debug)]
pub struct ReviewSummary {
    pub task_id: String,
    pub verdict: String,
    pub final_status: TaskStatus,
    pub reject_count: u32,
}

pub struct ReviewProcessor {
    store: Store,
    runner: Arc<dyn Runner>,
    config: Config,
    project_id: String,
    task_id: String,
    model: Model,
    timeout: Duration,
}

#[derive(Serialize)]
struct ReviewPromptContext<'a> {
    task_id: &'a str,
    order_id: &'a str,
    project_id: &'a str,
    title: &'a str,
    priority: String,
    description: Option<&'a str>,
    reject_count: u32,
    criteria: &'a str,
    report: &'a str,
}

impl ReviewProcessor {
    pub fn new(
        store: Store,
        runner: Arc<dyn Runner>,
        config: Config,
        project_id: String,
        task_id: String,
        model: Option<Model>,
        timeout: Duration,
    ) -> Self {
        let model = model.unwrap_or(config.review.review_model);
        Self {
            store,
            runner,
            config,
            project_id,
            task_id,
            model,
            timeout,
        }
    }

    pub async fn process(&self) -> Result<ReviewSummary> {
        // Preconditions: DONE, unreviewed, and a real report on disk.
        // Violations abort with an explicit error; the task stays DONE.
        let t = self
            .store
            .read(|conn| task::get_task_required(conn, &self.project_id, &self.task_id))?;

        if t.status != TaskStatus::Done {
            bail!(
                "task {} is not reviewable: status {} (expected DONE)",
                t.id,
                t.status
            );
        }
        if t.reviewed_at.is_some() {
            bail!("task {} already reviewed at {}", t.id, t.reviewed_at.as_deref().unwrap_or("?"));
        }

        let paths = OrderPaths::new(&self.config.storage.projects_root, &self.project_id, &t.order_id);
        let report_path = paths.report_file(&t.id);
        let report = std::fs::read_to_string(&report_path)
            .context(format!("report missing: {}", report_path.display()))?;
        if report.chars().filter(|c| !c.is_whitespace()).count() < MIN_REPORT_CHARS {
            bail!(
                "report too small to review: {} ({} non-whitespace chars required)",
                report_path.display(),
                MIN_REPORT_CHARS
            );
        }

        // Claim the review before judging
        self.store
            .with_txn(|txn| task::set_reviewed_at(txn, &self.project_id, &t.id))?;

        // Criteria strictness depends on how many times the task bounced
        let criteria = criteria_for_rework_count(t.reject_count);
        if t.reject_count >= 2 {
            self.log_relaxation(&t)?;
        }

        let prompt = prompts::render(
            "review",
            &ReviewPromptContext {
                task_id: &t.id,
                order_id: &t.order_id,
                project_id: &self.project_id,
                title: &t.title,
                priority: t.priority.to_string(),
                description: t.description.as_deref(),
                reject_count: t.reject_count,
                criteria,
                report: &report,
            },
        )?;

        let outcome = self
            .runner
            .run(RunnerRequest::new(prompt, self.model, self.timeout))
            .await?;
        if !outcome.success {
            bail!(
                "review runner failed: {}",
                outcome.error.as_deref().unwrap_or("unknown")
            );
        }
        let verdict = parse_verdict(&outcome.text)?;

        info!(
            task_id = %t.id,
            verdict = %verdict.verdict,
            reject_count = t.reject_count,
            "process: verdict parsed"
        );

        let summary = match verdict.verdict.as_str() {
            "APPROVED" => self.handle_approved(&t, &verdict).await?,
            "REJECTED" => self.handle_rejected(&t, &verdict).await?,
            "ESCALATED" => self.handle_escalated(&t, &verdict).await?,
            other => bail!("unknown verdict: {}", other),
        };

        self.write_review_file(&paths, &t, &verdict, &summary)?;
        Ok(summary)
    }

    async fn handle_approved(&self, t: &Task, verdict: &ReviewVerdict) -> Result<ReviewSummary> {
        self.store.with_txn(|txn| {
            task::transition_task(
                txn,
                &self.project_id,
                &t.id,
                TaskStatus::Completed,
                Role::Pm,
                "Reviewer",
                Some("review approved"),
            )?;
            Ok(())
        })?;

        // Entry to COMPLETED unblocks dependents
        resolver::resolve_on_completion(&self.store, &self.project_id, &t.order_id, &t.id)?;

        self.post_approved_hook(t, verdict)?;

        Ok(ReviewSummary {
            task_id: t.id.clone(),
            verdict: "APPROVED".to_string(),
            final_status: TaskStatus::Completed,
            reject_count: t.reject_count,
        })
    }

    /// Post-approval impact analysis: recommendations naming downstream
    /// tasks get appended to those tasks' descriptions, recorded as a
    /// TASK_REPLAN escalation (not an error).
    fn post_approved_hook(&self, t: &Task, verdict: &ReviewVerdict) -> Result<()> {
        let mut replanned = Vec::new();

        self.store.with_txn(|txn| {
            for recommendation in &verdict.recommendations {
                for hit in TASK_REF_RE.find_iter(recommendation) {
                    let target = hit.as_str();
                    if target == t.id {
                        continue;
                    }
                    let Some(downstream) = task::get_task(txn, &self.project_id, target)? else {
                        continue;
                    };
                    if downstream.status.is_terminal() {
                        continue;
                    }

                    let note = format!(
                        "{}\n\nNote from review of {}: {}",
                        downstream.description.as_deref().unwrap_or(""),
                        t.id,
                        recommendation
                    );
                    task::set_description(
                        txn,
                        &self.project_id,
                        target,
                        note.trim(),
                        "Reviewer",
                        Some(&format!("impact analysis from {} review", t.id)),
                    )?;
                    replanned.push(target.to_string());
                }
            }

            if !replanned.is_empty() {
                escalation::log_escalation(
                    txn,
                    &self.project_id,
                    Some(&t.order_id),
                    Some(&t.id),
                    EscalationType::TaskReplan,
                    &format!("post-approval impact analysis rewrote {} task(s)", replanned.len()),
                    Some(&serde_json::json!({ "rewritten_tasks": replanned })),
                )?;
            }
            Ok(())
        })?;
        Ok(())
    }

    async fn handle_rejected(&self, t: &Task, verdict: &ReviewVerdict) -> Result<ReviewSummary> {
        let mut comment_parts = Vec::new();
        if !verdict.issues.is_empty() {
            comment_parts.push(format!("issues: {}", verdict.issues.join("; ")));
        }
        if !verdict.recommendations.is_empty() {
            comment_parts.push(format!("guidance: {}", verdict.recommendations.join("; ")));
        }
        let comment = if comment_parts.is_empty() {
            "rework required".to_string()
        } else {
            comment_parts.join(" | ")
        };

        let new_reject_count = self.store.with_txn(|txn| {
            let outcome = task::transition_task(
                txn,
                &self.project_id,
                &t.id,
                TaskStatus::Rework,
                Role::Pm,
                "Reviewer",
                Some("review rejected"),
            )?;
            task::record_rework_comment(txn, &self.project_id, &t.id, &comment)?;
            escalation::log_escalation(
                txn,
                &self.project_id,
                Some(&t.order_id),
                Some(&t.id),
                EscalationType::ReviewRejection,
                &format!("review rejected (rework #{})", outcome.reject_count),
                Some(&serde_json::json!({
                    "rework_count": outcome.reject_count,
                    "issues": verdict.issues,
                    "recommendations": verdict.recommendations,
                })),
            )?;
            Ok(outcome.reject_count)
        })?;

        // Beyond the rework budget: PM redesign, REJECTED only if it fails
        if new_reject_count > self.config.review.max_rework {
            warn!(
                task_id = %t.id,
                reject_count = new_reject_count,
                max_rework = self.config.review.max_rework,
                "handle_rejected: rework budget exhausted, attempting redesign"
            );

            let handler = RedesignHandler::new(
                Store::open(&self.config.storage.db_path)?,
                Arc::clone(&self.runner),
                self.config.clone(),
            );
            let result = handler
                .redesign(&self.project_id, &t.id, &comment, self.timeout)
                .await;

            if result.success {
                return Ok(ReviewSummary {
                    task_id: t.id.clone(),
                    verdict: "REJECTED".to_string(),
                    final_status: TaskStatus::Queued,
                    reject_count: 0,
                });
            }

            self.store.with_txn(|txn| {
                task::transition_task(
                    txn,
                    &self.project_id,
                    &t.id,
                    TaskStatus::Rejected,
                    Role::System,
                    "Reviewer",
                    Some("rework limit exceeded and redesign failed"),
                )?;
                escalation::log_escalation(
                    txn,
                    &self.project_id,
                    Some(&t.order_id),
                    Some(&t.id),
                    EscalationType::ReworkLimitExceeded,
                    &format!(
                        "rework limit exceeded ({}/{}), redesign failed",
                        new_reject_count, self.config.review.max_rework
                    ),
                    Some(&serde_json::json!({
                        "rework_count": new_reject_count,
                        "max_rework": self.config.review.max_rework,
                        "redesign_error": result.error,
                    })),
                )?;
                Ok(())
            })?;

            return Ok(ReviewSummary {
                task_id: t.id.clone(),
                verdict: "REJECTED".to_string(),
                final_status: TaskStatus::Rejected,
                reject_count: new_reject_count,
            });
        }

        // Within budget: the task waits in REWORK for the daemon's detector
        Ok(ReviewSummary {
            task_id: t.id.clone(),
            verdict: "REJECTED".to_string(),
            final_status: TaskStatus::Rework,
            reject_count: new_reject_count,
        })
    }

    async fn handle_escalated(&self, t: &Task, verdict: &ReviewVerdict) -> Result<ReviewSummary> {
        self.store.with_txn(|txn| {
            task::transition_task(
                txn,
                &self.project_id,
                &t.id,
                TaskStatus::Escalated,
                Role::Pm,
                "Reviewer",
                Some("review escalated"),
            )?;
            escalation::log_escalation(
                txn,
                &self.project_id,
                Some(&t.order_id),
                Some(&t.id),
                EscalationType::ReviewEscalation,
                &format!("review escalated: {}", verdict.summary),
                Some(&serde_json::json!({ "issues": verdict.issues })),
            )?;
            Ok(())
        })?;

        // PM auto-judge, bounded per task by how often the task has ever
        // entered ESCALATED (counted from history, including the entry just
        // recorded); at the cap the task terminates without a redesign
        let escalation_count = self.store.read(|conn| {
            history::count_entries_into(conn, EntityKind::Task, &t.id, "status", "ESCALATED")
        })?;

        if escalation_count >= self.config.review.escalation_max {
            warn!(
                task_id = %t.id,
                escalation_count,
                max = self.config.review.escalation_max,
                "handle_escalated: escalation budget exhausted"
            );
            return self.escalated_to_rejected(t, "escalation budget exhausted").await;
        }

        let context = format!(
            "review escalated: {} | issues: {}",
            verdict.summary,
            verdict.issues.join("; ")
        );
        let handler = RedesignHandler::new(
            Store::open(&self.config.storage.db_path)?,
            Arc::clone(&self.runner),
            self.config.clone(),
        );
        let result = handler
            .redesign(&self.project_id, &t.id, &context, self.timeout)
            .await;

        if result.success {
            // Redesign requeued the task and reset its reject counter
            Ok(ReviewSummary {
                task_id: t.id.clone(),
                verdict: "ESCALATED".to_string(),
                final_status: TaskStatus::Queued,
                reject_count: 0,
            })
        } else {
            self.escalated_to_rejected(t, result.error.as_deref().unwrap_or("redesign declined"))
                .await
        }
    }

    async fn escalated_to_rejected(&self, t: &Task, reason: &str) -> Result<ReviewSummary> {
        self.store.with_txn(|txn| {
            task::transition_task(
                txn,
                &self.project_id,
                &t.id,
                TaskStatus::Rejected,
                Role::Pm,
                "Reviewer",
                Some(&format!("escalation terminal: {}", reason)),
            )?;
            Ok(())
        })?;
        Ok(ReviewSummary {
            task_id: t.id.clone(),
            verdict: "ESCALATED".to_string(),
            final_status: TaskStatus::Rejected,
            reject_count: t.reject_count,
        })
    }

    fn log_relaxation(&self, t: &Task) -> Result<()> {
        self.store.with_txn(|txn| {
            escalation::log_escalation(
                txn,
                &self.project_id,
                Some(&t.order_id),
                Some(&t.id),
                EscalationType::CriteriaRelaxation,
                &format!("review criteria relaxed at rework {}", t.reject_count),
                Some(&serde_json::json!({ "rework_count": t.reject_count })),
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn write_review_file(
        &self,
        paths: &OrderPaths,
        t: &Task,
        verdict: &ReviewVerdict,
        summary: &ReviewSummary,
    ) -> Result<()> {
        let mut md = format!("# Review: {} - {}\n\n", t.id, t.title);
        md.push_str(&format!("- Verdict: {}\n", verdict.verdict));
        md.push_str(&format!("- Final status: {}\n", summary.final_status));
        md.push_str(&format!("- Rework count: {}\n", summary.reject_count));
        md.push_str(&format!("- Reviewed: {}\n\n", pmstore::now_iso()));
        md.push_str(&format!("## Summary\n\n{}\n", verdict.summary));

        for (title, items) in [
            ("Checklist", &verdict.checklist),
            ("Issues", &verdict.issues),
            ("Recommendations", &verdict.recommendations),
        ] {
            if !items.is_empty() {
                md.push_str(&format!("\n## {}\n\n", title));
                for item in items {
                    md.push_str(&format!("- {}\n", item));
                }
            }
        }

        std::fs::create_dir_all(paths.review_dir())?;
        std::fs::write(paths.review_file(&t.id), md).context("Failed to write review file")?;
        Ok(())
    }
}

/// Review criteria text by rework count: standard (0-1), relaxed (2),
/// minimal (3+). Relaxation trades polish for termination.
pub fn criteria_for_rework_count(reject_count: u32) -> &'static str {
    match reject_count {
        0 => {
            "Standard criteria:\n\
             1. Completion criteria are demonstrably met.\n\
             2. The artifacts satisfy the requirements.\n\
             3. Quality is acceptable: readable, maintainable code.\n\
             4. Tests are adequate for the change."
        }
        1 => {
            "Standard criteria (rework 1):\n\
             1. Completion criteria are demonstrably met.\n\
             2. The artifacts satisfy the requirements.\n\
             3. Quality is acceptable: readable, maintainable code.\n\
             4. Tests are adequate for the change.\n\
             Focus on whether the previously reported issues are fixed."
        }
        2 => {
            "Relaxed criteria (rework 2) - accept non-critical gaps:\n\
             REQUIRED: the essential completion criteria are met and the\n\
             change works without major defects.\n\
             ACCEPTABLE: minor style differences, naming nits, imperfect\n\
             test coverage (basic cases suffice), documentation wording.\n\
             Reject only on essential functional failure; put everything\n\
             else in recommendations and consider APPROVED."
        }
        _ => {
            "Minimal criteria (rework 3+) - completion over polish:\n\
             Check only that the task's main purpose is achieved, nothing\n\
             critical is broken, and existing behavior is not destroyed.\n\
             Code quality, test coverage, documentation, naming, and\n\
             performance concerns are all acceptable as-is; note them in\n\
             recommendations. Approve unless there is a critical functional\n\
             defect or regression, to end the rework loop."
        }
    }
}

/// Parse the strict JSON verdict from the model response.
pub fn parse_verdict(text: &str) -> Result<ReviewVerdict> {
    let json = extract_json(text).ok_or_else(|| eyre::eyre!("no JSON object in review response"))?;
    let verdict: ReviewVerdict =
        serde_json::from_str(json).context("review JSON does not match schema")?;
    if !matches!(verdict.verdict.as_str(), "APPROVED" | "REJECTED" | "ESCALATED") {
        bail!("unknown verdict value: {}", verdict.verdict);
    }
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmstore::task::{create_task, get_task_required, transition_task, NewTask};
    use pmstore::testutil::{seed_order, seed_project};
    use crate::runner::ScriptRunner;

    fn setup(dir: &std::path::Path) -> (Store, Config) {
        let store = Store::open(dir.join("pm.db")).unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let config = Config {
            storage: crate::config::StorageConfig {
                db_path: dir.join("pm.db"),
                projects_root: dir.to_path_buf(),
            },
            ..Config::default()
        };
        (store, config)
    }

    fn done_task(store: &Store, config: &Config, report_body: &str) -> Task {
        let t = create_task(
            store,
            "demo",
            &NewTask {
                order_id: "ORDER_001".to_string(),
                title: "Reviewable".to_string(),
                ..NewTask::default()
            },
        )
        .unwrap();
        store
            .with_txn(|txn| {
                transition_task(txn, "demo", &t.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &t.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                Ok(())
            })
            .unwrap();

        let paths = OrderPaths::new(&config.storage.projects_root, "demo", "ORDER_001");
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.report_file(&t.id), report_body).unwrap();
        t
    }

    fn processor(store: Store, config: Config, task_id: &str, verdict: serde_json::Value) -> ReviewProcessor {
        let script = format!("cat > /dev/null; cat <<'EOF'\n{}\nEOF", verdict);
        ReviewProcessor::new(
            store,
            Arc::new(ScriptRunner::new(script)),
            config,
            "demo".to_string(),
            task_id.to_string(),
            None,
            Duration::from_secs(30),
        )
    }

    fn long_report() -> String {
        "did the work thoroughly and verified everything carefully indeed ".repeat(3)
    }

    #[test]
    fn test_criteria_tiers() {
        assert!(criteria_for_rework_count(0).contains("Standard"));
        assert!(criteria_for_rework_count(1).contains("previously reported"));
        assert!(criteria_for_rework_count(2).contains("Relaxed"));
        assert!(criteria_for_rework_count(3).contains("Minimal"));
        assert!(criteria_for_rework_count(7).contains("Minimal"));
    }

    #[test]
    fn test_parse_verdict_rejects_unknown() {
        assert!(parse_verdict(r#"{"verdict": "MAYBE"}"#).is_err());
        let v = parse_verdict(r#"{"verdict": "APPROVED", "summary": "fine"}"#).unwrap();
        assert_eq!(v.verdict, "APPROVED");
    }

    #[tokio::test]
    async fn test_approved_completes_and_unblocks() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path());
        let t = done_task(&store, &config, &long_report());

        // A dependent task blocked on t
        let dependent = create_task(
            &store,
            "demo",
            &NewTask {
                order_id: "ORDER_001".to_string(),
                title: "Dependent".to_string(),
                depends_on: vec![t.id.clone()],
                ..NewTask::default()
            },
        )
        .unwrap();

        let p = processor(
            store,
            config,
            &t.id,
            serde_json::json!({"verdict": "APPROVED", "summary": "good work"}),
        );
        let summary = p.process().await.unwrap();
        assert_eq!(summary.final_status, TaskStatus::Completed);

        p.store
            .read(|conn| {
                assert_eq!(get_task_required(conn, "demo", &t.id)?.status, TaskStatus::Completed);
                // Dependent unblocked by the resolver
                assert_eq!(get_task_required(conn, "demo", &dependent.id)?.status, TaskStatus::Queued);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_within_budget_rests_in_rework() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path());
        let t = done_task(&store, &config, &long_report());

        let p = processor(
            store,
            config,
            &t.id,
            serde_json::json!({
                "verdict": "REJECTED",
                "summary": "not quite",
                "issues": ["missing tests"],
                "recommendations": ["add unit tests"]
            }),
        );
        let summary = p.process().await.unwrap();
        assert_eq!(summary.final_status, TaskStatus::Rework);
        assert_eq!(summary.reject_count, 1);

        p.store
            .read(|conn| {
                let reloaded = get_task_required(conn, "demo", &t.id)?;
                assert_eq!(reloaded.status, TaskStatus::Rework);
                assert_eq!(reloaded.reject_count, 1);
                // reviewed_at stays set until the next IN_PROGRESS entry
                assert!(reloaded.reviewed_at.is_some());

                // Rework comment recorded for the next worker prompt
                let comments = task::rework_history(conn, "demo", &t.id)?;
                assert!(comments[0].1.contains("missing tests"));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreviewable_states_abort() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path());
        let t = done_task(&store, &config, &long_report());

        // Claim the review once
        store
            .with_txn(|txn| {
                task::set_reviewed_at(txn, "demo", &t.id)?;
                Ok(())
            })
            .unwrap();

        let p = processor(
            store,
            config,
            &t.id,
            serde_json::json!({"verdict": "APPROVED"}),
        );
        let result = p.process().await;
        assert!(result.is_err());

        // The task stays DONE
        p.store
            .read(|conn| {
                assert_eq!(get_task_required(conn, "demo", &t.id)?.status, TaskStatus::Done);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_tiny_report_aborts_review() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path());
        let t = done_task(&store, &config, "too short");

        let p = processor(
            store,
            config,
            &t.id,
            serde_json::json!({"verdict": "APPROVED"}),
        );
        assert!(p.process().await.is_err());
    }

    #[tokio::test]
    async fn test_escalated_with_declining_redesign_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path());
        let t = done_task(&store, &config, &long_report());

        // The same script answers both the review (ESCALATED) and the
        // redesign (decline): both shapes in one JSON object
        let p = processor(
            store,
            config,
            &t.id,
            serde_json::json!({
                "verdict": "ESCALATED",
                "summary": "task is ill-posed",
                "action": "decline",
                "reason": "cannot be salvaged"
            }),
        );
        let summary = p.process().await.unwrap();
        assert_eq!(summary.verdict, "ESCALATED");
        assert_eq!(summary.final_status, TaskStatus::Rejected);
    }

    #[tokio::test]
    async fn test_relaxation_logged_at_rework_two() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path());
        let t = done_task(&store, &config, &long_report());

        // Bounce the task twice so reject_count = 2 and it is DONE again
        store
            .with_txn(|txn| {
                for _ in 0..2 {
                    transition_task(txn, "demo", &t.id, TaskStatus::Rework, Role::Pm, "PM", None)?;
                    transition_task(txn, "demo", &t.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                    transition_task(txn, "demo", &t.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                }
                Ok(())
            })
            .unwrap();

        let p = processor(
            store,
            config,
            &t.id,
            serde_json::json!({"verdict": "APPROVED", "summary": "ok now"}),
        );
        let summary = p.process().await.unwrap();
        assert_eq!(summary.final_status, TaskStatus::Completed);

        p.store
            .read(|conn| {
                assert_eq!(
                    escalation::count_for_task(conn, "demo", &t.id, EscalationType::CriteriaRelaxation)?,
                    1
                );
                Ok(())
            })
            .unwrap();
    }
}
