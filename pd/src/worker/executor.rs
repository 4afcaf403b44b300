//! Per-task worker execution: assign, lock, prompt, run, self-verify,
//! report, quality hooks, DONE. Any failure is routed through AutoRecovery,
//! which alone decides the task's next status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use pmstore::task::Task;
use pmstore::{escalation, incident, lock, pattern, task, EscalationType, Model, Role, Store, TaskStatus};

use crate::config::Config;
use crate::paths::OrderPaths;
use crate::permissions;
use crate::prompts;
use crate::runner::{Runner, RunnerRequest};
use crate::worker::recovery::{AutoRecoveryEngine, RecoveryResult};
use crate::worker::{report, verify};

/// Final result returned by the subprocess (exit code derives from it).
#[derive(Debug)]
pub struct WorkerRunSummary {
    pub task_id: String,
    pub success: bool,
    pub model: Model,
    pub cost_usd: Option<f64>,
    pub report_path: Option<PathBuf>,
    pub recovery: Option<RecoveryResult>,
    pub error: Option<String>,
}

pub struct WorkerExecutor {
    store: Store,
    runner: Arc<dyn Runner>,
    config: Config,
    project_id: String,
    task_id: String,
    model_override: Option<Model>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ReworkEntry {
    timestamp: String,
    comment: String,
}

#[derive(Serialize)]
struct KnownBug {
    title: String,
    severity: String,
    solution: Option<String>,
}

#[derive(Serialize)]
struct WorkerPromptContext {
    task_id: String,
    order_id: String,
    project_id: String,
    title: String,
    priority: String,
    description: Option<String>,
    target_files: Vec<String>,
    rework_history: Vec<ReworkEntry>,
    failure_context: Option<String>,
    allowed_tools: String,
    project_path: String,
    migration_safety: bool,
    known_bugs: Vec<KnownBug>,
    task_definition: Option<String>,
}

impl WorkerExecutor {
    pub fn new(
        store: Store,
        runner: Arc<dyn Runner>,
        config: Config,
        project_id: String,
        task_id: String,
        model_override: Option<Model>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            project_id,
            task_id,
            model_override,
            timeout,
        }
    }

    /// Execute the task end to end. Never panics out: every failure is
    /// converted into a summary after AutoRecovery has decided the task's
    /// next status.
    pub async fn execute(&self) -> WorkerRunSummary {
        match self.run_pipeline().await {
            Ok(summary) => summary,
            Err(e) => self.handle_failure(e).await,
        }
    }

    async fn run_pipeline(&self) -> Result<WorkerRunSummary> {
        // Step 1: fetch & validate
        let (t, project_path) = self.store.read(|conn| {
            let t = task::get_task_required(conn, &self.project_id, &self.task_id)?;
            let p = pmstore::project::get_project_required(conn, &self.project_id)?;
            Ok((t, p.path))
        })?;

        if !matches!(
            t.status,
            TaskStatus::Queued | TaskStatus::Rework | TaskStatus::InProgress
        ) {
            bail!(
                "task {} is not runnable: status {} (expected QUEUED, REWORK, or IN_PROGRESS)",
                t.id,
                t.status
            );
        }

        let order_paths = OrderPaths::new(
            &self.config.storage.projects_root,
            &self.project_id,
            &t.order_id,
        );
        order_paths.ensure_dirs()?;

        // Step 2: model selection, with the rework auto-upgrade
        let model = self.select_model(&t)?;

        // Step 3: assign & transition with lock acquisition
        let worker_id = format!("worker-{}", std::process::id());
        self.assign_and_lock(&t, &worker_id)?;

        // Snapshot target files so a ROLLBACK recovery can restore them
        self.snapshot_files(&t, &order_paths, &project_path)?;

        // Step 4: build prompt & execute
        let prompt = self.build_prompt(&t, &project_path, &order_paths)?;
        let profile = permissions::resolve_profile(&t.title, t.description.as_deref().unwrap_or(""));
        let request = RunnerRequest::new(prompt, model, self.timeout)
            .with_allowed_tools(profile.allowed_tools());

        info!(task_id = %t.id, model = model.as_str(), "run_pipeline: invoking runner");
        let outcome = self.runner.run(request).await?;
        if !outcome.success {
            bail!(
                "runner reported failure: {}",
                outcome.error.as_deref().unwrap_or("unknown")
            );
        }

        // Step 5: self-verification loop
        let artifacts = self.artifact_paths(&t, &project_path);
        let verification = verify::verification_loop(
            &self.config.verification,
            &self.runner,
            &t.id,
            model,
            self.timeout,
            &artifacts,
        )
        .await?;

        // Step 6: report emission
        let report_path = order_paths.report_file(&t.id);
        let content = report::format_report(
            &t,
            model.as_str(),
            &outcome.text,
            outcome.cost_usd,
            &verification,
        );
        report::write_report(&report_path, &content)?;

        // Step 7: static-analysis hook (best-effort)
        if let Some(score) =
            report::static_analysis_hook(&self.config.verification, &report_path, &artifacts)
        {
            if let Err(e) = self.store.with_txn(|txn| {
                task::set_static_analysis_score(txn, &self.project_id, &t.id, score)
            }) {
                warn!(error = %e, "run_pipeline: failed to persist static analysis score");
            }
        }

        // Step 8: destructive-SQL scan (informational)
        let findings = report::destructive_sql_scan(&report_path, &artifacts);
        if findings > 0 {
            warn!(task_id = %t.id, findings, "run_pipeline: destructive SQL detected in artifacts");
        }

        // Step 9: DONE (releases locks)
        self.store.with_txn(|txn| {
            task::transition_task(
                txn,
                &self.project_id,
                &t.id,
                TaskStatus::Done,
                Role::Worker,
                &worker_id,
                Some("worker finished"),
            )?;
            Ok(())
        })?;

        info!(task_id = %t.id, "run_pipeline: task DONE");
        Ok(WorkerRunSummary {
            task_id: t.id,
            success: true,
            model,
            cost_usd: outcome.cost_usd,
            report_path: Some(report_path),
            recovery: None,
            error: None,
        })
    }

    /// Task-recommended model, auto-upgraded to Opus once the task has been
    /// rejected twice; CLI override wins over both.
    fn select_model(&self, t: &Task) -> Result<Model> {
        if t.reject_count >= 2 && t.recommended_model != Some(Model::Opus) {
            let from = t
                .recommended_model
                .unwrap_or(self.config.llm.default_model);
            self.store.with_txn(|txn| {
                task::set_recommended_model(
                    txn,
                    &self.project_id,
                    &t.id,
                    Model::Opus,
                    "Worker",
                    Some(&format!("rework {}: model auto-upgrade", t.reject_count)),
                )?;
                escalation::log_escalation(
                    txn,
                    &self.project_id,
                    Some(&t.order_id),
                    Some(&t.id),
                    EscalationType::ModelUpgrade,
                    &format!(
                        "rework {}: model auto-upgraded {} -> Opus",
                        t.reject_count, from
                    ),
                    Some(&serde_json::json!({
                        "from_model": from.as_str(),
                        "to_model": "Opus",
                        "rework_count": t.reject_count,
                    })),
                )?;
                Ok(())
            })?;
            info!(task_id = %t.id, "select_model: auto-upgraded to Opus");
            return Ok(self.model_override.unwrap_or(Model::Opus));
        }

        Ok(self
            .model_override
            .or(t.recommended_model)
            .unwrap_or(self.config.llm.default_model))
    }

    /// Acquire locks and enter IN_PROGRESS. REWORK re-entry releases stale
    /// locks first; IN_PROGRESS re-execution only refreshes the assignee.
    fn assign_and_lock(&self, t: &Task, worker_id: &str) -> Result<()> {
        self.store.with_txn(|txn| {
            if matches!(t.status, TaskStatus::Rework | TaskStatus::InProgress) {
                // Lock hygiene on re-entry: drop anything a lost daemon or a
                // prior attempt left behind, then re-acquire below
                lock::release_locks(txn, &self.project_id, &t.id)?;
            }

            if !t.target_files.is_empty() {
                let acquired = lock::acquire_locks(txn, &self.project_id, &t.id, &t.target_files)?;
                if !acquired {
                    let (_, blockers) =
                        lock::can_task_start(txn, &self.project_id, &t.id, &t.target_files)?;
                    return Err(pmstore::StoreError::validation(
                        "file_lock",
                        format!("file lock conflict: blocked by {}", blockers.join(", ")),
                    ));
                }
            }

            if t.status == TaskStatus::InProgress {
                // Idempotent re-execution: assignee refresh only, no status
                // history row
                debug!(task_id = %t.id, "assign_and_lock: already IN_PROGRESS, re-execution mode");
                task::set_assignee(
                    txn,
                    &self.project_id,
                    &t.id,
                    worker_id,
                    "Worker",
                    Some("re-execution: assignee refresh"),
                )?;
            } else {
                task::transition_task(
                    txn,
                    &self.project_id,
                    &t.id,
                    TaskStatus::InProgress,
                    Role::Worker,
                    worker_id,
                    None,
                )?;
                task::set_assignee(txn, &self.project_id, &t.id, worker_id, "Worker", None)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn build_prompt(&self, t: &Task, project_path: &str, order_paths: &OrderPaths) -> Result<String> {
        let profile = permissions::resolve_profile(&t.title, t.description.as_deref().unwrap_or(""));

        let (rework_history, failure_context, known_bugs) = self.store.with_txn(|txn| {
            let history = task::rework_history(txn, &self.project_id, &t.id)?
                .into_iter()
                .map(|(timestamp, comment)| ReworkEntry { timestamp, comment })
                .collect::<Vec<_>>();

            let failure_context = incident::list(txn, &self.project_id, 20)?
                .into_iter()
                .find(|i| i.task_id.as_deref() == Some(t.id.as_str()))
                .and_then(|i| i.root_cause);

            // Known-bug injection counts toward each pattern's exposure
            let bugs = pattern::active_bug_patterns(txn, &self.project_id, 5)?;
            for bug in &bugs {
                pattern::record_injection(txn, &bug.id)?;
            }
            let bugs = bugs
                .into_iter()
                .map(|b| KnownBug {
                    title: b.title,
                    severity: b.severity,
                    solution: b.solution,
                })
                .collect::<Vec<_>>();

            Ok((history, failure_context, bugs))
        })?;

        let task_definition = std::fs::read_to_string(order_paths.task_file(&t.id)).ok();

        let migration_safety = profile.needs_migration_safety() || t.is_destructive_db_change;
        let context = WorkerPromptContext {
            task_id: t.id.clone(),
            order_id: t.order_id.clone(),
            project_id: t.project_id.clone(),
            title: t.title.clone(),
            priority: t.priority.to_string(),
            description: t.description.clone(),
            target_files: t.target_files.clone(),
            rework_history,
            failure_context,
            allowed_tools: profile.allowed_tools().join(", "),
            project_path: project_path.to_string(),
            migration_safety,
            known_bugs,
            task_definition,
        };

        prompts::render("worker", &context)
    }

    /// Declared artifacts resolved against the project tree. Entries with
    /// glob metacharacters expand to whatever currently matches.
    fn artifact_paths(&self, t: &Task, project_path: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for f in &t.target_files {
            let full = PathBuf::from(project_path).join(f);
            if f.contains('*') || f.contains('?') || f.contains('[') {
                match glob::glob(&full.to_string_lossy()) {
                    Ok(matches) => paths.extend(matches.filter_map(|m| m.ok())),
                    Err(e) => warn!(pattern = %f, error = %e, "artifact_paths: bad glob pattern"),
                }
            } else {
                paths.push(full);
            }
        }
        paths
    }

    fn snapshot_dir(&self, order_paths: &OrderPaths, task_id: &str) -> PathBuf {
        order_paths.artifacts_dir().join("snapshots").join(task_id)
    }

    fn snapshot_files(&self, t: &Task, order_paths: &OrderPaths, project_path: &str) -> Result<()> {
        let dir = self.snapshot_dir(order_paths, &t.id);
        std::fs::create_dir_all(&dir)?;
        for (idx, file) in self.artifact_paths(t, project_path).iter().enumerate() {
            if file.exists() {
                std::fs::copy(file, dir.join(format!("{:02}.snap", idx)))
                    .context("Failed to snapshot target file")?;
            }
        }
        Ok(())
    }

    fn restore_snapshot(&self, t: &Task, order_paths: &OrderPaths, project_path: &str) {
        let dir = self.snapshot_dir(order_paths, &t.id);
        for (idx, file) in self.artifact_paths(t, project_path).iter().enumerate() {
            let snap = dir.join(format!("{:02}.snap", idx));
            if snap.exists() {
                if let Err(e) = std::fs::copy(&snap, file) {
                    warn!(file = %file.display(), error = %e, "restore_snapshot: copy failed");
                }
            }
        }
    }

    /// Failure path: AutoRecovery classifies the error and decides the next
    /// status. File locks are released by whatever transition it applies.
    async fn handle_failure(&self, error: eyre::Report) -> WorkerRunSummary {
        let message = format!("{:#}", error);
        warn!(task_id = %self.task_id, error = %message, "handle_failure: worker failed");

        let current = self
            .store
            .read(|conn| task::get_task_required(conn, &self.project_id, &self.task_id))
            .ok();

        let Some(t) = current else {
            return self.failure_summary(message, None);
        };

        // Failures before IN_PROGRESS (validation, lock conflict) change no
        // status; the task simply stays where it was and is retried later.
        if t.status != TaskStatus::InProgress {
            let record = self.store.with_txn(|txn| {
                incident::record(
                    txn,
                    &self.project_id,
                    Some(&t.id),
                    "WORKER_REFUSED",
                    "low",
                    None,
                    Some(&message),
                    Some(&format!("task left in {}", t.status)),
                )?;
                Ok(())
            });
            if let Err(e) = record {
                warn!(error = %e, "handle_failure: failed to record incident");
            }
            return self.failure_summary(message, None);
        }

        let engine = match AutoRecoveryEngine::new(&self.store) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "handle_failure: recovery engine unavailable");
                return self.failure_summary(message, None);
            }
        };

        let analysis = engine.analyze_error(&message);
        let retries = engine.retry_count(&self.store, &self.project_id, &self.task_id);
        let strategy = engine.determine_strategy(&analysis, retries);

        if strategy.should_rollback_files {
            let order_paths = OrderPaths::new(
                &self.config.storage.projects_root,
                &self.project_id,
                &t.order_id,
            );
            let project_path = self
                .store
                .read(|conn| pmstore::project::get_project_required(conn, &self.project_id))
                .map(|p| p.path)
                .unwrap_or_default();
            self.restore_snapshot(&t, &order_paths, &project_path);
        }

        match engine.execute(
            &self.store,
            &self.project_id,
            &t.order_id,
            &self.task_id,
            &strategy,
            &analysis,
        ) {
            Ok(result) => self.failure_summary(message, Some(result)),
            Err(e) => {
                warn!(error = %e, "handle_failure: recovery execution failed");
                self.failure_summary(message, None)
            }
        }
    }

    fn failure_summary(&self, error: String, recovery: Option<RecoveryResult>) -> WorkerRunSummary {
        WorkerRunSummary {
            task_id: self.task_id.clone(),
            success: false,
            model: self.model_override.unwrap_or(self.config.llm.default_model),
            cost_usd: None,
            report_path: None,
            recovery,
            error: Some(error),
        }
    }
}
