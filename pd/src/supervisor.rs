//! Worker supervisor: owns the handle set for spawned Worker and Reviewer
//! subprocesses, reaps exits, runs the health checks, and drives the
//! crash-recovery path. The daemon loop coordinates but never touches pids
//! directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use pmstore::task::Task;
use pmstore::{event, incident, task, EventType, Model, Role, Store, TaskStatus};
use tracing::{debug, error, info, warn};

use crate::paths::{log_timestamp, OrderPaths};

/// A live subprocess tracked by the supervisor.
pub struct WorkerHandle {
    pub task_id: String,
    child: Child,
    pub pid: u32,
    pub log_file: PathBuf,
    launched_at: Instant,
    pub launched_at_iso: String,
}

/// What happened to a reaped worker.
#[derive(Debug, Clone)]
pub enum ReapOutcome {
    /// Exit 0 with a valid report
    Succeeded { task_id: String },
    /// Exit 0 but the report was missing or too small; task reverted to REWORK
    ReportInvalid { task_id: String, reason: String },
    /// Non-zero exit; the worker recorded its own failure handling
    Failed { task_id: String, exit_code: i32 },
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker_timeout: Duration,
    pub stale_log_timeout: Duration,
    /// Minimum bytes for a report to count as real output
    pub min_report_bytes: u64,
}

pub struct Supervisor {
    project_id: String,
    order_id: String,
    paths: OrderPaths,
    config: SupervisorConfig,
    db_path: PathBuf,
    projects_root: PathBuf,
    workers: HashMap<String, WorkerHandle>,
    reviewers: HashMap<String, WorkerHandle>,
}

impl Supervisor {
    pub fn new(
        paths: OrderPaths,
        config: SupervisorConfig,
        db_path: PathBuf,
        projects_root: PathBuf,
    ) -> Self {
        Self {
            project_id: paths.project_id().to_string(),
            order_id: paths.order_id().to_string(),
            paths,
            config,
            db_path,
            projects_root,
            workers: HashMap::new(),
            reviewers: HashMap::new(),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn active_reviewers(&self) -> usize {
        self.reviewers.len()
    }

    pub fn active_worker_pids(&self) -> Vec<u32> {
        self.workers.values().map(|h| h.pid).collect()
    }

    pub fn is_tracking(&self, task_id: &str) -> bool {
        self.workers.contains_key(task_id)
    }

    pub fn is_reviewing(&self, task_id: &str) -> bool {
        self.reviewers.contains_key(task_id)
    }

    /// Spawn a Worker subprocess for a task already transitioned to
    /// IN_PROGRESS. The subprocess is this same binary re-invoked with the
    /// `worker` subcommand; stdout and stderr go to the per-task log file.
    pub fn spawn_worker(&mut self, t: &Task, model: Model, timeout_secs: u64) -> Result<u32> {
        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let log_file = self.paths.worker_log_file(&t.id, &log_timestamp());

        let mut cmd = Command::new(exe);
        cmd.arg("worker")
            .arg(&self.project_id)
            .arg(&t.id)
            .arg("--db")
            .arg(&self.db_path)
            .arg("--projects-root")
            .arg(&self.projects_root)
            .arg("--model")
            .arg(model.as_str())
            .arg("--timeout")
            .arg(timeout_secs.to_string());

        self.spawn_tracked(&t.id, cmd, log_file, false)
    }

    /// Spawn a Reviewer subprocess for a DONE task awaiting review.
    pub fn spawn_reviewer(&mut self, task_id: &str, model: Model, timeout_secs: u64) -> Result<u32> {
        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let log_file = self.paths.review_log_file(task_id, &log_timestamp());

        let mut cmd = Command::new(exe);
        cmd.arg("review")
            .arg(&self.project_id)
            .arg(task_id)
            .arg("--db")
            .arg(&self.db_path)
            .arg("--projects-root")
            .arg(&self.projects_root)
            .arg("--model")
            .arg(model.as_str())
            .arg("--timeout")
            .arg(timeout_secs.to_string());

        self.spawn_tracked(task_id, cmd, log_file, true)
    }

    /// Spawn an arbitrary command under supervision. Exposed so tests can
    /// supervise plain shell commands instead of the real binary.
    pub fn spawn_tracked(
        &mut self,
        task_id: &str,
        mut cmd: Command,
        log_file: PathBuf,
        reviewer: bool,
    ) -> Result<u32> {
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::File::create(&log_file)
            .context(format!("Failed to create log file {}", log_file.display()))?;
        let log_err = log.try_clone().context("Failed to clone log handle")?;

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .context("Failed to spawn subprocess")?;

        let pid = child.id();
        let handle = WorkerHandle {
            task_id: task_id.to_string(),
            child,
            pid,
            log_file,
            launched_at: Instant::now(),
            launched_at_iso: pmstore::now_iso(),
        };

        if reviewer {
            self.reviewers.insert(task_id.to_string(), handle);
        } else {
            self.workers.insert(task_id.to_string(), handle);
        }

        info!(task_id, pid, reviewer, "spawn_tracked: subprocess launched");
        Ok(pid)
    }

    /// Reap finished workers. For exit-0 workers the report file is
    /// validated; a missing or undersized report reverts the task to REWORK
    /// and suppresses the completion event.
    pub fn reap(&mut self, store: &Store) -> Vec<ReapOutcome> {
        let mut outcomes = Vec::new();
        let mut finished: Vec<(String, i32)> = Vec::new();

        for (task_id, handle) in self.workers.iter_mut() {
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    finished.push((task_id.clone(), status.code().unwrap_or(-1)));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id, error = %e, "reap: try_wait failed");
                }
            }
        }

        for (task_id, exit_code) in finished {
            self.workers.remove(&task_id);

            if exit_code == 0 {
                match self.validate_report(&task_id) {
                    Ok(()) => {
                        info!(task_id, "reap: worker finished with valid report");
                        if let Err(e) = store.with_txn(|txn| {
                            event::emit(
                                txn,
                                &self.project_id,
                                Some(&self.order_id),
                                EventType::TaskCompleted,
                                Some(&task_id),
                                None,
                            )?;
                            Ok(())
                        }) {
                            warn!(task_id, error = %e, "reap: failed to emit TASK_COMPLETED");
                        }
                        outcomes.push(ReapOutcome::Succeeded { task_id });
                    }
                    Err(reason) => {
                        error!(task_id, %reason, "reap: exit 0 but report invalid, reverting to REWORK");
                        if let Err(e) = store.with_txn(|txn| {
                            task::transition_task(
                                txn,
                                &self.project_id,
                                &task_id,
                                TaskStatus::Rework,
                                Role::System,
                                "DaemonReportCheck",
                                Some(&reason),
                            )?;
                            incident::record(
                                txn,
                                &self.project_id,
                                Some(&task_id),
                                "REPORT_INVALID",
                                "medium",
                                None,
                                Some(&reason),
                                Some("reverted DONE -> REWORK"),
                            )?;
                            Ok(())
                        }) {
                            error!(task_id, error = %e, "reap: failed to revert task");
                        }
                        outcomes.push(ReapOutcome::ReportInvalid { task_id, reason });
                    }
                }
            } else {
                warn!(task_id, exit_code, "reap: worker exited non-zero");
                if let Err(e) = store.with_txn(|txn| {
                    event::emit(
                        txn,
                        &self.project_id,
                        Some(&self.order_id),
                        EventType::TaskFailed,
                        Some(&task_id),
                        Some(&serde_json::json!({ "exit_code": exit_code })),
                    )?;
                    Ok(())
                }) {
                    warn!(task_id, error = %e, "reap: failed to emit TASK_FAILED");
                }
                outcomes.push(ReapOutcome::Failed { task_id, exit_code });
            }
        }

        outcomes
    }

    /// Reap finished reviewer subprocesses (no report validation; reviewers
    /// write their own artifacts and status transitions).
    pub fn reap_reviewers(&mut self) -> Vec<(String, i32)> {
        let mut finished = Vec::new();
        for (task_id, handle) in self.reviewers.iter_mut() {
            if let Ok(Some(status)) = handle.child.try_wait() {
                finished.push((task_id.clone(), status.code().unwrap_or(-1)));
            }
        }
        for (task_id, code) in &finished {
            self.reviewers.remove(task_id);
            debug!(task_id, code, "reap_reviewers: reviewer finished");
        }
        finished
    }

    fn validate_report(&self, task_id: &str) -> std::result::Result<(), String> {
        let report = self.paths.report_file(task_id);
        match std::fs::metadata(&report) {
            Ok(meta) if meta.len() >= self.config.min_report_bytes => Ok(()),
            Ok(meta) => Err(format!(
                "report too small after exit 0: {} bytes at {}",
                meta.len(),
                report.display()
            )),
            Err(_) => Err(format!("report missing after exit 0: {}", report.display())),
        }
    }

    /// The three liveness checks, in order: pid-alive, process-timeout,
    /// log-staleness. Returns (task_id, detection_method) for each stuck
    /// worker; the caller drives recovery.
    pub fn check_health(&mut self) -> Vec<(String, &'static str)> {
        let mut stuck = Vec::new();

        for (task_id, handle) in self.workers.iter_mut() {
            // Already exited: reap() will handle it
            if let Ok(Some(_)) = handle.child.try_wait() {
                continue;
            }

            if !is_pid_alive(handle.pid) {
                warn!(task_id, pid = handle.pid, "check_health: pid dead");
                stuck.push((task_id.clone(), "pid_alive_check"));
                continue;
            }

            let elapsed = handle.launched_at.elapsed();
            if !self.config.worker_timeout.is_zero() && elapsed > self.config.worker_timeout {
                warn!(
                    task_id,
                    pid = handle.pid,
                    elapsed_secs = elapsed.as_secs(),
                    "check_health: process timeout exceeded"
                );
                stuck.push((task_id.clone(), "process_timeout"));
                continue;
            }

            if Self::is_log_stale(self.config.stale_log_timeout, &handle.log_file) {
                warn!(task_id, pid = handle.pid, "check_health: log stale");
                stuck.push((task_id.clone(), "log_staleness"));
            }
        }

        stuck
    }

    fn is_log_stale(stale_log_timeout: Duration, log_file: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(log_file) else {
            // Not yet created: not stale
            return false;
        };
        match meta.modified().and_then(|m| {
            m.elapsed()
                .map_err(|e| std::io::Error::other(e.to_string()))
        }) {
            Ok(age) => age > stale_log_timeout,
            Err(_) => false,
        }
    }

    /// One-shot crash recovery: hard kill, release locks via the
    /// IN_PROGRESS -> QUEUED transition, record the incident with the
    /// detection method and elapsed seconds, emit WORKER_CRASHED.
    pub fn recover_stuck(&mut self, store: &Store, task_id: &str, detection_method: &str) {
        let Some(mut handle) = self.workers.remove(task_id) else {
            return;
        };
        let elapsed_secs = handle.launched_at.elapsed().as_secs();

        warn!(
            task_id,
            pid = handle.pid,
            detection_method,
            elapsed_secs,
            "recover_stuck: recovering worker"
        );

        kill_hard(&mut handle);

        let reason = format!(
            "auto-recovery: worker stuck (pid {}, detection_method={}, elapsed={}s)",
            handle.pid, detection_method, elapsed_secs
        );
        let result = store.with_txn(|txn| {
            task::transition_task(
                txn,
                &self.project_id,
                task_id,
                TaskStatus::Queued,
                Role::System,
                "DaemonHealthCheck",
                Some(&reason),
            )?;
            incident::record(
                txn,
                &self.project_id,
                Some(task_id),
                "WORKER_CRASH",
                "high",
                None,
                Some(&reason),
                Some("killed, locks released, task requeued"),
            )?;
            event::emit(
                txn,
                &self.project_id,
                Some(&self.order_id),
                EventType::WorkerCrashed,
                Some(task_id),
                Some(&serde_json::json!({
                    "pid": handle.pid,
                    "detection_method": detection_method,
                    "elapsed_seconds": elapsed_secs,
                })),
            )?;
            Ok(())
        });

        match result {
            Ok(()) => info!(task_id, "recover_stuck: task requeued"),
            Err(e) => error!(task_id, error = %e, "recover_stuck: recovery transaction failed"),
        }
    }

    /// Orphan reconciliation: IN_PROGRESS rows in this order that are not
    /// in the in-memory map mean the daemon restarted between spawn and
    /// reap. Same recovery path, detection_method = orphan_detection.
    pub fn detect_orphans(&mut self, store: &Store) -> Vec<String> {
        let in_progress = match store.read(|conn| {
            task::list_tasks(conn, &self.project_id, &self.order_id, Some(TaskStatus::InProgress))
        }) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "detect_orphans: query failed");
                return Vec::new();
            }
        };

        let mut recovered = Vec::new();
        for t in in_progress {
            if self.workers.contains_key(&t.id) {
                continue;
            }

            warn!(task_id = %t.id, "detect_orphans: orphaned IN_PROGRESS task");
            let reason =
                "auto-recovery: task IN_PROGRESS but not tracked by daemon (detection_method=orphan_detection)";
            let result = store.with_txn(|txn| {
                task::transition_task(
                    txn,
                    &self.project_id,
                    &t.id,
                    TaskStatus::Queued,
                    Role::System,
                    "DaemonOrphanCheck",
                    Some(reason),
                )?;
                incident::record(
                    txn,
                    &self.project_id,
                    Some(&t.id),
                    "WORKER_CRASH",
                    "high",
                    None,
                    Some(reason),
                    Some("locks released, task requeued"),
                )?;
                event::emit(
                    txn,
                    &self.project_id,
                    Some(&self.order_id),
                    EventType::WorkerCrashed,
                    Some(&t.id),
                    Some(&serde_json::json!({ "detection_method": "orphan_detection" })),
                )?;
                Ok(())
            });

            match result {
                Ok(()) => recovered.push(t.id),
                Err(e) => error!(task_id = %t.id, error = %e, "detect_orphans: recovery failed"),
            }
        }
        recovered
    }

    /// Kill everything still running (shutdown path keeps reaping instead;
    /// this is the last resort on drop-dead exit).
    pub fn kill_all(&mut self) {
        for (_, handle) in self.workers.iter_mut() {
            kill_hard(handle);
        }
        for (_, handle) in self.reviewers.iter_mut() {
            kill_hard(handle);
        }
        self.workers.clear();
        self.reviewers.clear();
    }
}

fn kill_hard(handle: &mut WorkerHandle) {
    if let Err(e) = handle.child.kill() {
        debug!(pid = handle.pid, error = %e, "kill_hard: child.kill failed, trying SIGKILL");
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(handle.pid as i32), Signal::SIGKILL);
        }
    }
    let _ = handle.child.wait();
}

/// Whether a process with the given PID exists. Signal 0 probes without
/// affecting the target.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
