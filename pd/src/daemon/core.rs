//! The daemon loop: the only long-lived driver. Each tick reaps, heals,
//! resolves dependencies, sweeps escalations, admits new work under
//! resource and lock constraints, writes the heartbeat, and sleeps
//! adaptively. Exits cleanly once every task in the order is terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::DateTime;
use eyre::{Context, Result};
use tracing::{debug, error, info, warn};

use pmstore::{
    backlog, escalation, event, lock, order, project, task, EscalationType, EventType, Model,
    OrderStatus, Role, Store, TaskStatus,
};

use crate::config::Config;
use crate::daemon::heartbeat::{self, Heartbeat, InstanceLock};
use crate::detector;
use crate::monitor::ResourceMonitor;
use crate::paths::OrderPaths;
use crate::poller::AdaptivePoller;
use crate::resolver;
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::worker::report::MIN_REPORT_BYTES;

/// CLI-level options layered over the config.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub max_workers: Option<usize>,
    pub model_override: Option<Model>,
    pub no_review: bool,
    pub dry_run: bool,
}

/// Final results of a daemon run.
#[derive(Debug)]
pub struct DaemonRunResult {
    pub loops: u64,
    pub launched: u64,
    pub errors: Vec<String>,
    pub elapsed_secs: u64,
    pub order_completed: bool,
}

pub struct Daemon {
    store: Store,
    config: Config,
    project_id: String,
    order_id: String,
    paths: OrderPaths,
    supervisor: Supervisor,
    monitor: ResourceMonitor,
    poller: AdaptivePoller,
    shutdown: Arc<AtomicBool>,
    options: DaemonOptions,
    errors: Vec<String>,
    launched: u64,
    _instance_lock: InstanceLock,
}

impl Daemon {
    pub fn new(
        store: Store,
        config: Config,
        project_id: String,
        order_id: String,
        options: DaemonOptions,
    ) -> Result<Self> {
        let paths = OrderPaths::new(&config.storage.projects_root, &project_id, &order_id);
        paths.ensure_dirs()?;
        let instance_lock = InstanceLock::acquire(&paths.daemon_lock_file())?;

        let supervisor = Supervisor::new(
            paths.clone(),
            SupervisorConfig {
                worker_timeout: Duration::from_secs(config.daemon.worker_timeout_secs),
                stale_log_timeout: Duration::from_secs(config.daemon.stale_log_timeout_secs),
                min_report_bytes: MIN_REPORT_BYTES,
            },
            config.storage.db_path.clone(),
            config.storage.projects_root.clone(),
        );
        let monitor = ResourceMonitor::new(&config.resources);
        let poller = AdaptivePoller::new(&config.daemon);

        Ok(Self {
            store,
            project_id,
            order_id,
            paths,
            supervisor,
            monitor,
            poller,
            shutdown: Arc::new(AtomicBool::new(false)),
            options,
            errors: Vec::new(),
            launched: 0,
            config,
            _instance_lock: instance_lock,
        })
    }

    fn install_signal_handlers(&self) {
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut term = match signal(SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(e) => {
                        warn!(error = %e, "signal handler unavailable");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            info!("shutdown requested");
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    /// The pump. Returns once the order completes or shutdown is requested.
    pub async fn run(mut self) -> Result<DaemonRunResult> {
        info!(
            project_id = %self.project_id,
            order_id = %self.order_id,
            max_workers = self.effective_max_workers(),
            poll_interval = self.config.daemon.poll_interval_secs,
            "daemon loop starting"
        );
        self.install_signal_handlers();

        let started = Instant::now();
        let mut loops: u64 = 0;
        let mut last_orphan_review = Instant::now();
        let mut order_completed = false;

        while !self.shutdown.load(Ordering::SeqCst) {
            loops += 1;
            debug!(tick = loops, "daemon tick");

            // 1. Reap finished workers (validates reports for exit-0)
            let reaped = self.supervisor.reap(&self.store);

            // 2. Health-check running workers
            let stuck = self.supervisor.check_health();
            for (task_id, detection_method) in stuck {
                self.supervisor
                    .recover_stuck(&self.store, &task_id, detection_method);
            }

            // 3. Orphaned IN_PROGRESS rows (daemon restarted mid-flight)
            self.supervisor.detect_orphans(&self.store);

            // 4. Periodic: orphaned DONE tasks awaiting review
            if last_orphan_review.elapsed().as_secs() >= self.config.daemon.orphan_review_interval_secs
            {
                last_orphan_review = Instant::now();
                self.spawn_reviewers_for_orphaned_done();
            }
            self.supervisor.reap_reviewers();

            // 5. Consume events; completions feed the dependency resolver
            let events_seen = self.consume_events();
            if events_seen > 0 || !reaped.is_empty() {
                self.poller.notify_event_detected();
            } else {
                self.poller.notify_idle_cycle();
            }

            // 6. Resource trend sample
            if self.config.resources.enable_monitoring {
                self.monitor.collect_sample();
            }

            // 7. ESCALATED timeout safety valve
            match sweep_escalated_timeouts(
                &self.store,
                &self.project_id,
                &self.order_id,
                Duration::from_secs(self.config.daemon.escalated_timeout_secs),
            ) {
                Ok(rejected) if !rejected.is_empty() => {
                    warn!(?rejected, "escalated timeout sweep force-rejected tasks");
                }
                Ok(_) => {}
                Err(e) => self.errors.push(format!("escalated sweep: {}", e)),
            }

            // 8. Order completion
            match check_order_complete_and_close(&self.store, &self.project_id, &self.order_id) {
                Ok(true) => {
                    info!(order_id = %self.order_id, "order complete, exiting");
                    order_completed = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => self.errors.push(format!("completion check: {}", e)),
            }

            // 9/10. Dynamic capacity, then admission
            self.admit_new_work();

            // 11. Heartbeat
            self.write_heartbeat();

            // 12. Adaptive sleep, sliced so shutdown is observed promptly
            self.interruptible_sleep(self.poller.next_interval()).await;
        }

        // Cooperative drain: no new spawns, keep reaping
        if self.shutdown.load(Ordering::SeqCst) {
            self.drain().await;
        }
        self.supervisor.reap(&self.store);
        heartbeat::remove_heartbeat(&self.paths.heartbeat_file());

        // Drop consumed events so long-lived projects don't accumulate rows
        if let Err(e) = self
            .store
            .with_txn(|txn| event::cleanup_consumed(txn, &self.project_id, &pmstore::now_iso()))
        {
            warn!(error = %e, "event cleanup failed");
        }

        let result = DaemonRunResult {
            loops,
            launched: self.launched,
            errors: self.errors,
            elapsed_secs: started.elapsed().as_secs(),
            order_completed,
        };
        info!(
            loops = result.loops,
            launched = result.launched,
            errors = result.errors.len(),
            elapsed_secs = result.elapsed_secs,
            "daemon loop ended"
        );
        Ok(result)
    }

    /// Single admission pass for the one-shot launcher: reconcile, detect,
    /// admit, no loop. Returns the number of workers launched.
    pub fn run_once(mut self) -> Result<u64> {
        if self.config.resources.enable_monitoring {
            self.monitor.collect_sample();
        }
        self.admit_new_work();
        Ok(self.launched)
    }

    fn effective_max_workers(&self) -> usize {
        self.options.max_workers.unwrap_or(self.config.daemon.max_workers)
    }

    fn consume_events(&mut self) -> usize {
        let events = match self
            .store
            .with_txn(|txn| event::consume(txn, &self.project_id, &self.order_id))
        {
            Ok(events) => events,
            Err(e) => {
                self.errors.push(format!("event consume: {}", e));
                return 0;
            }
        };

        for ev in &events {
            debug!(event_type = ev.event_type.as_str(), task_id = ?ev.task_id, "event consumed");
            if matches!(
                ev.event_type,
                EventType::TaskCompleted | EventType::DependencyResolved
            ) {
                if let Some(task_id) = &ev.task_id {
                    if let Err(e) = resolver::resolve_on_completion(
                        &self.store,
                        &self.project_id,
                        &self.order_id,
                        task_id,
                    ) {
                        warn!(task_id, error = %e, "resolver failed for event");
                    }
                }
            }
        }
        events.len()
    }

    fn spawn_reviewers_for_orphaned_done(&mut self) {
        if self.options.no_review || !self.config.review.auto_review {
            return;
        }
        let reviewable = match self
            .store
            .read(|conn| task::find_reviewable(conn, &self.project_id))
        {
            Ok(tasks) => tasks,
            Err(e) => {
                self.errors.push(format!("orphan review scan: {}", e));
                return;
            }
        };

        for t in reviewable {
            if t.order_id != self.order_id || self.supervisor.is_reviewing(&t.id) {
                continue;
            }
            info!(task_id = %t.id, "spawning reviewer for orphaned DONE task");
            if let Err(e) = self.supervisor.spawn_reviewer(
                &t.id,
                self.config.review.review_model,
                self.config.daemon.worker_timeout_secs,
            ) {
                warn!(task_id = %t.id, error = %e, "failed to spawn reviewer");
            }
        }
    }

    /// Compute dynamic capacity and admit candidates: capacity slot, then
    /// detector pick, then resource admission, then lock + transition +
    /// spawn. A denied candidate stays QUEUED; it is not marked failed.
    fn admit_new_work(&mut self) {
        // Reconciliation pass runs on every admission cycle
        if let Err(e) = resolver::reconcile(&self.store, &self.project_id, &self.order_id) {
            warn!(error = %e, "reconcile failed");
        }

        let active = self.supervisor.active_workers();
        let max = self.effective_max_workers();
        let dynamic_max = if self.config.resources.enable_auto_scaling {
            self.monitor.predicted_worker_count(active, max)
        } else {
            max
        };
        let slots = dynamic_max.saturating_sub(active);
        if slots == 0 {
            return;
        }

        let candidates =
            match detector::find_launchable(&self.store, &self.project_id, &self.order_id, slots) {
                Ok(candidates) => candidates,
                Err(e) => {
                    self.errors.push(format!("detector: {}", e));
                    return;
                }
            };
        if candidates.is_empty() {
            return;
        }
        info!(
            count = candidates.len(),
            active,
            dynamic_max,
            "admitting new work"
        );

        for t in candidates {
            let (can_launch, reason) = self.monitor.can_launch_worker();
            if !can_launch {
                info!(task_id = %t.id, reason, "admission denied by resource monitor");
                break;
            }

            if self.options.dry_run {
                info!(task_id = %t.id, "dry-run: would launch worker");
                continue;
            }

            if let Err(e) = self.launch_worker(&t) {
                error!(task_id = %t.id, error = %e, "launch failed");
                self.errors.push(format!("launch {}: {}", t.id, e));
                self.rollback_launch(&t.id);
            }
        }
    }

    fn launch_worker(&mut self, t: &pmstore::Task) -> Result<()> {
        // Locks + transition form one atomic unit; the subprocess sees a
        // task already IN_PROGRESS and treats it as a re-execution.
        let acquired = self.store.with_txn(|txn| {
            if !t.target_files.is_empty()
                && !lock::acquire_locks(txn, &self.project_id, &t.id, &t.target_files)?
            {
                return Ok(false);
            }
            task::transition_task(
                txn,
                &self.project_id,
                &t.id,
                TaskStatus::InProgress,
                Role::Worker,
                "Daemon",
                Some("daemon admission"),
            )?;
            Ok(true)
        })?;

        if !acquired {
            // Lost the lock race since detection; stays QUEUED for next tick
            info!(task_id = %t.id, "lock conflict at launch, staying QUEUED");
            return Ok(());
        }

        let model = self
            .options
            .model_override
            .or(t.recommended_model)
            .unwrap_or(self.config.llm.default_model);
        self.supervisor
            .spawn_worker(t, model, self.config.daemon.worker_timeout_secs)
            .context("spawn failed")?;
        self.launched += 1;
        Ok(())
    }

    fn rollback_launch(&mut self, task_id: &str) {
        let result = self.store.with_txn(|txn| {
            task::transition_task(
                txn,
                &self.project_id,
                task_id,
                TaskStatus::Queued,
                Role::System,
                "Daemon",
                Some("launch rollback"),
            )?;
            Ok(())
        });
        if let Err(e) = result {
            error!(task_id, error = %e, "rollback failed");
            self.errors.push(format!("rollback {}: {}", task_id, e));
        }
    }

    fn write_heartbeat(&mut self) {
        let heartbeat = Heartbeat {
            pid: std::process::id(),
            order_id: self.order_id.clone(),
            project_id: self.project_id.clone(),
            timestamp: pmstore::now_iso(),
            active_workers: self.supervisor.active_workers(),
            active_worker_pids: self.supervisor.active_worker_pids(),
            status: if self.shutdown.load(Ordering::SeqCst) {
                "shutting_down".to_string()
            } else {
                "running".to_string()
            },
            adaptive_poll_interval: self.poller.next_interval().as_secs_f64(),
            resource_trend: if self.config.resources.enable_monitoring {
                serde_json::to_value(self.monitor.trend_status()).ok()
            } else {
                None
            },
        };
        if let Err(e) = heartbeat::write_heartbeat(&self.paths.heartbeat_file(), &heartbeat) {
            warn!(error = %e, "heartbeat write failed");
        }
    }

    async fn interruptible_sleep(&self, duration: Duration) {
        let mut remaining = duration;
        let slice = Duration::from_millis(500);
        while !remaining.is_zero() && !self.shutdown.load(Ordering::SeqCst) {
            let step = remaining.min(slice);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    /// Shutdown drain: no new spawns, keep reaping until workers exit or
    /// the worker timeout elapses.
    async fn drain(&mut self) {
        info!(
            active = self.supervisor.active_workers(),
            "draining in-flight workers"
        );
        let deadline = Instant::now() + Duration::from_secs(self.config.daemon.worker_timeout_secs);

        while self.supervisor.active_workers() > 0 && Instant::now() < deadline {
            self.supervisor.reap(&self.store);
            self.write_heartbeat();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        if self.supervisor.active_workers() > 0 {
            warn!(
                active = self.supervisor.active_workers(),
                "drain deadline passed, killing remaining workers"
            );
            self.supervisor.kill_all();
        }
    }
}

/// Force-reject ESCALATED tasks older than `timeout` so the loop cannot
/// hang on a review stuck in redesign. Persists an ESCALATION_TIMEOUT row
/// per rejected task.
pub fn sweep_escalated_timeouts(
    store: &Store,
    project_id: &str,
    order_id: &str,
    timeout: Duration,
) -> pmstore::Result<Vec<String>> {
    let escalated = store.read(|conn| {
        task::list_tasks(conn, project_id, order_id, Some(TaskStatus::Escalated))
    })?;
    if escalated.is_empty() {
        return Ok(Vec::new());
    }

    let now = chrono::Utc::now();
    let mut rejected = Vec::new();

    for t in escalated {
        let Ok(updated_at) = DateTime::parse_from_rfc3339(&t.updated_at) else {
            continue;
        };
        let age = now.signed_duration_since(updated_at.with_timezone(&chrono::Utc));
        let age_secs = age.num_seconds().max(0) as u64;
        if age_secs <= timeout.as_secs() {
            continue;
        }

        store.with_txn(|txn| {
            task::transition_task(
                txn,
                project_id,
                &t.id,
                TaskStatus::Rejected,
                Role::System,
                "DaemonTimeoutCheck",
                Some(&format!(
                    "ESCALATED timeout ({}s > {}s), auto-rejected as safety valve",
                    age_secs,
                    timeout.as_secs()
                )),
            )?;
            escalation::log_escalation(
                txn,
                project_id,
                Some(order_id),
                Some(&t.id),
                EscalationType::EscalationTimeout,
                &format!(
                    "escalated for {}s (limit {}s), auto-rejected",
                    age_secs,
                    timeout.as_secs()
                ),
                Some(&serde_json::json!({
                    "timeout_seconds": timeout.as_secs(),
                    "actual_seconds": age_secs,
                })),
            )?;
            Ok(())
        })?;
        rejected.push(t.id);
    }

    Ok(rejected)
}

/// When every task is terminal, close the order: COMPLETED status, backlog
/// item auto-DONE, current-order pointer cleared. Returns whether the
/// order is (now) complete.
pub fn check_order_complete_and_close(
    store: &Store,
    project_id: &str,
    order_id: &str,
) -> pmstore::Result<bool> {
    let complete = store.read(|conn| order::is_order_complete(conn, project_id, order_id))?;
    if !complete {
        return Ok(false);
    }

    store.with_txn(|txn| {
        let current = order::get_order_required(txn, project_id, order_id)?;
        if current.status != OrderStatus::Completed {
            order::transition_order(
                txn,
                project_id,
                order_id,
                OrderStatus::Completed,
                Role::System,
                "Daemon",
                Some("all tasks terminal"),
            )?;
            backlog::close_for_order(txn, project_id, order_id)?;
        }

        let p = project::get_project_required(txn, project_id)?;
        if p.current_order_id.as_deref() == Some(order_id) {
            project::set_current_order(txn, project_id, None)?;
        }
        Ok(())
    })?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmstore::task::{create_task, get_task_required, transition_task, NewTask};
    use pmstore::testutil::{seed_order, seed_project};

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        store
    }

    #[test]
    fn test_escalated_sweep_rejects_stale_only() {
        let store = seeded();
        let t = create_task(
            &store,
            "demo",
            &NewTask {
                order_id: "ORDER_001".to_string(),
                title: "stuck".to_string(),
                ..NewTask::default()
            },
        )
        .unwrap();
        store
            .with_txn(|txn| {
                transition_task(txn, "demo", &t.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &t.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &t.id, TaskStatus::Escalated, Role::Pm, "PM", None)?;
                Ok(())
            })
            .unwrap();

        // Fresh: nothing to reject
        let rejected =
            sweep_escalated_timeouts(&store, "demo", "ORDER_001", Duration::from_secs(300)).unwrap();
        assert!(rejected.is_empty());

        // Zero timeout: everything escalated is stale
        let rejected =
            sweep_escalated_timeouts(&store, "demo", "ORDER_001", Duration::from_secs(0)).unwrap();
        assert_eq!(rejected, vec![t.id.clone()]);

        store
            .read(|conn| {
                assert_eq!(get_task_required(conn, "demo", &t.id)?.status, TaskStatus::Rejected);
                assert_eq!(
                    escalation::count_for_task(conn, "demo", &t.id, EscalationType::EscalationTimeout)?,
                    1
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_order_close_updates_backlog_and_pointer() {
        let store = seeded();

        // A backlog item converted into this order
        store
            .with_txn(|txn| {
                let item = backlog::add_item(txn, "demo", "thing", None, None, pmstore::BacklogPriority::Medium)?;
                backlog::update_status(
                    txn, "demo", &item.id, pmstore::BacklogStatus::InProgress,
                    Role::Any, "PM", None,
                )?;
                txn.execute(
                    "UPDATE backlog SET related_order_id = 'ORDER_001' WHERE id = ?1",
                    [item.id.clone()],
                )?;
                project::set_current_order(txn, "demo", Some("ORDER_001"))?;
                Ok(())
            })
            .unwrap();

        // One task, driven to COMPLETED
        let t = create_task(
            &store,
            "demo",
            &NewTask {
                order_id: "ORDER_001".to_string(),
                title: "only".to_string(),
                ..NewTask::default()
            },
        )
        .unwrap();

        assert!(!check_order_complete_and_close(&store, "demo", "ORDER_001").unwrap());

        store
            .with_txn(|txn| {
                transition_task(txn, "demo", &t.id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &t.id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", &t.id, TaskStatus::Completed, Role::Pm, "PM", None)?;
                Ok(())
            })
            .unwrap();

        assert!(check_order_complete_and_close(&store, "demo", "ORDER_001").unwrap());

        store
            .read(|conn| {
                assert_eq!(
                    order::get_order_required(conn, "demo", "ORDER_001")?.status,
                    OrderStatus::Completed
                );
                let items = backlog::list_items(conn, "demo", None)?;
                assert_eq!(items[0].status, pmstore::BacklogStatus::Done);
                assert!(project::get_project_required(conn, "demo")?
                    .current_order_id
                    .is_none());
                Ok(())
            })
            .unwrap();

        // Idempotent
        assert!(check_order_complete_and_close(&store, "demo", "ORDER_001").unwrap());
    }
}
