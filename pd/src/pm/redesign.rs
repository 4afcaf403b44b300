//! PM redesign escalation: given a task that failed review beyond its
//! rework budget (or an explicit ESCALATED verdict), split it, replan it,
//! or decline. Structurally a small inline planner invocation constrained
//! to the failed task's context.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pmstore::task::NewTask;
use pmstore::{dependency, escalation, task, EscalationType, Priority, Role, Store, TaskStatus};

use crate::config::Config;
use crate::prompts;
use crate::runner::{extract_json, Runner, RunnerRequest};

/// Model output for a redesign decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RedesignOutput {
    action: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    tasks: Vec<RedesignTask>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    target_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RedesignTask {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    target_files: Vec<String>,
}

/// Result of one redesign attempt.
#[derive(Debug, Clone)]
pub struct RedesignResult {
    pub success: bool,
    pub action: String,
    pub new_task_ids: Vec<String>,
    pub error: Option<String>,
}

pub struct RedesignHandler {
    store: Store,
    runner: Arc<dyn Runner>,
    config: Config,
}

#[derive(Serialize)]
struct RedesignPromptContext<'a> {
    task_id: &'a str,
    project_id: &'a str,
    title: &'a str,
    priority: String,
    description: Option<&'a str>,
    target_files: String,
    reject_count: u32,
    failure_context: &'a str,
}

impl RedesignHandler {
    pub fn new(store: Store, runner: Arc<dyn Runner>, config: Config) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Attempt a redesign. On success the failed task is back in QUEUED
    /// with its reject counter reset (its redesigned shape may add new
    /// predecessor tasks). On decline or error the caller terminates the
    /// task; each attempt is audited with a parent-task reference.
    pub async fn redesign(
        &self,
        project_id: &str,
        task_id: &str,
        failure_context: &str,
        timeout: Duration,
    ) -> RedesignResult {
        match self
            .try_redesign(project_id, task_id, failure_context, timeout)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id, error = %e, "redesign: attempt failed");
                RedesignResult {
                    success: false,
                    action: "error".to_string(),
                    new_task_ids: vec![],
                    error: Some(format!("{:#}", e)),
                }
            }
        }
    }

    async fn try_redesign(
        &self,
        project_id: &str,
        task_id: &str,
        failure_context: &str,
        timeout: Duration,
    ) -> Result<RedesignResult> {
        let t = self
            .store
            .read(|conn| task::get_task_required(conn, project_id, task_id))?;

        let prompt = prompts::render(
            "redesign",
            &RedesignPromptContext {
                task_id,
                project_id,
                title: &t.title,
                priority: t.priority.to_string(),
                description: t.description.as_deref(),
                target_files: t.target_files.join(", "),
                reject_count: t.reject_count,
                failure_context,
            },
        )?;

        let outcome = self
            .runner
            .run(RunnerRequest::new(
                prompt,
                self.config.llm.default_model,
                timeout,
            ))
            .await?;
        if !outcome.success {
            bail!(
                "redesign runner failed: {}",
                outcome.error.as_deref().unwrap_or("unknown")
            );
        }

        let json = extract_json(&outcome.text)
            .ok_or_else(|| eyre::eyre!("no JSON object in redesign response"))?;
        let output: RedesignOutput = serde_json::from_str(json)?;

        let result = match output.action.as_str() {
            "split" => self.apply_split(project_id, &t, &output)?,
            "replan" => self.apply_replan(project_id, &t, &output)?,
            "decline" => RedesignResult {
                success: false,
                action: "decline".to_string(),
                new_task_ids: vec![],
                error: Some(output.reason.clone()),
            },
            other => bail!("unknown redesign action: {}", other),
        };

        // Every attempt is auditable, carrying the parent-task reference
        self.store.with_txn(|txn| {
            escalation::log_escalation(
                txn,
                project_id,
                Some(&t.order_id),
                Some(task_id),
                EscalationType::TaskReplan,
                &format!("PM redesign: action={}, reason={}", result.action, output.reason),
                Some(&serde_json::json!({
                    "parent_task": task_id,
                    "action": result.action,
                    "new_tasks": result.new_task_ids,
                    "success": result.success,
                })),
            )?;
            Ok(())
        })?;

        Ok(result)
    }

    /// Split: new preparatory tasks, the failed task depends on them, then
    /// ESCALATED/REWORK -> QUEUED with the reject counter reset. The
    /// detector re-checks dependencies, so the task stays un-launchable
    /// until its new predecessors complete.
    fn apply_split(
        &self,
        project_id: &str,
        t: &pmstore::Task,
        output: &RedesignOutput,
    ) -> Result<RedesignResult> {
        if output.tasks.is_empty() {
            bail!("split redesign produced no tasks");
        }

        let mut new_task_ids = Vec::new();
        for sub in &output.tasks {
            let new = NewTask {
                order_id: t.order_id.clone(),
                title: sub.title.clone(),
                description: Some(sub.description.clone()),
                priority: sub
                    .priority
                    .as_deref()
                    .and_then(|p| Priority::from_str(p).ok())
                    .unwrap_or(t.priority),
                recommended_model: t.recommended_model,
                complexity_score: None,
                depends_on: vec![],
                target_files: sub.target_files.clone(),
                is_destructive_db_change: false,
            };
            let created = task::create_task(&self.store, project_id, &new)?;
            new_task_ids.push(created.id);
        }

        self.store.with_txn(|txn| {
            for new_id in &new_task_ids {
                dependency::add_dependency(txn, project_id, &t.id, new_id)?;
            }
            self.requeue(txn, project_id, &t.id, "redesign: task split into predecessors")?;
            Ok(())
        })?;

        info!(task_id = %t.id, ?new_task_ids, "apply_split: task split");
        Ok(RedesignResult {
            success: true,
            action: "split".to_string(),
            new_task_ids,
            error: None,
        })
    }

    /// Replan: rewrite description and/or target files in place, then
    /// requeue.
    fn apply_replan(
        &self,
        project_id: &str,
        t: &pmstore::Task,
        output: &RedesignOutput,
    ) -> Result<RedesignResult> {
        self.store.with_txn(|txn| {
            if let Some(description) = &output.description {
                task::set_description(
                    txn,
                    project_id,
                    &t.id,
                    description,
                    "PM",
                    Some("redesign: replanned description"),
                )?;
            }
            if let Some(files) = &output.target_files {
                task::set_target_files(
                    txn,
                    project_id,
                    &t.id,
                    files,
                    "PM",
                    Some("redesign: replanned target files"),
                )?;
            }
            self.requeue(txn, project_id, &t.id, "redesign: task replanned")?;
            Ok(())
        })?;

        info!(task_id = %t.id, "apply_replan: task replanned");
        Ok(RedesignResult {
            success: true,
            action: "replan".to_string(),
            new_task_ids: vec![],
            error: None,
        })
    }

    fn requeue(
        &self,
        txn: &pmstore::rusqlite::Transaction,
        project_id: &str,
        task_id: &str,
        reason: &str,
    ) -> pmstore::Result<()> {
        task::transition_task(
            txn,
            project_id,
            task_id,
            TaskStatus::Queued,
            Role::Pm,
            "PMRedesign",
            Some(reason),
        )?;
        task::reset_reject_count(txn, project_id, task_id, "PMRedesign", Some(reason))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmstore::task::{create_task, get_task_required, transition_task, NewTask};
    use pmstore::testutil::{seed_order, seed_project};
    use crate::runner::ScriptRunner;

    fn escalated_task(store: &Store) -> pmstore::Task {
        let t = create_task(
            store,
            "demo",
            &NewTask {
                order_id: "ORDER_001".to_string(),
                title: "Hard task".to_string(),
                target_files: vec!["src/hard.py".to_string()],
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
        t
    }

    fn handler(store: Store, response: serde_json::Value) -> RedesignHandler {
        let script = format!("cat > /dev/null; cat <<'EOF'\n{}\nEOF", response);
        RedesignHandler::new(store, Arc::new(ScriptRunner::new(script)), Config::default())
    }

    #[tokio::test]
    async fn test_split_creates_predecessors_and_requeues() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let t = escalated_task(&store);

        let h = handler(
            store,
            serde_json::json!({
                "action": "split",
                "reason": "too big",
                "tasks": [
                    {"title": "Prepare fixtures", "description": "make fixtures", "priority": "P1",
                     "target_files": ["tests/fixtures.py"]}
                ]
            }),
        );

        let result = h.redesign("demo", &t.id, "rejected 4 times", Duration::from_secs(30)).await;
        assert!(result.success);
        assert_eq!(result.new_task_ids.len(), 1);

        h.store
            .read(|conn| {
                let reloaded = get_task_required(conn, "demo", &t.id)?;
                assert_eq!(reloaded.status, TaskStatus::Queued);
                assert_eq!(reloaded.reject_count, 0);
                let deps = dependency::deps_of(conn, "demo", &t.id)?;
                assert_eq!(deps, result.new_task_ids);

                // Audit chain carries the parent-task reference
                let escalations = escalation::for_task(conn, "demo", &t.id)?;
                assert!(escalations
                    .iter()
                    .any(|e| e.escalation_type == EscalationType::TaskReplan));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_replan_rewrites_targets() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let t = escalated_task(&store);

        let h = handler(
            store,
            serde_json::json!({
                "action": "replan",
                "reason": "wrong files",
                "description": "a sharper description",
                "target_files": ["src/easy.py"]
            }),
        );

        let result = h.redesign("demo", &t.id, "context", Duration::from_secs(30)).await;
        assert!(result.success);

        h.store
            .read(|conn| {
                let reloaded = get_task_required(conn, "demo", &t.id)?;
                assert_eq!(reloaded.status, TaskStatus::Queued);
                assert_eq!(reloaded.description.as_deref(), Some("a sharper description"));
                assert_eq!(reloaded.target_files, vec!["src/easy.py".to_string()]);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_decline_is_unsuccessful() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");
        let t = escalated_task(&store);

        let h = handler(
            store,
            serde_json::json!({"action": "decline", "reason": "fundamentally ill-posed"}),
        );

        let result = h.redesign("demo", &t.id, "context", Duration::from_secs(30)).await;
        assert!(!result.success);
        assert_eq!(result.action, "decline");

        // Task untouched: the caller decides the terminal transition
        h.store
            .read(|conn| {
                assert_eq!(get_task_required(conn, "demo", &t.id)?.status, TaskStatus::Escalated);
                Ok(())
            })
            .unwrap();
    }
}
