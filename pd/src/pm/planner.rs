//! PM planner: turn an Order description into a persisted plan — goal,
//! requirements, staffing artifacts, and a task list with dependencies and
//! target files. On a malformed model response the planner records the raw
//! text and fails fast; it never guesses.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pmstore::task::NewTask;
use pmstore::{order, project, task, Model, OrderStatus, Priority, Role, Store};

use crate::config::Config;
use crate::paths::OrderPaths;
use crate::permissions::detect_gui_keywords;
use crate::prompts;
use crate::runner::{extract_json, Runner, RunnerRequest};

/// Keywords marking a task as a destructive DB change. Matched
/// case-insensitively against title + description.
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "DROP TABLE",
    "DROP COLUMN",
    "ALTER TABLE",
    "TRUNCATE",
    "DELETE FROM",
    "REVIEW_QUEUE",
    "テーブル削除",
    "テーブル廃止",
    "カラム削除",
];

const ENVIRONMENT_CONSTRAINT_NOTE: &str = "\n\nNote: execution environment is a headless \
terminal. GUI interaction mentioned in this task must be implemented or verified through \
terminal-accessible means only.";

/// Strict JSON plan shape requested from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutput {
    pub goal: GoalOutput,
    pub requirements: RequirementsOutput,
    pub tasks: Vec<TaskOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalOutput {
    pub summary: String,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementsOutput {
    #[serde(default)]
    pub functional: Vec<String>,
    #[serde(default)]
    pub non_functional: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// Plan validation annotation: warnings never block, errors surface.
#[derive(Debug, Clone)]
pub struct PlanValidation {
    pub score: u32,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Result of a full planning run.
#[derive(Debug)]
pub struct PlanSummary {
    pub order_id: String,
    pub task_ids: Vec<String>,
    pub warnings: Vec<String>,
    pub score: u32,
}

pub struct Planner {
    store: Store,
    runner: Arc<dyn Runner>,
    config: Config,
}

#[derive(Serialize)]
struct PlanPromptContext<'a> {
    project_id: &'a str,
    order_id: &'a str,
    description: &'a str,
}

impl Planner {
    pub fn new(store: Store, runner: Arc<dyn Runner>, config: Config) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Plan the order from its description document.
    pub async fn plan(
        &self,
        project_id: &str,
        order_id: &str,
        description: &str,
        timeout: Duration,
    ) -> Result<PlanSummary> {
        let paths = OrderPaths::new(&self.config.storage.projects_root, project_id, order_id);
        paths.ensure_dirs()?;

        // The order row: reuse an existing PLANNING order, create otherwise
        self.ensure_order(project_id, order_id, description)?;

        // One model call with the strict schema request
        let prompt = prompts::render(
            "plan",
            &PlanPromptContext {
                project_id,
                order_id,
                description,
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
                "planner runner failed: {}",
                outcome.error.as_deref().unwrap_or("unknown")
            );
        }

        let mut plan = match parse_plan(&outcome.text) {
            Ok(plan) => plan,
            Err(e) => {
                // Fail fast, but keep the raw response for the operator
                let raw_path = paths.requirements_dir().join("raw_response.txt");
                if let Err(write_err) = std::fs::write(&raw_path, &outcome.text) {
                    warn!(error = %write_err, "plan: failed to persist raw response");
                }
                return Err(e).context(format!(
                    "planner produced an unparsable plan; raw response saved to {}",
                    raw_path.display()
                ));
            }
        };

        // Rule-based acceptance criteria where the model omitted them
        for t in &mut plan.tasks {
            if t.acceptance_criteria.is_empty() {
                t.acceptance_criteria = synthesize_acceptance_criteria(t);
            }
        }

        // Environment-constraint note for GUI-flavored tasks
        for t in &mut plan.tasks {
            if !detect_gui_keywords(&t.title, &t.description).is_empty()
                && !t.description.contains("headless terminal")
            {
                t.description.push_str(ENVIRONMENT_CONSTRAINT_NOTE);
            }
        }

        let validation = validate_plan(&plan);
        if !validation.errors.is_empty() {
            bail!("plan validation failed: {}", validation.errors.join("; "));
        }
        for warning in &validation.warnings {
            warn!(warning, "plan: validation warning");
        }

        // Destructive tasks run only after everything else completes
        let (plan_tasks, reorder_warnings) = reorder_destructive_tasks(plan.tasks.clone());
        for warning in &reorder_warnings {
            warn!(warning, "plan: destructive reorder warning");
        }
        let mut warnings = validation.warnings;
        warnings.extend(reorder_warnings);

        let task_ids = self.persist_tasks(project_id, order_id, &plan_tasks, &paths)?;

        self.write_artifacts(&paths, &plan, &plan_tasks)?;

        // Plan persisted: the order starts executing
        self.store.with_txn(|txn| {
            order::transition_order(
                txn,
                project_id,
                order_id,
                OrderStatus::InProgress,
                Role::Pm,
                "PM",
                Some("plan persisted"),
            )?;
            project::set_current_order(txn, project_id, Some(order_id))?;
            Ok(())
        })?;

        info!(
            project_id,
            order_id,
            tasks = task_ids.len(),
            score = validation.score,
            "plan: order planned"
        );

        Ok(PlanSummary {
            order_id: order_id.to_string(),
            task_ids,
            warnings,
            score: validation.score,
        })
    }

    fn ensure_order(&self, project_id: &str, order_id: &str, description: &str) -> Result<()> {
        self.store.with_txn(|txn| {
            project::get_project_required(txn, project_id)?;
            match order::get_order(txn, project_id, order_id)? {
                Some(existing) if existing.status == OrderStatus::Planning => Ok(()),
                Some(existing) => Err(pmstore::StoreError::validation(
                    "status",
                    format!(
                        "order {} is {}, expected PLANNING",
                        order_id, existing.status
                    ),
                )),
                None => {
                    let title = description
                        .lines()
                        .find(|l| !l.trim().is_empty())
                        .unwrap_or(order_id)
                        .trim_start_matches('#')
                        .trim()
                        .to_string();
                    order::create_order_with_id(txn, project_id, order_id, &title, Priority::P1)?;
                    Ok(())
                }
            }
        })?;
        Ok(())
    }

    /// Create the task rows in plan order, resolving dependency titles to
    /// the ids of already-created tasks (unknown titles become warnings at
    /// validation time and are skipped here).
    fn persist_tasks(
        &self,
        project_id: &str,
        order_id: &str,
        plan_tasks: &[TaskOutput],
        paths: &OrderPaths,
    ) -> Result<Vec<String>> {
        let mut title_to_id: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();
        let mut task_ids = Vec::new();

        for t in plan_tasks {
            let depends_on: Vec<String> = t
                .depends_on
                .iter()
                .filter_map(|title| title_to_id.get(title).cloned())
                .collect();

            let priority = t
                .priority
                .as_deref()
                .and_then(|p| Priority::from_str(p).ok())
                .unwrap_or_default();
            let model = t.model.as_deref().and_then(|m| Model::from_str(m).ok());

            let new = NewTask {
                order_id: order_id.to_string(),
                title: t.title.clone(),
                description: Some(t.description.clone()),
                priority,
                recommended_model: model,
                complexity_score: None,
                depends_on,
                target_files: t.target_files.clone(),
                is_destructive_db_change: is_destructive_task(t),
            };
            let created = task::create_task(&self.store, project_id, &new)?;
            self.write_task_file(paths, &created.id, t)?;
            title_to_id.insert(t.title.clone(), created.id.clone());
            task_ids.push(created.id);
        }

        Ok(task_ids)
    }

    fn write_task_file(&self, paths: &OrderPaths, task_id: &str, t: &TaskOutput) -> Result<()> {
        let mut md = format!("# {}: {}\n\n{}\n", task_id, t.title, t.description);
        if !t.target_files.is_empty() {
            md.push_str("\n## Target files\n\n");
            for file in &t.target_files {
                md.push_str(&format!("- {}\n", file));
            }
        }
        if !t.acceptance_criteria.is_empty() {
            md.push_str("\n## Acceptance criteria\n\n");
            for criterion in &t.acceptance_criteria {
                md.push_str(&format!("- {}\n", criterion));
            }
        }
        std::fs::write(paths.task_file(task_id), md).context("Failed to write task file")?;
        Ok(())
    }

    fn write_artifacts(
        &self,
        paths: &OrderPaths,
        plan: &PlanOutput,
        plan_tasks: &[TaskOutput],
    ) -> Result<()> {
        let mut goal = format!("# Goal\n\n{}\n", plan.goal.summary);
        if !plan.goal.objectives.is_empty() {
            goal.push_str("\n## Objectives\n\n");
            for o in &plan.goal.objectives {
                goal.push_str(&format!("- {}\n", o));
            }
        }
        if !plan.goal.success_criteria.is_empty() {
            goal.push_str("\n## Success criteria\n\n");
            for c in &plan.goal.success_criteria {
                goal.push_str(&format!("- {}\n", c));
            }
        }
        std::fs::write(paths.goal_dir().join("GOAL.md"), goal)?;

        let mut req = String::from("# Requirements\n");
        for (title, items) in [
            ("Functional", &plan.requirements.functional),
            ("Non-functional", &plan.requirements.non_functional),
            ("Constraints", &plan.requirements.constraints),
        ] {
            if !items.is_empty() {
                req.push_str(&format!("\n## {}\n\n", title));
                for item in items {
                    req.push_str(&format!("- {}\n", item));
                }
            }
        }
        std::fs::write(paths.requirements_dir().join("REQUIREMENTS.md"), req)?;

        let mut staffing = String::from("# Staffing\n\n| Task | Priority | Model | Files |\n|---|---|---|---|\n");
        for t in plan_tasks {
            staffing.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                t.title,
                t.priority.as_deref().unwrap_or("P1"),
                t.model.as_deref().unwrap_or("Sonnet"),
                t.target_files.join(", ")
            ));
        }
        std::fs::write(paths.staffing_dir().join("STAFFING.md"), staffing)?;
        Ok(())
    }
}

/// Parse the strict JSON plan out of the model response.
pub fn parse_plan(text: &str) -> Result<PlanOutput> {
    let json = extract_json(text).ok_or_else(|| eyre::eyre!("no JSON object in response"))?;
    let plan: PlanOutput = serde_json::from_str(json).context("plan JSON does not match schema")?;
    if plan.tasks.is_empty() {
        bail!("plan contains zero tasks");
    }
    Ok(plan)
}

/// Whether a task definition touches destructive DB operations.
pub fn is_destructive_task(t: &TaskOutput) -> bool {
    let text = format!("{} {}", t.title, t.description).to_uppercase();
    DESTRUCTIVE_KEYWORDS
        .iter()
        .any(|kw| text.contains(&kw.to_uppercase()))
}

/// Defer destructive tasks to the end of the plan by making each depend on
/// every non-destructive task. Destructive tasks then run only after
/// everything else completes.
///
/// A normal task that depends on a destructive task cannot survive the
/// reordering (its dependency now sorts after it); each such dependency is
/// reported as a warning so the operator sees it instead of a silent drop.
pub fn reorder_destructive_tasks(tasks: Vec<TaskOutput>) -> (Vec<TaskOutput>, Vec<String>) {
    let (mut destructive, normal): (Vec<_>, Vec<_>) =
        tasks.into_iter().partition(is_destructive_task);

    if destructive.is_empty() {
        return (normal, Vec::new());
    }

    let mut warnings = Vec::new();
    let destructive_titles: Vec<&str> =
        destructive.iter().map(|t| t.title.as_str()).collect();
    for t in &normal {
        for dep in &t.depends_on {
            if destructive_titles.contains(&dep.as_str()) {
                warnings.push(format!(
                    "task '{}' depends on destructive DB task '{}', which is deferred \
                     to the final phase; the dependency will be dropped",
                    t.title, dep
                ));
            }
        }
    }

    let normal_titles: Vec<String> = normal.iter().map(|t| t.title.clone()).collect();
    for t in &mut destructive {
        warn!(title = %t.title, "reorder_destructive_tasks: deferring destructive DB task");
        for title in &normal_titles {
            if !t.depends_on.contains(title) {
                t.depends_on.push(title.clone());
            }
        }
    }

    let mut reordered = normal;
    reordered.extend(destructive);
    (reordered, warnings)
}

/// Rule-based acceptance criteria for tasks where the model omitted them.
pub fn synthesize_acceptance_criteria(t: &TaskOutput) -> Vec<String> {
    let mut criteria = Vec::new();
    for file in &t.target_files {
        criteria.push(format!("{} is updated and passes its checks", file));
    }
    if criteria.is_empty() {
        criteria.push(format!("'{}' is demonstrably complete per its description", t.title));
    }
    if t.priority.as_deref() == Some("P0") {
        criteria.push("no regression in existing behavior".to_string());
    }
    criteria
}

/// Annotate the plan with a score and warnings; errors block persistence.
pub fn validate_plan(plan: &PlanOutput) -> PlanValidation {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let mut score: i32 = 100;

    let mut seen_titles = std::collections::HashSet::new();
    for t in &plan.tasks {
        if !seen_titles.insert(t.title.as_str()) {
            errors.push(format!("duplicate task title: '{}'", t.title));
        }
    }

    let titles: std::collections::HashSet<&str> =
        plan.tasks.iter().map(|t| t.title.as_str()).collect();
    for (idx, t) in plan.tasks.iter().enumerate() {
        for dep in &t.depends_on {
            if !titles.contains(dep.as_str()) {
                errors.push(format!("task '{}' depends on unknown task '{}'", t.title, dep));
            } else if plan.tasks[..idx].iter().all(|p| p.title != *dep) {
                warnings.push(format!(
                    "task '{}' depends on later task '{}'; dependency will be dropped",
                    t.title, dep
                ));
                score -= 10;
            }
        }

        if let Some(p) = t.priority.as_deref() {
            if Priority::from_str(p).is_err() {
                warnings.push(format!("task '{}' has unknown priority '{}'", t.title, p));
                score -= 5;
            }
        }
        if t.target_files.is_empty() {
            warnings.push(format!("task '{}' declares no target files", t.title));
            score -= 5;
        }
        if t.target_files.iter().any(|f| f.starts_with('/')) {
            warnings.push(format!("task '{}' uses absolute target paths", t.title));
            score -= 5;
        }
        if t.description.trim().is_empty() {
            warnings.push(format!("task '{}' has no description", t.title));
            score -= 5;
        }
    }

    PlanValidation {
        score: score.max(0) as u32,
        warnings,
        errors,
    }
}
