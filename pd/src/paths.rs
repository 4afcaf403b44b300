//! Canonical filesystem layout per order:
//! `PROJECTS/<project>/RESULT/<order>/{01_GOAL,...,07_REVIEW,LOGS}`.
//!
//! These files are human-readable projections; the database remains the
//! system of record.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};

/// Resolved directory layout for one order.
#[derive(Debug, Clone)]
pub struct OrderPaths {
    root: PathBuf,
    project_id: String,
    order_id: String,
}

impl OrderPaths {
    pub fn new(projects_root: impl AsRef<Path>, project_id: &str, order_id: &str) -> Self {
        let root = projects_root
            .as_ref()
            .join("PROJECTS")
            .join(project_id)
            .join("RESULT")
            .join(order_id);
        Self {
            root,
            project_id: project_id.to_string(),
            order_id: order_id.to_string(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn goal_dir(&self) -> PathBuf {
        self.root.join("01_GOAL")
    }

    pub fn requirements_dir(&self) -> PathBuf {
        self.root.join("02_REQUIREMENTS")
    }

    pub fn staffing_dir(&self) -> PathBuf {
        self.root.join("03_STAFFING")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("04_QUEUE")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.root.join("05_REPORT")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("06_ARTIFACTS")
    }

    pub fn review_dir(&self) -> PathBuf {
        self.root.join("07_REVIEW")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("LOGS")
    }

    /// Create the whole tree.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.goal_dir(),
            self.requirements_dir(),
            self.staffing_dir(),
            self.queue_dir(),
            self.report_dir(),
            self.artifacts_dir(),
            self.review_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .context(format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// `04_QUEUE/TASK_<n>.md`
    pub fn task_file(&self, task_id: &str) -> PathBuf {
        self.queue_dir().join(format!("{}.md", task_id))
    }

    /// `05_REPORT/REPORT_<n>.md`
    pub fn report_file(&self, task_id: &str) -> PathBuf {
        self.report_dir()
            .join(format!("REPORT_{}.md", task_number(task_id)))
    }

    /// `07_REVIEW/REVIEW_<n>.md`
    pub fn review_file(&self, task_id: &str) -> PathBuf {
        self.review_dir()
            .join(format!("REVIEW_{}.md", task_number(task_id)))
    }

    /// `LOGS/worker_<task>_<ts>.log`
    pub fn worker_log_file(&self, task_id: &str, timestamp: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("worker_{}_{}.log", task_id, timestamp))
    }

    /// `LOGS/review_<task>_<ts>.log`
    pub fn review_log_file(&self, task_id: &str, timestamp: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("review_{}_{}.log", task_id, timestamp))
    }

    /// `LOGS/daemon_heartbeat.json`
    pub fn heartbeat_file(&self) -> PathBuf {
        self.logs_dir().join("daemon_heartbeat.json")
    }

    /// `LOGS/daemon.lock` - single-instance guard
    pub fn daemon_lock_file(&self) -> PathBuf {
        self.logs_dir().join("daemon.lock")
    }
}

/// Order-description input document: `PROJECTS/<project>/ORDERS/<order>.md`.
pub fn order_description_file(
    projects_root: impl AsRef<Path>,
    project_id: &str,
    order_id: &str,
) -> PathBuf {
    projects_root
        .as_ref()
        .join("PROJECTS")
        .join(project_id)
        .join("ORDERS")
        .join(format!("{}.md", order_id))
}

/// Numeric suffix of a task id: `TASK_188` -> `188`, `TASK_188_INT_01` -> `188`.
pub fn task_number(task_id: &str) -> String {
    task_id
        .strip_prefix("TASK_")
        .map(|rest| {
            rest.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
        })
        .filter(|digits| !digits.is_empty())
        .unwrap_or_else(|| task_id.to_string())
}

/// Filesystem-safe timestamp for log file names.
pub fn log_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = OrderPaths::new("/data", "demo", "ORDER_036");
        assert_eq!(
            paths.report_file("TASK_188"),
            PathBuf::from("/data/PROJECTS/demo/RESULT/ORDER_036/05_REPORT/REPORT_188.md")
        );
        assert_eq!(
            paths.review_file("TASK_188_INT_01"),
            PathBuf::from("/data/PROJECTS/demo/RESULT/ORDER_036/07_REVIEW/REVIEW_188.md")
        );
        assert!(paths
            .heartbeat_file()
            .ends_with("LOGS/daemon_heartbeat.json"));
    }

    #[test]
    fn test_task_number() {
        assert_eq!(task_number("TASK_188"), "188");
        assert_eq!(task_number("TASK_188_INT_01"), "188");
        assert_eq!(task_number("ODD"), "ODD");
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = OrderPaths::new(dir.path(), "demo", "ORDER_001");
        paths.ensure_dirs().unwrap();
        assert!(paths.queue_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
    }
}
