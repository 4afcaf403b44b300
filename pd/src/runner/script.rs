//! Script runner: reads the completion from a shell command.
//!
//! The command receives the prompt on stdin and must print the completion
//! on stdout. Used by tests and offline dry-runs.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Runner, RunnerError, RunnerOutcome, RunnerRequest};

pub struct ScriptRunner {
    command: String,
}

impl ScriptRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Runner for ScriptRunner {
    async fn run(&self, request: RunnerRequest) -> Result<RunnerOutcome, RunnerError> {
        debug!(command = %self.command, model = request.model.as_str(), "run: invoking script");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("PD_MODEL", request.model.as_str())
            .env("PD_ALLOWED_TOOLS", request.allowed_tools.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RunnerError::Script(format!("spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| RunnerError::Script(format!("stdin write failed: {}", e)))?;
        }

        let output = tokio::time::timeout(request.timeout, child.wait_with_output())
            .await
            .map_err(|_| RunnerError::Timeout(request.timeout))?
            .map_err(|e| RunnerError::Script(format!("wait failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(RunnerOutcome::failed(format!(
                "script exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(RunnerOutcome::ok(text, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmstore::Model;
    use std::time::Duration;

    #[tokio::test]
    async fn test_echoes_stdout() {
        let runner = ScriptRunner::new("cat");
        let outcome = runner
            .run(RunnerRequest::new("hello", Model::Sonnet, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.text, "hello");
    }

    #[tokio::test]
    async fn test_model_exposed_in_env() {
        let runner = ScriptRunner::new("printf '%s' \"$PD_MODEL\"");
        let outcome = runner
            .run(RunnerRequest::new("x", Model::Opus, Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome.text, "Opus");
    }

    #[tokio::test]
    async fn test_failure_captured_not_raised() {
        let runner = ScriptRunner::new("echo boom >&2; exit 3");
        let outcome = runner
            .run(RunnerRequest::new("x", Model::Sonnet, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = ScriptRunner::new("sleep 5");
        let result = runner
            .run(RunnerRequest::new("x", Model::Sonnet, Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(RunnerError::Timeout(_))));
    }
}
