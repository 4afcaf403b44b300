//! Self-verification: run detected check tools against the declared
//! artifacts; on failure, rebuild a fix prompt with the tool output and
//! re-invoke the Runner. Bounded by the configured iteration budget.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use pmstore::Model;

use crate::config::VerificationConfig;
use crate::prompts;
use crate::runner::{Runner, RunnerRequest};

/// One failing check, fed back into the fix prompt.
#[derive(Debug, Clone, Serialize)]
pub struct CheckFailure {
    pub command: String,
    pub output: String,
}

/// Outcome of the whole verification loop.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub iterations: u32,
    pub failures: Vec<CheckFailure>,
}

/// Resolve the check command for a file, by extension.
fn command_for(config: &VerificationConfig, file: &Path) -> Option<String> {
    let ext = file.extension()?.to_str()?;
    let template = config.commands.get(ext)?;
    Some(template.replace("{file}", &file.to_string_lossy()))
}

/// Run every applicable check once; collect failures.
pub fn run_checks(config: &VerificationConfig, artifacts: &[PathBuf]) -> Vec<CheckFailure> {
    let mut failures = Vec::new();

    for file in artifacts {
        if !file.exists() {
            debug!(file = %file.display(), "run_checks: artifact not on disk, skipping");
            continue;
        }
        let Some(command) = command_for(config, file) else {
            continue;
        };

        debug!(%command, "run_checks: running");
        match Command::new("sh").arg("-c").arg(&command).output() {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                failures.push(CheckFailure {
                    command,
                    output: text.chars().take(4000).collect(),
                });
            }
            Err(e) => {
                // A missing tool is not the worker's fault; log and move on
                warn!(%command, error = %e, "run_checks: check command unavailable");
            }
        }
    }

    failures
}

#[derive(Serialize)]
struct FixContext<'a> {
    task_id: &'a str,
    failures: &'a [CheckFailure],
}

/// The bounded check-fix loop. Each failing round re-invokes the Runner
/// with the tool output; stops on pass or budget exhaustion.
pub async fn verification_loop(
    config: &VerificationConfig,
    runner: &Arc<dyn Runner>,
    task_id: &str,
    model: Model,
    timeout: Duration,
    artifacts: &[PathBuf],
) -> eyre::Result<VerificationOutcome> {
    let mut failures = run_checks(config, artifacts);
    if failures.is_empty() {
        return Ok(VerificationOutcome {
            passed: true,
            iterations: 0,
            failures,
        });
    }

    for iteration in 1..=config.max_iterations {
        info!(
            task_id,
            iteration,
            failing = failures.len(),
            "verification_loop: attempting fix"
        );

        let prompt = prompts::render(
            "fix",
            &FixContext {
                task_id,
                failures: &failures,
            },
        )?;
        let outcome = runner
            .run(RunnerRequest::new(prompt, model, timeout))
            .await?;
        if !outcome.success {
            warn!(task_id, iteration, error = ?outcome.error, "verification_loop: fix call failed");
        }

        failures = run_checks(config, artifacts);
        if failures.is_empty() {
            return Ok(VerificationOutcome {
                passed: true,
                iterations: iteration,
                failures,
            });
        }
    }

    warn!(
        task_id,
        failing = failures.len(),
        "verification_loop: budget exhausted, checks still failing"
    );
    Ok(VerificationOutcome {
        passed: false,
        iterations: config.max_iterations,
        failures,
    })
}
