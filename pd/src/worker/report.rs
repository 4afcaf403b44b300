//! Report emission and the post-execution quality hooks: static analysis
//! (best-effort) and the destructive-SQL scan (informational, never blocks).

use std::path::{Path, PathBuf};
use std::process::Command;

use eyre::{Context, Result};
use pmstore::sqlcheck;
use pmstore::task::Task;
use tracing::{debug, info, warn};

use crate::config::VerificationConfig;
use crate::worker::verify::VerificationOutcome;

/// Minimum size for a report to count as real output.
pub const MIN_REPORT_BYTES: u64 = 100;

/// Render the worker report markdown.
pub fn format_report(
    t: &Task,
    model: &str,
    execution_result: &str,
    cost_usd: Option<f64>,
    verification: &VerificationOutcome,
) -> String {
    let mut md = String::new();
    md.push_str(&format!("# Report: {} - {}\n\n", t.id, t.title));
    md.push_str(&format!("- Order: {}\n", t.order_id));
    md.push_str(&format!("- Project: {}\n", t.project_id));
    md.push_str(&format!("- Model: {}\n", model));
    if let Some(cost) = cost_usd {
        md.push_str(&format!("- Cost: ${:.4}\n", cost));
    }
    md.push_str(&format!("- Completed: {}\n", pmstore::now_iso()));
    if !t.target_files.is_empty() {
        md.push_str(&format!("- Target files: {}\n", t.target_files.join(", ")));
    }
    md.push('\n');

    md.push_str("## Execution result\n\n");
    md.push_str(execution_result);
    md.push('\n');

    md.push_str("\n## Self-verification\n\n");
    if verification.passed {
        md.push_str(&format!(
            "All checks passed after {} fix iteration(s).\n",
            verification.iterations
        ));
    } else {
        md.push_str(&format!(
            "{} check(s) still failing after {} iteration(s):\n\n",
            verification.failures.len(),
            verification.iterations
        ));
        for failure in &verification.failures {
            md.push_str(&format!("- `{}`\n", failure.command));
        }
    }

    md
}

/// Write the report and validate its size; an undersized report is a
/// worker failure.
pub fn write_report(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content).context(format!("Failed to write report {}", path.display()))?;

    let size = std::fs::metadata(path)?.len();
    if size < MIN_REPORT_BYTES {
        eyre::bail!(
            "report file missing or too small: {} bytes at {}",
            size,
            path.display()
        );
    }
    info!(path = %path.display(), size, "write_report: report written");
    Ok(())
}

/// Append a titled section to an existing report.
pub fn append_section(path: &Path, title: &str, body: &str) -> Result<()> {
    let mut content = std::fs::read_to_string(path).unwrap_or_default();
    content.push_str(&format!("\n## {}\n\n{}\n", title, body));
    std::fs::write(path, content)?;
    Ok(())
}

/// Static-analysis hook: run the configured auto-fixer then analyzer over
/// the artifacts, append a section, and return the parsed score. Every
/// failure is logged and swallowed; this hook is never fatal.
pub fn static_analysis_hook(
    config: &VerificationConfig,
    report_path: &Path,
    artifacts: &[PathBuf],
) -> Option<i64> {
    let analyzer = config.analyzer_command.as_ref()?;
    if artifacts.is_empty() {
        return None;
    }

    let file_list = artifacts
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");

    if let Some(fixer) = &config.fixer_command {
        let cmd = fixer.replace("{files}", &file_list);
        debug!(%cmd, "static_analysis_hook: running fixer");
        if let Err(e) = Command::new("sh").arg("-c").arg(&cmd).output() {
            warn!(error = %e, "static_analysis_hook: fixer failed");
        }
    }

    let cmd = analyzer.replace("{files}", &file_list);
    debug!(%cmd, "static_analysis_hook: running analyzer");
    let output = match Command::new("sh").arg("-c").arg(&cmd).output() {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "static_analysis_hook: analyzer failed to run");
            return None;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    // The score is the last integer the analyzer prints
    let score = stdout
        .split_whitespace()
        .rev()
        .find_map(|token| token.trim_end_matches('%').parse::<i64>().ok());

    let body = format!(
        "Analyzer: `{}`\n\nScore: {}\n\n```\n{}\n```",
        cmd,
        score.map_or("n/a".to_string(), |s| s.to_string()),
        stdout.trim()
    );
    if let Err(e) = append_section(report_path, "Static analysis", &body) {
        warn!(error = %e, "static_analysis_hook: failed to append section");
    }

    score
}

/// Destructive-SQL scan over the artifacts. Appends findings to the
/// report; informational only.
pub fn destructive_sql_scan(report_path: &Path, artifacts: &[PathBuf]) -> usize {
    let mut findings = Vec::new();

    for file in artifacts {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        for finding in sqlcheck::destructive_findings(&content) {
            findings.push(format!("{}: {}", file.display(), finding));
        }
    }

    if !findings.is_empty() {
        let body = format!(
            "Destructive SQL statements detected (informational; review before deploy):\n\n{}",
            findings
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        );
        if let Err(e) = append_section(report_path, "Destructive SQL scan", &body) {
            warn!(error = %e, "destructive_sql_scan: failed to append section");
        }
    }

    findings.len()
}
