//! Daemon heartbeat: a small JSON file rewritten every tick. External
//! tooling judges liveness by file mtime (fresh if under 60 seconds old).
//! Also the single-instance guard, so two daemons never manage one order.

use std::fs::File;
use std::path::Path;

use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Freshness bound for external liveness checks.
pub const FRESH_SECS: u64 = 60;

/// Heartbeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub order_id: String,
    pub project_id: String,
    /// ISO-8601 write time
    pub timestamp: String,
    pub active_workers: usize,
    pub active_worker_pids: Vec<u32>,
    /// "running" or "shutting_down"
    pub status: String,
    pub adaptive_poll_interval: f64,
    pub resource_trend: Option<serde_json::Value>,
}

/// Heartbeat plus freshness info, as read by external consumers.
#[derive(Debug, Clone)]
pub struct HeartbeatInfo {
    pub heartbeat: Heartbeat,
    pub age_seconds: u64,
    pub is_alive: bool,
}

/// Write (atomically replace) the heartbeat file.
pub fn write_heartbeat(path: &Path, heartbeat: &Heartbeat) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(heartbeat)?;
    std::fs::write(path, json).context("Failed to write heartbeat")?;
    debug!(path = %path.display(), "write_heartbeat");
    Ok(())
}

/// Delete the heartbeat on clean shutdown.
pub fn remove_heartbeat(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            debug!(path = %path.display(), error = %e, "remove_heartbeat failed");
        }
    }
}

/// Read and validate a heartbeat. Freshness is judged by file mtime.
pub fn read_heartbeat(path: &Path) -> Option<HeartbeatInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    let heartbeat: Heartbeat = serde_json::from_str(&content).ok()?;

    let age_seconds = std::fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(u64::MAX);

    Some(HeartbeatInfo {
        heartbeat,
        age_seconds,
        is_alive: age_seconds < FRESH_SECS,
    })
}

/// Exclusive per-order daemon lock, held for the daemon's lifetime.
pub struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    /// Returns an error when another daemon already holds the lock.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path).context("Failed to create daemon lock file")?;
        file.try_lock_exclusive().context(format!(
            "another daemon already manages this order (lock: {})",
            path.display()
        ))?;
        Ok(Self { _file: file })
    }
}
