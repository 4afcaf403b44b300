//! Adaptive poller: shortens the daemon's sleep on activity, lengthens it
//! on idle cycles (exponential toward the ceiling).

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::DaemonConfig;

const BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug)]
pub struct AdaptivePoller {
    min_secs: f64,
    max_secs: f64,
    current_secs: f64,
    events_seen: u64,
    idle_cycles: u64,
}

/// Poller statistics exported in the heartbeat and final results.
#[derive(Debug, Clone, Serialize)]
pub struct PollerStats {
    pub current_interval_secs: f64,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    pub events_seen: u64,
    pub idle_cycles: u64,
}

impl AdaptivePoller {
    pub fn new(config: &DaemonConfig) -> Self {
        let min_secs = config.min_poll_interval_secs.max(0.1);
        let max_secs = config.max_poll_interval_secs.max(min_secs);
        let current_secs = config.poll_interval_secs.clamp(min_secs, max_secs);
        Self {
            min_secs,
            max_secs,
            current_secs,
            events_seen: 0,
            idle_cycles: 0,
        }
    }

    /// Activity observed: snap back to the floor so follow-up work is
    /// picked up promptly.
    pub fn notify_event_detected(&mut self) {
        self.events_seen += 1;
        self.current_secs = self.min_secs;
        debug!(interval = self.current_secs, "notify_event_detected");
    }

    /// Nothing happened this tick: back off toward the ceiling.
    pub fn notify_idle_cycle(&mut self) {
        self.idle_cycles += 1;
        self.current_secs = (self.current_secs * BACKOFF_FACTOR).min(self.max_secs);
        debug!(interval = self.current_secs, "notify_idle_cycle");
    }

    /// The sleep to use for the upcoming tick.
    pub fn next_interval(&self) -> Duration {
        Duration::from_secs_f64(self.current_secs)
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            current_interval_secs: self.current_secs,
            min_interval_secs: self.min_secs,
            max_interval_secs: self.max_secs,
            events_seen: self.events_seen,
            idle_cycles: self.idle_cycles,
        }
    }
}
