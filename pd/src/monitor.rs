//! Host resource monitor: CPU/memory sampling, admission verdicts, and a
//! trend-aware recommended-worker-count signal that lags so transient
//! spikes don't thrash the scheduler.

use std::collections::VecDeque;

use serde::Serialize;
use sysinfo::System;
use tracing::debug;

use crate::config::ResourceConfig;

/// One sample of host load.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Sample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Trend summary exported in the heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct TrendStatus {
    pub cpu_avg: f32,
    pub memory_avg: f32,
    pub samples: usize,
    pub direction: &'static str,
}

const WINDOW: usize = 6;

pub struct ResourceMonitor {
    sys: System,
    max_cpu_percent: f32,
    max_memory_percent: f32,
    window: VecDeque<Sample>,
}

impl ResourceMonitor {
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            sys: System::new(),
            max_cpu_percent: config.max_cpu_percent,
            max_memory_percent: config.max_memory_percent,
            window: VecDeque::with_capacity(WINDOW),
        }
    }

    /// Sample the host; called once per daemon tick.
    pub fn collect_sample(&mut self) -> Sample {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cpu = self.sys.global_cpu_usage();
        let total = self.sys.total_memory();
        let memory = if total > 0 {
            (self.sys.used_memory() as f32 / total as f32) * 100.0
        } else {
            0.0
        };

        let sample = Sample {
            cpu_percent: cpu,
            memory_percent: memory,
        };
        self.record_sample(sample);
        sample
    }

    /// Feed a sample directly (tests).
    pub fn record_sample(&mut self, sample: Sample) {
        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            "record_sample"
        );
    }

    fn latest(&self) -> Option<Sample> {
        self.window.back().copied()
    }

    fn averages(&self) -> (f32, f32) {
        if self.window.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.window.len() as f32;
        let cpu = self.window.iter().map(|s| s.cpu_percent).sum::<f32>() / n;
        let mem = self.window.iter().map(|s| s.memory_percent).sum::<f32>() / n;
        (cpu, mem)
    }

    /// Per-tick slope of the CPU series over the window.
    fn cpu_slope(&self) -> f32 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let first = self.window.front().map(|s| s.cpu_percent).unwrap_or(0.0);
        let last = self.window.back().map(|s| s.cpu_percent).unwrap_or(0.0);
        (last - first) / (self.window.len() - 1) as f32
    }

    /// Single-shot admission: may one more worker launch right now?
    pub fn can_launch_worker(&self) -> (bool, String) {
        let Some(sample) = self.latest() else {
            return (true, "no samples yet".to_string());
        };
        if sample.cpu_percent > self.max_cpu_percent {
            return (
                false,
                format!(
                    "CPU {:.1}% exceeds limit {:.1}%",
                    sample.cpu_percent, self.max_cpu_percent
                ),
            );
        }
        if sample.memory_percent > self.max_memory_percent {
            return (
                false,
                format!(
                    "memory {:.1}% exceeds limit {:.1}%",
                    sample.memory_percent, self.max_memory_percent
                ),
            );
        }
        (true, "ok".to_string())
    }

    /// Scale `max` down under pressure, based on the latest sample only.
    pub fn recommended_worker_count(&self, current: usize, max: usize) -> usize {
        let Some(sample) = self.latest() else {
            return max;
        };
        self.scale(sample.cpu_percent, sample.memory_percent, current, max)
    }

    /// Trend-aware variant: uses the moving-window average plus the CPU
    /// slope projected one tick forward, so a single spike neither halts
    /// admission nor does a brief dip re-open it.
    pub fn predicted_worker_count(&self, current: usize, max: usize) -> usize {
        if self.window.is_empty() {
            return max;
        }
        let (cpu_avg, mem_avg) = self.averages();
        let projected_cpu = (cpu_avg + self.cpu_slope()).clamp(0.0, 100.0);
        self.scale(projected_cpu, mem_avg, current, max)
    }

    fn scale(&self, cpu: f32, memory: f32, current: usize, max: usize) -> usize {
        let over = cpu > self.max_cpu_percent || memory > self.max_memory_percent;
        let near = cpu > self.max_cpu_percent - 10.0 || memory > self.max_memory_percent - 10.0;

        if over {
            // Shed one slot, never below a single worker
            current.saturating_sub(1).max(1).min(max)
        } else if near {
            // Hold: no growth beyond what is already running
            current.max(1).min(max)
        } else {
            max
        }
    }

    /// Trend summary for the heartbeat.
    pub fn trend_status(&self) -> TrendStatus {
        let (cpu_avg, memory_avg) = self.averages();
        let slope = self.cpu_slope();
        let direction = if slope > 1.0 {
            "rising"
        } else if slope < -1.0 {
            "falling"
        } else {
            "steady"
        };
        TrendStatus {
            cpu_avg,
            memory_avg,
            samples: self.window.len(),
            direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ResourceMonitor {
        ResourceMonitor::new(&ResourceConfig::default())
    }

    fn sample(cpu: f32, mem: f32) -> Sample {
        Sample {
            cpu_percent: cpu,
            memory_percent: mem,
        }
    }

    #[test]
    fn test_admission_without_samples_is_open() {
        let m = monitor();
        assert!(m.can_launch_worker().0);
        assert_eq!(m.recommended_worker_count(2, 5), 5);
    }

    #[test]
    fn test_admission_denied_over_cpu_limit() {
        let mut m = monitor();
        m.record_sample(sample(92.0, 40.0));
        let (ok, reason) = m.can_launch_worker();
        assert!(!ok);
        assert!(reason.contains("CPU"));
    }

    #[test]
    fn test_admission_denied_over_memory_limit() {
        let mut m = monitor();
        m.record_sample(sample(10.0, 95.0));
        let (ok, reason) = m.can_launch_worker();
        assert!(!ok);
        assert!(reason.contains("memory"));
    }

    #[test]
    fn test_recommended_sheds_under_pressure() {
        let mut m = monitor();
        m.record_sample(sample(95.0, 40.0));
        assert_eq!(m.recommended_worker_count(4, 5), 3);
        // Never below one
        assert_eq!(m.recommended_worker_count(1, 5), 1);
    }

    #[test]
    fn test_recommended_holds_near_limit() {
        let mut m = monitor();
        m.record_sample(sample(80.0, 40.0));
        assert_eq!(m.recommended_worker_count(2, 5), 2);
    }

    #[test]
    fn test_recommended_full_when_idle() {
        let mut m = monitor();
        m.record_sample(sample(20.0, 30.0));
        assert_eq!(m.recommended_worker_count(2, 5), 5);
    }

    #[test]
    fn test_predicted_smooths_transient_spike() {
        let mut m = monitor();
        for _ in 0..5 {
            m.record_sample(sample(30.0, 40.0));
        }
        // One spike over the limit must not shed a slot in the predicted view
        m.record_sample(sample(95.0, 40.0));
        assert_eq!(m.recommended_worker_count(3, 5), 2);
        assert!(m.predicted_worker_count(3, 5) >= 3);
    }

    #[test]
    fn test_predicted_reacts_to_sustained_rise() {
        let mut m = monitor();
        for cpu in [70.0, 75.0, 80.0, 85.0, 90.0, 95.0] {
            m.record_sample(sample(cpu, 40.0));
        }
        // Average ~82.5 with a rising slope projects over the near band
        assert!(m.predicted_worker_count(4, 5) <= 4);
        assert_eq!(m.trend_status().direction, "rising");
    }
}
