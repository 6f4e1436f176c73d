//! Progress snapshots and the monitor output.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Units for [`format_duration`], each with its size relative to the previous one.
const TIME_UNITS: [(f64, &str); 7] = [
    (1.0, "ms"),
    (1000.0, "seconds"),
    (60.0, "minutes"),
    (60.0, "hours"),
    (24.0, "days"),
    (31.0, "months"),
    (365.0 / 31.0, "years"),
];

/// A value is promoted to the next unit once it reaches this fraction of it.
const TIME_UNIT_THRESHOLD: f64 = 0.95;

/// Human readable duration, e.g. `1.5 minutes`. Negative input is `unknown`.
pub fn format_duration(millis: f64) -> String {
    if millis < 0.0 || millis.is_nan() {
        return "unknown".to_string();
    }
    let mut remaining = millis;
    let mut unit = 0;
    while unit + 1 < TIME_UNITS.len() && remaining / TIME_UNITS[unit + 1].0 >= TIME_UNIT_THRESHOLD
    {
        remaining /= TIME_UNITS[unit + 1].0;
        unit += 1;
    }
    format!("{remaining:.1} {}", TIME_UNITS[unit].1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Working,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub state: WorkerState,
    /// URL (or other identity) of the job in progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_target: Option<String>,
}

/// Point-in-time view of a cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub started_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// Jobs submitted so far.
    pub all_targets: u64,
    /// Jobs neither queued nor running.
    pub done_targets: u64,
    /// Jobs that ended in an error.
    pub error_count: u64,
    pub queued: usize,
    pub workers: Vec<WorkerStatus>,
    pub starting_workers: usize,
    pub closed: bool,
}

impl ClusterStatus {
    pub fn running_for(&self) -> Duration {
        (self.now - self.started_at).to_std().unwrap_or_default()
    }

    /// Share of submitted jobs that are done; 1.0 when nothing was submitted.
    pub fn done_fraction(&self) -> f64 {
        if self.all_targets == 0 {
            1.0
        } else {
            self.done_targets as f64 / self.all_targets as f64
        }
    }

    pub fn error_percentage(&self) -> f64 {
        if self.done_targets == 0 {
            0.0
        } else {
            100.0 * self.error_count as f64 / self.done_targets as f64
        }
    }

    pub fn pages_per_second(&self) -> f64 {
        let secs = self.running_for().as_secs_f64();
        if self.done_targets == 0 || secs == 0.0 {
            0.0
        } else {
            self.done_targets as f64 / secs
        }
    }

    /// Linear estimate of the time left, `None` before anything finished.
    pub fn remaining(&self) -> Option<Duration> {
        let done = self.done_fraction();
        if done == 0.0 {
            return None;
        }
        let elapsed = self.running_for().as_secs_f64();
        Some(Duration::from_secs_f64((elapsed / done - elapsed).max(0.0)))
    }

    /// Number of workers, including those still starting.
    pub fn worker_count(&self) -> usize {
        self.workers.len() + self.starting_workers
    }

    /// Multi-line progress report.
    pub fn report(&self) -> Vec<String> {
        let remaining = self
            .remaining()
            .map_or(-1.0, |d| d.as_millis() as f64);
        let mut lines = vec![
            format!("== Start:     {}", self.started_at.format("%Y-%m-%d %H:%M:%S%.3f")),
            format!(
                "== Now:       {} (running for {})",
                self.now.format("%Y-%m-%d %H:%M:%S%.3f"),
                format_duration(self.running_for().as_millis() as f64)
            ),
            format!(
                "== Progress:  {} / {} ({:.2}%), errors: {} ({:.2}%)",
                self.done_targets,
                self.all_targets,
                100.0 * self.done_fraction(),
                self.error_count,
                self.error_percentage()
            ),
            format!(
                "== Remaining: {} (@ {:.2} pages/second)",
                format_duration(remaining),
                self.pages_per_second()
            ),
            format!("== Workers:   {}", self.worker_count()),
        ];
        for worker in &self.workers {
            lines.push(match (worker.state, &worker.active_target) {
                (WorkerState::Idle, _) => format!("   #{} IDLE", worker.id),
                (WorkerState::Working, Some(target)) => format!("   #{} WORK {target}", worker.id),
                (WorkerState::Working, None) => format!("   #{} WORK", worker.id),
            });
        }
        for i in 0..self.starting_workers {
            lines.push(format!("   #{} STARTING...", self.workers.len() + i));
        }
        lines
    }
}

/// Emit one status snapshot to the log.
pub(crate) fn log_status(status: &ClusterStatus) {
    info!(
        done = status.done_targets,
        total = status.all_targets,
        errors = status.error_count,
        queued = status.queued,
        workers = status.worker_count(),
        "Cluster progress"
    );
    for line in status.report() {
        info!(target: "rusty_cluster::monitor", "{line}");
    }
}
