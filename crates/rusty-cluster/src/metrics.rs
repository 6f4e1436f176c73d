//! Scheduler metrics, recorded through the `metrics` facade.
//!
//! Without an installed recorder these are no-ops.

/// Record a job entering the queue.
pub fn record_queued() {
    metrics::counter!("cluster_jobs_queued_total").increment(1);
}

/// Record a job reaching a terminal state.
pub fn record_completed(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("cluster_jobs_completed_total", &labels).increment(1);
}

pub fn record_retry() {
    metrics::counter!("cluster_job_retries_total").increment(1);
}

/// Record the duration of one job attempt.
pub fn record_attempt(duration_secs: f64) {
    metrics::histogram!("cluster_job_duration_seconds").record(duration_secs);
}

pub fn record_worker_started() {
    metrics::gauge!("cluster_workers").increment(1.0);
}

pub fn record_worker_closed() {
    metrics::gauge!("cluster_workers").decrement(1.0);
}
