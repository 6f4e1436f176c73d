use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Config error: {0}")]
    Config(String),

    /// The browser engine could not be launched. Fatal at startup.
    #[error("Unable to launch browser: {0}")]
    Launch(String),

    #[error("No task function defined")]
    NoTaskFunction,

    #[error("Cluster is closed")]
    Closed,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a job attempt failed, or why a job never ran.
///
/// Cloneable so it can be kept on the job's error history and broadcast to
/// event subscribers at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("Timeout hit: {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Unable to get browser page after {attempts} attempts: {last_error}")]
    Acquisition { attempts: u32, last_error: String },

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Page error: {0}")]
    Page(String),

    #[error("No task function defined")]
    NoTaskFunction,

    /// The job's URL was already handled and duplicate skipping is on.
    #[error("Skipped duplicate: {0}")]
    Skipped(String),
}

impl JobError {
    /// Wrap an error returned by a task function, keeping its context chain.
    pub fn task(err: &anyhow::Error) -> Self {
        Self::Task(format!("{err:#}"))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
