//! A worker binds one pooled browser resource to at most one job at a time.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, warn};

use rusty_cluster_browser::{JobInstance, WorkerResource};
use rusty_cluster_core::JobError;

use crate::job::{JobData, TaskContext, TaskFn};

/// How often `job_instance()` is tried (with a repair in between) before the
/// job fails.
pub(crate) const ACQUIRE_ATTEMPTS: u32 = 10;

pub(crate) struct Worker {
    pub id: usize,
    resource: Box<dyn WorkerResource>,
    /// Identity of the job being worked on, for status reports.
    active_target: Mutex<Option<String>>,
}

impl Worker {
    pub fn new(id: usize, resource: Box<dyn WorkerResource>) -> Self {
        Self {
            id,
            resource,
            active_target: Mutex::new(None),
        }
    }

    pub fn active_target(&self) -> Option<String> {
        self.active_target
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn set_active_target(&self, target: Option<String>) {
        if let Ok(mut slot) = self.active_target.lock() {
            *slot = target;
        }
    }

    /// Run `task` against a fresh execution surface.
    ///
    /// Never fails past this boundary: every problem ends up in the returned
    /// `JobError`.
    pub async fn handle<D: JobData, R>(
        &self,
        task: TaskFn<D, R>,
        data: D,
        timeout: Option<Duration>,
    ) -> Result<R, JobError> {
        self.set_active_target(Some(
            data.identity_key().unwrap_or_else(|| "UNKNOWN TARGET".into()),
        ));
        let result = self.run(task, data, timeout).await;
        self.set_active_target(None);
        result
    }

    async fn run<D: JobData, R>(
        &self,
        task: TaskFn<D, R>,
        data: D,
        timeout: Option<Duration>,
    ) -> Result<R, JobError> {
        let instance = self.acquire().await?;
        let page = instance.page();
        let mut page_errors = page.errors();

        let fut = task(TaskContext {
            page,
            data,
            worker_id: self.id,
        });
        let mut result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome.map_err(|e| JobError::task(&e)),
                Err(_) => Err(JobError::Timeout(limit)),
            },
            None => fut.await.map_err(|e| JobError::task(&e)),
        };

        if result.is_ok() {
            match page_errors.try_recv() {
                Ok(message) => result = Err(JobError::Page(message)),
                Err(TryRecvError::Lagged(missed)) => {
                    result = Err(JobError::Page(format!("{missed} page errors")))
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => {}
            }
        }

        if let Err(e) = instance.close().await {
            warn!(worker_id = self.id, error = %e, "Releasing job resources failed, repairing");
            self.resource.repair().await;
        }
        result
    }

    async fn acquire(&self) -> Result<JobInstance, JobError> {
        let mut last_error = String::new();
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            match self.resource.job_instance().await {
                Ok(instance) => return Ok(instance),
                Err(e) => {
                    debug!(worker_id = self.id, attempt, error = %e, "Error getting browser page");
                    last_error = format!("{e:#}");
                    self.resource.repair().await;
                }
            }
        }
        warn!(worker_id = self.id, error = %last_error, "Giving up on browser page");
        Err(JobError::Acquisition {
            attempts: ACQUIRE_ATTEMPTS,
            last_error,
        })
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.resource.close().await
    }
}
