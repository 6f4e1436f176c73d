use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rusty_cluster_core::LaunchOptions;

use super::{ConcurrencyBackend, JobInstance, WorkerResource, bounded};
use crate::engine::{Browser, Engine};

/// Upper bound on opening and disposing a job's context and page.
const BROWSER_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// One browser process per worker, each optionally launched with its own options.
pub struct BrowserBackend {
    engine: Arc<dyn Engine>,
    options: LaunchOptions,
}

impl BrowserBackend {
    pub fn new(engine: Arc<dyn Engine>, options: LaunchOptions) -> Self {
        Self { engine, options }
    }
}

#[async_trait]
impl ConcurrencyBackend for BrowserBackend {
    /// Launch and close a probe browser so a broken engine fails at startup.
    async fn init(&self) -> anyhow::Result<()> {
        let probe = self.engine.launch(&self.options).await?;
        if let Err(e) = probe.close().await {
            debug!(error = %e, "Closing probe browser failed");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn worker_instance(
        &self,
        options: Option<LaunchOptions>,
    ) -> anyhow::Result<Box<dyn WorkerResource>> {
        let options = options.unwrap_or_else(|| self.options.clone());
        let browser = self.engine.launch(&options).await?;
        info!(engine = self.engine.name(), "Worker browser launched");
        Ok(Box::new(BrowserWorker {
            engine: self.engine.clone(),
            options,
            browser: Mutex::new(browser),
        }))
    }
}

struct BrowserWorker {
    engine: Arc<dyn Engine>,
    options: LaunchOptions,
    browser: Mutex<Arc<dyn Browser>>,
}

#[async_trait]
impl WorkerResource for BrowserWorker {
    async fn job_instance(&self) -> anyhow::Result<JobInstance> {
        let browser = self.browser.lock().await.clone();
        let context = bounded(
            Some(BROWSER_OP_TIMEOUT),
            "creating browser context",
            browser.new_context(),
        )
        .await?;
        match bounded(Some(BROWSER_OP_TIMEOUT), "creating page", context.new_page()).await {
            Ok(page) => Ok(JobInstance::in_context(
                page,
                context,
                Some(BROWSER_OP_TIMEOUT),
            )),
            Err(e) => {
                let _ = context.close().await;
                Err(e)
            }
        }
    }

    async fn repair(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!(error = %e, "Closing broken worker browser failed");
        }
        match self.engine.launch(&self.options).await {
            Ok(fresh) => {
                warn!("Worker browser relaunched");
                *browser = fresh;
            }
            Err(e) => warn!(error = %e, "Unable to restart worker browser"),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.browser.lock().await.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEngine;

    #[tokio::test]
    async fn test_one_browser_per_worker() {
        let engine = MemoryEngine::new();
        let backend = BrowserBackend::new(Arc::new(engine.clone()), LaunchOptions::default());
        backend.init().await.unwrap();
        assert_eq!(engine.open_browsers(), 0);

        let a = backend.worker_instance(None).await.unwrap();
        let b = backend.worker_instance(None).await.unwrap();
        assert_eq!(engine.open_browsers(), 2);

        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(engine.open_browsers(), 0);
    }

    #[tokio::test]
    async fn test_worker_options_used_for_launch_and_repair() {
        let engine = MemoryEngine::new();
        let backend = BrowserBackend::new(Arc::new(engine.clone()), LaunchOptions::default());
        let custom = LaunchOptions::default().with_arg("--proxy-server=10.0.0.1:3128");

        let worker = backend.worker_instance(Some(custom.clone())).await.unwrap();
        worker.repair().await;

        let launched = engine.launched_with();
        assert_eq!(launched, vec![custom.clone(), custom]);
        assert_eq!(engine.open_browsers(), 1);
    }

    #[tokio::test]
    async fn test_init_fails_when_engine_cannot_launch() {
        let engine = MemoryEngine::new();
        engine.fail_launches(true);
        let backend = BrowserBackend::new(Arc::new(engine), LaunchOptions::default());
        assert!(backend.init().await.is_err());
    }

    #[tokio::test]
    async fn test_repair_keeps_old_browser_when_relaunch_fails() {
        let engine = MemoryEngine::new();
        let backend = BrowserBackend::new(Arc::new(engine.clone()), LaunchOptions::default());
        let worker = backend.worker_instance(None).await.unwrap();

        engine.fail_launches(true);
        worker.repair().await;
        assert!(worker.job_instance().await.is_err());

        engine.fail_launches(false);
        worker.repair().await;
        assert!(worker.job_instance().await.is_ok());
    }
}
