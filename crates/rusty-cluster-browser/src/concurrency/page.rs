use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rusty_cluster_core::LaunchOptions;

use super::shared::SharedBrowser;
use super::{ConcurrencyBackend, JobInstance, WorkerResource, bounded};
use crate::engine::{Engine, Page};

/// Upper bound on the liveness check of a reused page.
const PAGE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// One shared browser; every worker keeps a single page for all its jobs.
///
/// Cheapest model, but jobs see each other's cookies and storage.
pub struct PageBackend {
    shared: Arc<SharedBrowser>,
}

impl PageBackend {
    pub fn new(engine: Arc<dyn Engine>, options: LaunchOptions) -> Self {
        Self {
            shared: Arc::new(SharedBrowser::new(engine, options)),
        }
    }
}

#[async_trait]
impl ConcurrencyBackend for PageBackend {
    async fn init(&self) -> anyhow::Result<()> {
        self.shared.launch().await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.shared.close().await
    }

    async fn worker_instance(
        &self,
        _options: Option<LaunchOptions>,
    ) -> anyhow::Result<Box<dyn WorkerResource>> {
        let (generation, browser) = self.shared.get().await?;
        let page = browser.new_page().await?;
        Ok(Box::new(PageWorker {
            shared: self.shared.clone(),
            slot: Mutex::new(Slot {
                generation,
                page: Some(page),
            }),
        }))
    }
}

struct Slot {
    /// Browser generation the worker last saw. Repairs relaunch only this one.
    generation: u64,
    /// `None` after the page died or a repair could not reopen it.
    page: Option<Arc<dyn Page>>,
}

struct PageWorker {
    shared: Arc<SharedBrowser>,
    slot: Mutex<Slot>,
}

#[async_trait]
impl WorkerResource for PageWorker {
    /// Hand out the worker's page, reopening it after someone else relaunched
    /// the browser. A page that stopped answering is an acquisition error.
    async fn job_instance(&self) -> anyhow::Result<JobInstance> {
        let mut slot = self.slot.lock().await;
        let (generation, browser) = self.shared.get().await?;

        if slot.generation != generation {
            debug!(from = slot.generation, to = generation, "Shared browser changed, reopening page");
            if let Some(stale) = slot.page.take() {
                let _ = stale.close().await;
            }
            slot.generation = generation;
        }

        if let Some(page) = slot.page.clone() {
            match bounded(Some(PAGE_CHECK_TIMEOUT), "checking page", page.url()).await {
                Ok(_) => return Ok(JobInstance::reused(page)),
                Err(e) => {
                    slot.page = None;
                    let _ = page.close().await;
                    return Err(e.context("Worker page is no longer usable"));
                }
            }
        }

        let page = browser.new_page().await?;
        slot.page = Some(page.clone());
        Ok(JobInstance::reused(page))
    }

    async fn repair(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(page) = slot.page.take() {
            let _ = page.close().await;
        }
        if let Err(e) = self.shared.relaunch(slot.generation).await {
            warn!(error = %e, "Unable to restart shared browser");
            return;
        }
        match self.shared.get().await {
            Ok((generation, browser)) => {
                slot.generation = generation;
                match browser.new_page().await {
                    Ok(page) => slot.page = Some(page),
                    Err(e) => debug!(error = %e, "Page not reopened after repair"),
                }
            }
            Err(e) => warn!(error = %e, "Shared browser unavailable after repair"),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        match self.slot.lock().await.page.take() {
            Some(page) => page.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEngine;

    #[tokio::test]
    async fn test_page_is_reused_across_jobs() {
        let engine = MemoryEngine::new();
        let backend = PageBackend::new(Arc::new(engine.clone()), LaunchOptions::default());
        backend.init().await.unwrap();
        let worker = backend.worker_instance(None).await.unwrap();

        let first = worker.job_instance().await.unwrap();
        first.page().goto("https://a.test/").await.unwrap();
        first.close().await.unwrap();

        let second = worker.job_instance().await.unwrap();
        assert_eq!(
            second.page().url().await.unwrap().as_deref(),
            Some("https://a.test/")
        );
        assert_eq!(engine.open_pages(), 1);
    }

    #[tokio::test]
    async fn test_repair_by_many_workers_relaunches_once() {
        let engine = MemoryEngine::new();
        let backend = PageBackend::new(Arc::new(engine.clone()), LaunchOptions::default());
        backend.init().await.unwrap();
        let a = backend.worker_instance(None).await.unwrap();
        let b = backend.worker_instance(None).await.unwrap();

        a.repair().await;
        b.repair().await;
        assert_eq!(engine.launches(), 2);

        let instance = b.job_instance().await.unwrap();
        instance.page().goto("https://b.test/").await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_browser_fails_acquisition_until_repaired() {
        let engine = MemoryEngine::new();
        let backend = PageBackend::new(Arc::new(engine.clone()), LaunchOptions::default());
        backend.init().await.unwrap();
        let worker = backend.worker_instance(None).await.unwrap();

        engine.disconnect_browsers();
        let err = worker.job_instance().await.unwrap_err();
        assert!(format!("{err:#}").contains("no longer usable"));

        worker.repair().await;
        assert_eq!(engine.launches(), 2);
        let instance = worker.job_instance().await.unwrap();
        instance.page().goto("https://a.test/").await.unwrap();
        assert_eq!(engine.open_pages(), 1);
    }

    #[tokio::test]
    async fn test_page_reopened_after_other_worker_relaunch() {
        let engine = MemoryEngine::new();
        let backend = PageBackend::new(Arc::new(engine.clone()), LaunchOptions::default());
        backend.init().await.unwrap();
        let a = backend.worker_instance(None).await.unwrap();
        let b = backend.worker_instance(None).await.unwrap();

        a.repair().await;
        // b never saw a failure, but its page belongs to the old browser.
        let instance = b.job_instance().await.unwrap();
        instance.page().goto("https://b.test/").await.unwrap();
        assert_eq!(engine.launches(), 2);
        assert_eq!(engine.open_pages(), 2);
    }

    #[tokio::test]
    async fn test_worker_instance_requires_init() {
        let engine = MemoryEngine::new();
        let backend = PageBackend::new(Arc::new(engine), LaunchOptions::default());
        assert!(backend.worker_instance(None).await.is_err());
    }
}
