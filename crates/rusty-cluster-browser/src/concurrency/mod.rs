//! Concurrency backends: how browsers are shared between workers and jobs.
//!
//! | model     | browsers            | per job                          |
//! |-----------|---------------------|----------------------------------|
//! | `page`    | one, shared         | the worker's own page, reused    |
//! | `context` | one, shared         | a fresh incognito context + page |
//! | `browser` | one per worker      | a fresh context + page           |
//!
//! Callers can plug in their own strategy by implementing [`ConcurrencyBackend`].

mod browser;
mod context;
mod page;
mod shared;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use rusty_cluster_core::{ConcurrencyModel, LaunchOptions};

use crate::engine::{BrowserContext, Engine, Page};

pub use browser::BrowserBackend;
pub use context::ContextBackend;
pub use page::PageBackend;

/// Manages the lifecycle of pooled browser resources.
#[async_trait]
pub trait ConcurrencyBackend: Send + Sync {
    /// Prepare the backend. An error here aborts cluster startup.
    async fn init(&self) -> anyhow::Result<()>;

    /// Release everything the backend still holds.
    async fn close(&self) -> anyhow::Result<()>;

    /// Create the resource one worker will run all of its jobs against.
    ///
    /// `options` carries per-worker launch options when the cluster runs in
    /// per-worker mode; backends that share one browser ignore it.
    async fn worker_instance(
        &self,
        options: Option<LaunchOptions>,
    ) -> anyhow::Result<Box<dyn WorkerResource>>;
}

/// A resource bound to one worker.
#[async_trait]
pub trait WorkerResource: Send + Sync {
    /// Hand out the execution surface for the next job.
    async fn job_instance(&self) -> anyhow::Result<JobInstance>;

    /// Best-effort recovery, usually relaunching the browser.
    async fn repair(&self);

    async fn close(&self) -> anyhow::Result<()>;
}

/// What to tear down once a job is finished with its page.
enum Release {
    /// The page outlives the job.
    Keep,
    /// Close the page.
    Page(Arc<dyn Page>),
    /// Close the whole context, optionally bounded in time.
    Context {
        context: Arc<dyn BrowserContext>,
        timeout: Option<Duration>,
    },
}

/// The execution surface handed to a single job.
pub struct JobInstance {
    page: Arc<dyn Page>,
    release: Release,
}

impl std::fmt::Debug for JobInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInstance").finish_non_exhaustive()
    }
}

impl JobInstance {
    /// A page the job borrows; closing the instance leaves it open.
    pub fn reused(page: Arc<dyn Page>) -> Self {
        Self {
            page,
            release: Release::Keep,
        }
    }

    /// A page owned by the job, closed on release.
    pub fn owned_page(page: Arc<dyn Page>) -> Self {
        Self {
            release: Release::Page(page.clone()),
            page,
        }
    }

    /// A page inside a context owned by the job; the context is disposed on release.
    pub fn in_context(
        page: Arc<dyn Page>,
        context: Arc<dyn BrowserContext>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            page,
            release: Release::Context { context, timeout },
        }
    }

    pub fn page(&self) -> Arc<dyn Page> {
        self.page.clone()
    }

    /// Tear down whatever the job owned.
    pub async fn close(self) -> anyhow::Result<()> {
        match self.release {
            Release::Keep => Ok(()),
            Release::Page(page) => page.close().await,
            Release::Context { context, timeout } => {
                bounded(timeout, "closing browser context", context.close()).await
            }
        }
    }
}

/// Run `fut`, failing with a descriptive error when `limit` elapses first.
pub(crate) async fn bounded<T, F>(limit: Option<Duration>, what: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("Timed out after {}ms {what}", limit.as_millis()),
        },
        None => fut.await,
    }
}

/// Build the built-in backend for `model`.
pub fn backend_for(
    model: ConcurrencyModel,
    engine: Arc<dyn Engine>,
    options: LaunchOptions,
) -> Arc<dyn ConcurrencyBackend> {
    match model {
        ConcurrencyModel::Page => Arc::new(PageBackend::new(engine, options)),
        ConcurrencyModel::Context => Arc::new(ContextBackend::new(engine, options)),
        ConcurrencyModel::Browser => Arc::new(BrowserBackend::new(engine, options)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEngine;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: anyhow::Result<()> = bounded(
            Some(Duration::from_millis(10)),
            "creating page",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        let err = result.unwrap_err().to_string();
        assert_eq!(err, "Timed out after 10ms creating page");
    }

    #[tokio::test]
    async fn test_owned_page_closed_on_release() {
        let engine = MemoryEngine::new();
        let browser = engine.launch(&LaunchOptions::default()).await.unwrap();
        let page = browser.new_page().await.unwrap();
        assert_eq!(engine.open_pages(), 1);

        let instance = JobInstance::owned_page(page);
        instance.close().await.unwrap();
        assert_eq!(engine.open_pages(), 0);
    }

    #[tokio::test]
    async fn test_backend_for_each_model() {
        let engine = MemoryEngine::new();
        for model in [
            ConcurrencyModel::Page,
            ConcurrencyModel::Context,
            ConcurrencyModel::Browser,
        ] {
            let backend = backend_for(model, Arc::new(engine.clone()), LaunchOptions::default());
            backend.init().await.unwrap();
            let worker = backend.worker_instance(None).await.unwrap();
            let instance = worker.job_instance().await.unwrap();
            instance.page().goto("https://example.com").await.unwrap();
            instance.close().await.unwrap();
            worker.close().await.unwrap();
            backend.close().await.unwrap();
        }
        assert_eq!(engine.open_browsers(), 0);
        assert_eq!(engine.open_contexts(), 0);
    }
}
