use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::warn;

use rusty_cluster_core::LaunchOptions;

use super::shared::SharedBrowser;
use super::{ConcurrencyBackend, JobInstance, WorkerResource};
use crate::engine::Engine;

/// One shared browser; every job runs in a fresh incognito context.
pub struct ContextBackend {
    shared: Arc<SharedBrowser>,
}

impl ContextBackend {
    pub fn new(engine: Arc<dyn Engine>, options: LaunchOptions) -> Self {
        Self {
            shared: Arc::new(SharedBrowser::new(engine, options)),
        }
    }
}

#[async_trait]
impl ConcurrencyBackend for ContextBackend {
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
        let (generation, _) = self.shared.get().await?;
        Ok(Box::new(ContextWorker {
            shared: self.shared.clone(),
            generation: AtomicU64::new(generation),
        }))
    }
}

struct ContextWorker {
    shared: Arc<SharedBrowser>,
    /// Browser generation of the last context this worker opened.
    generation: AtomicU64,
}

#[async_trait]
impl WorkerResource for ContextWorker {
    async fn job_instance(&self) -> anyhow::Result<JobInstance> {
        let (generation, browser) = self.shared.get().await?;
        self.generation.store(generation, Ordering::SeqCst);

        let context = browser.new_context().await?;
        match context.new_page().await {
            Ok(page) => Ok(JobInstance::in_context(page, context, None)),
            Err(e) => {
                let _ = context.close().await;
                Err(e)
            }
        }
    }

    async fn repair(&self) {
        let seen = self.generation.load(Ordering::SeqCst);
        if let Err(e) = self.shared.relaunch(seen).await {
            warn!(error = %e, "Unable to restart shared browser");
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
