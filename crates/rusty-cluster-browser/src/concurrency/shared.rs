//! One browser shared by every worker of a page or context backend.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use rusty_cluster_core::LaunchOptions;

use crate::engine::{Browser, Engine};

struct Current {
    generation: u64,
    browser: Arc<dyn Browser>,
}

/// Shared browser handle with collapsing relaunch.
///
/// Every launch bumps a generation counter. Workers remember the generation
/// they got their pages from; a repair request carrying an old generation is
/// a no-op because someone else already relaunched.
pub(crate) struct SharedBrowser {
    engine: Arc<dyn Engine>,
    options: LaunchOptions,
    current: Mutex<Option<Current>>,
}

impl SharedBrowser {
    pub(crate) fn new(engine: Arc<dyn Engine>, options: LaunchOptions) -> Self {
        Self {
            engine,
            options,
            current: Mutex::new(None),
        }
    }

    pub(crate) async fn launch(&self) -> anyhow::Result<()> {
        let mut current = self.current.lock().await;
        let browser = self.engine.launch(&self.options).await?;
        let generation = current.as_ref().map_or(1, |c| c.generation + 1);
        info!(engine = self.engine.name(), generation, "Shared browser launched");
        *current = Some(Current {
            generation,
            browser,
        });
        Ok(())
    }

    /// The current browser and its generation.
    pub(crate) async fn get(&self) -> anyhow::Result<(u64, Arc<dyn Browser>)> {
        match self.current.lock().await.as_ref() {
            Some(c) => Ok((c.generation, c.browser.clone())),
            None => anyhow::bail!("Shared browser is not running"),
        }
    }

    /// Relaunch the browser unless it was already relaunched after `seen`.
    pub(crate) async fn relaunch(&self, seen: u64) -> anyhow::Result<()> {
        let mut current = self.current.lock().await;
        let generation = match current.as_ref() {
            Some(c) if c.generation != seen => return Ok(()),
            Some(c) => {
                if let Err(e) = c.browser.close().await {
                    warn!(error = %e, "Closing broken shared browser failed");
                }
                c.generation
            }
            None => 0,
        };
        let browser = self.engine.launch(&self.options).await?;
        warn!(generation = generation + 1, "Shared browser relaunched");
        *current = Some(Current {
            generation: generation + 1,
            browser,
        });
        Ok(())
    }

    pub(crate) async fn close(&self) -> anyhow::Result<()> {
        match self.current.lock().await.take() {
            Some(c) => c.browser.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEngine;

    #[tokio::test]
    async fn test_stale_repairs_collapse() {
        let engine = MemoryEngine::new();
        let shared = SharedBrowser::new(Arc::new(engine.clone()), LaunchOptions::default());
        shared.launch().await.unwrap();
        let (seen, _) = shared.get().await.unwrap();

        shared.relaunch(seen).await.unwrap();
        shared.relaunch(seen).await.unwrap();
        shared.relaunch(seen).await.unwrap();

        assert_eq!(engine.launches(), 2);
        assert_eq!(engine.open_browsers(), 1);
        let (generation, _) = shared.get().await.unwrap();
        assert_eq!(generation, seen + 1);
    }

    #[tokio::test]
    async fn test_get_before_launch_fails() {
        let engine = MemoryEngine::new();
        let shared = SharedBrowser::new(Arc::new(engine), LaunchOptions::default());
        assert!(shared.get().await.is_err());
        shared.close().await.unwrap();
    }
}
