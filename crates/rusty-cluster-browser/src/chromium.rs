//! Chrome/Chromium engine over the DevTools protocol (chromiumoxide).

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::inspector::EventTargetCrashed;
use chromiumoxide::cdp::browser_protocol::target::{
    BrowserContextId, CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{BrowserConfig, Handler};
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rusty_cluster_core::LaunchOptions;

use crate::engine::{Browser, BrowserContext, Engine, Page};

/// Launches local Chrome/Chromium processes.
#[derive(Debug, Clone, Default)]
pub struct ChromiumEngine;

impl ChromiumEngine {
    pub fn new() -> Self {
        Self
    }
}

fn browser_config(options: &LaunchOptions) -> anyhow::Result<BrowserConfig> {
    let mut builder = BrowserConfig::builder().launch_timeout(options.launch_timeout());
    if !options.headless {
        builder = builder.with_head();
    }
    if let Some(path) = &options.chrome_path {
        builder = builder.chrome_executable(path);
    }
    if let (Some(width), Some(height)) = (options.window_width, options.window_height) {
        builder = builder.window_size(width, height);
    }
    if let Some(dir) = &options.user_data_dir {
        builder = builder.user_data_dir(dir);
    }
    if !options.args.is_empty() {
        builder = builder.args(options.args.iter().map(String::as_str));
    }
    builder.build().map_err(anyhow::Error::msg)
}

/// Drive the CDP connection until the browser goes away.
fn spawn_handler(mut handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!(error = %e, "CDP handler stopped");
                break;
            }
        }
    })
}

#[async_trait]
impl Engine for ChromiumEngine {
    fn name(&self) -> &str {
        "chromium"
    }

    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<Arc<dyn Browser>> {
        let config = browser_config(options)?;
        let (browser, handler) = chromiumoxide::Browser::launch(config).await?;
        info!(headless = options.headless, "Chromium launched");
        Ok(Arc::new(ChromiumBrowser {
            inner: Arc::new(Mutex::new(browser)),
            handler: spawn_handler(handler),
        }))
    }
}

struct ChromiumBrowser {
    inner: Arc<Mutex<chromiumoxide::Browser>>,
    handler: JoinHandle<()>,
}

async fn open_page(
    browser: &Mutex<chromiumoxide::Browser>,
    context: Option<BrowserContextId>,
) -> anyhow::Result<Arc<dyn Page>> {
    let mut params = CreateTargetParams::builder().url("about:blank");
    if let Some(id) = context {
        params = params.browser_context_id(id);
    }
    let params = params.build().map_err(anyhow::Error::msg)?;
    let page = browser.lock().await.new_page(params).await?;
    Ok(Arc::new(ChromiumPage::watch(page).await?))
}

#[async_trait]
impl Browser for ChromiumBrowser {
    async fn new_page(&self) -> anyhow::Result<Arc<dyn Page>> {
        open_page(&self.inner, None).await
    }

    async fn new_context(&self) -> anyhow::Result<Arc<dyn BrowserContext>> {
        let id = self
            .inner
            .lock()
            .await
            .create_browser_context(CreateBrowserContextParams::default())
            .await?;
        Ok(Arc::new(ChromiumContext {
            browser: self.inner.clone(),
            id,
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        let mut browser = self.inner.lock().await;
        let result = browser.close().await;
        if let Err(e) = browser.wait().await {
            warn!(error = %e, "Chromium process did not exit cleanly");
        }
        self.handler.abort();
        result?;
        Ok(())
    }
}

struct ChromiumContext {
    browser: Arc<Mutex<chromiumoxide::Browser>>,
    id: BrowserContextId,
}

#[async_trait]
impl BrowserContext for ChromiumContext {
    async fn new_page(&self) -> anyhow::Result<Arc<dyn Page>> {
        open_page(&self.browser, Some(self.id.clone())).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.browser
            .lock()
            .await
            .dispose_browser_context(self.id.clone())
            .await?;
        Ok(())
    }
}

struct ChromiumPage {
    page: chromiumoxide::Page,
    errors: broadcast::Sender<String>,
    crash_listener: JoinHandle<()>,
}

impl ChromiumPage {
    /// Wrap `page` and forward renderer crashes to the error channel.
    async fn watch(page: chromiumoxide::Page) -> anyhow::Result<Self> {
        let (errors, _) = broadcast::channel(8);
        let mut crashes = page.event_listener::<EventTargetCrashed>().await?;
        let tx = errors.clone();
        let crash_listener = tokio::spawn(async move {
            while crashes.next().await.is_some() {
                let _ = tx.send("Page crashed!".to_string());
            }
        });
        Ok(Self {
            page,
            errors,
            crash_listener,
        })
    }
}

#[async_trait]
impl Page for ChromiumPage {
    async fn goto(&self, url: &str) -> anyhow::Result<()> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn url(&self) -> anyhow::Result<Option<String>> {
        Ok(self.page.url().await?)
    }

    async fn title(&self) -> anyhow::Result<Option<String>> {
        Ok(self.page.get_title().await?)
    }

    async fn content(&self) -> anyhow::Result<String> {
        Ok(self.page.content().await?)
    }

    async fn evaluate(&self, expression: &str) -> anyhow::Result<serde_json::Value> {
        let result = self.page.evaluate(expression).await?;
        Ok(result.into_value()?)
    }

    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self
            .page
            .screenshot(ScreenshotParams::builder().build())
            .await?)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.crash_listener.abort();
        self.page.clone().close().await?;
        Ok(())
    }

    fn errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_config_from_options() {
        // An explicit path skips executable detection.
        let options = LaunchOptions::default()
            .with_chrome_path("/usr/bin/chromium")
            .with_window_size(1024, 768)
            .with_arg("--no-sandbox");
        assert!(browser_config(&options).is_ok());
    }

    #[tokio::test]
    #[ignore = "requires Chrome/Chromium installed"]
    async fn test_launch_and_title() {
        let engine = ChromiumEngine::new();
        let browser = engine.launch(&LaunchOptions::default()).await.unwrap();
        let page = browser.new_page().await.unwrap();
        page.goto("about:blank").await.unwrap();
        assert!(page.title().await.unwrap().is_some());
        page.close().await.unwrap();
        browser.close().await.unwrap();
    }
}
