//! Engine abstraction over a browser automation library.
//!
//! The scheduler never talks to a CDP client directly; it only sees these
//! traits, so tests and dry runs can swap in the [`MemoryEngine`](crate::MemoryEngine).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use rusty_cluster_core::LaunchOptions;

/// Launches browser processes.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Short engine name for logs (e.g. "chromium", "memory").
    fn name(&self) -> &str;

    /// Launch a new browser process.
    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<Arc<dyn Browser>>;
}

/// A running browser process.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a page in the default (shared) browsing context.
    async fn new_page(&self) -> anyhow::Result<Arc<dyn Page>>;

    /// Create an isolated (incognito) browsing context.
    async fn new_context(&self) -> anyhow::Result<Arc<dyn BrowserContext>>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// An isolated browsing context: its own cookies, cache and storage.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> anyhow::Result<Arc<dyn Page>>;

    /// Close the context and every page in it.
    async fn close(&self) -> anyhow::Result<()>;
}

/// A single tab. This is the execution surface handed to task functions.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str) -> anyhow::Result<()>;

    async fn url(&self) -> anyhow::Result<Option<String>>;

    async fn title(&self) -> anyhow::Result<Option<String>>;

    /// Serialized HTML of the current document.
    async fn content(&self) -> anyhow::Result<String>;

    /// Evaluate a JavaScript expression and return its JSON value.
    async fn evaluate(&self, expression: &str) -> anyhow::Result<serde_json::Value>;

    /// PNG screenshot of the viewport.
    async fn screenshot(&self) -> anyhow::Result<Vec<u8>>;

    async fn close(&self) -> anyhow::Result<()>;

    /// Subscribe to asynchronous page errors (e.g. the renderer crashed).
    ///
    /// Errors sent here fail the running job even if the task itself returns.
    fn errors(&self) -> broadcast::Receiver<String>;
}
