//! In-memory engine: a scriptable stand-in for a real browser.
//!
//! Pages "load" any URL instantly and report a title derived from it. Failures
//! (launch, page creation, release, renderer crash) can be injected to drive
//! the repair and retry paths without Chrome installed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use rusty_cluster_core::LaunchOptions;

use crate::engine::{Browser, BrowserContext, Engine, Page};

/// Engine whose browsers live entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<EngineState>,
}

#[derive(Default)]
struct EngineState {
    launches: AtomicUsize,
    refused_launches: AtomicUsize,
    browsers_open: AtomicUsize,
    contexts_open: AtomicUsize,
    pages_open: AtomicUsize,
    fail_launches: AtomicBool,
    page_failures: AtomicU32,
    release_failures: AtomicU32,
    crash_urls: Mutex<HashSet<String>>,
    titles: Mutex<HashMap<String, String>>,
    launched_with: Mutex<Vec<LaunchOptions>>,
    /// Closed flags of every launched browser, for `disconnect_browsers`.
    browser_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Consume one injected failure, if any are left.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following launch fail (or succeed again).
    pub fn fail_launches(&self, fail: bool) {
        self.state.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` page creations fail.
    pub fn fail_next_pages(&self, n: u32) {
        self.state.page_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` page/context releases fail.
    pub fn fail_next_releases(&self, n: u32) {
        self.state.release_failures.store(n, Ordering::SeqCst);
    }

    /// Emit a page error whenever a page navigates to `url`.
    pub fn crash_on(&self, url: impl Into<String>) {
        self.state.crash_urls.lock().unwrap().insert(url.into());
    }

    /// Kill every browser launched so far, as if the processes died.
    ///
    /// Their pages and contexts fail from now on; later launches are unaffected.
    pub fn disconnect_browsers(&self) {
        let flags = std::mem::take(&mut *self.state.browser_flags.lock().unwrap());
        for closed in flags {
            if !closed.swap(true, Ordering::SeqCst) {
                self.state.browsers_open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Title reported for `url` (defaults to "Title of <url>").
    pub fn set_title(&self, url: impl Into<String>, title: impl Into<String>) {
        self.state
            .titles
            .lock()
            .unwrap()
            .insert(url.into(), title.into());
    }

    /// Number of successful browser launches so far.
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Number of launches refused by [`fail_launches`](Self::fail_launches).
    pub fn refused_launches(&self) -> usize {
        self.state.refused_launches.load(Ordering::SeqCst)
    }

    /// Launch options of every successful launch, in order.
    pub fn launched_with(&self) -> Vec<LaunchOptions> {
        self.state.launched_with.lock().unwrap().clone()
    }

    pub fn open_browsers(&self) -> usize {
        self.state.browsers_open.load(Ordering::SeqCst)
    }

    pub fn open_contexts(&self) -> usize {
        self.state.contexts_open.load(Ordering::SeqCst)
    }

    pub fn open_pages(&self) -> usize {
        self.state.pages_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<Arc<dyn Browser>> {
        if self.state.fail_launches.load(Ordering::SeqCst) {
            self.state.refused_launches.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("Failed to launch the browser process");
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        self.state.browsers_open.fetch_add(1, Ordering::SeqCst);
        self.state
            .launched_with
            .lock()
            .unwrap()
            .push(options.clone());
        debug!(launches = self.launches(), "Memory browser launched");
        let closed = Arc::new(AtomicBool::new(false));
        self.state
            .browser_flags
            .lock()
            .unwrap()
            .push(closed.clone());
        Ok(Arc::new(MemoryBrowser {
            state: self.state.clone(),
            closed,
        }))
    }
}

struct MemoryBrowser {
    state: Arc<EngineState>,
    closed: Arc<AtomicBool>,
}

impl MemoryBrowser {
    fn open_page(&self) -> anyhow::Result<Arc<dyn Page>> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("Browser has been closed");
        }
        if take_failure(&self.state.page_failures) {
            anyhow::bail!("Target closed while creating page");
        }
        self.state.pages_open.fetch_add(1, Ordering::SeqCst);
        let (errors, _) = broadcast::channel(8);
        Ok(Arc::new(MemoryPage {
            state: self.state.clone(),
            browser_closed: self.closed.clone(),
            url: Mutex::new(None),
            closed: AtomicBool::new(false),
            errors,
        }))
    }
}

#[async_trait]
impl Browser for MemoryBrowser {
    async fn new_page(&self) -> anyhow::Result<Arc<dyn Page>> {
        self.open_page()
    }

    async fn new_context(&self) -> anyhow::Result<Arc<dyn BrowserContext>> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("Browser has been closed");
        }
        self.state.contexts_open.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryContext {
            browser: MemoryBrowser {
                state: self.state.clone(),
                closed: self.closed.clone(),
            },
            pages: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Browser already closed");
        }
        self.state.browsers_open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryContext {
    browser: MemoryBrowser,
    pages: Mutex<Vec<Arc<dyn Page>>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrowserContext for MemoryContext {
    async fn new_page(&self) -> anyhow::Result<Arc<dyn Page>> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("Browser context has been closed");
        }
        let page = self.browser.open_page()?;
        self.pages.lock().unwrap().push(page.clone());
        Ok(page)
    }

    async fn close(&self) -> anyhow::Result<()> {
        if take_failure(&self.browser.state.release_failures) {
            anyhow::bail!("Failed to dispose browser context");
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pages = std::mem::take(&mut *self.pages.lock().unwrap());
        for page in pages {
            let _ = page.close().await;
        }
        self.browser.state.contexts_open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryPage {
    state: Arc<EngineState>,
    browser_closed: Arc<AtomicBool>,
    url: Mutex<Option<String>>,
    closed: AtomicBool,
    errors: broadcast::Sender<String>,
}

impl MemoryPage {
    fn ensure_usable(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("Page has been closed");
        }
        if self.browser_closed.load(Ordering::SeqCst) {
            anyhow::bail!("Browser has disconnected");
        }
        Ok(())
    }

    fn current_title(&self) -> Option<String> {
        let url = self.url.lock().unwrap().clone()?;
        let titles = self.state.titles.lock().unwrap();
        Some(
            titles
                .get(&url)
                .cloned()
                .unwrap_or_else(|| format!("Title of {url}")),
        )
    }
}

#[async_trait]
impl Page for MemoryPage {
    async fn goto(&self, url: &str) -> anyhow::Result<()> {
        self.ensure_usable()?;
        *self.url.lock().unwrap() = Some(url.to_string());
        if self.state.crash_urls.lock().unwrap().contains(url) {
            let _ = self.errors.send(format!("Page crashed while loading {url}"));
        }
        Ok(())
    }

    async fn url(&self) -> anyhow::Result<Option<String>> {
        self.ensure_usable()?;
        Ok(self.url.lock().unwrap().clone())
    }

    async fn title(&self) -> anyhow::Result<Option<String>> {
        self.ensure_usable()?;
        Ok(self.current_title())
    }

    async fn content(&self) -> anyhow::Result<String> {
        self.ensure_usable()?;
        let title = self.current_title().unwrap_or_default();
        Ok(format!(
            "<html><head><title>{title}</title></head><body></body></html>"
        ))
    }

    async fn evaluate(&self, expression: &str) -> anyhow::Result<serde_json::Value> {
        self.ensure_usable()?;
        match expression.trim() {
            "document.title" => Ok(self.current_title().into()),
            "location.href" | "window.location.href" => Ok(self.url.lock().unwrap().clone().into()),
            _ => Ok(serde_json::Value::Null),
        }
    }

    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        self.ensure_usable()?;
        // PNG signature only; enough for callers that check the format.
        Ok(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])
    }

    async fn close(&self) -> anyhow::Result<()> {
        if take_failure(&self.state.release_failures) {
            anyhow::bail!("Failed to close page");
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.pages_open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }
}
