//! `rusty-cluster crawl`: load every URL and print its title.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use rusty_cluster::{Cluster, ClusterEvent, ClusterOptions, ConcurrencyModel, Engine, MemoryEngine};
use rusty_cluster_core::LaunchOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineKind {
    Chromium,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelArg {
    Page,
    Context,
    Browser,
}

impl From<ModelArg> for ConcurrencyModel {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Page => Self::Page,
            ModelArg::Context => Self::Context,
            ModelArg::Browser => Self::Browser,
        }
    }
}

/// Command line overrides for the `cluster` config section.
#[derive(Debug, Default, clap::Args)]
pub struct OptionOverrides {
    /// Concurrency model
    #[arg(long, value_enum)]
    pub concurrency: Option<ModelArg>,

    /// Maximum number of workers (0 = unlimited)
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Per-page timeout in milliseconds (0 = none)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub retry_limit: Option<u32>,

    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Load every URL only once
    #[arg(long)]
    pub skip_duplicate_urls: bool,

    /// Minimum spacing between two pages of the same domain, in milliseconds
    #[arg(long)]
    pub same_domain_delay_ms: Option<u64>,

    /// Log progress every 500ms
    #[arg(long)]
    pub monitor: bool,
}

impl OptionOverrides {
    pub fn apply(&self, mut options: ClusterOptions) -> ClusterOptions {
        if let Some(model) = self.concurrency {
            options.concurrency = model.into();
        }
        if let Some(max) = self.max_concurrency {
            options = options.with_max_concurrency(max);
        }
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        if let Some(limit) = self.retry_limit {
            options = options.with_retry_limit(limit);
        }
        if let Some(ms) = self.retry_delay_ms {
            options = options.with_retry_delay(Duration::from_millis(ms));
        }
        if self.skip_duplicate_urls {
            options = options.with_skip_duplicate_urls(true);
        }
        if let Some(ms) = self.same_domain_delay_ms {
            options = options.with_same_domain_delay(Duration::from_millis(ms));
        }
        if self.monitor {
            options = options.with_monitor(true);
        }
        options
    }
}

/// One line of crawl output.
#[derive(Debug, Serialize)]
struct PageRecord<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker: Option<usize>,
}

/// URLs from the command line plus the file (one per line, `#` comments).
pub fn collect_urls(args: &[String], file: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let mut urls: Vec<String> = args.to_vec();
    if let Some(path) = file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading URL list {}", path.display()))?;
        urls.extend(
            raw.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(urls)
}

pub fn engine(kind: EngineKind) -> anyhow::Result<Arc<dyn Engine>> {
    match kind {
        EngineKind::Memory => Ok(Arc::new(MemoryEngine::new())),
        #[cfg(feature = "browser")]
        EngineKind::Chromium => Ok(Arc::new(rusty_cluster_browser::ChromiumEngine::new())),
        #[cfg(not(feature = "browser"))]
        EngineKind::Chromium => {
            anyhow::bail!("the chromium engine needs the `browser` feature; use --engine memory")
        }
    }
}

/// Outcome of a crawl.
#[derive(Debug, Default)]
pub struct CrawlReport {
    pub pages: u64,
    /// URL and last error of every page that failed for good.
    pub failed: Vec<(String, String)>,
}

/// Crawl `urls` and print one JSON line per page.
pub async fn run(
    urls: Vec<String>,
    options: ClusterOptions,
    launch_options: LaunchOptions,
    engine: Arc<dyn Engine>,
) -> anyhow::Result<CrawlReport> {
    if urls.is_empty() {
        anyhow::bail!("no URLs given");
    }
    let retry_limit = options.retry_limit;

    let cluster = Cluster::<String, ()>::builder(options)
        .with_engine(engine)
        .with_launch_options(launch_options)
        .with_task(|ctx| async move {
            let mut page_errors = ctx.page.errors();
            ctx.page.goto(&ctx.data).await?;
            let title = ctx.page.title().await?;
            // A crashed page is reported once its retries are used up, not here.
            if let Ok(message) = page_errors.try_recv() {
                anyhow::bail!("Page error: {message}");
            }
            print_record(&PageRecord {
                url: &ctx.data,
                title,
                error: None,
                worker: Some(ctx.worker_id),
            });
            Ok(())
        })
        .launch()
        .await?;

    let events = cluster.subscribe();
    let reporter = tokio::spawn(report_failures(events, retry_limit));

    for url in urls {
        cluster.queue(url)?;
    }
    cluster.idle().await;

    let status = cluster.status();
    cluster.close().await;
    // The reporter drains what is still buffered and ends once the sender is gone.
    drop(cluster);
    let failed = reporter.await?;

    info!(
        pages = status.all_targets,
        errors = status.error_count,
        took = %rusty_cluster::format_duration(status.running_for().as_millis() as f64),
        "Crawl finished"
    );
    Ok(CrawlReport {
        pages: status.all_targets,
        failed,
    })
}

/// Print a record for every job whose retries are used up.
async fn report_failures(
    mut events: broadcast::Receiver<ClusterEvent<String>>,
    retry_limit: u32,
) -> Vec<(String, String)> {
    let mut attempts: HashMap<String, u32> = HashMap::new();
    let mut failed = Vec::new();
    loop {
        match events.recv().await {
            Ok(ClusterEvent::TaskError { error, data }) => {
                let tries = attempts.entry(data.clone()).or_default();
                *tries += 1;
                if *tries <= retry_limit {
                    debug!(url = %data, tries = *tries, error = %error, "Page failed, retrying");
                    continue;
                }
                warn!(url = %data, error = %error, "Page failed");
                print_record(&PageRecord {
                    url: &data,
                    title: None,
                    error: Some(error.to_string()),
                    worker: None,
                });
                failed.push((data, error.to_string()));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Crawl reporter fell behind, some failures were not reported");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    failed
}

fn print_record(record: &PageRecord<'_>) {
    match serde_json::to_string(record) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Unable to serialize page record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_collect_urls_from_args_and_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "https://b.test/\n\n# skipped\n  https://c.test/  ").unwrap();

        let urls = collect_urls(&["https://a.test/".into()], Some(file.path())).unwrap();
        assert_eq!(urls, vec!["https://a.test/", "https://b.test/", "https://c.test/"]);
    }

    #[test]
    fn test_overrides_apply() {
        let overrides = OptionOverrides {
            concurrency: Some(ModelArg::Page),
            max_concurrency: Some(4),
            timeout_ms: Some(0),
            skip_duplicate_urls: true,
            ..Default::default()
        };
        let options = overrides.apply(ClusterOptions::default());
        assert_eq!(options.concurrency, ConcurrencyModel::Page);
        assert_eq!(options.max_concurrency, 4);
        assert_eq!(options.timeout(), None);
        assert!(options.skip_duplicate_urls);
        assert_eq!(options.retry_limit, 0);
    }

    #[tokio::test]
    async fn test_crawl_with_memory_engine() {
        let options = ClusterOptions::new(ConcurrencyModel::Context).with_max_concurrency(2);
        let report = run(
            vec!["https://a.test/".into(), "https://b.test/".into()],
            options,
            LaunchOptions::default(),
            engine(EngineKind::Memory).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(report.pages, 2);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_crawl_reports_each_failed_page_once() {
        let memory = MemoryEngine::new();
        memory.crash_on("https://crash.test/");
        let options = ClusterOptions::new(ConcurrencyModel::Context).with_retry_limit(2);

        let report = run(
            vec!["https://crash.test/".into(), "https://ok.test/".into()],
            options,
            LaunchOptions::default(),
            Arc::new(memory),
        )
        .await
        .unwrap();

        assert_eq!(report.pages, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "https://crash.test/");
        assert!(report.failed[0].1.contains("crashed"));
    }

    #[tokio::test]
    async fn test_crawl_requires_urls() {
        let result = run(
            Vec::new(),
            ClusterOptions::default(),
            LaunchOptions::default(),
            engine(EngineKind::Memory).unwrap(),
        )
        .await;
        assert!(result.is_err());
    }
}
