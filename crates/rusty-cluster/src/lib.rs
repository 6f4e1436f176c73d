//! Rusty Cluster: a bounded pool of browser workers.
//!
//! Jobs are queued with [`Cluster::queue`] (fire and forget, retried) or
//! [`Cluster::execute`] (request/response, never retried). The cluster grows
//! its pool up to `max_concurrency` workers, skips duplicate URLs, spaces out
//! requests to the same domain and times out stuck tasks.
//!
//! ```no_run
//! # async fn run() -> rusty_cluster::Result<()> {
//! use std::sync::Arc;
//! use rusty_cluster::{Cluster, ClusterOptions, ConcurrencyModel, MemoryEngine};
//!
//! let options = ClusterOptions::new(ConcurrencyModel::Context).with_max_concurrency(2);
//! let cluster: Cluster<String, String> =
//!     Cluster::launch(options, Arc::new(MemoryEngine::new())).await?;
//! cluster.task(|ctx| async move {
//!     ctx.page.goto(&ctx.data).await?;
//!     Ok(ctx.page.title().await?.unwrap_or_default())
//! });
//! let title = cluster.execute("https://example.com".to_string()).await?;
//! cluster.close().await;
//! # Ok(()) }
//! ```

pub mod cluster;
pub mod events;
pub mod job;
pub mod metrics;
pub mod options;
pub mod queue;
pub mod status;
mod worker;

pub use cluster::{Cluster, ClusterBuilder};
pub use events::ClusterEvent;
pub use job::{JobData, TaskContext, TaskFn, task_fn};
pub use options::{ClusterOptions, Concurrency};
pub use status::{ClusterStatus, WorkerState, WorkerStatus, format_duration};

pub use rusty_cluster_browser::{
    Browser, ConcurrencyBackend, Engine, JobInstance, MemoryEngine, Page, WorkerResource,
};
pub use rusty_cluster_core::{ClusterError, ConcurrencyModel, JobError, LaunchOptions, Result};
