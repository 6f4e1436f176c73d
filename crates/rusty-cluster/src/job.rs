//! Jobs, job payloads and task functions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;

use rusty_cluster_browser::Page;
use rusty_cluster_core::JobError;

/// Payload carried by a job.
///
/// The keys drive duplicate skipping (`identity_key`) and same-domain rate
/// limiting (`group_key`). Payloads without a URL simply return `None`.
pub trait JobData: Clone + Send + Sync + 'static {
    fn identity_key(&self) -> Option<String> {
        None
    }

    fn group_key(&self) -> Option<String> {
        None
    }
}

/// Normalized form of `raw`, or `raw` itself when it does not parse as a URL.
fn normalize_url(raw: &str) -> String {
    url::Url::parse(raw)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

fn url_host(raw: &str) -> Option<String> {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

impl JobData for String {
    fn identity_key(&self) -> Option<String> {
        Some(normalize_url(self))
    }

    fn group_key(&self) -> Option<String> {
        url_host(self)
    }
}

impl JobData for &'static str {
    fn identity_key(&self) -> Option<String> {
        Some(normalize_url(self))
    }

    fn group_key(&self) -> Option<String> {
        url_host(self)
    }
}

/// A JSON string is taken as a URL; a JSON object may carry one under `url`.
impl JobData for serde_json::Value {
    fn identity_key(&self) -> Option<String> {
        json_url(self).map(normalize_url)
    }

    fn group_key(&self) -> Option<String> {
        json_url(self).and_then(url_host)
    }
}

fn json_url(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Object(map) => map.get("url").and_then(|v| v.as_str()),
        _ => None,
    }
}

/// Everything a task function gets to work with.
pub struct TaskContext<D> {
    pub page: Arc<dyn Page>,
    pub data: D,
    /// Id of the worker running the task.
    pub worker_id: usize,
}

pub type TaskFuture<R> = Pin<Box<dyn Future<Output = anyhow::Result<R>> + Send>>;

/// A task function, shared between the cluster and its workers.
pub type TaskFn<D, R> = Arc<dyn Fn(TaskContext<D>) -> TaskFuture<R> + Send + Sync>;

/// Box an async closure into a [`TaskFn`].
pub fn task_fn<D, R, F, Fut>(f: F) -> TaskFn<D, R>
where
    F: Fn(TaskContext<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

pub(crate) type Callback<R> = oneshot::Sender<Result<R, JobError>>;

/// One unit of work moving through the queue.
pub(crate) struct Job<D, R> {
    pub data: D,
    pub task: Option<TaskFn<D, R>>,
    /// Set for `execute` jobs; such jobs settle once and never retry.
    pub callback: Option<Callback<R>>,
    pub tries: u32,
    pub errors: Vec<JobError>,
}

impl<D: JobData, R> Job<D, R> {
    pub fn new(data: D, task: Option<TaskFn<D, R>>, callback: Option<Callback<R>>) -> Self {
        Self {
            data,
            task,
            callback,
            tries: 0,
            errors: Vec::new(),
        }
    }

    pub fn identity_key(&self) -> Option<String> {
        self.data.identity_key()
    }

    pub fn group_key(&self) -> Option<String> {
        self.data.group_key()
    }

    /// Record a failed attempt.
    pub fn add_error(&mut self, error: JobError) {
        self.tries += 1;
        self.errors.push(error);
    }

    pub fn last_error(&self) -> Option<&JobError> {
        self.errors.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_keys() {
        let data = "https://Example.com/path?q=1".to_string();
        assert_eq!(
            data.identity_key().as_deref(),
            Some("https://example.com/path?q=1")
        );
        assert_eq!(data.group_key().as_deref(), Some("example.com"));
    }

    #[test]
    fn test_unparseable_url_has_identity_but_no_group() {
        let data = "not a url";
        assert_eq!(data.identity_key().as_deref(), Some("not a url"));
        assert_eq!(data.group_key(), None);
    }

    #[test]
    fn test_json_keys() {
        let obj = json!({ "url": "https://a.test/x", "depth": 2 });
        assert_eq!(obj.group_key().as_deref(), Some("a.test"));
        assert_eq!(obj.identity_key().as_deref(), Some("https://a.test/x"));

        let s = json!("https://b.test/");
        assert_eq!(s.group_key().as_deref(), Some("b.test"));

        let n = json!(42);
        assert_eq!(n.identity_key(), None);
        assert_eq!(n.group_key(), None);
    }

    #[test]
    fn test_job_error_history() {
        let mut job: Job<String, ()> = Job::new("https://a.test/".into(), None, None);
        assert_eq!(job.tries, 0);
        assert!(job.last_error().is_none());

        job.add_error(JobError::Task("first".into()));
        job.add_error(JobError::Page("second".into()));
        assert_eq!(job.tries, 2);
        assert_eq!(job.errors.len(), 2);
        assert_eq!(job.last_error(), Some(&JobError::Page("second".into())));
    }
}
