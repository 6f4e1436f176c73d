//! The scheduler: owns the queue and the workers and decides what runs where.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rusty_cluster_browser::{ConcurrencyBackend, Engine, backend_for};
use rusty_cluster_core::{ClusterError, ClusterOptions, JobError, LaunchOptions, Result};

use crate::events::ClusterEvent;
use crate::job::{Job, JobData, TaskContext, TaskFn, task_fn};
use crate::metrics;
use crate::options::Concurrency;
use crate::queue::{JobQueue, Shift};
use crate::status::{self, ClusterStatus, WorkerState, WorkerStatus};
use crate::worker::Worker;

/// Minimum spacing between two dispatch attempts.
const WORK_CALL_INTERVAL: Duration = Duration::from_millis(10);
/// Background work check, so freed resources and elapsed delays are noticed.
const CHECK_FOR_WORK_INTERVAL: Duration = Duration::from_millis(100);
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 1024;

struct State<D, R> {
    queue: JobQueue<Job<D, R>>,
    default_task: Option<TaskFn<D, R>>,

    /// Every admitted worker, in admission order.
    workers: Vec<Arc<Worker>>,
    available: VecDeque<Arc<Worker>>,
    busy: Vec<Arc<Worker>>,
    starting: usize,
    next_worker_id: usize,
    last_launch: Option<Instant>,
    per_worker_options: VecDeque<LaunchOptions>,

    all_targets: u64,
    error_count: u64,
    seen_keys: HashSet<String>,
    last_domain_access: HashMap<String, Instant>,

    idle_waiters: Vec<oneshot::Sender<()>>,
    one_waiters: Vec<oneshot::Sender<D>>,

    next_work_call: Instant,
    work_pending: bool,
    closed: bool,
}

struct Inner<D, R> {
    options: ClusterOptions,
    backend: Arc<dyn ConcurrencyBackend>,
    state: Mutex<State<D, R>>,
    events: broadcast::Sender<ClusterEvent<D>>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// What `do_work` decided to do once the state lock is released.
enum Step<D, R> {
    Done,
    Again,
    Grow(Option<LaunchOptions>),
    Run {
        job: Job<D, R>,
        worker: Arc<Worker>,
        task: Option<TaskFn<D, R>>,
        more_capacity: bool,
    },
}

/// Configures and launches a [`Cluster`].
pub struct ClusterBuilder<D, R> {
    options: ClusterOptions,
    concurrency: Concurrency,
    engine: Option<Arc<dyn Engine>>,
    launch_options: LaunchOptions,
    task: Option<TaskFn<D, R>>,
}

impl<D: JobData, R: Send + 'static> ClusterBuilder<D, R> {
    pub fn new(options: ClusterOptions) -> Self {
        Self {
            concurrency: options.concurrency.into(),
            options,
            engine: None,
            launch_options: LaunchOptions::default(),
            task: None,
        }
    }

    /// Override the backend, e.g. with a custom [`ConcurrencyBackend`].
    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        if let Some(model) = concurrency.model() {
            self.options.concurrency = model;
        }
        self.concurrency = concurrency;
        self
    }

    /// How browsers are obtained. Defaults to Chromium with the `browser` feature.
    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Default launch options for every browser.
    pub fn with_launch_options(mut self, options: LaunchOptions) -> Self {
        self.launch_options = options;
        self
    }

    /// Default task function.
    pub fn with_task<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.task = Some(task_fn(f));
        self
    }

    fn default_engine() -> Result<Arc<dyn Engine>> {
        #[cfg(feature = "browser")]
        {
            Ok(Arc::new(rusty_cluster_browser::ChromiumEngine::new()))
        }
        #[cfg(not(feature = "browser"))]
        {
            Err(ClusterError::Launch(
                "no browser engine configured (enable the `browser` feature or set one)".into(),
            ))
        }
    }

    /// Create the backend, initialize it and start the background loops.
    pub async fn launch(self) -> Result<Cluster<D, R>> {
        let options = self.options;
        let backend = match self.concurrency {
            Concurrency::Custom(backend) => backend,
            built_in => {
                let engine = match self.engine {
                    Some(engine) => engine,
                    None => Self::default_engine()?,
                };
                let model = built_in.model().unwrap_or(options.concurrency);
                backend_for(model, engine, self.launch_options)
            }
        };

        if let Some(reason) = options.per_worker_options_warning() {
            warn!(entries = options.per_worker_options.len(), "{reason}");
        }
        let per_worker_options = if options.uses_per_worker_options() {
            options.per_worker_options.iter().cloned().collect()
        } else {
            VecDeque::new()
        };

        if let Err(e) = backend.init().await {
            error!(error = %e, "Unable to launch browser");
            return Err(ClusterError::Launch(format!("{e:#}")));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            backend,
            state: Mutex::new(State {
                queue: JobQueue::new(),
                default_task: self.task,
                workers: Vec::new(),
                available: VecDeque::new(),
                busy: Vec::new(),
                starting: 0,
                next_worker_id: 0,
                last_launch: None,
                per_worker_options,
                all_targets: 0,
                error_count: 0,
                seen_keys: HashSet::new(),
                last_domain_access: HashMap::new(),
                idle_waiters: Vec::new(),
                one_waiters: Vec::new(),
                next_work_call: Instant::now(),
                work_pending: false,
                closed: false,
            }),
            events,
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
            options,
        });

        spawn_periodic(&inner, CHECK_FOR_WORK_INTERVAL, |inner| inner.work());
        if inner.options.monitor {
            spawn_periodic(&inner, MONITOR_INTERVAL, |inner| {
                status::log_status(&inner.status())
            });
        }

        info!(
            concurrency = ?inner.options.concurrency,
            max_concurrency = inner.options.max_concurrency,
            "Cluster launched"
        );
        Ok(Cluster { inner })
    }
}

/// Run `tick` every `period` until the cluster closes or is dropped.
fn spawn_periodic<D: JobData, R: Send + 'static>(
    inner: &Arc<Inner<D, R>>,
    period: Duration,
    tick: fn(&Arc<Inner<D, R>>),
) {
    let weak: Weak<Inner<D, R>> = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    tick(&inner);
                }
            }
        }
    });
}

impl<D: JobData, R: Send + 'static> Inner<D, R> {
    fn state(&self) -> MutexGuard<'_, State<D, R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn can_grow(&self, st: &State<D, R>, now: Instant) -> bool {
        let max = self.options.max_concurrency;
        let below_limit = max == 0 || st.workers.len() + st.starting < max;
        let delay = self.options.worker_creation_delay();
        let delay_elapsed = delay.is_zero() || st.last_launch.is_none_or(|at| at + delay <= now);
        below_limit && delay_elapsed
    }

    /// Schedule a dispatch attempt, at most one per [`WORK_CALL_INTERVAL`].
    fn work(self: &Arc<Self>) {
        let delay = {
            let mut st = self.state();
            if st.closed || st.work_pending {
                return;
            }
            let now = Instant::now();
            st.next_work_call = (st.next_work_call + WORK_CALL_INTERVAL).max(now);
            st.work_pending = true;
            st.next_work_call - now
        };

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            inner.state().work_pending = false;
            inner.do_work().await;
        });
    }

    fn plan(&self) -> Step<D, R> {
        let mut st = self.state();
        let now = Instant::now();

        if st.queue.is_empty() {
            if st.busy.is_empty() {
                for waiter in st.idle_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            return Step::Done;
        }

        if st.available.is_empty() {
            if self.can_grow(&st, now) {
                st.starting += 1;
                st.last_launch = Some(now);
                let options = st.per_worker_options.pop_front();
                return Step::Grow(options);
            }
            return Step::Done;
        }

        let job = match st.queue.shift() {
            Shift::Ready(job) => job,
            Shift::Delayed { until } => {
                debug!(in_ms = (until - now).as_millis() as u64, "Next job is delayed");
                return Step::Done;
            }
            Shift::Empty => return Step::Done,
        };

        let identity = job.identity_key();
        let group = job.group_key();

        if self.options.skip_duplicate_urls {
            if let Some(key) = identity.as_ref().filter(|k| st.seen_keys.contains(*k)) {
                debug!(url = %key, "Skipping duplicate");
                if let Some(callback) = job.callback {
                    let _ = callback.send(Err(JobError::Skipped(key.clone())));
                }
                metrics::record_completed("skipped");
                return Step::Again;
            }
        }

        let domain_delay = self.options.same_domain_delay();
        if !domain_delay.is_zero() {
            if let Some(last) = group.as_ref().and_then(|g| st.last_domain_access.get(g)) {
                let not_before = *last + domain_delay;
                if not_before > now {
                    debug!(domain = ?group, "Delaying job for same-domain rate limit");
                    st.queue.push(job, Some(not_before));
                    return Step::Again;
                }
            }
        }

        if self.options.skip_duplicate_urls {
            if let Some(key) = identity {
                st.seen_keys.insert(key);
            }
        }
        if !domain_delay.is_zero() {
            if let Some(group) = group {
                st.last_domain_access.insert(group, now);
            }
        }

        let Some(worker) = st.available.pop_front() else {
            st.queue.push(job, None);
            return Step::Done;
        };
        st.busy.push(worker.clone());
        let more_capacity = !st.available.is_empty() || self.can_grow(&st, now);
        let task = job.task.clone().or_else(|| st.default_task.clone());

        Step::Run {
            job,
            worker,
            task,
            more_capacity,
        }
    }

    async fn do_work(self: Arc<Self>) {
        match self.plan() {
            Step::Done => {}
            Step::Again => self.work(),
            // A failed launch is retried by the periodic work check.
            Step::Grow(options) => {
                if self.launch_worker(options).await {
                    self.work();
                }
            }
            Step::Run {
                job,
                worker,
                task,
                more_capacity,
            } => {
                if more_capacity {
                    self.work();
                }
                self.run_job(job, worker, task).await;
                self.work();
            }
        }
    }

    async fn run_job(&self, mut job: Job<D, R>, worker: Arc<Worker>, task: Option<TaskFn<D, R>>) {
        let started = Instant::now();
        let result = match task {
            Some(task) => {
                worker
                    .handle(task, job.data.clone(), self.options.timeout())
                    .await
            }
            None => Err(JobError::NoTaskFunction),
        };
        metrics::record_attempt(started.elapsed().as_secs_f64());

        let data = job.data.clone();
        let mut st = self.state();
        match result {
            Err(error) => {
                if let Some(callback) = job.callback.take() {
                    let _ = callback.send(Err(error));
                    st.error_count += 1;
                    metrics::record_completed("error");
                } else {
                    job.add_error(error.clone());
                    let _ = self.events.send(ClusterEvent::TaskError {
                        error: error.clone(),
                        data: data.clone(),
                    });
                    if job.tries <= self.options.retry_limit {
                        debug!(worker_id = worker.id, tries = job.tries, error = %error, "Retrying job");
                        let retry_delay = self.options.retry_delay();
                        let not_before =
                            (!retry_delay.is_zero()).then(|| Instant::now() + retry_delay);
                        st.queue.push(job, not_before);
                        metrics::record_retry();
                    } else {
                        warn!(
                            worker_id = worker.id,
                            tries = job.tries,
                            error = %job.last_error().unwrap_or(&error),
                            "Job failed"
                        );
                        st.error_count += 1;
                        metrics::record_completed("error");
                    }
                }
            }
            Ok(value) => {
                if let Some(callback) = job.callback.take() {
                    let _ = callback.send(Ok(value));
                }
                metrics::record_completed("success");
            }
        }

        for waiter in st.one_waiters.drain(..) {
            let _ = waiter.send(data.clone());
        }

        st.busy.retain(|w| !Arc::ptr_eq(w, &worker));
        st.available.push_back(worker);
    }

    /// Launch one worker. Returns whether it joined the pool.
    async fn launch_worker(&self, options: Option<LaunchOptions>) -> bool {
        let resource = match self.backend.worker_instance(options).await {
            Ok(resource) => resource,
            Err(e) => {
                self.state().starting -= 1;
                warn!(error = %e, "Unable to launch browser for worker, will retry");
                return false;
            }
        };

        let rejected = {
            let mut st = self.state();
            st.starting -= 1;
            if st.closed {
                Some(resource)
            } else {
                let id = st.next_worker_id;
                st.next_worker_id += 1;
                let worker = Arc::new(Worker::new(id, resource));
                st.workers.push(worker.clone());
                st.available.push_back(worker);
                metrics::record_worker_started();
                info!(worker_id = id, "Worker started");
                None
            }
        };

        // The cluster closed while this worker was launching.
        match rejected {
            Some(resource) => {
                if let Err(e) = resource.close().await {
                    debug!(error = %e, "Closing late worker failed");
                }
                false
            }
            None => true,
        }
    }

    fn status(&self) -> ClusterStatus {
        let st = self.state();
        let in_progress = (st.queue.size() + st.busy.len()) as u64;
        let workers = st
            .workers
            .iter()
            .map(|w| {
                let busy = st.busy.iter().any(|b| Arc::ptr_eq(b, w));
                WorkerStatus {
                    id: w.id,
                    state: if busy {
                        WorkerState::Working
                    } else {
                        WorkerState::Idle
                    },
                    active_target: if busy { w.active_target() } else { None },
                }
            })
            .collect();
        ClusterStatus {
            started_at: self.started_at,
            now: Utc::now(),
            all_targets: st.all_targets,
            done_targets: st.all_targets.saturating_sub(in_progress),
            error_count: st.error_count,
            queued: st.queue.size(),
            workers,
            starting_workers: st.starting,
            closed: st.closed,
        }
    }
}

/// A bounded pool of browser workers processing queued jobs.
///
/// `D` is the job payload, `R` what task functions return. Cheap to clone;
/// all clones drive the same pool.
pub struct Cluster<D, R> {
    inner: Arc<Inner<D, R>>,
}

impl<D, R> Clone for Cluster<D, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: JobData, R: Send + 'static> Cluster<D, R> {
    pub fn builder(options: ClusterOptions) -> ClusterBuilder<D, R> {
        ClusterBuilder::new(options)
    }

    /// Launch a cluster on `engine` with default launch options.
    pub async fn launch(options: ClusterOptions, engine: Arc<dyn Engine>) -> Result<Self> {
        ClusterBuilder::new(options).with_engine(engine).launch().await
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.inner.options
    }

    /// Set the task function used by jobs queued without their own.
    pub fn task<F, Fut>(&self, f: F)
    where
        F: Fn(TaskContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.inner.state().default_task = Some(task_fn(f));
    }

    fn submit(
        &self,
        data: D,
        task: Option<TaskFn<D, R>>,
        callback: Option<oneshot::Sender<std::result::Result<R, JobError>>>,
    ) -> Result<()> {
        {
            let mut st = self.inner.state();
            if st.closed {
                return Err(ClusterError::Closed);
            }
            if task.is_none() && st.default_task.is_none() {
                return Err(ClusterError::NoTaskFunction);
            }
            st.all_targets += 1;
            st.queue.push(Job::new(data.clone(), task, callback), None);
        }
        metrics::record_queued();
        let _ = self.inner.events.send(ClusterEvent::Queued { data });
        self.inner.work();
        Ok(())
    }

    /// Queue a job for the default task. Failures are retried up to
    /// `retry_limit` times and reported as [`ClusterEvent::TaskError`].
    pub fn queue(&self, data: D) -> Result<()> {
        self.submit(data, None, None)
    }

    /// Queue a job with its own task function.
    pub fn queue_with<F, Fut>(&self, data: D, f: F) -> Result<()>
    where
        F: Fn(TaskContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.submit(data, Some(task_fn(f)), None)
    }

    /// Run a job for the default task and wait for its result.
    ///
    /// Not retried: the first failure is returned.
    pub async fn execute(&self, data: D) -> Result<R> {
        self.execute_task(data, None).await
    }

    pub async fn execute_with<F, Fut>(&self, data: D, f: F) -> Result<R>
    where
        F: Fn(TaskContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.execute_task(data, Some(task_fn(f))).await
    }

    async fn execute_task(&self, data: D, task: Option<TaskFn<D, R>>) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.submit(data, task, Some(tx))?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ClusterError::Job(e)),
            Err(_) => Err(ClusterError::Closed),
        }
    }

    /// Resolves once the queue is empty and no worker is busy.
    pub async fn idle(&self) {
        let rx = {
            let mut st = self.inner.state();
            if st.closed {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.idle_waiters.push(tx);
            rx
        };
        self.inner.work();
        let _ = rx.await;
    }

    /// Resolves with the data of the next job that finishes, successfully or not.
    ///
    /// The waiter is registered when this is called, not when first polled.
    pub fn wait_for_one(&self) -> impl Future<Output = Result<D>> + Send + 'static {
        let rx = {
            let mut st = self.inner.state();
            (!st.closed).then(|| {
                let (tx, rx) = oneshot::channel();
                st.one_waiters.push(tx);
                rx
            })
        };
        async move {
            match rx {
                Some(rx) => rx.await.map_err(|_| ClusterError::Closed),
                None => Err(ClusterError::Closed),
            }
        }
    }

    /// Subscribe to [`ClusterEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent<D>> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ClusterStatus {
        self.inner.status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Shut down: stop scheduling, close every worker and the backend.
    ///
    /// Jobs still queued are dropped; pending `execute` calls fail with
    /// [`ClusterError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) {
        let (workers, idle_waiters, dropped) = {
            let mut st = self.inner.state();
            if st.closed {
                return;
            }
            st.closed = true;
            let dropped = st.queue.drain();
            st.one_waiters.clear();
            (
                std::mem::take(&mut st.workers),
                std::mem::take(&mut st.idle_waiters),
                dropped,
            )
        };
        self.inner.cancel.cancel();
        drop(dropped);

        let closes = workers.iter().map(|w| async move {
            if let Err(e) = w.close().await {
                warn!(worker_id = w.id, error = %e, "Unable to close worker browser");
            }
            metrics::record_worker_closed();
        });
        futures::future::join_all(closes).await;

        if let Err(e) = self.inner.backend.close().await {
            warn!(error = %e, "Unable to close concurrency backend");
        }

        if self.inner.options.monitor {
            status::log_status(&self.inner.status());
        }
        for waiter in idle_waiters {
            let _ = waiter.send(());
        }
        info!("Cluster closed");
    }
}
