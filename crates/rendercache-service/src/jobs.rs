//! Execution of rendering jobs.
//!
//! The [`JobRunner`] guarantees that at most one job per [`JobIdentity`] is executing at any
//! time:
//! - A job is started using [`JobRunner::start`]. If a job with the same identity is already
//!   running, the caller is attached to it instead, and if the outcome is already cached, it is
//!   returned right away. All of this happens under the lock of the registry of running jobs, so
//!   a job finishing concurrently is never run a second time.
//! - The returned [`JobHandle`] can be awaited by any number of callers. Every one of them
//!   observes the same result.
//! - Running jobs can be looked up by identity with [`JobRunner::current`], and results of
//!   finished jobs stay available through [`JobRunner::completed`] for the configured
//!   `poll_retention`.
//!
//! Successful, cacheable outcomes are put into the [`ResultCache`] before the job leaves the
//! registry of running jobs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{self, AbortHandle, FutureExt as _};
use sentry::SentryFutureExt;
use thiserror::Error;

use crate::authorization::AuthorizationChecker;
use crate::caching::{CacheKey, ResultCache, decode_tokens};
use crate::config::JobsConfig;
use crate::context::{CaptureError, ContextSnapshot};
use crate::render::{Outcome, RenderContext, RenderError, Renderer};
use crate::types::{EntityReference, Right};
use crate::utils::futures::{CallOnDrop, m, measure};

/// The identity of a rendering job.
///
/// The identity consists of the number of renderer identity tokens, the renderer identity tokens
/// themselves, and the name and value of every captured context entry, in name order. Two jobs
/// have the same identity exactly when their renderer identities and captured contexts are
/// equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobIdentity {
    tokens: Arc<[String]>,
    key: CacheKey,
}

impl JobIdentity {
    /// Computes the identity of running a renderer with the given `renderer_id` in `context`.
    pub fn new(renderer_id: Vec<String>, context: &ContextSnapshot) -> Self {
        let mut tokens = Vec::with_capacity(1 + renderer_id.len() + 2 * context.len());
        // without the count, a renderer token could pass as a context entry name
        tokens.push(renderer_id.len().to_string());
        tokens.extend(renderer_id);
        for (name, value) in context.iter() {
            tokens.push(name.to_owned());
            tokens.push(value.to_owned());
        }
        Self::from_tokens(tokens)
    }

    fn from_tokens(tokens: Vec<String>) -> Self {
        let key = CacheKey::from_tokens(&tokens);
        Self {
            tokens: tokens.into(),
            key,
        }
    }

    /// Parses an identity from its encoded form, as returned by [`JobIdentity::cache_key`].
    pub fn parse(encoded: &str) -> Option<Self> {
        decode_tokens(encoded).map(Self::from_tokens)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// The key under which the outcome of this job is cached.
    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}

/// An error executing a rendering job.
///
/// Errors are shared by every caller waiting on the failed job. They are never cached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The context of the renderer could not be captured. No job was started.
    #[error("failed to capture rendering context")]
    Capture(#[from] CaptureError),
    /// The renderer failed.
    #[error("rendering failed")]
    Render(#[source] RenderError),
    /// The right required by the job was not granted.
    #[error("access denied: `{right}` right required")]
    AccessDenied {
        right: Right,
        entity: Option<EntityReference>,
    },
    /// The job exceeded the configured timeout.
    #[error("rendering timed out after {0:?}")]
    Timeout(Duration),
    /// The job terminated without producing a result, e.g. because it panicked.
    #[error("rendering job was canceled")]
    Canceled,
    /// The job runner was shut down.
    #[error("job runner is shut down")]
    ShutDown,
    /// The job runner is already running the maximum number of concurrent jobs.
    #[error("maximum number of concurrent jobs reached")]
    TooManyJobs,
}

impl ExecutionError {
    fn as_tag(&self) -> &'static str {
        match self {
            Self::Capture(_) => "capture",
            Self::Render(_) => "error",
            Self::AccessDenied { .. } => "access_denied",
            Self::Timeout(_) => "timeout",
            Self::Canceled => "canceled",
            Self::ShutDown => "shut_down",
            Self::TooManyJobs => "too_many_jobs",
        }
    }
}

/// The result of a rendering job.
pub type JobResult = Result<Arc<Outcome>, ExecutionError>;

/// A request to run a renderer.
#[derive(Clone)]
pub struct JobRequest {
    pub identity: JobIdentity,
    pub renderer: Arc<dyn Renderer>,
    pub context: ContextSnapshot,
    /// The right the renderer requires, if any.
    pub right: Option<Right>,
    /// The entity `right` is checked on.
    pub right_entity: Option<EntityReference>,
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("identity", &self.identity)
            .field("renderer", &self.renderer)
            .field("right", &self.right)
            .field("right_entity", &self.right_entity)
            .finish_non_exhaustive()
    }
}

impl JobRequest {
    async fn run(
        &self,
        authorization: &dyn AuthorizationChecker,
        use_cache: bool,
    ) -> Result<Outcome, ExecutionError> {
        if let Some(right) = self.right {
            let entity = self.right_entity.as_ref();
            if !authorization.check_access(right, entity, &self.context) {
                return Err(ExecutionError::AccessDenied {
                    right,
                    entity: entity.cloned(),
                });
            }
        }

        let ctx = RenderContext {
            use_cache,
            context: self.context.clone(),
        };
        let rendered = self
            .renderer
            .render(&ctx)
            .await
            .map_err(ExecutionError::Render)?;

        Ok(Outcome::new(rendered, self.renderer.is_cache_allowed()))
    }
}

// A shared future, so that waiting on a job does not hold the registry lock.
type JobChannel = future::Shared<oneshot::Receiver<JobResult>>;

struct RunningJob {
    channel: JobChannel,
    abort: AbortHandle,
}

/// A handle to the result of a job.
///
/// The handle either refers to a running job, or holds a result that was already available when
/// the handle was created.
#[derive(Clone)]
pub struct JobHandle {
    identity: JobIdentity,
    state: HandleState,
}

#[derive(Clone)]
enum HandleState {
    Ready(JobResult),
    Running {
        channel: JobChannel,
        shut_down: Arc<AtomicBool>,
    },
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("identity", &self.identity)
            .field("result", &self.try_result())
            .finish()
    }
}

impl JobHandle {
    pub(crate) fn ready(identity: JobIdentity, result: JobResult) -> Self {
        Self {
            identity,
            state: HandleState::Ready(result),
        }
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    /// Returns the result of the job if it is available without waiting.
    pub fn try_result(&self) -> Option<JobResult> {
        match &self.state {
            HandleState::Ready(result) => Some(result.clone()),
            HandleState::Running { channel, shut_down } => channel
                .peek()
                .map(|received| flatten_received(received.clone(), shut_down)),
        }
    }

    /// Waits for the job to finish.
    pub async fn wait(self) -> JobResult {
        match self.state {
            HandleState::Ready(result) => result,
            HandleState::Running { channel, shut_down } => {
                flatten_received(channel.await, &shut_down)
            }
        }
    }

    /// Waits up to `timeout` for the job to finish.
    ///
    /// Returns `None` if the job is still running after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<JobResult> {
        match &self.state {
            HandleState::Ready(result) => Some(result.clone()),
            HandleState::Running { channel, shut_down } => {
                let received = tokio::time::timeout(timeout, channel.clone()).await.ok()?;
                Some(flatten_received(received, shut_down))
            }
        }
    }
}

fn flatten_received(
    received: Result<JobResult, oneshot::Canceled>,
    shut_down: &AtomicBool,
) -> JobResult {
    match received {
        Ok(result) => result,
        // The sender is dropped when the job is aborted or panics. Panics are captured at the
        // source, so there is no need to report anything here.
        Err(_canceled) if shut_down.load(Ordering::Acquire) => Err(ExecutionError::ShutDown),
        Err(_canceled) => Err(ExecutionError::Canceled),
    }
}

/// Runs rendering jobs on a tokio runtime, at most one per [`JobIdentity`] at a time.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<JobRunnerInner>,
}

struct JobRunnerInner {
    config: JobsConfig,
    runtime: tokio::runtime::Handle,
    cache: Arc<ResultCache>,
    authorization: Arc<dyn AuthorizationChecker>,

    running: Mutex<BTreeMap<JobIdentity, RunningJob>>,
    /// Results of finished jobs, kept for polling.
    completed: Option<moka::sync::Cache<JobIdentity, JobResult>>,
    current_jobs: AtomicUsize,
    shut_down: Arc<AtomicBool>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("config", &self.inner.config)
            .field("running jobs", &self.in_flight())
            .field("shut down", &self.is_shut_down())
            .finish()
    }
}

impl JobRunner {
    pub fn new(
        config: JobsConfig,
        runtime: tokio::runtime::Handle,
        cache: Arc<ResultCache>,
        authorization: Arc<dyn AuthorizationChecker>,
    ) -> Self {
        let completed = (!config.poll_retention.is_zero()).then(|| {
            moka::sync::Cache::builder()
                .name("completed-jobs")
                .time_to_live(config.poll_retention)
                .build()
        });

        let inner = JobRunnerInner {
            config,
            runtime,
            cache,
            authorization,
            running: Mutex::new(BTreeMap::new()),
            completed,
            current_jobs: AtomicUsize::new(0),
            shut_down: Arc::new(AtomicBool::new(false)),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Starts a job for `request`, unless its result is already available.
    ///
    /// - If a job with the same identity is running, returns a handle attached to that job.
    /// - If the outcome is cached, returns a handle holding it.
    /// - Otherwise, spawns a new job.
    ///
    /// Returns an `Err` if the runner is shut down, or if it is already running the maximum
    /// number of jobs, as configured by the `max_concurrent_jobs` option.
    pub fn start(&self, request: JobRequest) -> Result<JobHandle, ExecutionError> {
        let inner = &self.inner;
        if self.is_shut_down() {
            metric!(counter("jobs.rejected") += 1, "reason" => "shut_down");
            return Err(ExecutionError::ShutDown);
        }

        let identity = request.identity.clone();
        let mut running = inner.running.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(job) = running.get(&identity) {
            metric!(counter("jobs.attached") += 1);
            tracing::trace!(%identity, "Attached to running job");
            return Ok(self.handle(identity, job.channel.clone()));
        }

        if let Some(outcome) = inner.cache.get(identity.cache_key()) {
            return Ok(JobHandle::ready(identity, Ok(outcome)));
        }

        let num_jobs = inner.current_jobs.load(Ordering::Relaxed);
        metric!(gauge("jobs.in_flight") = num_jobs as u64);
        if let Some(max_concurrent_jobs) = inner.config.max_concurrent_jobs {
            if num_jobs >= max_concurrent_jobs {
                metric!(counter("jobs.rejected") += 1, "reason" => "too_many_jobs");
                return Err(ExecutionError::TooManyJobs);
            }
        }

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let (job, abort) = future::abortable(self.create_job(request, sender));

        running.insert(
            identity.clone(),
            RunningJob {
                channel: channel.clone(),
                abort,
            },
        );
        inner.current_jobs.fetch_add(1, Ordering::Relaxed);
        // The job removes itself from `running`, so the lock has to be released before spawning.
        drop(running);

        metric!(counter("jobs.spawned") += 1);
        tracing::debug!(%identity, "Spawned rendering job");
        inner.runtime.spawn(job);

        Ok(self.handle(identity, channel))
    }

    fn handle(&self, identity: JobIdentity, channel: JobChannel) -> JobHandle {
        JobHandle {
            identity,
            state: HandleState::Running {
                channel,
                shut_down: Arc::clone(&self.inner.shut_down),
            },
        }
    }

    fn create_job(
        &self,
        request: JobRequest,
        sender: oneshot::Sender<JobResult>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let hub = Arc::new(sentry::Hub::new_from_top(sentry::Hub::current()));

        let token = {
            let inner = Arc::clone(&self.inner);
            let identity = request.identity.clone();
            CallOnDrop::new(move || {
                inner
                    .running
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&identity);
                inner.current_jobs.fetch_sub(1, Ordering::Relaxed);
            })
        };

        let spawn_time = Instant::now();
        async move {
            let identity = request.identity.clone();
            let timeout = inner.config.timeout;

            let ctx = sentry::TransactionContext::new("render", "rendercache.job");
            let transaction = sentry::start_transaction(ctx);
            sentry::configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));
            let transaction_guard = CallOnDrop::new(move || transaction.finish());

            let use_cache = inner.cache.is_enabled() && request.renderer.is_cache_allowed();
            let render = request.run(inner.authorization.as_ref(), use_cache);
            let result = measure(
                "render",
                m::timed_result,
                tokio::time::timeout(timeout, render),
            )
            .await;
            drop(transaction_guard);

            let result = match result {
                Ok(Ok(outcome)) => {
                    let outcome = Arc::new(outcome);
                    if outcome.cacheable && inner.cache.is_enabled() {
                        let key = identity.cache_key().clone();
                        if let Err(err) = inner.cache.put(key, Arc::clone(&outcome)) {
                            err.log("put");
                        }
                    }
                    Ok(outcome)
                }
                Ok(Err(err)) => {
                    match &err {
                        ExecutionError::AccessDenied { right, .. } => {
                            tracing::debug!(%identity, %right, "Rendering job denied access");
                        }
                        err => {
                            let error: &dyn std::error::Error = err;
                            tracing::error!(error, %identity, "Rendering job failed");
                        }
                    }
                    Err(err)
                }
                Err(_elapsed) => {
                    tracing::error!(%identity, "Rendering job timed out after {timeout:?}");
                    Err(ExecutionError::Timeout(timeout))
                }
            };

            let status = result.as_ref().map_or_else(ExecutionError::as_tag, |_| "ok");
            metric!(timer("jobs.duration") = spawn_time.elapsed(), "status" => status);
            metric!(counter("jobs.finished") += 1, "status" => status);

            // Make the result pollable before the job leaves the registry.
            if let Some(completed) = &inner.completed {
                completed.insert(identity, result.clone());
            }
            sender.send(result).ok();

            drop(token);
        }
        .bind_hub(hub)
    }

    /// Returns a handle to the running job with the given identity, if there is one.
    pub fn current(&self, identity: &JobIdentity) -> Option<JobHandle> {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let channel = running.get(identity)?.channel.clone();
        Some(self.handle(identity.clone(), channel))
    }

    /// Returns the result of a recently finished job with the given identity.
    pub fn completed(&self, identity: &JobIdentity) -> Option<JobResult> {
        self.inner.completed.as_ref()?.get(identity)
    }

    /// The number of jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.current_jobs.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Aborts all running jobs and rejects all future ones.
    ///
    /// Everyone waiting on an aborted job observes [`ExecutionError::ShutDown`].
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);

        let aborts: Vec<_> = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(identity, job)| (identity.clone(), job.abort.clone()))
            .collect();

        tracing::info!(jobs = aborts.len(), "Shutting down job runner");
        for (identity, abort) in aborts {
            // Aborted jobs stay pollable once they have left the registry.
            if let Some(completed) = &self.inner.completed {
                completed
                    .entry(identity)
                    .or_insert(Err(ExecutionError::ShutDown));
            }
            abort.abort();
        }
    }
}
