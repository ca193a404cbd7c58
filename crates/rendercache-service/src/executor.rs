//! The entry point for rendering: deduplicates, caches and runs [`Renderer`]s.
//!
//! Rendering works like this:
//! - The context entries the caller names are captured into a [`ContextSnapshot`]. A failure
//!   to capture fails the request before anything else happens.
//! - The [`JobIdentity`] is computed from the renderer identity and the snapshot.
//! - If a job with that identity is running, the caller waits for it.
//! - Otherwise, a cached outcome is returned if there is one.
//! - Otherwise, a new job is started and awaited.
//!
//! In addition to waiting with [`RenderExecutor::execute`], rendering can be started with
//! [`RenderExecutor::submit`], which returns immediately. The result can later be retrieved with
//! [`RenderExecutor::poll`] and an optional timeout.

use std::sync::Arc;
use std::time::Duration;

use crate::caching::ResultCache;
use crate::context::{ContextCapture, ContextSnapshot};
use crate::jobs::{ExecutionError, JobHandle, JobIdentity, JobRequest, JobResult, JobRunner};
use crate::render::{Outcome, Renderer};
use crate::types::{EntityReference, Right};

/// A request to render something.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub renderer: Arc<dyn Renderer>,
    /// The names of the context entries the rendered value depends on.
    pub context_entries: Vec<String>,
    /// The right required to render, if any.
    pub right: Option<Right>,
    /// The entity the `right` is checked on, or `None` for the current wiki.
    pub right_entity: Option<EntityReference>,
}

impl RenderRequest {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            context_entries: Vec::new(),
            right: None,
            right_entity: None,
        }
    }

    /// Adds context entries the rendered value depends on.
    pub fn with_context<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_entries
            .extend(entries.into_iter().map(Into::into));
        self
    }

    /// Requires `right` on `entity` before rendering.
    pub fn with_right(mut self, right: Right, entity: Option<EntityReference>) -> Self {
        self.right = Some(right);
        self.right_entity = entity;
        self
    }
}

/// The response of [`RenderExecutor::submit`] and [`RenderExecutor::poll`].
#[derive(Debug, Clone)]
pub enum RenderResponse {
    /// Rendering is still running.
    Pending {
        /// The identity with which the result can be polled.
        identity: JobIdentity,
    },
    /// Rendering finished.
    Completed(Arc<Outcome>),
    /// Rendering failed.
    Failed(ExecutionError),
}

impl From<JobResult> for RenderResponse {
    fn from(result: JobResult) -> Self {
        match result {
            Ok(outcome) => Self::Completed(outcome),
            Err(err) => Self::Failed(err),
        }
    }
}

/// Coordinates rendering requests, see the [module documentation](self).
#[derive(Clone)]
pub struct RenderExecutor {
    capture: Arc<dyn ContextCapture>,
    cache: Arc<ResultCache>,
    runner: JobRunner,
}

impl std::fmt::Debug for RenderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderExecutor")
            .field("cache", &self.cache)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl RenderExecutor {
    pub fn new(
        capture: Arc<dyn ContextCapture>,
        cache: Arc<ResultCache>,
        runner: JobRunner,
    ) -> Self {
        Self {
            capture,
            cache,
            runner,
        }
    }

    /// Renders the value of `request`, or returns it from the cache.
    ///
    /// Concurrent calls with the same identity share a single job.
    pub async fn execute(&self, request: RenderRequest) -> Result<Arc<Outcome>, ExecutionError> {
        self.lookup(request)?.wait().await
    }

    /// Starts rendering `request` without waiting for the result.
    ///
    /// Returns [`RenderResponse::Completed`] if the outcome is cached, and
    /// [`RenderResponse::Pending`] otherwise. Failures capturing the context or starting the job
    /// are returned as `Err`.
    pub fn submit(&self, request: RenderRequest) -> Result<RenderResponse, ExecutionError> {
        let handle = self.lookup(request)?;
        Ok(match handle.try_result() {
            Some(result) => result.into(),
            None => RenderResponse::Pending {
                identity: handle.identity().clone(),
            },
        })
    }

    /// Polls the result of a job previously started for `identity`.
    ///
    /// If the job is still running, waits for it, at most for `timeout` if one is given, in which
    /// case [`RenderResponse::Pending`] is returned once it elapses. Results of jobs that finished
    /// recently and cached outcomes are returned right away. After shutdown, unknown identities
    /// report [`ExecutionError::ShutDown`]. Otherwise returns `None` if nothing is known about
    /// `identity`.
    pub async fn poll(
        &self,
        identity: &JobIdentity,
        timeout: Option<Duration>,
    ) -> Option<RenderResponse> {
        if let Some(handle) = self.runner.current(identity) {
            let result = match timeout {
                Some(timeout) => handle.wait_timeout(timeout).await,
                None => Some(handle.wait().await),
            };
            return Some(match result {
                Some(result) => result.into(),
                None => RenderResponse::Pending {
                    identity: identity.clone(),
                },
            });
        }

        // The job has been put here before it stopped running.
        if let Some(result) = self.runner.completed(identity) {
            return Some(result.into());
        }

        if let Some(outcome) = self.cache.get(identity.cache_key()) {
            return Some(RenderResponse::Completed(outcome));
        }

        if self.runner.is_shut_down() {
            let result: JobResult = Err(ExecutionError::ShutDown);
            return Some(result.into());
        }

        metric!(counter("jobs.unknown") += 1);
        None
    }

    /// Captures the context of `request`, and attaches to a running job, serves the outcome from
    /// the cache, or starts a new job.
    fn lookup(&self, request: RenderRequest) -> Result<JobHandle, ExecutionError> {
        let RenderRequest {
            renderer,
            context_entries,
            right,
            right_entity,
        } = request;

        let context = if context_entries.is_empty() {
            ContextSnapshot::new()
        } else {
            let entries: Vec<&str> = context_entries.iter().map(String::as_str).collect();
            self.capture.capture(&entries).map_err(|err| {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "Failed to capture rendering context"
                );
                ExecutionError::from(err)
            })?
        };
        let identity = JobIdentity::new(renderer.id(), &context);

        if let Some(handle) = self.runner.current(&identity) {
            metric!(counter("jobs.attached") += 1);
            return Ok(handle);
        }

        if let Some(outcome) = self.cache.get(identity.cache_key()) {
            tracing::trace!(%identity, "Served outcome from cache");
            return Ok(JobHandle::ready(identity, Ok(outcome)));
        }

        // Starting re-checks both running jobs and the cache under the registry lock.
        self.runner.start(JobRequest {
            identity,
            renderer,
            context,
            right,
            right_entity,
        })
    }
}
