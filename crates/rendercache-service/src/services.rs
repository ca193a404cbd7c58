//! Provides the shared rendering services and a way to initialize them.
//!
//! [`SharedServices`] creates the result cache, the job runner, the render executor and the
//! invalidation listener according to the provided [`Config`], and wires them together. There
//! is no global state: everything that needs one of the services gets it from here.

use std::sync::Arc;

use crate::authorization::{AllowAll, AuthorizationChecker};
use crate::caching::ResultCache;
use crate::config::Config;
use crate::context::{ContextCapture, ContextStore};
use crate::executor::RenderExecutor;
use crate::invalidation::InvalidationListener;
use crate::jobs::JobRunner;

pub struct SharedServices {
    pub config: Config,
    pub cache: Arc<ResultCache>,
    pub runner: JobRunner,
    pub executor: RenderExecutor,
    pub invalidation: InvalidationListener,
    /// The store context is captured from, if these services created it.
    pub context: Option<Arc<ContextStore>>,
}

impl SharedServices {
    /// Creates all services with a [`ContextStore`] for capturing context, and without any access
    /// restrictions.
    ///
    /// The store is available as [`SharedServices::context`].
    pub fn new(config: Config, runtime: tokio::runtime::Handle) -> Self {
        let context = Arc::new(ContextStore::new());
        let mut services =
            Self::with_collaborators(config, runtime, context.clone(), Arc::new(AllowAll));
        services.context = Some(context);
        services
    }

    /// Creates all services using the given context capture and authorization checker.
    pub fn with_collaborators(
        config: Config,
        runtime: tokio::runtime::Handle,
        capture: Arc<dyn ContextCapture>,
        authorization: Arc<dyn AuthorizationChecker>,
    ) -> Self {
        let cache = Arc::new(ResultCache::new(config.cache.capacity));
        if cache.is_enabled() {
            tracing::debug!(capacity = cache.capacity(), "Created result cache");
        } else {
            tracing::info!("Result cache is disabled, outcomes will not be cached");
        }

        let runner = JobRunner::new(config.jobs, runtime, Arc::clone(&cache), authorization);
        let executor = RenderExecutor::new(capture, Arc::clone(&cache), runner.clone());
        let invalidation = InvalidationListener::new(Arc::clone(&cache));

        Self {
            config,
            cache,
            runner,
            executor,
            invalidation,
            context: None,
        }
    }
}
