//! Helpers for testing the rendering services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - A [`TestRenderer`] counts how often it was invoked across all of its clones. Keep one clone
//!    around to check the count, and hand out others with [`TestRenderer::shared`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use rendercache_service::render::{RenderContext, RenderError, Rendered, Renderer};
use rendercache_service::types::{DependencyToken, EntityReference};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// The wiki all test references point into.
pub const WIKI: &str = "xwiki";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `rendercache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("rendercache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A reference to the document `Main.{name}` in the test wiki.
pub fn document(name: &str) -> EntityReference {
    EntityReference::document(WIKI, &["Main"], name)
}

/// A dependency on the document `Main.{name}` in the test wiki.
pub fn depends_on_document(name: &str) -> DependencyToken {
    document(name).into()
}

/// A configurable [`Renderer`] that counts its invocations.
///
/// The rendered value is the identity of the renderer followed by the captured context entries,
/// e.g. `doc;user=Admin`.
#[derive(Debug, Clone)]
pub struct TestRenderer {
    id: Vec<String>,
    dependencies: Vec<DependencyToken>,
    delay: Duration,
    fail: bool,
    panic: bool,
    cacheable: bool,
    invocations: Arc<AtomicUsize>,
}

impl TestRenderer {
    pub fn new(id: &str) -> Self {
        Self {
            id: vec![id.to_owned()],
            dependencies: Vec::new(),
            delay: Duration::ZERO,
            fail: false,
            panic: false,
            cacheable: true,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replaces the identity tokens of this renderer.
    pub fn with_id(mut self, id: &[&str]) -> Self {
        self.id = id.iter().map(|token| token.to_string()).collect();
        self
    }

    /// Reports a dependency on `token` when rendering.
    pub fn with_dependency(mut self, token: impl Into<DependencyToken>) -> Self {
        self.dependencies.push(token.into());
        self
    }

    /// Sleeps for `delay` before producing the value.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails every rendering, after the delay.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Panics in every rendering, after the delay.
    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    /// Forbids caching of the rendered value.
    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// The number of times any clone of this renderer rendered.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Returns a clone of this renderer as a trait object.
    pub fn shared(&self) -> Arc<dyn Renderer> {
        Arc::new(self.clone())
    }
}

impl Renderer for TestRenderer {
    fn id(&self) -> Vec<String> {
        self.id.clone()
    }

    fn is_cache_allowed(&self) -> bool {
        self.cacheable
    }

    fn render<'a>(
        &'a self,
        ctx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Rendered, RenderError>> {
        Box::pin(async move {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if self.panic {
                panic!("renderer {:?} panicked", self.id);
            }
            if self.fail {
                return Err(RenderError::new(format_args!(
                    "renderer {:?} failed",
                    self.id
                )));
            }

            let mut value = self.id.join("/");
            for (name, entry) in ctx.context.iter() {
                value.push_str(&format!(";{name}={entry}"));
            }

            let rendered = self
                .dependencies
                .iter()
                .cloned()
                .fold(Rendered::new(value), Rendered::depends_on);
            Ok(rendered)
        })
    }
}
