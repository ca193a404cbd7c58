//! The [`Renderer`] capability and the [`Outcome`]s it produces.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::context::ContextSnapshot;
use crate::types::DependencyToken;

/// Everything a [`Renderer`] gets to see when it runs.
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// Whether the renderer may use cached outcomes for nested renderings.
    pub use_cache: bool,
    /// The context captured when the job was submitted.
    pub context: ContextSnapshot,
}

/// The value produced by a [`Renderer`], together with everything it depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    pub value: String,
    pub dependencies: BTreeSet<DependencyToken>,
}

impl Rendered {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            dependencies: BTreeSet::new(),
        }
    }

    /// Records that the value depends on `token`.
    pub fn depends_on(mut self, token: impl Into<DependencyToken>) -> Self {
        self.dependencies.insert(token.into());
        self
    }
}

/// An error raised by a [`Renderer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RenderError(Arc<str>);

impl RenderError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string().into())
    }
}

impl From<anyhow::Error> for RenderError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format_args!("{err:#}"))
    }
}

/// Something that renders a value, usually expensively.
pub trait Renderer: Send + Sync + 'static {
    /// The tokens identifying this renderer, e.g. the reference of the rendered document and the
    /// target syntax.
    ///
    /// Two renderers with equal identities must produce equal values when run in equal context.
    fn id(&self) -> Vec<String>;

    /// Whether the rendered value may be cached.
    fn is_cache_allowed(&self) -> bool {
        true
    }

    /// Renders the value.
    fn render<'a>(&'a self, ctx: &'a RenderContext) -> BoxFuture<'a, Result<Rendered, RenderError>>;
}

impl fmt::Debug for dyn Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer").field("id", &self.id()).finish()
    }
}

/// The stored result of a successfully completed rendering job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub value: String,
    pub dependencies: BTreeSet<DependencyToken>,
    /// Whether this outcome may be stored in the result cache.
    pub cacheable: bool,
}

impl Outcome {
    pub fn new(rendered: Rendered, cacheable: bool) -> Self {
        let Rendered {
            value,
            dependencies,
        } = rendered;
        Self {
            value,
            dependencies,
            cacheable,
        }
    }
}
