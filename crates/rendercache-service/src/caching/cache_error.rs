use thiserror::Error;

/// An error that happens when accessing the [`ResultCache`](super::ResultCache).
///
/// Cache errors are never fatal for a rendering request: they are logged, and the request
/// proceeds as if the cache had missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The cache is not available, e.g. because it was configured with a capacity of `0`.
    #[error("result cache unavailable")]
    Unavailable,
}

impl CacheError {
    /// Logs this error and reports it to metrics.
    pub(crate) fn log(&self, operation: &'static str) {
        tracing::warn!(
            error = self as &dyn std::error::Error,
            operation,
            "Result cache operation failed"
        );
        metric!(counter("caches.unavailable") += 1, "operation" => operation);
    }
}
