//! Request-scoped context passed explicitly through every operation.
//!
//! Each top-level call (create, delete, clean) builds one context and hands
//! it down; operations open their `tracing` spans with its correlation ID so
//! the log lines of concurrent requests can be told apart.

use std::fmt;

use uuid::Uuid;

/// Correlation data for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: Uuid,
}

impl RequestContext {
    /// Creates a context with a fresh random request ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
        }
    }

    /// Creates a context that continues an existing request.
    #[must_use]
    pub const fn with_id(request_id: Uuid) -> Self {
        Self { request_id }
    }

    /// Returns the request ID.
    #[must_use]
    pub const fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Opens a span named after the operation, tagged with the request ID.
    #[must_use]
    pub fn span(&self, operation: &'static str) -> tracing::Span {
        tracing::info_span!("op", operation, request_id = %self.request_id)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.request_id)
    }
}
