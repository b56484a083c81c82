//! Mimir error types

use std::sync::Arc;
use std::time::Duration;

/// Mimir error types
#[derive(Debug, thiserror::Error)]
pub enum MimirError {
    // Transport/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("upstream error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Well-formed response that reports a semantic failure in its body.
    #[error("application error: {0}")]
    Application(String),

    /// Every endpoint was tried and none succeeded.
    #[error("all endpoints failed after {attempts} attempts, last error: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<MimirError>,
    },

    #[error("no upstream endpoint configured")]
    NoEndpoint,

    // Storage errors
    #[error("store error: {0}")]
    Store(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Error produced by a coalesced fetch and observed by more than one caller.
    #[error(transparent)]
    Shared(Arc<MimirError>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MimirError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Network failures, rate limits, and 5xx responses are transient.
    /// Application errors are assumed endpoint-independent and are not.
    pub fn is_transient(&self) -> bool {
        match self {
            MimirError::Http(_) | MimirError::RateLimited { .. } => true,
            MimirError::Api { status, .. } => *status >= 500,
            MimirError::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// The underlying error, looking through [`MimirError::Shared`].
    pub fn root(&self) -> &MimirError {
        match self {
            MimirError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Server-supplied wait hint, if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MimirError::RateLimited { retry_after } => *retry_after,
            MimirError::Shared(inner) => inner.retry_after(),
            _ => None,
        }
    }
}

/// Result type alias for Mimir operations
pub type Result<T> = std::result::Result<T, MimirError>;
