//! Error types for ratelimit-io.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::LimitSpec;

/// Main error type for admission checks.
#[derive(Error, Debug)]
pub enum RatelimitError {
    /// A quota with no requests or an empty window.
    #[error("Invalid limit: {requests} requests per {window:?} (both must be greater than zero)")]
    InvalidLimit {
        /// Requested maximum number of calls
        requests: u64,
        /// Requested window length
        window: Duration,
    },

    /// Neither the call nor the engine configuration supplied a limit.
    #[error("No limit for key {key}: a per-call limit or a default limit must be provided")]
    MissingLimit {
        /// The resolved (mode-tagged) key
        key: String,
    },

    /// The store refused to register the quota script.
    #[error("Script load error: {0}")]
    ScriptLoad(String),

    /// Transport-level failure reaching the store.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The call was denied in fail-fast mode.
    #[error("Rate limit exceeded for {key} ({limit}), retry after {retry_after:?}")]
    RateLimitExceeded {
        /// The resolved (mode-tagged) key
        key: String,
        /// The limit that was enforced
        limit: LimitSpec,
        /// Time until the current window closes
        retry_after: Duration,
    },

    /// The caller abandoned a blocking-mode wait.
    #[error("Wait cancelled for {key}")]
    Cancelled {
        /// The resolved (mode-tagged) key
        key: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatelimitError {
    /// The retry hint carried by a fail-fast denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RatelimitError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether this error is the expected fail-fast denial signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RatelimitError::RateLimitExceeded { .. })
    }
}

/// Result type alias for ratelimit-io operations.
pub type Result<T> = std::result::Result<T, RatelimitError>;
