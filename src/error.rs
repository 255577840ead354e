//! Error types for the analysis cache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the analysis cache.
///
/// Payloads are plain strings so one failure can be handed to every caller
/// waiting on the same single-flight computation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The image could not be reduced to a luminance grid
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// The compute capability did not answer in time
    #[error("Compute timed out after {timeout:?}")]
    ComputeTimeout { timeout: Duration },

    /// The compute capability returned an error
    #[error("Compute failed ({provider}): {reason}")]
    ComputeFailed { provider: String, reason: String },

    /// The durable tier could not be reached or rejected the operation
    #[error("Durable tier unavailable: {0}")]
    DurableTierUnavailable(String),

    /// The volatile tier could not be reached (recovered internally)
    #[error("Volatile tier unavailable: {0}")]
    VolatileTierUnavailable(String),

    /// Record encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a compute failure attributed to a provider.
    pub fn compute_failed(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ComputeFailed {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Whether a caller outside the cache may reasonably retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ComputeTimeout { .. }
                | Error::ComputeFailed { .. }
                | Error::DurableTierUnavailable(_)
        )
    }

    /// Whether this error is the caller's fault.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Error::InvalidImage(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {}", e))
    }
}
