//! Error types for Courier.
//!
//! Library crates use [`CourierError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Courier operations.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport-level failure talking to an external service.
    #[error("network error: {0}")]
    Network(String),

    /// The external service answered but asked us to come back later
    /// (rate limit, 5xx, timeout).
    #[error("transient external error: {0}")]
    Transient(String),

    /// The external service rejected the input for good (malformed input,
    /// missing resource). Retrying with the same input cannot succeed.
    #[error("permanent external error: {0}")]
    Permanent(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Lost an optimistic-concurrency race on an item or record.
    #[error("concurrency conflict: {0}")]
    Conflict(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Response or payload parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CourierError>;

impl CourierError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap any displayable backend error as a storage error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Whether retrying the same call later can succeed.
    ///
    /// Storage errors are not retryable here; they are retried at the
    /// persistence boundary only.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Transient(_))
    }

    /// Whether this error must halt the whole pipeline.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CourierError::config("missing stage list");
        assert_eq!(err.to_string(), "config error: missing stage list");

        let err = CourierError::validation("ordinal 4 is out of sequence");
        assert!(err.to_string().contains("ordinal 4"));
    }

    #[test]
    fn retry_classification() {
        assert!(CourierError::Network("connection reset".into()).is_retryable());
        assert!(CourierError::Transient("HTTP 429".into()).is_retryable());
        assert!(!CourierError::Permanent("HTTP 404".into()).is_retryable());
        assert!(!CourierError::parse("bad json").is_retryable());
        assert!(!CourierError::storage("disk full").is_retryable());
    }

    #[test]
    fn storage_classification() {
        assert!(CourierError::storage("disk full").is_storage());
        assert!(!CourierError::Conflict("version 3".into()).is_storage());
    }
}
