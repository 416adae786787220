//! Error types for Concierge.
//!
//! Library crates use [`ConciergeError`] via `thiserror`.
//! The CLI app wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Concierge operations.
#[derive(Debug, thiserror::Error)]
pub enum ConciergeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during crawl or model calls.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedding model error (API failure, response mismatch, oversized input).
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Generative model error (API failure or stream failure).
    #[error("generation error: {0}")]
    Generation(String),

    /// Vector index error (dimension mismatch, unknown chunk).
    #[error("index error: {0}")]
    Index(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad URL, invalid state, malformed record).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ConciergeError>;

impl ConciergeError {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ConciergeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ConciergeError::Embedding("model unavailable".into());
        assert!(err.to_string().contains("model unavailable"));

        let err = ConciergeError::validation("unknown page state 'done'");
        assert!(err.to_string().contains("unknown page state"));
    }
}
