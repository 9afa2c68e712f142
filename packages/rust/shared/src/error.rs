//! Error types for RecordFlow.
//!
//! Library crates use [`RecordFlowError`] via `thiserror`.
//! Calls to external collaborators report [`ServiceError`], which carries the
//! transient/permanent classification the backoff helper needs.
//! The CLI wraps both with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all RecordFlow operations.
#[derive(Debug, thiserror::Error)]
pub enum RecordFlowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during crawl or lookup.
    #[error("network error: {0}")]
    Network(String),

    /// HTML, JSON, or image parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem-backed store error (manifest, cache, checkpoint, sinks).
    #[error("storage error: {0}")]
    Storage(String),

    /// External collaborator failure after retries were exhausted.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad record, invalid URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RecordFlowError>;

impl RecordFlowError {
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

/// Failure of a call to an external collaborator (directory, research,
/// synthesis, or ranking service).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// Connection, DNS, or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered but the payload could not be used.
    #[error("unparsable response: {0}")]
    Parse(String),

    /// No endpoint or credentials were configured for this service.
    #[error("service not configured: {0}")]
    Unconfigured(String),
}

impl ServiceError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Parse(_) | Self::Unconfigured(_) => false,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}
