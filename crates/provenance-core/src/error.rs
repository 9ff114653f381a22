//! Error types for the provenance engine.
//!
//! Errors are grouped by the concern that produced them. Most of them are
//! contained at the granularity of one file or one identifier by the batch
//! operations; only a failure to open the store is fatal to the engine.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the provenance engine.
#[derive(Debug, Error)]
pub enum ProvenanceError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited by {service}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Registry returned HTTP {status} for {path}")]
    Registry { status: u16, path: String },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Malformed registry payload: {message}")]
    MalformedPayload { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown model category: {0}")]
    UnknownCategory(String),

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Remote identity not found for {0}")]
    IdentityNotFound(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for provenance operations.
pub type Result<T> = std::result::Result<T, ProvenanceError>;

impl From<std::io::Error> for ProvenanceError {
    fn from(err: std::io::Error) -> Self {
        ProvenanceError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ProvenanceError {
    fn from(err: serde_json::Error) -> Self {
        ProvenanceError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for ProvenanceError {
    fn from(err: rusqlite::Error) -> Self {
        ProvenanceError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ProvenanceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProvenanceError::Timeout(std::time::Duration::from_secs(0))
        } else {
            ProvenanceError::Network {
                message: err.to_string(),
                cause: err.status().map(|s| s.to_string()),
            }
        }
    }
}

impl ProvenanceError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ProvenanceError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Error for a poisoned connection mutex.
    pub(crate) fn lock_poisoned() -> Self {
        ProvenanceError::Database {
            message: "Failed to acquire connection lock".to_string(),
            source: None,
        }
    }

    /// Error for an operation on a store that was already closed.
    pub(crate) fn store_closed() -> Self {
        ProvenanceError::Database {
            message: "Identity store is closed".to_string(),
            source: None,
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvenanceError::Network { .. }
                | ProvenanceError::Timeout(_)
                | ProvenanceError::RateLimited { .. }
        )
    }
}
