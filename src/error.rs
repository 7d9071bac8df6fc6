//! Error types for propserve
//!
//! This module defines all error types used throughout the orchestration
//! layer, following the taxonomy of the request lifecycle: validation and
//! provisioning errors are fatal to the operation that triggered them,
//! worker failures are transient and retried, calculation errors become
//! per-item terminal results.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for propserve operations
#[derive(Error, Debug)]
pub enum EstimatorError {
    /// Request failed validation and was never dispatched
    #[error("validation failed: {0}")]
    Validation(String),

    /// The worker pool could not satisfy the resource request
    #[error("provisioning failed on {substrate}: {message}")]
    Provisioning { substrate: String, message: String },

    /// A worker died or disconnected while executing a unit of work
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// Client/server transport failure
    #[error("connection error to '{host}': {message}")]
    Connection { host: String, message: String },

    /// The schema executor could not produce a value for an item
    #[error("calculation failed for '{property}': {message}")]
    Calculation { property: String, message: String },

    /// Malformed or unexpected frame on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error with path context
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Request was cancelled before completion
    #[error("request cancelled")]
    Cancelled,
}

impl EstimatorError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a provisioning error for a named substrate
    pub fn provisioning(substrate: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            substrate: substrate.into(),
            message: message.into(),
        }
    }

    /// Create a worker failure
    pub fn worker(message: impl Into<String>) -> Self {
        Self::WorkerFailure(message.into())
    }

    /// Create a connection error
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a calculation error for a property type
    pub fn calculation(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Calculation {
            property: property.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Check whether the error is transient (worth retrying)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WorkerFailure(_) | Self::Connection { .. } | Self::Io { .. }
        )
    }
}

/// Result type alias for propserve operations
pub type Result<T> = std::result::Result<T, EstimatorError>;

impl From<std::io::Error> for EstimatorError {
    fn from(err: std::io::Error) -> Self {
        EstimatorError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for EstimatorError {
    fn from(err: serde_json::Error) -> Self {
        EstimatorError::Serialization(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| EstimatorError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EstimatorError::worker("worker died").is_transient());
        assert!(EstimatorError::connection("localhost:8000", "refused").is_transient());
        assert!(!EstimatorError::validation("no schema").is_transient());
        assert!(!EstimatorError::calculation("Density", "did not converge").is_transient());
    }

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = EstimatorError::io("/test/path", io_err);
        let rendered = err.to_string();
        assert!(rendered.contains("/test/path"));
    }

    #[test]
    fn test_display_includes_context() {
        let err = EstimatorError::provisioning("slurm", "unknown partition 'gpu-long'");
        assert_eq!(
            err.to_string(),
            "provisioning failed on slurm: unknown partition 'gpu-long'"
        );
    }
}
