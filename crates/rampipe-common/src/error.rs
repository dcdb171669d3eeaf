//! Error types for RamPipe
//!
//! This module defines the common error types used throughout the system.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for RamPipe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for RamPipe
#[derive(Debug, Error)]
pub enum Error {
    // Pin/unpin state errors
    #[error("path is in use (open file descriptors): {path}")]
    InUse { path: PathBuf },

    #[error("path is already pinned: {0}")]
    AlreadyPinned(PathBuf),

    #[error("path is not pinned: {0}")]
    NotPinned(PathBuf),

    // OS operation errors
    #[error("mount operation failed: {op}: {detail}")]
    Mount { op: String, detail: String },

    #[error("device operation failed: {op}: {detail}")]
    Device { op: String, detail: String },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("sync failed: {0}")]
    Sync(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    // Request/state errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a mount failure with the failing operation and its diagnostic
    pub fn mount(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Mount {
            op: op.into(),
            detail: detail.into(),
        }
    }

    /// Create a device-mapper/loop failure with the failing operation
    pub fn device(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Device {
            op: op.into(),
            detail: detail.into(),
        }
    }

    /// Create a precondition failure
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a sync failure
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error is the client's fault (bad request or state
    /// mismatch) rather than a failure inside the daemon
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyPinned(_)
                | Self::NotPinned(_)
                | Self::InvalidRequest(_)
                | Self::NotSupported(_)
        )
    }

    /// Check if the operation can be retried later without intervention
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InUse { .. } | Self::Sync(_))
    }
}
