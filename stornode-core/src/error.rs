//! Error types for the storage node.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for storage node operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Main error type for the storage node.
#[derive(Error, Debug)]
pub enum StorageError {
    // Resource errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Resource {resource} is busy (held by '{owner_uri}')")]
    ResourceBusy { resource: String, owner_uri: String },

    #[error("Service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    #[error("Operation on {resource} was cancelled")]
    Cancelled { resource: String },

    // Image errors
    #[error("Invalid image {image_id}: {reason}")]
    InvalidImage { image_id: String, reason: String },

    // Scrub errors
    #[error("Scrub of {device:?} failed: {reason}")]
    Scrub { device: PathBuf, reason: String },

    // External command errors
    #[error("Command '{cmd}' exited with code {exit_code}: {stderr}")]
    Process { cmd: String, stdout: String, stderr: String, exit_code: i32 },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Shorthand for an I/O error tied to a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn volume_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Volume", id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::ResourceBusy { .. })
    }
}
