//! Error types for the omnidesk application.
//!
//! This module defines the error taxonomy shared by the storage backends,
//! the trash lifecycle and the application state coordinator.

use std::{io, path::PathBuf};

use thiserror::Error;

/// The main error type for the omnidesk application.
#[derive(Error, Debug)]
pub enum OmniError {
    /// An operation referenced an id absent from the target collection or trash.
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// The backend is not initialized or cannot be reached.
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// A payload failed the checks applied at the storage boundary.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// A storage call did not complete within the configured timeout.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Errors related to file I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization operations.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors raised by the HTTP client of the remote backend.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Errors related to zip operations.
    #[error("Zip error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    /// Errors related to backup operations.
    #[error("Backup failed: {message}")]
    BackupFailed { message: String },

    /// Error when attempting to restore from backup.
    #[error("Restore failed: {message}")]
    RestoreFailed { message: String },

    /// Errors related to configuration.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Directory creation or access failed.
    #[error("Failed to create or access directory: {path}")]
    DirectoryError { path: PathBuf },

    /// for mutex lock acquisition issues
    #[error("{message}")]
    LockAcquisitionFailed { message: String },

    #[error("{message}")]
    EditorError { message: String },

    /// Generic application error with a custom message.
    #[error("{message}")]
    ApplicationError { message: String },
}

impl OmniError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        OmniError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        OmniError::Validation {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        OmniError::StorageUnavailable {
            message: message.into(),
        }
    }

    /// Whether the failure came from the transport rather than the request itself.
    ///
    /// The remote backend uses this to decide between queueing a write and
    /// surfacing the error.
    pub fn is_connectivity(&self) -> bool {
        match self {
            OmniError::StorageUnavailable { .. } | OmniError::Timeout { .. } => true,
            OmniError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}
