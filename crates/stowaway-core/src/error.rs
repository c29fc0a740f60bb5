//! Error types for stowaway-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using stowaway-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stowaway-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sync was requested while the network collaborator reports offline
    #[error("Cannot sync while offline")]
    Offline,

    /// Sync was requested while sync is paused
    #[error("Sync is paused")]
    SyncPaused,

    /// Storage quota would be exceeded and eviction could not free enough space
    #[error("Storage quota exceeded: requested {requested} bytes, {available} bytes available")]
    QuotaExceeded {
        /// Bytes the request needs
        requested: u64,
        /// Bytes available after eviction
        available: u64,
    },

    /// Content download error
    #[error("Download error: {0}")]
    Download(String),

    /// Remote API error surfaced outside of a sync batch
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Failure taxonomy used to decide whether an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    NetworkError,
    AuthenticationError,
    ValidationError,
    ConflictError,
    StorageError,
    QuotaExceeded,
    Unknown,
}

impl SyncErrorKind {
    /// Network, storage, and unknown failures are retried with backoff.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::StorageError | Self::Unknown
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkError => "network_error",
            Self::AuthenticationError => "authentication_error",
            Self::ValidationError => "validation_error",
            Self::ConflictError => "conflict_error",
            Self::StorageError => "storage_error",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Unknown => "unknown",
        }
    }

    /// Classify a remote failure from its status code and error code.
    pub fn classify_remote(error: &RemoteError) -> Self {
        if let Some(status) = error.status {
            match status {
                401 | 403 => return Self::AuthenticationError,
                400 | 422 => return Self::ValidationError,
                409 | 412 => return Self::ConflictError,
                413 | 507 => return Self::QuotaExceeded,
                408 | 429 | 500..=599 => return Self::NetworkError,
                _ => {}
            }
        }

        let Some(code) = error.code.as_deref() else {
            return Self::Unknown;
        };
        match code.trim().to_ascii_lowercase().as_str() {
            "network" | "network_error" | "timeout" | "offline" | "connection_reset"
            | "connection_refused" | "dns" => Self::NetworkError,
            "auth" | "unauthorized" | "forbidden" | "token_expired" => Self::AuthenticationError,
            "validation" | "invalid" | "bad_request" => Self::ValidationError,
            "conflict" => Self::ConflictError,
            "storage" | "disk_full" => Self::StorageError,
            "quota" | "quota_exceeded" | "payload_too_large" => Self::QuotaExceeded,
            _ => Self::Unknown,
        }
    }

    /// Classify a local failure raised while processing an operation.
    pub fn classify_local(error: &Error) -> Self {
        match error {
            Error::Database(_) | Error::LibSql(_) | Error::Io(_) => Self::StorageError,
            Error::InvalidInput(_) | Error::Serialization(_) => Self::ValidationError,
            Error::Offline => Self::NetworkError,
            Error::QuotaExceeded { .. } => Self::QuotaExceeded,
            Error::NotFound(_) | Error::SyncPaused | Error::Download(_) | Error::Remote(_) => {
                Self::Unknown
            }
        }
    }
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
