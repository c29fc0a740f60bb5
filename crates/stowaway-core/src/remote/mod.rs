//! Remote API contract used to reconcile queued operations.
//!
//! The engine never talks HTTP for mutations itself; the application supplies
//! a [`RemoteApi`] that maps each request onto its own backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{OfflineOperation, OperationId, OperationKind, ResourceType};
use crate::util::compact_text;

/// One mutation sent to the remote source of truth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteRequest {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub data: Value,
    /// Overwrite the server version even if it changed since it was read
    pub force: bool,
}

impl RemoteRequest {
    pub fn from_operation(operation: &OfflineOperation) -> Self {
        Self {
            operation_id: operation.id,
            kind: operation.kind,
            resource_type: operation.resource_type,
            resource_id: operation.resource_id.clone(),
            data: operation.data().clone(),
            force: false,
        }
    }

    /// Same request carrying resolved data, applied unconditionally.
    #[must_use]
    pub fn forced(&self, data: Value) -> Self {
        Self {
            data,
            force: true,
            ..self.clone()
        }
    }
}

/// Result of a remote call that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The mutation was applied; `server` holds the stored version when returned
    Applied { server: Option<Value> },
    /// The server version disagrees; `null` when the resource no longer exists
    Conflict { server: Value },
}

impl RemoteOutcome {
    pub const fn applied() -> Self {
        Self::Applied { server: None }
    }
}

/// Failure reported by the remote collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", self.describe())]
pub struct RemoteError {
    /// HTTP-style status when one is available
    pub status: Option<u16>,
    /// Machine-readable error code
    pub code: Option<String>,
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: Some(code.into()),
            message: message.into(),
        }
    }

    fn describe(&self) -> String {
        let message = compact_text(&self.message);
        match (self.status, self.code.as_deref()) {
            (Some(status), Some(code)) => format!("HTTP {status} ({code}): {message}"),
            (Some(status), None) => format!("HTTP {status}: {message}"),
            (None, Some(code)) => format!("{code}: {message}"),
            (None, None) => message,
        }
    }
}


/// Where a resource's downloadable content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLocation {
    pub url: String,
    pub resource_type: ResourceType,
    pub expected_size: Option<u64>,
}

/// Server-side collaborator for reconciliation.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, request: &RemoteRequest) -> Result<RemoteOutcome, RemoteError>;
    async fn update(&self, request: &RemoteRequest) -> Result<RemoteOutcome, RemoteError>;
    async fn delete(&self, request: &RemoteRequest) -> Result<RemoteOutcome, RemoteError>;
    async fn upload(&self, request: &RemoteRequest) -> Result<RemoteOutcome, RemoteError>;
    async fn download(&self, request: &RemoteRequest) -> Result<RemoteOutcome, RemoteError>;

    /// Resolve a resource id to the content a download should fetch.
    async fn resolve_content(&self, resource_id: &str) -> Result<ContentLocation, RemoteError>;

    /// Dispatch by operation kind.
    async fn dispatch(&self, request: &RemoteRequest) -> Result<RemoteOutcome, RemoteError> {
        match request.kind {
            OperationKind::Create => self.create(request).await,
            OperationKind::Update => self.update(request).await,
            OperationKind::Delete => self.delete(request).await,
            OperationKind::Upload => self.upload(request).await,
            OperationKind::Download => self.download(request).await,
        }
    }
}
