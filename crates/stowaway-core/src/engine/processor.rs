//! Reconciles one queued operation against the remote API.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::conflict::ConflictResolutionManager;
use crate::error::SyncErrorKind;
use crate::models::{ConflictKind, OfflineOperation, OperationKind, SyncConflict, SyncError};
use crate::monitor::OfflineStatusMonitor;
use crate::queue::{OperationOutcome, OperationProcessor};
use crate::remote::{RemoteApi, RemoteError, RemoteOutcome, RemoteRequest};

pub(super) struct RemoteProcessor<'a> {
    pub(super) remote: &'a dyn RemoteApi,
    pub(super) conflicts: &'a RwLock<ConflictResolutionManager>,
    pub(super) monitor: &'a OfflineStatusMonitor,
}

impl RemoteProcessor<'_> {
    fn failure(operation: &OfflineOperation, error: &RemoteError) -> OperationOutcome {
        let kind = SyncErrorKind::classify_remote(error);
        let error = SyncError::new(operation.id, kind, error.to_string());
        if kind.is_retryable() {
            OperationOutcome::Retry { error }
        } else {
            OperationOutcome::Failed { error }
        }
    }

    fn resolve(
        &self,
        operation: &OfflineOperation,
        server: Value,
    ) -> (SyncConflict, Option<Value>) {
        let manager = self
            .conflicts
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut conflict = manager.create_conflict(
            operation.id,
            operation.resource_type,
            operation.resource_id.clone(),
            operation.data().clone(),
            server,
            operation.conflict_strategy,
        );
        let resolved = manager.resolve(&mut conflict);
        (conflict, resolved)
    }

    async fn reconcile(
        &self,
        operation: &OfflineOperation,
        request: &RemoteRequest,
        server: Value,
    ) -> OperationOutcome {
        if operation.kind != OperationKind::Update {
            let error = SyncError::new(
                operation.id,
                SyncErrorKind::ConflictError,
                format!(
                    "{} of {} conflicts with the server",
                    operation.kind, operation.resource_type
                ),
            );
            return OperationOutcome::Failed { error };
        }

        let (conflict, resolved) = self.resolve(operation, server);
        let Some(resolved) = resolved else {
            return OperationOutcome::AwaitingDecision { conflict };
        };
        if resolved.is_null() || resolved == conflict.server_data {
            return OperationOutcome::Completed {
                conflict: Some(conflict),
            };
        }

        let forced = request.forced(resolved);
        let pushed = if conflict.kind == ConflictKind::DeletedOnServer {
            let recreate = RemoteRequest {
                kind: OperationKind::Create,
                ..forced
            };
            self.remote.create(&recreate).await
        } else {
            self.remote.update(&forced).await
        };
        match pushed {
            Ok(RemoteOutcome::Applied { .. }) => OperationOutcome::Completed {
                conflict: Some(conflict),
            },
            Ok(RemoteOutcome::Conflict { .. }) => OperationOutcome::Failed {
                error: SyncError::new(
                    operation.id,
                    SyncErrorKind::ConflictError,
                    "server rejected the resolved version",
                ),
            },
            Err(error) => Self::failure(operation, &error),
        }
    }
}

#[async_trait]
impl OperationProcessor for RemoteProcessor<'_> {
    async fn started(&self) {
        self.monitor.sync_started().await;
    }

    async fn process(&self, operation: &OfflineOperation) -> OperationOutcome {
        let request = RemoteRequest::from_operation(operation);
        match self.remote.dispatch(&request).await {
            Ok(RemoteOutcome::Applied { .. }) => OperationOutcome::Completed { conflict: None },
            Ok(RemoteOutcome::Conflict { server }) => {
                self.reconcile(operation, &request, server).await
            }
            Err(error) => {
                tracing::debug!(
                    "{} {} for {} failed: {}",
                    operation.kind,
                    operation.id,
                    operation.resource_type,
                    error
                );
                Self::failure(operation, &error)
            }
        }
    }
}
