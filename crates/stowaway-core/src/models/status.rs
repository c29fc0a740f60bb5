//! Sync results, status snapshots, and aggregate statistics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{DownloadStatus, OperationId, Priority, ResourceType, SyncConflict};
use crate::error::SyncErrorKind;

/// A classified failure of a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub operation_id: OperationId,
    pub kind: SyncErrorKind,
    pub message: String,
}

impl SyncError {
    pub fn new(operation_id: OperationId, kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation_id,
            kind,
            message: message.into(),
        }
    }

    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// Outcome of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// No operation in the pass failed
    pub success: bool,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Conflicts encountered, resolved or parked
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<SyncError>,
    pub duration_ms: u64,
    /// The pass was folded into a run that was already in flight
    pub coalesced: bool,
}

impl SyncResult {
    /// Result returned when a pass joins an already running one.
    pub fn coalesced() -> Self {
        Self {
            success: true,
            coalesced: true,
            ..Self::default()
        }
    }
}

/// Aggregate offline state exposed to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_operations: usize,
    pub failed_operations: usize,
    /// Unix ms of the last completed sync
    pub last_sync_time: Option<i64>,
    /// Unix ms of the next scheduled sync
    pub next_sync_time: Option<i64>,
    pub storage_used: u64,
    pub storage_limit: u64,
    pub auto_sync_enabled: bool,
    pub sync_paused: bool,
    /// Conflicts awaiting a user decision
    pub conflicts: usize,
}

/// Running sync metrics, persisted across sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub operations_processed: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub conflicts_detected: u64,
    pub average_sync_duration_ms: f64,
    pub last_sync_duration_ms: Option<u64>,
    pub last_sync_time: Option<i64>,
    pub last_error: Option<String>,
}

/// Queue counts by state, priority, and resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
    pub awaiting_decision: usize,
    pub total: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_type: BTreeMap<ResourceType, usize>,
    /// Sum of configured priority weights over pending operations
    pub weighted_pending: u64,
}

/// Bytes and record counts held by the download manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub count: usize,
    pub by_status: BTreeMap<DownloadStatus, usize>,
}
