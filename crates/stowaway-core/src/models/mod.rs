//! Data models for Stowaway

mod conflict;
mod download;
mod operation;
mod status;

pub use conflict::{ConflictKind, ConflictStrategy, SyncConflict};
pub use download::{DownloadRecord, DownloadRequest, DownloadStatus};
pub use operation::{
    NewOperation, OfflineOperation, OperationId, OperationKind, OperationPayload, Priority,
    ResourceType, DEFAULT_MAX_RETRIES, PAYLOAD_VERSION,
};
pub use status::{
    OfflineStatus, QueueStats, StorageUsage, SyncError, SyncMetrics, SyncResult,
};
