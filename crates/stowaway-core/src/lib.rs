//! stowaway-core - Offline-first sync engine
//!
//! Local changes are persisted as operations in a libSQL-backed queue and
//! reconciled with a remote source of truth when connectivity allows.
//! Conflicts are resolved per resource type, content can be downloaded for
//! offline use under a storage quota, and a background scheduler keeps
//! everything moving without the host having to drive it.

pub mod background;
pub mod config;
pub mod conflict;
pub mod db;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod monitor;
pub mod network;
pub mod queue;
pub mod remote;
pub mod services;
mod util;

#[cfg(test)]
mod test_support;

pub use background::{AppState, BackgroundSyncService, NewBackgroundTask, TaskAction};
pub use config::{SyncConfiguration, SyncConfigurationUpdate};
pub use conflict::ConflictResolutionManager;
pub use download::{ContentDownloadManager, ContentFetcher, HttpContentFetcher};
pub use engine::{SyncEngine, SyncEngineParts, UserDecision};
pub use error::{Error, Result, SyncErrorKind};
pub use events::{EventBus, Subscription, SyncEvent};
pub use models::{
    ConflictStrategy, NewOperation, OfflineOperation, OfflineStatus, OperationId, OperationKind,
    Priority, ResourceType, SyncResult,
};
pub use monitor::OfflineStatusMonitor;
pub use network::{ConnectionType, ManualNetworkMonitor, NetworkMonitor, NetworkStatus};
pub use queue::OperationQueue;
pub use remote::{RemoteApi, RemoteError, RemoteOutcome, RemoteRequest};
pub use services::StorageService;
