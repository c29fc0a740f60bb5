//! Content download model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::operation::string_enum;
use super::{Priority, ResourceType};
use crate::error::{Error, Result};

string_enum! {
    /// Download lifecycle state
    DownloadStatus {
        Pending => "pending",
        Downloading => "downloading",
        Paused => "paused",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl DownloadStatus {
    /// Completed, Failed, and Cancelled never transition on their own.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Request to fetch a resource for offline use.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub url: String,
    pub priority: Priority,
    pub expected_size: Option<u64>,
    pub metadata: Option<Value>,
}

impl DownloadRequest {
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: ResourceType,
        url: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type,
            url: url.into(),
            priority: Priority::Medium,
            expected_size: None,
            metadata: None,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Persisted state of one content fetch, keyed by resource id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Row identifier
    pub id: String,
    /// Resource being downloaded (unique)
    pub resource_id: String,
    /// Resource type
    pub resource_type: ResourceType,
    /// Source URL
    pub url: String,
    /// Destination on disk once known
    pub local_path: Option<PathBuf>,
    /// Expected size in bytes (0 when unknown)
    pub file_size: u64,
    /// Bytes written so far
    pub downloaded_size: u64,
    /// Percent complete, 0-100
    pub progress: u8,
    /// Lifecycle state
    pub status: DownloadStatus,
    /// Scheduling priority, also used for eviction order
    pub priority: Priority,
    /// Error from the last failed attempt
    pub error: Option<String>,
    /// Queue timestamp (Unix ms)
    pub started_at: i64,
    /// Completion timestamp (Unix ms)
    pub completed_at: Option<i64>,
    /// Free-form caller metadata
    pub metadata: Option<Value>,
}

impl DownloadRecord {
    /// Percent complete for the given byte counters, clamped to 0-100.
    pub fn progress_for(downloaded: u64, total: u64) -> u8 {
        if total == 0 {
            return 0;
        }
        let percent = downloaded.saturating_mul(100) / total;
        u8::try_from(percent.min(100)).unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_for() {
        assert_eq!(DownloadRecord::progress_for(0, 0), 0);
        assert_eq!(DownloadRecord::progress_for(50, 200), 25);
        assert_eq!(DownloadRecord::progress_for(500, 200), 100);
    }

    #[test]
    fn test_terminal_states() {
        assert!(DownloadStatus::Completed.is_terminal());
        assert!(DownloadStatus::Cancelled.is_terminal());
        assert!(DownloadStatus::Failed.is_terminal());
        assert!(!DownloadStatus::Paused.is_terminal());
        assert!(!DownloadStatus::Pending.is_terminal());
    }
}
