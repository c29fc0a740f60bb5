//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::operation::string_enum;
use super::{OperationId, ResourceType};
use crate::error::{Error, Result};

string_enum! {
    /// Policy used to pick or merge a winning value
    ConflictStrategy {
        ClientWins => "client_wins",
        ServerWins => "server_wins",
        LastModifiedWins => "last_modified_wins",
        Merge => "merge",
        PromptUser => "prompt_user",
    }
}

string_enum! {
    /// How the local and remote versions disagree
    ConflictKind {
        ConcurrentModification => "concurrent_modification",
        DeletedOnServer => "deleted_on_server",
        CreatedOnBoth => "created_on_both",
        VersionMismatch => "version_mismatch",
    }
}

/// Conflict detected during one reconciliation attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Operation being reconciled
    pub operation_id: OperationId,
    /// Resource type, drives strategy lookup
    pub resource_type: ResourceType,
    /// Resource involved in the conflict
    pub resource_id: Option<String>,
    /// Locally held version
    pub client_data: Value,
    /// Remote version; `null` when the server no longer has the resource
    pub server_data: Value,
    /// Detected disagreement
    pub kind: ConflictKind,
    /// Strategy applied
    pub strategy: ConflictStrategy,
    /// Winning value once resolved
    pub resolved_data: Option<Value>,
}
