//! Queued operation model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::ConflictStrategy;

/// Current payload schema version written to storage.
pub const PAYLOAD_VERSION: u32 = 1;

/// Retry ceiling applied when the caller does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unique identifier for a queued operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Declares a closed string-backed enum with `as_str`/`FromStr`/`Display`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Storage representation.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        concat!("Unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

string_enum! {
    /// Kind of mutation carried by an operation
    OperationKind {
        Create => "create",
        Update => "update",
        Delete => "delete",
        Upload => "upload",
        Download => "download",
    }
}

string_enum! {
    /// Closed set of resource types the engine knows how to sync
    ResourceType {
        Post => "post",
        Comment => "comment",
        Message => "message",
        Resource => "resource",
        Community => "community",
        UserProfile => "user_profile",
        MediaAttachment => "media_attachment",
    }
}

string_enum! {
    /// Scheduling priority, totally ordered from `Low` to `Critical`
    Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

impl Priority {
    /// Numeric rank persisted so SQL can order by priority.
    pub const fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// Inverse of [`Priority::rank`]; unknown ranks clamp to the nearest end.
    pub const fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Critical,
        }
    }

    /// High and Critical work bypasses periodic scheduling.
    pub const fn is_urgent(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Schema-tagged operation payload.
///
/// Stored as `{"version":1,"data":...}` so structural changes are explicit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    /// Payload schema version
    pub version: u32,
    /// Resource data sent to the remote API
    pub data: Value,
}

impl OperationPayload {
    /// Wrap resource data in the current payload version.
    #[must_use]
    pub const fn new(data: Value) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            data,
        }
    }

    /// Serialize for storage.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored payload, rejecting versions this build cannot read.
    pub fn decode(raw: &str) -> Result<Self> {
        let payload: Self = serde_json::from_str(raw)?;
        if payload.version == 0 || payload.version > PAYLOAD_VERSION {
            return Err(Error::InvalidInput(format!(
                "Unsupported payload version {} (expected <= {PAYLOAD_VERSION})",
                payload.version
            )));
        }
        Ok(payload)
    }
}

impl From<Value> for OperationPayload {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

/// A mutation queued while offline, awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    /// Unique identifier
    pub id: OperationId,
    /// Mutation kind
    pub kind: OperationKind,
    /// Resource type the mutation targets
    pub resource_type: ResourceType,
    /// Target resource, absent for creates that mint ids server-side
    pub resource_id: Option<String>,
    /// Versioned resource data
    pub payload: OperationPayload,
    /// Scheduling priority
    pub priority: Priority,
    /// Attempts recorded so far
    pub retry_count: u32,
    /// Attempts allowed before the operation is considered failed
    pub max_retries: u32,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Earliest eligible processing time (Unix ms)
    pub scheduled_at: i64,
    /// Last attempt timestamp (Unix ms)
    pub last_attempt_at: Option<i64>,
    /// Error recorded by the last failed attempt
    pub last_error: Option<String>,
    /// Conflict strategy override for this operation
    pub conflict_strategy: Option<ConflictStrategy>,
    /// Parked until a user resolves a conflict
    pub needs_decision: bool,
    /// Server version captured when the operation was parked
    pub conflict_snapshot: Option<Value>,
}

impl OfflineOperation {
    /// Whether retries are exhausted.
    pub const fn is_failed(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Whether the operation is eligible for processing at `now`.
    pub const fn is_pending_at(&self, now: i64) -> bool {
        !self.needs_decision && !self.is_failed() && self.scheduled_at <= now
    }

    /// Resource data carried by the payload.
    pub const fn data(&self) -> &Value {
        &self.payload.data
    }
}

/// Parameters for enqueueing an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub resource_type: ResourceType,
    pub payload: OperationPayload,
    pub resource_id: Option<String>,
    pub priority: Priority,
    pub max_retries: Option<u32>,
    pub conflict_strategy: Option<ConflictStrategy>,
}

impl NewOperation {
    /// Create an operation request with default options (Medium priority).
    pub fn new(kind: OperationKind, resource_type: ResourceType, data: Value) -> Self {
        Self {
            kind,
            resource_type,
            payload: OperationPayload::new(data),
            resource_id: None,
            priority: Priority::Medium,
            max_retries: None,
            conflict_strategy: None,
        }
    }

    #[must_use]
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub const fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = Some(strategy);
        self
    }

    /// Build the stored operation, minting a fresh id.
    pub(crate) fn into_operation(self, default_max_retries: u32, now: i64) -> OfflineOperation {
        OfflineOperation {
            id: OperationId::new(),
            kind: self.kind,
            resource_type: self.resource_type,
            resource_id: crate::util::normalize_text_option(self.resource_id),
            payload: self.payload,
            priority: self.priority,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            created_at: now,
            scheduled_at: now,
            last_attempt_at: None,
            last_error: None,
            conflict_strategy: self.conflict_strategy,
            needs_decision: false,
            conflict_snapshot: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_id_unique() {
        assert_ne!(OperationId::new(), OperationId::new());
    }

    #[test]
    fn test_operation_id_parse() {
        let id = OperationId::new();
        let parsed: OperationId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_priority_total_order() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
        for priority in Priority::ALL {
            assert_eq!(Priority::from_rank(priority.rank()), *priority);
        }
    }

    #[test]
    fn test_resource_type_roundtrip() {
        for resource_type in ResourceType::ALL {
            let parsed: ResourceType = resource_type.as_str().parse().unwrap();
            assert_eq!(parsed, *resource_type);
        }
        assert!("planet".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_payload_rejects_future_version() {
        let raw = r#"{"version":99,"data":{"title":"x"}}"#;
        assert!(OperationPayload::decode(raw).is_err());

        let payload = OperationPayload::new(json!({"title": "x"}));
        let decoded = OperationPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_new_operation_defaults() {
        let op = NewOperation::new(OperationKind::Create, ResourceType::Post, json!({}))
            .with_resource_id("  ")
            .into_operation(DEFAULT_MAX_RETRIES, 1_000);
        assert_eq!(op.priority, Priority::Medium);
        assert_eq!(op.max_retries, 3);
        assert_eq!(op.resource_id, None);
        assert!(op.is_pending_at(1_000));
        assert!(!op.is_pending_at(999));
    }
}
