//! Conflict detection and resolution.
//!
//! Pure logic with no persistence: given the client and server versions of a
//! resource, classify the disagreement and pick or merge a winner according
//! to the operation's strategy, the resource type's default, or
//! last-modified-wins.

mod merge;
mod resolvers;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::models::{ConflictKind, ConflictStrategy, OperationId, ResourceType, SyncConflict};

pub use merge::{merge_values, modified_at, parse_timestamp, MODIFIED_FIELDS};
pub use resolvers::{merge_post, merge_user_profile};

/// Custom merge for one resource type: `(client, server) -> merged`.
pub type MergeResolver = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Classify how the client and server versions disagree.
pub fn detect_conflict_kind(client: &Value, server: &Value) -> ConflictKind {
    if server.is_null() {
        return ConflictKind::DeletedOnServer;
    }
    if client.get("id").is_none() && server.get("id").is_some() {
        return ConflictKind::CreatedOnBoth;
    }
    match (client.get("version"), server.get("version")) {
        (Some(client_version), Some(server_version)) if client_version != server_version => {
            ConflictKind::VersionMismatch
        }
        _ => ConflictKind::ConcurrentModification,
    }
}

pub struct ConflictResolutionManager {
    default_strategies: BTreeMap<ResourceType, ConflictStrategy>,
    resolvers: HashMap<ResourceType, MergeResolver>,
}

impl Default for ConflictResolutionManager {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl ConflictResolutionManager {
    /// Create a manager with per-type default strategies and the built-in resolvers.
    pub fn new(default_strategies: BTreeMap<ResourceType, ConflictStrategy>) -> Self {
        let mut manager = Self {
            default_strategies,
            resolvers: HashMap::new(),
        };
        manager.register_resolver(ResourceType::UserProfile, merge_user_profile);
        manager.register_resolver(ResourceType::Post, merge_post);
        manager
    }

    /// Replace the merge used for `resource_type` under the Merge strategy.
    pub fn register_resolver(
        &mut self,
        resource_type: ResourceType,
        resolver: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    ) {
        self.resolvers.insert(resource_type, Arc::new(resolver));
    }

    pub fn set_default_strategy(
        &mut self,
        resource_type: ResourceType,
        strategy: ConflictStrategy,
    ) {
        self.default_strategies.insert(resource_type, strategy);
    }

    /// Strategy used when an operation carries no override.
    pub fn default_strategy(&self, resource_type: ResourceType) -> ConflictStrategy {
        self.default_strategies
            .get(&resource_type)
            .copied()
            .unwrap_or(ConflictStrategy::LastModifiedWins)
    }

    /// Build a conflict record, classifying it and picking its strategy.
    pub fn create_conflict(
        &self,
        operation_id: OperationId,
        resource_type: ResourceType,
        resource_id: Option<String>,
        client_data: Value,
        server_data: Value,
        strategy: Option<ConflictStrategy>,
    ) -> SyncConflict {
        let kind = detect_conflict_kind(&client_data, &server_data);
        SyncConflict {
            operation_id,
            resource_type,
            resource_id,
            client_data,
            server_data,
            kind,
            strategy: strategy.unwrap_or_else(|| self.default_strategy(resource_type)),
            resolved_data: None,
        }
    }

    /// Resolve a conflict, storing the winner on it.
    ///
    /// `None` means a user has to decide. A JSON `null` winner means the
    /// resource should stay deleted.
    pub fn resolve(&self, conflict: &mut SyncConflict) -> Option<Value> {
        let resolved = match conflict.strategy {
            ConflictStrategy::ClientWins => Some(conflict.client_data.clone()),
            ConflictStrategy::ServerWins => Some(conflict.server_data.clone()),
            ConflictStrategy::LastModifiedWins => Some(Self::last_modified_wins(
                &conflict.client_data,
                &conflict.server_data,
            )),
            ConflictStrategy::Merge => Some(self.merge(
                conflict.resource_type,
                &conflict.client_data,
                &conflict.server_data,
            )),
            ConflictStrategy::PromptUser => None,
        };

        tracing::debug!(
            "Resolved {} conflict on {} {} with {}: {}",
            conflict.kind,
            conflict.resource_type,
            conflict.resource_id.as_deref().unwrap_or("-"),
            conflict.strategy,
            if resolved.is_some() { "resolved" } else { "awaiting user" }
        );
        conflict.resolved_data.clone_from(&resolved);
        resolved
    }

    /// Merge using the type's registered resolver, else the default field merge.
    pub fn merge(&self, resource_type: ResourceType, client: &Value, server: &Value) -> Value {
        self.resolvers
            .get(&resource_type)
            .map_or_else(|| merge_values(client, server), |resolver| resolver(client, server))
    }

    fn last_modified_wins(client: &Value, server: &Value) -> Value {
        match (modified_at(client), modified_at(server)) {
            (Some(client_ms), Some(server_ms)) if client_ms > server_ms => client.clone(),
            (Some(_), None) => client.clone(),
            _ => server.clone(),
        }
    }
}
