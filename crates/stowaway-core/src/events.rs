//! Typed sync events and the listener registry that fans them out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;

use crate::error::SyncErrorKind;
use crate::models::{OperationId, ResourceType, SyncConflict, SyncResult};
use crate::network::NetworkStatus;

/// Something observable happened inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted,
    SyncCompleted {
        result: SyncResult,
    },
    SyncFailed {
        error: String,
    },
    OperationQueued {
        operation_id: OperationId,
        resource_type: ResourceType,
    },
    OperationCompleted {
        operation_id: OperationId,
    },
    OperationFailed {
        operation_id: OperationId,
        kind: SyncErrorKind,
        message: String,
        will_retry: bool,
    },
    ConflictDetected {
        conflict: SyncConflict,
    },
    StorageQuotaExceeded {
        requested: u64,
        available: u64,
    },
    NetworkStatusChanged {
        status: NetworkStatus,
    },
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener<E>>>,
}

/// Registered listeners for one event type.
///
/// Listeners run synchronously on the emitting task, in registration order.
pub struct EventBus<E = SyncEvent> {
    registry: Arc<Registry<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Register a listener; dropping the handle does not unsubscribe.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));

        let registry: Arc<dyn Unsubscribe> = self.registry.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Remove a listener by subscription id; returns whether it was registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.registry.remove(id)
    }

    /// Deliver an event to every listener.
    pub fn emit(&self, event: &E) {
        // Snapshot so listeners may subscribe or unsubscribe while handling.
        let listeners: Vec<Listener<E>> = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64) -> bool;
}

impl<E: 'static> Unsubscribe for Registry<E> {
    fn remove(&self, id: u64) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

/// Handle returned by a listener registration.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. A no-op once the bus is gone or already removed.
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
