//! Network state provider contract.
//!
//! The host application owns platform reachability APIs and reports changes
//! through a [`NetworkMonitor`]. [`ManualNetworkMonitor`] is the bundled
//! implementation: the host calls [`ManualNetworkMonitor::set_status`] from
//! its own callbacks.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::events::{EventBus, Subscription};

/// Physical link reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Other,
    #[default]
    None,
}

/// Snapshot of connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    pub connection_type: ConnectionType,
    /// `None` while the platform has not checked reachability yet
    pub internet_reachable: Option<bool>,
}

impl NetworkStatus {
    pub const fn offline() -> Self {
        Self {
            connected: false,
            connection_type: ConnectionType::None,
            internet_reachable: Some(false),
        }
    }

    pub const fn online(connection_type: ConnectionType) -> Self {
        Self {
            connected: true,
            connection_type,
            internet_reachable: Some(true),
        }
    }

    /// Connected and not known to be unreachable.
    pub const fn is_online(&self) -> bool {
        self.connected && !matches!(self.internet_reachable, Some(false))
    }

    pub const fn is_wifi(&self) -> bool {
        matches!(
            self.connection_type,
            ConnectionType::Wifi | ConnectionType::Ethernet
        )
    }
}

/// Source of connectivity information.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool {
        self.current_status().is_online()
    }

    fn current_status(&self) -> NetworkStatus;

    /// Register for status changes.
    fn add_listener(&self, listener: Box<dyn Fn(&NetworkStatus) + Send + Sync>) -> Subscription;
}

/// Network monitor fed explicitly by the host.
pub struct ManualNetworkMonitor {
    status: Mutex<NetworkStatus>,
    bus: EventBus<NetworkStatus>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        Self {
            status: Mutex::new(initial),
            bus: EventBus::new(),
        }
    }

    /// Store a new status and notify listeners when it changed.
    pub fn set_status(&self, status: NetworkStatus) {
        let previous = {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, status)
        };
        if previous != status {
            tracing::debug!(
                "Network status changed: online={} type={:?}",
                status.is_online(),
                status.connection_type
            );
            self.bus.emit(&status);
        }
    }

    pub fn set_online(&self, connection_type: ConnectionType) {
        self.set_status(NetworkStatus::online(connection_type));
    }

    pub fn set_offline(&self) {
        self.set_status(NetworkStatus::offline());
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::online(ConnectionType::Wifi))
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn current_status(&self) -> NetworkStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_listener(&self, listener: Box<dyn Fn(&NetworkStatus) + Send + Sync>) -> Subscription {
        self.bus.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn reachability_gates_online() {
        assert!(NetworkStatus::online(ConnectionType::Cellular).is_online());
        assert!(!NetworkStatus::offline().is_online());

        let unknown = NetworkStatus {
            connected: true,
            connection_type: ConnectionType::Wifi,
            internet_reachable: None,
        };
        assert!(unknown.is_online());

        let captive = NetworkStatus {
            internet_reachable: Some(false),
            ..unknown
        };
        assert!(!captive.is_online());
    }

    #[test]
    fn notifies_only_on_change() {
        let monitor = ManualNetworkMonitor::default();
        let changes = Arc::new(AtomicUsize::new(0));
        let subscription = {
            let changes = changes.clone();
            monitor.add_listener(Box::new(move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            }))
        };

        monitor.set_online(ConnectionType::Wifi);
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        monitor.set_offline();
        assert!(!monitor.is_online());
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        monitor.set_online(ConnectionType::Cellular);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert!(!monitor.current_status().is_wifi());
    }
}
