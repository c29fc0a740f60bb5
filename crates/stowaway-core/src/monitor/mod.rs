//! Aggregated offline status, sync metrics, and the event bus.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::SyncConfiguration;
use crate::error::Result;
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::models::{OfflineStatus, SyncMetrics, SyncResult};
use crate::network::NetworkStatus;
use crate::services::KeyValueStore;
use crate::util::now_millis;

/// Key the metrics are persisted under.
pub const METRICS_KEY: &str = "sync_metrics";

struct MonitorState {
    status: OfflineStatus,
    metrics: SyncMetrics,
}

/// Tracks what the engine is doing and tells listeners about it.
pub struct OfflineStatusMonitor {
    state: RwLock<MonitorState>,
    events: EventBus,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl OfflineStatusMonitor {
    pub fn new(
        config: &SyncConfiguration,
        events: EventBus,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        Self {
            state: RwLock::new(MonitorState {
                status: OfflineStatus {
                    storage_limit: config.storage_quota_bytes,
                    auto_sync_enabled: config.auto_sync_enabled,
                    ..OfflineStatus::default()
                },
                metrics: SyncMetrics::default(),
            }),
            events,
            store,
        }
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn add_listener(
        &self,
        listener: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(listener)
    }

    pub fn remove_listener(&self, subscription: &Subscription) -> bool {
        self.events.unsubscribe(subscription.id())
    }

    pub fn emit(&self, event: &SyncEvent) {
        self.events.emit(event);
    }

    /// Load persisted metrics. Unreadable metrics are discarded.
    pub async fn load_metrics(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(raw) = store.get(METRICS_KEY).await? else {
            return Ok(());
        };

        match serde_json::from_str::<SyncMetrics>(&raw) {
            Ok(metrics) => {
                let mut state = self.state.write().await;
                state.status.last_sync_time = metrics.last_sync_time;
                state.metrics = metrics;
                tracing::debug!("Loaded sync metrics ({} syncs)", state.metrics.total_syncs);
            }
            Err(error) => {
                tracing::warn!("Discarding unreadable sync metrics: {}", error);
            }
        }
        Ok(())
    }

    async fn persist_metrics(&self, metrics: &SyncMetrics) {
        let Some(store) = &self.store else {
            return;
        };
        let saved = match serde_json::to_string(metrics) {
            Ok(raw) => store.set(METRICS_KEY, &raw).await,
            Err(error) => Err(error.into()),
        };
        if let Err(error) = saved {
            tracing::warn!("Failed to persist sync metrics: {}", error);
        }
    }

    pub async fn sync_started(&self) {
        self.state.write().await.status.is_syncing = true;
        self.emit(&SyncEvent::SyncStarted);
    }

    /// Fold a finished pass into the metrics.
    ///
    /// The average duration is a running mean over every recorded pass:
    /// `avg' = (avg * (n - 1) + duration) / n`.
    pub async fn record_sync_completion(&self, result: &SyncResult) {
        let now = now_millis();
        let metrics = {
            let mut state = self.state.write().await;
            let metrics = &mut state.metrics;
            metrics.total_syncs += 1;
            if result.success {
                metrics.successful_syncs += 1;
            } else {
                metrics.failed_syncs += 1;
            }
            metrics.operations_processed += result.processed as u64;
            metrics.operations_succeeded += result.succeeded as u64;
            metrics.operations_failed += result.failed as u64;
            metrics.conflicts_detected += result.conflicts.len() as u64;

            #[allow(clippy::cast_precision_loss)]
            let count = metrics.total_syncs as f64;
            #[allow(clippy::cast_precision_loss)]
            let duration = result.duration_ms as f64;
            metrics.average_sync_duration_ms =
                metrics.average_sync_duration_ms.mul_add(count - 1.0, duration) / count;
            metrics.last_sync_duration_ms = Some(result.duration_ms);
            metrics.last_sync_time = Some(now);
            metrics.last_error = result.errors.first().map(|error| error.to_string());

            state.status.is_syncing = false;
            state.status.last_sync_time = Some(now);
            state.metrics.clone()
        };

        self.persist_metrics(&metrics).await;
        self.emit(&SyncEvent::SyncCompleted {
            result: result.clone(),
        });
    }

    /// Record a pass that aborted before producing a result.
    pub async fn record_sync_failure(&self, error: &str) {
        let metrics = {
            let mut state = self.state.write().await;
            state.metrics.failed_syncs += 1;
            state.metrics.last_error = Some(error.to_string());
            state.status.is_syncing = false;
            state.metrics.clone()
        };

        self.persist_metrics(&metrics).await;
        self.emit(&SyncEvent::SyncFailed {
            error: error.to_string(),
        });
    }

    /// Track connectivity; listeners hear about actual changes only.
    pub async fn set_network_status(&self, network: &NetworkStatus) {
        let online = network.is_online();
        let changed = {
            let mut state = self.state.write().await;
            let changed = state.status.is_online != online;
            state.status.is_online = online;
            changed
        };
        if changed {
            tracing::info!("Network is now {}", if online { "online" } else { "offline" });
            self.emit(&SyncEvent::NetworkStatusChanged {
                status: *network,
            });
        }
    }

    pub async fn set_queue_counts(&self, pending: usize, failed: usize, conflicts: usize) {
        let mut state = self.state.write().await;
        state.status.pending_operations = pending;
        state.status.failed_operations = failed;
        state.status.conflicts = conflicts;
    }

    pub async fn set_storage_used(&self, bytes: u64) {
        self.state.write().await.status.storage_used = bytes;
    }

    pub async fn set_storage_limit(&self, bytes: u64) {
        self.state.write().await.status.storage_limit = bytes;
    }

    pub async fn set_auto_sync(&self, enabled: bool) {
        self.state.write().await.status.auto_sync_enabled = enabled;
    }

    pub async fn set_next_sync_time(&self, at: Option<i64>) {
        self.state.write().await.status.next_sync_time = at;
    }

    pub async fn pause(&self) {
        self.state.write().await.status.sync_paused = true;
    }

    pub async fn resume(&self) {
        self.state.write().await.status.sync_paused = false;
    }

    pub async fn is_paused(&self) -> bool {
        self.state.read().await.status.sync_paused
    }

    pub async fn status(&self) -> OfflineStatus {
        self.state.read().await.status.clone()
    }

    pub async fn metrics(&self) -> SyncMetrics {
        self.state.read().await.metrics.clone()
    }

    pub async fn status_message(&self) -> String {
        status_message(&self.status().await, now_millis())
    }
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

fn ago(elapsed_ms: i64) -> String {
    let seconds = elapsed_ms.max(0) / 1000;
    let (count, unit) = match seconds {
        0..=59 => return "just now".to_string(),
        60..=3_599 => (seconds / 60, "minute"),
        3_600..=86_399 => (seconds / 3_600, "hour"),
        _ => (seconds / 86_400, "day"),
    };
    format!("{} ago", plural(usize::try_from(count).unwrap_or(usize::MAX), unit))
}

/// One line describing the most important thing about `status`.
///
/// Offline beats syncing, which beats paused, then pending, failed and
/// conflicted work, then the time since the last sync.
pub fn status_message(status: &OfflineStatus, now: i64) -> String {
    if !status.is_online {
        return if status.pending_operations > 0 {
            format!(
                "Offline - {} waiting to sync",
                plural(status.pending_operations, "change")
            )
        } else {
            "Offline".to_string()
        };
    }
    if status.is_syncing {
        return "Syncing...".to_string();
    }
    if status.sync_paused {
        return "Sync paused".to_string();
    }
    if status.pending_operations > 0 {
        return format!("{} pending", plural(status.pending_operations, "change"));
    }
    if status.failed_operations > 0 {
        return format!(
            "{} failed to sync",
            plural(status.failed_operations, "change")
        );
    }
    if status.conflicts > 0 {
        return format!("{} to resolve", plural(status.conflicts, "conflict"));
    }
    if let Some(last) = status.last_sync_time {
        return format!("Last synced {}", ago(now - last));
    }
    "Ready".to_string()
}
