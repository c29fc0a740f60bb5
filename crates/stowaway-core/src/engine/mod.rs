//! Top-level offline sync engine.
//!
//! [`SyncEngine`] owns every component and is the single entry point for
//! hosts: operations go in through [`SyncEngine::queue_operation`], sync
//! passes run on demand or from the [`BackgroundSyncService`], and state
//! comes back out through [`SyncEngine::get_offline_status`] and events.

mod processor;

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::background::{
    AppState, BackgroundSyncService, NewBackgroundTask, SyncRunner, TaskAction,
};
use crate::config::{SyncConfiguration, SyncConfigurationUpdate};
use crate::conflict::ConflictResolutionManager;
use crate::download::{ContentDownloadManager, ContentFetcher};
use crate::error::{Error, Result, SyncErrorKind};
use crate::events::{EventBus, SyncEvent, Subscription};
use crate::models::{
    ConflictStrategy, DownloadRecord, DownloadRequest, NewOperation, OfflineOperation,
    OfflineStatus, OperationId, OperationPayload, Priority, QueueStats, ResourceType,
    SyncMetrics, SyncResult,
};
use crate::monitor::OfflineStatusMonitor;
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::queue::{OperationOutcome, OperationQueue, ProcessOptions, ProcessedOperation};
use crate::remote::RemoteApi;
use crate::services::{KeyValueStore, StorageService};

use processor::RemoteProcessor;

/// How the user settled a conflict that was left for them.
#[derive(Debug, Clone, PartialEq)]
pub enum UserDecision {
    /// Push the local version over the server's.
    UseClient,
    /// Keep the server version and drop the local change.
    UseServer,
    /// Push this hand-merged document instead.
    UseData(Value),
    /// Drop the local change without looking at either side.
    Discard,
}

/// Collaborators the engine is built from.
pub struct SyncEngineParts {
    pub storage: StorageService,
    pub remote: Arc<dyn RemoteApi>,
    pub network: Arc<dyn NetworkMonitor>,
    pub fetcher: Arc<dyn ContentFetcher>,
    /// Root directory for downloaded content
    pub content_dir: PathBuf,
}

struct EngineCore {
    storage: StorageService,
    remote: Arc<dyn RemoteApi>,
    network: Arc<dyn NetworkMonitor>,
    config: RwLock<SyncConfiguration>,
    queue: OperationQueue,
    conflicts: RwLock<ConflictResolutionManager>,
    downloads: ContentDownloadManager,
    monitor: OfflineStatusMonitor,
}

impl EngineCore {
    fn config(&self) -> SyncConfiguration {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One reconciliation pass over operations at or above `min_priority`.
    async fn sync(&self, min_priority: Priority) -> Result<SyncResult> {
        if !self.network.is_online() {
            tracing::debug!("Sync requested while offline");
            return Err(Error::Offline);
        }
        if self.monitor.is_paused().await {
            tracing::debug!("Sync requested while paused");
            return Err(Error::SyncPaused);
        }

        let options = ProcessOptions::from_config(&self.config()).with_min_priority(min_priority);
        let processor = RemoteProcessor {
            remote: self.remote.as_ref(),
            conflicts: &self.conflicts,
            monitor: &self.monitor,
        };
        let started = Instant::now();

        let processed = match self.queue.process(&processor, options).await {
            Ok(Some(processed)) => processed,
            Ok(None) => {
                tracing::debug!("Sync pass coalesced into the one already running");
                return Ok(SyncResult::coalesced());
            }
            Err(error) => {
                tracing::error!(
                    "Sync pass failed ({}): {}",
                    SyncErrorKind::classify_local(&error),
                    error
                );
                self.monitor.record_sync_failure(&error.to_string()).await;
                self.refresh_status().await;
                return Err(error);
            }
        };

        let mut result = self.summarize(processed);
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            "Sync pass finished: {} processed, {} succeeded, {} failed, {} conflicts in {}ms",
            result.processed,
            result.succeeded,
            result.failed,
            result.conflicts.len(),
            result.duration_ms
        );

        self.monitor.record_sync_completion(&result).await;
        self.refresh_status().await;
        Ok(result)
    }

    /// Fold per-operation outcomes into a result, emitting events as we go.
    fn summarize(&self, processed: Vec<ProcessedOperation>) -> SyncResult {
        let mut result = SyncResult {
            processed: processed.len(),
            ..SyncResult::default()
        };

        for ProcessedOperation {
            operation,
            outcome,
            exhausted,
        } in processed
        {
            match outcome {
                OperationOutcome::Completed { conflict } => {
                    result.succeeded += 1;
                    if let Some(conflict) = conflict {
                        self.monitor.emit(&SyncEvent::ConflictDetected {
                            conflict: conflict.clone(),
                        });
                        result.conflicts.push(conflict);
                    }
                    self.monitor.emit(&SyncEvent::OperationCompleted {
                        operation_id: operation.id,
                    });
                }
                OperationOutcome::AwaitingDecision { conflict } => {
                    self.monitor.emit(&SyncEvent::ConflictDetected {
                        conflict: conflict.clone(),
                    });
                    result.conflicts.push(conflict);
                }
                OperationOutcome::Retry { error } | OperationOutcome::Failed { error } => {
                    let will_retry = error.kind.is_retryable() && !exhausted;
                    result.failed += 1;
                    self.monitor.emit(&SyncEvent::OperationFailed {
                        operation_id: operation.id,
                        kind: error.kind,
                        message: error.message.clone(),
                        will_retry,
                    });
                    result.errors.push(error);
                }
            }
        }

        result.success = result.failed == 0;
        result
    }

    async fn refresh_status(&self) {
        match self.queue.stats().await {
            Ok(stats) => {
                self.monitor
                    .set_queue_counts(stats.pending, stats.failed, stats.awaiting_decision)
                    .await;
            }
            Err(error) => tracing::warn!("Failed to read queue stats: {}", error),
        }
        match self.downloads.storage_usage().await {
            Ok(usage) => self.monitor.set_storage_used(usage.total_bytes).await,
            Err(error) => tracing::warn!("Failed to read storage usage: {}", error),
        }
    }
}

#[async_trait]
impl SyncRunner for EngineCore {
    async fn run_sync(&self) -> Result<SyncResult> {
        self.sync(Priority::Low).await
    }

    async fn run_priority_sync(&self, min_priority: Priority) -> Result<SyncResult> {
        self.sync(min_priority).await
    }
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    network_subscription: Option<Subscription>,
    network_task: Option<JoinHandle<()>>,
}

/// Offline-first sync engine.
pub struct SyncEngine {
    core: Arc<EngineCore>,
    background: BackgroundSyncService,
    lifecycle: Mutex<Lifecycle>,
}

impl SyncEngine {
    /// Build an engine. Nothing runs until [`SyncEngine::initialize`].
    pub fn new(parts: SyncEngineParts, config: SyncConfiguration) -> Result<Self> {
        config.validate()?;
        let SyncEngineParts {
            storage,
            remote,
            network,
            fetcher,
            content_dir,
        } = parts;

        let events = EventBus::new();
        let store: Arc<dyn KeyValueStore> = Arc::new(storage.clone());
        let core = Arc::new(EngineCore {
            queue: OperationQueue::new(storage.clone(), config.clone()),
            conflicts: RwLock::new(ConflictResolutionManager::new(
                config.conflict_strategies.clone(),
            )),
            downloads: ContentDownloadManager::new(
                storage.clone(),
                fetcher,
                content_dir,
                &config,
                events.clone(),
            ),
            monitor: OfflineStatusMonitor::new(&config, events, Some(store)),
            config: RwLock::new(config.clone()),
            storage,
            remote,
            network: Arc::clone(&network),
        });
        let runner: Arc<dyn SyncRunner> = core.clone();
        let background = BackgroundSyncService::new(runner, network, &config);

        Ok(Self {
            core,
            background,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Prepare storage, restore state and start watching the network.
    ///
    /// Safe to call more than once.
    pub async fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.initialized {
            return Ok(());
        }

        self.core.storage.migrate().await?;
        self.core.monitor.load_metrics().await?;
        let initial = self.core.network.current_status();
        self.core.monitor.set_network_status(&initial).await;

        let restored = self.core.downloads.restore().await?;
        if restored > 0 {
            tracing::info!("Restored {} interrupted downloads", restored);
        }

        let (tx, rx) = mpsc::unbounded_channel::<NetworkStatus>();
        let forward = move |status: &NetworkStatus| {
            let _ = tx.send(*status);
        };
        let subscription = self.core.network.add_listener(Box::new(forward));
        lifecycle.network_subscription = Some(subscription);
        lifecycle.network_task = Some(tokio::spawn(watch_network(
            Arc::clone(&self.core),
            self.background.clone(),
            rx,
            initial.is_online(),
        )));

        self.background.start();
        self.core.refresh_status().await;
        lifecycle.initialized = true;
        tracing::info!("Sync engine initialized");
        Ok(())
    }

    /// Stop background work and release listeners. The engine can be
    /// initialized again afterwards.
    pub async fn destroy(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.background.stop().await;
        if let Some(subscription) = lifecycle.network_subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(task) = lifecycle.network_task.take() {
            task.abort();
        }
        self.core.downloads.shutdown();
        lifecycle.initialized = false;
        tracing::info!("Sync engine destroyed");
    }

    /// Persist an operation for later reconciliation.
    ///
    /// High and critical operations trigger an immediate priority pass while
    /// the device is online, whether or not auto-sync is on.
    pub async fn queue_operation(&self, operation: NewOperation) -> Result<OperationId> {
        let priority = operation.priority;
        let resource_type = operation.resource_type;
        let id = self.core.queue.enqueue(operation).await?;
        self.core.monitor.emit(&SyncEvent::OperationQueued {
            operation_id: id,
            resource_type,
        });
        self.core.refresh_status().await;

        if priority.is_urgent() && self.core.network.is_online() {
            let background = self.background.clone();
            tokio::spawn(async move {
                background
                    .schedule_task(NewBackgroundTask::new(
                        TaskAction::PrioritySync {
                            min_priority: Priority::High,
                        },
                        priority,
                    ))
                    .await;
            });
        }
        Ok(id)
    }

    /// Run one pass over pending operations now.
    pub async fn sync_pending_operations(&self) -> Result<SyncResult> {
        self.core.sync(Priority::Low).await
    }

    /// Give every failed operation a fresh retry budget, then sync.
    pub async fn retry_failed_operations(&self) -> Result<SyncResult> {
        self.core.queue.reset_failed().await?;
        self.core.refresh_status().await;
        self.sync_pending_operations().await
    }

    pub async fn clear_operation_queue(&self) -> Result<usize> {
        let removed = self.core.queue.clear().await?;
        self.core.refresh_status().await;
        Ok(removed)
    }

    /// Settle a conflict that was left for the user.
    pub async fn resolve_user_decision(
        &self,
        operation_id: &OperationId,
        decision: UserDecision,
    ) -> Result<()> {
        let operation = self
            .core
            .queue
            .get(operation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Operation {operation_id} not found")))?;
        if !operation.needs_decision {
            return Err(Error::InvalidInput(format!(
                "Operation {operation_id} is not awaiting a decision"
            )));
        }

        match decision {
            UserDecision::UseServer | UserDecision::Discard => {
                self.core.queue.remove(operation_id).await?;
            }
            UserDecision::UseClient => {
                self.core
                    .queue
                    .release(operation_id, &operation.payload, Some(ConflictStrategy::ClientWins))
                    .await?;
            }
            UserDecision::UseData(data) => {
                self.core
                    .queue
                    .release(
                        operation_id,
                        &OperationPayload::new(data),
                        Some(ConflictStrategy::ClientWins),
                    )
                    .await?;
            }
        }
        self.core.refresh_status().await;
        Ok(())
    }

    pub async fn awaiting_decision(&self) -> Result<Vec<OfflineOperation>> {
        self.core.queue.awaiting_decision().await
    }

    pub async fn failed_operations(&self) -> Result<Vec<OfflineOperation>> {
        self.core.queue.failed().await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.core.queue.stats().await
    }

    /// Resolve each resource to its content and queue it for download.
    ///
    /// Results come back in the order of `resource_ids`.
    pub async fn download_for_offline<S: AsRef<str>>(
        &self,
        resource_ids: &[S],
        priority: Priority,
    ) -> Vec<Result<DownloadRecord>> {
        let mut requests = Vec::new();
        let mut results: Vec<Option<Result<DownloadRecord>>> = Vec::new();
        for resource_id in resource_ids {
            let resource_id = resource_id.as_ref();
            match self.core.remote.resolve_content(resource_id).await {
                Ok(location) => {
                    let mut request =
                        DownloadRequest::new(resource_id, location.resource_type, location.url)
                            .with_priority(priority);
                    if let Some(size) = location.expected_size {
                        request = request.with_expected_size(size);
                    }
                    requests.push(request);
                    results.push(None);
                }
                Err(error) => {
                    tracing::warn!("Cannot resolve content for {}: {}", resource_id, error);
                    results.push(Some(Err(error.into())));
                }
            }
        }

        let mut queued = self.core.downloads.download_batch(requests).await.into_iter();
        let results = results
            .into_iter()
            .map(|slot| {
                slot.or_else(|| queued.next())
                    .unwrap_or_else(|| Err(Error::Download("download was not queued".to_string())))
            })
            .collect();
        self.core.refresh_status().await;
        results
    }

    pub async fn remove_offline_content<S: AsRef<str>>(&self, resource_ids: &[S]) -> Result<usize> {
        let removed = self.core.downloads.remove_content(resource_ids).await?;
        self.core.refresh_status().await;
        Ok(removed)
    }

    /// Current snapshot of connectivity, queue and storage state.
    pub async fn get_offline_status(&self) -> OfflineStatus {
        self.core.refresh_status().await;
        self.core
            .monitor
            .set_next_sync_time(self.background.stats().next_run_at)
            .await;
        let mut status = self.core.monitor.status().await;
        status.is_online = self.core.network.is_online();
        status
    }

    /// Human-readable one-liner for the current state.
    pub async fn status_message(&self) -> String {
        self.get_offline_status().await;
        self.core.monitor.status_message().await
    }

    pub async fn metrics(&self) -> SyncMetrics {
        self.core.monitor.metrics().await
    }

    pub async fn enable_auto_sync(&self, enabled: bool) -> Result<()> {
        self.update_configuration(SyncConfigurationUpdate {
            auto_sync_enabled: Some(enabled),
            ..SyncConfigurationUpdate::default()
        })
        .await
    }

    /// Run a full pass now, through the scheduler so it shows in its stats.
    pub async fn force_sync_now(&self) -> Result<SyncResult> {
        self.background.force_sync_now().await
    }

    pub async fn pause_sync(&self) {
        self.core.monitor.pause().await;
        tracing::info!("Sync paused");
    }

    pub async fn resume_sync(&self) {
        self.core.monitor.resume().await;
        tracing::info!("Sync resumed");
    }

    pub fn set_app_state(&self, app_state: AppState) {
        self.background.set_app_state(app_state);
    }

    pub fn add_sync_listener(
        &self,
        listener: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.core.monitor.add_listener(listener)
    }

    pub fn remove_sync_listener(&self, subscription: &Subscription) -> bool {
        self.core.monitor.remove_listener(subscription)
    }

    /// Install a custom merge function for a resource type.
    pub fn register_conflict_resolver(
        &self,
        resource_type: ResourceType,
        resolver: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    ) {
        self.core
            .conflicts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_resolver(resource_type, resolver);
    }

    /// Apply a partial configuration change to every component.
    ///
    /// Invalid updates are rejected and leave the configuration untouched.
    pub async fn update_configuration(&self, update: SyncConfigurationUpdate) -> Result<()> {
        let config = {
            let mut current = self
                .core
                .config
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut next = current.clone();
            next.apply(update)?;
            *current = next.clone();
            next
        };

        self.core.queue.configure(&config);
        self.core.downloads.configure(&config);
        {
            let mut conflicts = self
                .core
                .conflicts
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for (resource_type, strategy) in &config.conflict_strategies {
                conflicts.set_default_strategy(*resource_type, *strategy);
            }
        }
        self.core.monitor.set_storage_limit(config.storage_quota_bytes).await;
        self.core.monitor.set_auto_sync(config.auto_sync_enabled).await;
        self.background.update_configuration(&config).await;
        tracing::debug!("Sync configuration updated");
        Ok(())
    }

    pub fn configuration(&self) -> SyncConfiguration {
        self.core.config()
    }

    pub fn downloads(&self) -> &ContentDownloadManager {
        &self.core.downloads
    }

    pub const fn background(&self) -> &BackgroundSyncService {
        &self.background
    }
}

/// Forward connectivity changes to the monitor and scheduler.
async fn watch_network(
    core: Arc<EngineCore>,
    background: BackgroundSyncService,
    mut changes: mpsc::UnboundedReceiver<NetworkStatus>,
    mut was_online: bool,
) {
    while let Some(status) = changes.recv().await {
        core.monitor.set_network_status(&status).await;
        let online = status.is_online();
        if online != was_online {
            background.handle_network_change(online).await;
        }
        was_online = online;
    }
}
