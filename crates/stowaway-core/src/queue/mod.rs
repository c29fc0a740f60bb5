//! Persistent priority queue of offline operations.
//!
//! The queue exclusively owns the `offline_operations` table. Callers get
//! snapshots and issue commands; every retry/park/fail transition happens
//! here while the storage lock is held.
//!
//! [`OperationQueue::process`] drives a caller-supplied
//! [`OperationProcessor`] over bounded batches. Only one processing run is
//! in flight at a time; overlapping calls return `None`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::config::SyncConfiguration;
use crate::db::{LibSqlOperationRepository, OperationRepository};
use crate::error::{Error, Result};
use crate::models::{
    ConflictStrategy, NewOperation, OfflineOperation, OperationId, OperationPayload, Priority,
    QueueStats, SyncConflict, SyncError,
};
use crate::services::StorageService;
use crate::util::now_millis;

/// What happened to one operation during processing.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Reconciled; the operation is removed
    Completed { conflict: Option<SyncConflict> },
    /// Transient failure; retried after backoff
    Retry { error: SyncError },
    /// Permanent failure; retries are exhausted immediately
    Failed { error: SyncError },
    /// Conflict that needs a user decision; the operation is parked
    AwaitingDecision { conflict: SyncConflict },
}

/// Reconciles a single operation against the remote side.
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    /// Called once a run owns the queue, before the first operation.
    /// Coalesced runs never call it.
    async fn started(&self) {}

    async fn process(&self, operation: &OfflineOperation) -> OperationOutcome;
}

/// One operation handled by a processing run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedOperation {
    /// Snapshot taken before processing
    pub operation: OfflineOperation,
    pub outcome: OperationOutcome,
    /// Retries are now exhausted and the operation sits in the failed set
    pub exhausted: bool,
}

/// Knobs for one processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Only operations at or above this priority are pulled
    pub min_priority: Priority,
    /// Keep pulling batches until nothing eligible remains
    pub drain: bool,
}

impl ProcessOptions {
    pub const fn from_config(config: &SyncConfiguration) -> Self {
        Self {
            batch_size: config.batch_size,
            concurrency: config.operation_concurrency,
            min_priority: Priority::Low,
            drain: false,
        }
    }

    #[must_use]
    pub const fn with_min_priority(mut self, min_priority: Priority) -> Self {
        self.min_priority = min_priority;
        self
    }

    #[must_use]
    pub const fn draining(mut self) -> Self {
        self.drain = true;
        self
    }
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfiguration::default())
    }
}

/// Clears the in-flight flag when a processing run ends, including on panic.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OperationQueue {
    storage: StorageService,
    config: RwLock<SyncConfiguration>,
    processing: AtomicBool,
}

impl OperationQueue {
    pub fn new(storage: StorageService, config: SyncConfiguration) -> Self {
        Self {
            storage,
            config: RwLock::new(config),
            processing: AtomicBool::new(false),
        }
    }

    /// Replace the retry and weighting policy.
    pub fn configure(&self, config: &SyncConfiguration) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
    }

    fn config(&self) -> SyncConfiguration {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist a new operation under a fresh id.
    pub async fn enqueue(&self, operation: NewOperation) -> Result<OperationId> {
        let max_retries = self.config().max_retries;
        let operation = operation.into_operation(max_retries, now_millis());

        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.insert(&operation).await?;

        tracing::debug!(
            "Queued {} {} operation {} at {} priority",
            operation.kind,
            operation.resource_type,
            operation.id,
            operation.priority
        );
        Ok(operation.id)
    }

    /// Eligible operations, highest priority first, then oldest.
    pub async fn pending(&self, limit: usize) -> Result<Vec<OfflineOperation>> {
        self.pending_at_least(Priority::Low, limit).await
    }

    /// Eligible operations at or above `min_priority`.
    pub async fn pending_at_least(
        &self,
        min_priority: Priority,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.list_pending(now_millis(), min_priority, limit).await
    }

    /// Operations whose retries are exhausted, newest first.
    pub async fn failed(&self) -> Result<Vec<OfflineOperation>> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.list_failed().await
    }

    /// Operations parked for a user decision, oldest first.
    pub async fn awaiting_decision(&self) -> Result<Vec<OfflineOperation>> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.list_awaiting_decision().await
    }

    pub async fn get(&self, id: &OperationId) -> Result<Option<OfflineOperation>> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.get(id).await
    }

    /// Count an attempt against the operation.
    ///
    /// With `reschedule`, the next eligible time moves to `now + backoff`,
    /// never earlier than it already was.
    pub async fn record_retry(
        &self,
        id: &OperationId,
        error: &str,
        reschedule: bool,
    ) -> Result<OfflineOperation> {
        let backoff = self.config().backoff;
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let operation = repo
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Operation {id}")))?;
        let now = now_millis();
        let retry_count = operation.retry_count.saturating_add(1);
        let scheduled_at = if reschedule {
            let delay = i64::try_from(backoff.delay(retry_count).as_millis()).unwrap_or(i64::MAX);
            operation.scheduled_at.max(now.saturating_add(delay))
        } else {
            operation.scheduled_at
        };

        repo.update_retry(id, retry_count, scheduled_at, now, error)
            .await?;
        tracing::debug!(
            "Operation {id} attempt {retry_count}/{} failed: {error}",
            operation.max_retries
        );

        repo.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Operation {id}")))
    }

    /// Move an operation straight to the failed set.
    pub async fn mark_failed(&self, id: &OperationId, error: &str) -> Result<()> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.mark_failed(id, error, now_millis()).await
    }

    /// Park an operation until a user decides the conflict.
    pub async fn park(&self, id: &OperationId, server_snapshot: &serde_json::Value) -> Result<()> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.park(id, server_snapshot, now_millis()).await
    }

    /// Return a parked operation to the pending set with the chosen payload.
    pub async fn release(
        &self,
        id: &OperationId,
        payload: &OperationPayload,
        strategy: Option<ConflictStrategy>,
    ) -> Result<()> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.release(id, payload, strategy, now_millis()).await
    }

    /// Give every failed operation a fresh set of retries.
    pub async fn reset_failed(&self) -> Result<usize> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        let count = repo.reset_failed(now_millis()).await?;
        if count > 0 {
            tracing::info!("Reset {count} failed operations");
        }
        Ok(count)
    }

    pub async fn remove(&self, id: &OperationId) -> Result<bool> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        repo.delete(id).await
    }

    pub async fn clear(&self) -> Result<usize> {
        let db = self.storage.lock().await;
        let repo = LibSqlOperationRepository::new(db.connection());
        let count = repo.clear().await?;
        tracing::info!("Cleared {count} queued operations");
        Ok(count)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let weights = self.config().priority_weights;
        let operations = {
            let db = self.storage.lock().await;
            let repo = LibSqlOperationRepository::new(db.connection());
            repo.list_all().await?
        };

        let mut stats = QueueStats {
            total: operations.len(),
            ..QueueStats::default()
        };
        for operation in &operations {
            *stats.by_priority.entry(operation.priority).or_default() += 1;
            *stats.by_type.entry(operation.resource_type).or_default() += 1;
            if operation.needs_decision {
                stats.awaiting_decision += 1;
            } else if operation.is_failed() {
                stats.failed += 1;
            } else {
                // Backed-off operations still count as pending work
                stats.pending += 1;
                stats.weighted_pending += u64::from(weights.weight(operation.priority));
            }
        }
        Ok(stats)
    }

    /// Whether a processing run is in flight.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Run `processor` over eligible operations.
    ///
    /// Returns `None` when another run is already in flight. Bookkeeping
    /// failures are logged and leave the operation pending.
    pub async fn process(
        &self,
        processor: &dyn OperationProcessor,
        options: ProcessOptions,
    ) -> Result<Option<Vec<ProcessedOperation>>> {
        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            tracing::debug!("Queue processing already in flight; coalescing");
            return Ok(None);
        };
        processor.started().await;

        let batch_size = options.batch_size.max(1);
        let concurrency = options.concurrency.max(1);
        let mut processed = Vec::new();
        let mut seen = HashSet::new();

        loop {
            let batch = self.pending_at_least(options.min_priority, batch_size).await?;
            // Stop once a batch only contains operations this run already handled
            if batch.is_empty() || batch.iter().all(|operation| seen.contains(&operation.id)) {
                break;
            }
            seen.extend(batch.iter().map(|operation| operation.id));

            let outcomes: Vec<(OfflineOperation, OperationOutcome)> = stream::iter(batch)
                .map(|operation| async move {
                    let outcome = processor.process(&operation).await;
                    (operation, outcome)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for (operation, outcome) in outcomes {
                let exhausted = match self.apply_outcome(&operation, &outcome).await {
                    Ok(exhausted) => exhausted,
                    Err(error) => {
                        tracing::warn!(
                            "Failed to record outcome for operation {}: {error}",
                            operation.id
                        );
                        false
                    }
                };
                processed.push(ProcessedOperation {
                    operation,
                    outcome,
                    exhausted,
                });
            }

            if !options.drain {
                break;
            }
        }

        Ok(Some(processed))
    }

    /// Persist the transition for one outcome; returns whether retries are exhausted.
    async fn apply_outcome(
        &self,
        operation: &OfflineOperation,
        outcome: &OperationOutcome,
    ) -> Result<bool> {
        match outcome {
            OperationOutcome::Completed { .. } => {
                self.remove(&operation.id).await?;
                Ok(false)
            }
            OperationOutcome::Retry { error } => {
                let next_attempt = operation.retry_count.saturating_add(1);
                let reschedule = next_attempt < operation.max_retries;
                let updated = self
                    .record_retry(&operation.id, &error.message, reschedule)
                    .await?;
                if updated.is_failed() {
                    tracing::warn!(
                        "Operation {} exhausted {} retries: {}",
                        operation.id,
                        updated.max_retries,
                        error
                    );
                }
                Ok(updated.is_failed())
            }
            OperationOutcome::Failed { error } => {
                self.mark_failed(&operation.id, &error.message).await?;
                tracing::warn!("Operation {} failed permanently: {}", operation.id, error);
                Ok(true)
            }
            OperationOutcome::AwaitingDecision { conflict } => {
                self.park(&operation.id, &conflict.server_data).await?;
                tracing::info!(
                    "Operation {} parked awaiting a conflict decision",
                    operation.id
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests;
