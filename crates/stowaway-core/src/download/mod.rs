//! Prioritized, bounded-concurrency content downloads.
//!
//! Requests are persisted in `file_downloads` and kept in an in-memory queue
//! sorted by priority. A pump starts workers while fewer than
//! `max_concurrent_downloads` are active; every finished worker pumps again.
//! Completed content and the expected size of unfinished downloads count
//! against the storage quota. Room for a new request is made by evicting the
//! lowest-priority, then oldest, content, and the real size is checked again
//! when a download finishes.

mod fetcher;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfiguration;
use crate::db::{DownloadRepository, LibSqlDownloadRepository};
use crate::error::{Error, Result};
use crate::events::{EventBus, SyncEvent};
use crate::models::{DownloadRecord, DownloadRequest, DownloadStatus, StorageUsage};
use crate::services::StorageService;
use crate::util::{is_http_url, now_millis, sanitize_file_name};

pub use fetcher::{
    part_path, remove_partial, ContentFetcher, FetchOutcome, HttpContentFetcher, ProgressSink,
};

/// Callback invoked with the latest record of one resource.
pub type ProgressListener = Arc<dyn Fn(&DownloadRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Pause,
    Cancel,
    Shutdown,
}

struct ActiveDownload {
    token: CancellationToken,
    stop: Option<StopReason>,
}

struct DownloadState {
    queue: Vec<DownloadRecord>,
    active: HashMap<String, ActiveDownload>,
    max_concurrent: usize,
    quota_bytes: u64,
}

impl DownloadState {
    fn is_tracked(&self, resource_id: &str) -> bool {
        self.active.contains_key(resource_id)
            || self.queue.iter().any(|queued| queued.resource_id == resource_id)
    }

    /// Insert behind every queued record of equal or higher priority.
    fn enqueue(&mut self, record: DownloadRecord) -> bool {
        if self.is_tracked(&record.resource_id) {
            return false;
        }
        let at = self
            .queue
            .iter()
            .position(|queued| queued.priority < record.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, record);
        true
    }

    fn dequeue(&mut self, resource_id: &str) -> bool {
        let Some(at) = self
            .queue
            .iter()
            .position(|queued| queued.resource_id == resource_id)
        else {
            return false;
        };
        self.queue.remove(at);
        true
    }

    /// Ask an active worker to stop; returns whether one was running.
    fn stop_active(&mut self, resource_id: &str, reason: StopReason) -> bool {
        let Some(active) = self.active.get_mut(resource_id) else {
            return false;
        };
        active.stop = Some(reason);
        active.token.cancel();
        true
    }
}

/// Where a stop request found the download.
enum Interrupted {
    Queued,
    Active,
    Idle,
}

struct Inner {
    storage: StorageService,
    fetcher: Arc<dyn ContentFetcher>,
    content_dir: PathBuf,
    events: EventBus,
    state: Mutex<DownloadState>,
    listeners: Mutex<HashMap<String, ProgressListener>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn destination_for(&self, record: &DownloadRecord) -> PathBuf {
        self.content_dir
            .join(record.resource_type.as_str())
            .join(sanitize_file_name(&record.resource_id))
    }

    fn pump(inner: &Arc<Self>) {
        loop {
            let (record, token) = {
                let mut state = inner.state();
                if state.active.len() >= state.max_concurrent || state.queue.is_empty() {
                    break;
                }
                let record = state.queue.remove(0);
                let token = CancellationToken::new();
                state.active.insert(
                    record.resource_id.clone(),
                    ActiveDownload {
                        token: token.clone(),
                        stop: None,
                    },
                );
                (record, token)
            };
            tokio::spawn(run_download(Arc::clone(inner), record, token));
        }
    }

    fn finish_active(&self, resource_id: &str) -> Option<StopReason> {
        self.state()
            .active
            .remove(resource_id)
            .and_then(|active| active.stop)
    }

    async fn record(&self, resource_id: &str) -> Result<Option<DownloadRecord>> {
        let db = self.storage.lock().await;
        let repo = LibSqlDownloadRepository::new(db.connection());
        repo.get(resource_id).await
    }

    async fn set_status(
        &self,
        resource_id: &str,
        status: DownloadStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let completed_at = (status == DownloadStatus::Completed).then(now_millis);
        let db = self.storage.lock().await;
        let repo = LibSqlDownloadRepository::new(db.connection());
        repo.update_status(resource_id, status, error, completed_at).await
    }

    async fn notify(&self, resource_id: &str) {
        let listener = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .cloned();
        let Some(listener) = listener else {
            return;
        };
        match self.record(resource_id).await {
            Ok(Some(record)) => listener(&record),
            Ok(None) => {}
            Err(error) => tracing::warn!("Failed to load download {}: {}", resource_id, error),
        }
    }

    async fn settle(
        &self,
        record: &DownloadRecord,
        destination: &Path,
        outcome: Result<FetchOutcome>,
        stop: Option<StopReason>,
    ) -> Result<()> {
        let resource_id = record.resource_id.as_str();
        match (outcome, stop) {
            (
                Ok(FetchOutcome::Completed { bytes }),
                None | Some(StopReason::Pause | StopReason::Shutdown),
            ) => {
                let db = self.storage.lock().await;
                let repo = LibSqlDownloadRepository::new(db.connection());
                match self.ensure_capacity(&repo, resource_id, bytes).await {
                    Ok(()) => {}
                    Err(error @ Error::QuotaExceeded { .. }) => {
                        remove_file_quietly(destination).await;
                        repo.update_status(
                            resource_id,
                            DownloadStatus::Failed,
                            Some(&error.to_string()),
                            None,
                        )
                        .await?;
                        return Ok(());
                    }
                    Err(error) => return Err(error),
                }
                repo.complete(resource_id, destination, bytes, now_millis()).await?;
                tracing::info!(
                    "Downloaded {} {} ({} bytes) to {}",
                    record.resource_type,
                    resource_id,
                    bytes,
                    destination.display()
                );
            }
            (Ok(FetchOutcome::Completed { .. }), Some(StopReason::Cancel)) => {
                remove_file_quietly(destination).await;
                self.set_status(resource_id, DownloadStatus::Cancelled, None).await?;
            }
            (
                Ok(FetchOutcome::Cancelled),
                Some(reason @ (StopReason::Pause | StopReason::Shutdown)),
            ) => {
                let status = if reason == StopReason::Pause {
                    DownloadStatus::Paused
                } else {
                    DownloadStatus::Pending
                };
                let db = self.storage.lock().await;
                let repo = LibSqlDownloadRepository::new(db.connection());
                repo.update_progress(resource_id, 0, 0, 0).await?;
                repo.update_status(resource_id, status, None, None).await?;
                tracing::debug!("Download of {} stopped: {}", resource_id, status);
            }
            (Ok(FetchOutcome::Cancelled), _) => {
                self.set_status(resource_id, DownloadStatus::Cancelled, None).await?;
                tracing::debug!("Download of {} cancelled", resource_id);
            }
            (Err(error), _) => {
                tracing::warn!("Download of {} from {} failed: {}", resource_id, record.url, error);
                self.set_status(resource_id, DownloadStatus::Failed, Some(&error.to_string()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Evict completed content until `requested` more bytes fit in the quota
    /// next to stored content and what other downloads have reserved.
    async fn ensure_capacity(
        &self,
        repo: &LibSqlDownloadRepository<'_>,
        resource_id: &str,
        requested: u64,
    ) -> Result<()> {
        let quota = self.state().quota_bytes;
        let mut used = repo
            .completed_bytes()
            .await?
            .saturating_add(repo.reserved_bytes(resource_id).await?);
        if used.saturating_add(requested) <= quota {
            return Ok(());
        }

        let candidates = repo.list_eviction_candidates().await?;
        let reclaimable: u64 = candidates.iter().map(|record| record.file_size).sum();
        let floor = used.saturating_sub(reclaimable);
        if floor.saturating_add(requested) > quota {
            let available = quota.saturating_sub(used);
            tracing::warn!(
                "Storage quota exceeded: {} bytes requested for {}, {} of {} bytes available",
                requested,
                resource_id,
                available,
                quota
            );
            self.events
                .emit(&SyncEvent::StorageQuotaExceeded { requested, available });
            return Err(Error::QuotaExceeded { requested, available });
        }

        for candidate in candidates {
            if used.saturating_add(requested) <= quota {
                break;
            }
            if let Some(path) = candidate.local_path.as_deref() {
                remove_file_quietly(path).await;
            }
            repo.delete(&candidate.resource_id).await?;
            used = used.saturating_sub(candidate.file_size);
            tracing::info!(
                "Evicted {} ({} priority, {} bytes) to make room for {} bytes",
                candidate.resource_id,
                candidate.priority,
                candidate.file_size,
                requested
            );
        }
        Ok(())
    }
}

async fn run_download(inner: Arc<Inner>, record: DownloadRecord, token: CancellationToken) {
    let resource_id = record.resource_id.clone();
    let destination = inner.destination_for(&record);

    let outcome = match inner
        .set_status(&resource_id, DownloadStatus::Downloading, None)
        .await
    {
        Ok(()) => {
            inner.notify(&resource_id).await;
            let sink = RecordProgress {
                inner: Arc::clone(&inner),
                resource_id: resource_id.clone(),
                expected: record.file_size,
                last_percent: AtomicU8::new(u8::MAX),
            };
            inner
                .fetcher
                .fetch(&record.url, &destination, &sink, &token)
                .await
        }
        Err(error) => Err(error),
    };

    let stop = inner.finish_active(&resource_id);
    if let Err(error) = inner.settle(&record, &destination, outcome, stop).await {
        tracing::warn!("Failed to record download result for {}: {}", resource_id, error);
    }
    inner.notify(&resource_id).await;
    Inner::pump(&inner);
}

/// Persists byte counters whenever the whole percentage changes.
struct RecordProgress {
    inner: Arc<Inner>,
    resource_id: String,
    expected: u64,
    last_percent: AtomicU8,
}

#[async_trait]
impl ProgressSink for RecordProgress {
    async fn report(&self, downloaded: u64, total: Option<u64>) {
        let total = total.unwrap_or(self.expected);
        let percent = DownloadRecord::progress_for(downloaded, total);
        if self.last_percent.swap(percent, Ordering::Relaxed) == percent {
            return;
        }

        let saved = {
            let db = self.inner.storage.lock().await;
            let repo = LibSqlDownloadRepository::new(db.connection());
            repo.update_progress(&self.resource_id, downloaded, total, percent)
                .await
        };
        match saved {
            Ok(()) => self.inner.notify(&self.resource_id).await,
            Err(error) => tracing::warn!(
                "Failed to save progress for {}: {}",
                self.resource_id,
                error
            ),
        }
    }
}

async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!("Failed to remove {}: {}", path.display(), error),
    }
}

/// Downloads content for offline use and keeps it within a storage quota.
#[derive(Clone)]
pub struct ContentDownloadManager {
    inner: Arc<Inner>,
}

impl ContentDownloadManager {
    /// Files are stored under `content_dir/<resource_type>/<resource_id>`.
    pub fn new(
        storage: StorageService,
        fetcher: Arc<dyn ContentFetcher>,
        content_dir: impl Into<PathBuf>,
        config: &SyncConfiguration,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                fetcher,
                content_dir: content_dir.into(),
                events,
                state: Mutex::new(DownloadState {
                    queue: Vec::new(),
                    active: HashMap::new(),
                    max_concurrent: config.max_concurrent_downloads.max(1),
                    quota_bytes: config.storage_quota_bytes,
                }),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn content_dir(&self) -> &Path {
        &self.inner.content_dir
    }

    /// Apply the concurrency bound and quota of a new configuration.
    pub fn configure(&self, config: &SyncConfiguration) {
        {
            let mut state = self.inner.state();
            state.max_concurrent = config.max_concurrent_downloads.max(1);
            state.quota_bytes = config.storage_quota_bytes;
        }
        Inner::pump(&self.inner);
    }

    pub fn set_quota(&self, bytes: u64) {
        self.inner.state().quota_bytes = bytes;
    }

    pub fn quota(&self) -> u64 {
        self.inner.state().quota_bytes
    }

    pub fn active_count(&self) -> usize {
        self.inner.state().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Queue a download.
    ///
    /// A resource that is queued, downloading, or already completed on disk
    /// is left alone and its current record returned.
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadRecord> {
        let resource_id = request.resource_id.trim().to_string();
        if resource_id.is_empty() {
            return Err(Error::InvalidInput("resource_id must not be empty".to_string()));
        }
        if !is_http_url(request.url.trim()) {
            return Err(Error::InvalidInput(format!(
                "Download URL must be http(s): {}",
                request.url
            )));
        }

        let tracked = self.inner.state().is_tracked(&resource_id);
        if tracked {
            return self
                .inner
                .record(&resource_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Download {resource_id}")));
        }
        if let Some(existing) = self.inner.record(&resource_id).await? {
            let on_disk = existing
                .local_path
                .as_deref()
                .is_some_and(Path::exists);
            if existing.status == DownloadStatus::Completed && on_disk {
                return Ok(existing);
            }
        }

        let record = DownloadRecord {
            id: uuid::Uuid::now_v7().to_string(),
            resource_id: resource_id.clone(),
            resource_type: request.resource_type,
            url: request.url.trim().to_string(),
            local_path: None,
            file_size: request.expected_size.unwrap_or(0),
            downloaded_size: 0,
            progress: 0,
            status: DownloadStatus::Pending,
            priority: request.priority,
            error: None,
            started_at: now_millis(),
            completed_at: None,
            metadata: request.metadata,
        };
        {
            // Checked and reserved under one lock
            let db = self.inner.storage.lock().await;
            let repo = LibSqlDownloadRepository::new(db.connection());
            if let Some(size) = request.expected_size {
                self.inner
                    .ensure_capacity(&repo, &resource_id, size)
                    .await?;
            }
            repo.upsert(&record).await?;
        }

        if self.inner.state().enqueue(record.clone()) {
            tracing::debug!(
                "Queued download of {} {} at {} priority",
                record.resource_type,
                resource_id,
                record.priority
            );
            Inner::pump(&self.inner);
        }
        Ok(record)
    }

    /// Queue several downloads, highest priority first so they claim quota first.
    ///
    /// Results are returned in request order.
    pub async fn download_batch(
        &self,
        requests: Vec<DownloadRequest>,
    ) -> Vec<Result<DownloadRecord>> {
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by(|a, b| requests[*b].priority.cmp(&requests[*a].priority));

        let mut results = Vec::with_capacity(requests.len());
        for index in order {
            results.push((index, self.download(requests[index].clone()).await));
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn interrupt(&self, resource_id: &str, reason: StopReason) -> Interrupted {
        let mut state = self.inner.state();
        if state.dequeue(resource_id) {
            Interrupted::Queued
        } else if state.stop_active(resource_id, reason) {
            Interrupted::Active
        } else {
            Interrupted::Idle
        }
    }

    /// Pause a queued or running download. A running download reaches
    /// `Paused` once its worker stops.
    pub async fn pause(&self, resource_id: &str) -> Result<bool> {
        match self.interrupt(resource_id, StopReason::Pause) {
            Interrupted::Active => Ok(true),
            Interrupted::Queued => {
                self.inner
                    .set_status(resource_id, DownloadStatus::Paused, None)
                    .await?;
                self.inner.notify(resource_id).await;
                Ok(true)
            }
            Interrupted::Idle => {
                let pending = self
                    .inner
                    .record(resource_id)
                    .await?
                    .is_some_and(|record| record.status == DownloadStatus::Pending);
                if pending {
                    self.inner
                        .set_status(resource_id, DownloadStatus::Paused, None)
                        .await?;
                }
                Ok(pending)
            }
        }
    }

    /// Re-queue a paused download; it restarts from the beginning.
    pub async fn resume(&self, resource_id: &str) -> Result<bool> {
        let Some(mut record) = self.inner.record(resource_id).await? else {
            return Ok(false);
        };
        if record.status != DownloadStatus::Paused {
            return Ok(false);
        }

        self.inner
            .set_status(resource_id, DownloadStatus::Pending, None)
            .await?;
        record.status = DownloadStatus::Pending;
        record.error = None;
        if self.inner.state().enqueue(record) {
            Inner::pump(&self.inner);
        }
        self.inner.notify(resource_id).await;
        Ok(true)
    }

    /// Cancel a download that has not finished; partial data is discarded.
    pub async fn cancel(&self, resource_id: &str) -> Result<bool> {
        match self.interrupt(resource_id, StopReason::Cancel) {
            Interrupted::Active => Ok(true),
            Interrupted::Queued => {
                self.inner
                    .set_status(resource_id, DownloadStatus::Cancelled, None)
                    .await?;
                self.inner.notify(resource_id).await;
                Ok(true)
            }
            Interrupted::Idle => {
                let Some(record) = self.inner.record(resource_id).await? else {
                    return Ok(false);
                };
                if record.status.is_terminal() {
                    return Ok(false);
                }
                remove_partial(&self.inner.destination_for(&record)).await;
                self.inner
                    .set_status(resource_id, DownloadStatus::Cancelled, None)
                    .await?;
                Ok(true)
            }
        }
    }

    /// Stop and delete content and records; returns how many records were removed.
    pub async fn remove_content<S: AsRef<str>>(&self, resource_ids: &[S]) -> Result<usize> {
        let mut removed = 0;
        for resource_id in resource_ids {
            let resource_id = resource_id.as_ref();
            self.interrupt(resource_id, StopReason::Cancel);

            let db = self.inner.storage.lock().await;
            let repo = LibSqlDownloadRepository::new(db.connection());
            let Some(record) = repo.get(resource_id).await? else {
                continue;
            };
            if let Some(path) = record.local_path.as_deref() {
                remove_file_quietly(path).await;
            }
            remove_partial(&self.inner.destination_for(&record)).await;
            if repo.delete(resource_id).await? {
                removed += 1;
            }
            drop(db);

            self.inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(resource_id);
            tracing::debug!("Removed offline content for {}", resource_id);
        }
        Ok(removed)
    }

    /// Delete failed and cancelled records with their partial files.
    pub async fn cleanup_failed(&self) -> Result<usize> {
        let db = self.inner.storage.lock().await;
        let repo = LibSqlDownloadRepository::new(db.connection());
        let mut stale = repo.list_by_status(DownloadStatus::Failed).await?;
        stale.extend(repo.list_by_status(DownloadStatus::Cancelled).await?);

        let mut removed = 0;
        for record in &stale {
            remove_partial(&self.inner.destination_for(record)).await;
            if let Some(path) = record.local_path.as_deref() {
                remove_file_quietly(path).await;
            }
            if repo.delete(&record.resource_id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("Cleaned up {} failed or cancelled downloads", removed);
        }
        Ok(removed)
    }

    /// Re-queue downloads left pending or interrupted by a previous session.
    pub async fn restore(&self) -> Result<usize> {
        let records = {
            let db = self.inner.storage.lock().await;
            let repo = LibSqlDownloadRepository::new(db.connection());
            let mut records = repo.list_by_status(DownloadStatus::Pending).await?;
            for interrupted in repo.list_by_status(DownloadStatus::Downloading).await? {
                repo.update_status(&interrupted.resource_id, DownloadStatus::Pending, None, None)
                    .await?;
                records.push(DownloadRecord {
                    status: DownloadStatus::Pending,
                    ..interrupted
                });
            }
            records
        };

        let mut restored = 0;
        for record in records {
            remove_partial(&self.inner.destination_for(&record)).await;
            if self.inner.state().enqueue(record) {
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!("Restored {} queued downloads", restored);
            Inner::pump(&self.inner);
        }
        Ok(restored)
    }

    /// Stop every worker and drop the in-memory queue. Stopped downloads stay
    /// pending so [`ContentDownloadManager::restore`] picks them up again.
    pub fn shutdown(&self) {
        let mut state = self.inner.state();
        state.queue.clear();
        for active in state.active.values_mut() {
            active.stop = Some(StopReason::Shutdown);
            active.token.cancel();
        }
    }

    pub async fn progress(&self, resource_id: &str) -> Result<Option<DownloadRecord>> {
        self.inner.record(resource_id).await
    }

    pub async fn all(&self) -> Result<Vec<DownloadRecord>> {
        let db = self.inner.storage.lock().await;
        let repo = LibSqlDownloadRepository::new(db.connection());
        repo.list_all().await
    }

    pub async fn by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadRecord>> {
        let db = self.inner.storage.lock().await;
        let repo = LibSqlDownloadRepository::new(db.connection());
        repo.list_by_status(status).await
    }

    /// Bytes held by completed content plus record counts per state.
    pub async fn storage_usage(&self) -> Result<StorageUsage> {
        let db = self.inner.storage.lock().await;
        let repo = LibSqlDownloadRepository::new(db.connection());
        let records = repo.list_all().await?;
        let total_bytes = repo.completed_bytes().await?;

        let mut by_status = BTreeMap::new();
        for record in &records {
            *by_status.entry(record.status).or_insert(0) += 1;
        }
        Ok(StorageUsage {
            total_bytes,
            count: records.len(),
            by_status,
        })
    }

    /// Register the listener for one resource, replacing any previous one.
    pub fn add_progress_listener(
        &self,
        resource_id: impl Into<String>,
        listener: impl Fn(&DownloadRecord) + Send + Sync + 'static,
    ) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource_id.into(), Arc::new(listener));
    }

    pub fn remove_progress_listener(&self, resource_id: &str) -> bool {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource_id)
            .is_some()
    }
}
