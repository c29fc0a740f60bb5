use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Notify;

use super::*;
use crate::error::SyncErrorKind;
use crate::models::{ConflictKind, OperationKind, ResourceType};
use crate::test_support::init_tracing;

async fn queue() -> OperationQueue {
    init_tracing();
    let storage = StorageService::open_in_memory().await.unwrap();
    OperationQueue::new(storage, SyncConfiguration::default())
}

fn post(priority: Priority) -> NewOperation {
    NewOperation::new(
        OperationKind::Update,
        ResourceType::Post,
        json!({"id": "p1", "title": "draft"}),
    )
    .with_resource_id("p1")
    .with_priority(priority)
}

/// Records the order operations were handed to it and returns a fixed outcome.
struct Recorder {
    seen: Mutex<Vec<Priority>>,
    starts: AtomicUsize,
    outcome: Box<dyn Fn(&OfflineOperation) -> OperationOutcome + Send + Sync>,
}

impl Recorder {
    fn completing() -> Self {
        Self::with(|_| OperationOutcome::Completed { conflict: None })
    }

    fn with(outcome: impl Fn(&OfflineOperation) -> OperationOutcome + Send + Sync + 'static) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            outcome: Box::new(outcome),
        }
    }

    fn seen(&self) -> Vec<Priority> {
        self.seen.lock().unwrap().clone()
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationProcessor for Recorder {
    async fn started(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn process(&self, operation: &OfflineOperation) -> OperationOutcome {
        self.seen.lock().unwrap().push(operation.priority);
        (self.outcome)(operation)
    }
}

fn sync_error(operation: &OfflineOperation, kind: SyncErrorKind) -> SyncError {
    SyncError::new(operation.id, kind, format!("{kind} while syncing"))
}

fn conflict_for(operation: &OfflineOperation) -> SyncConflict {
    SyncConflict {
        operation_id: operation.id,
        resource_type: operation.resource_type,
        resource_id: operation.resource_id.clone(),
        client_data: operation.data().clone(),
        server_data: json!({"id": "p1", "title": "server"}),
        kind: ConflictKind::ConcurrentModification,
        strategy: ConflictStrategy::PromptUser,
        resolved_data: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_orders_higher_priority_first() {
    let queue = queue().await;
    for priority in [Priority::Low, Priority::High, Priority::Critical, Priority::Medium] {
        queue.enqueue(post(priority)).await.unwrap();
    }

    let order: Vec<_> = queue
        .pending(10)
        .await
        .unwrap()
        .into_iter()
        .map(|operation| operation.priority)
        .collect();
    assert_eq!(
        order,
        vec![
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn enqueue_mints_fresh_ids_without_dedup() {
    let queue = queue().await;
    let first = queue.enqueue(post(Priority::Low)).await.unwrap();
    let second = queue.enqueue(post(Priority::Low)).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(queue.pending(10).await.unwrap().len(), 2);
    let stored = queue.get(&first).await.unwrap().unwrap();
    assert_eq!(stored.max_retries, 3);
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_executes_in_priority_order() {
    let queue = queue().await;
    for priority in [Priority::Low, Priority::High, Priority::Critical] {
        queue.enqueue(post(priority)).await.unwrap();
    }

    let recorder = Recorder::completing();
    let options = ProcessOptions {
        concurrency: 1,
        ..ProcessOptions::default()
    };
    let processed = queue.process(&recorder, options).await.unwrap().unwrap();

    assert_eq!(
        recorder.seen(),
        vec![Priority::Critical, Priority::High, Priority::Low]
    );
    assert_eq!(processed.len(), 3);
    assert!(queue.pending(10).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausting_retries_moves_operation_to_failed() {
    let queue = queue().await;
    let id = queue
        .enqueue(post(Priority::Medium).with_max_retries(3))
        .await
        .unwrap();

    for attempt in 1..=3_u32 {
        assert_eq!(queue.pending(10).await.unwrap().len(), 1, "attempt {attempt}");
        let updated = queue.record_retry(&id, "timeout", false).await.unwrap();
        assert_eq!(updated.retry_count, attempt);
    }

    assert!(queue.pending(10).await.unwrap().is_empty());
    let failed = queue.failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].last_error.as_deref(), Some("timeout"));
}

#[tokio::test(flavor = "multi_thread")]
async fn rescheduling_is_monotonic_and_follows_backoff() {
    let queue = queue().await;
    let id = queue
        .enqueue(post(Priority::Medium).with_max_retries(10))
        .await
        .unwrap();

    let mut previous = queue.get(&id).await.unwrap().unwrap().scheduled_at;
    for retry in 1..=4_u32 {
        let before = now_millis();
        let updated = queue.record_retry(&id, "503", true).await.unwrap();
        assert!(updated.scheduled_at >= previous);

        let floor = 1_000_i64 << (retry - 1);
        assert!(updated.scheduled_at >= before + floor);
        assert!(updated.last_attempt_at.is_some());
        previous = updated.scheduled_at;
    }

    // Backed-off work is not eligible yet but still counts as pending
    assert!(queue.pending(10).await.unwrap().is_empty());
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn process_applies_each_outcome() {
    let queue = queue().await;
    let complete = queue.enqueue(post(Priority::Critical)).await.unwrap();
    let retry = queue.enqueue(post(Priority::High)).await.unwrap();
    let fail = queue.enqueue(post(Priority::Medium)).await.unwrap();
    let park = queue.enqueue(post(Priority::Low)).await.unwrap();

    let recorder = Recorder::with(move |operation| match operation.priority {
        Priority::Critical => OperationOutcome::Completed { conflict: None },
        Priority::High => OperationOutcome::Retry {
            error: sync_error(operation, SyncErrorKind::NetworkError),
        },
        Priority::Medium => OperationOutcome::Failed {
            error: sync_error(operation, SyncErrorKind::ValidationError),
        },
        Priority::Low => OperationOutcome::AwaitingDecision {
            conflict: conflict_for(operation),
        },
    });
    let processed = queue
        .process(&recorder, ProcessOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(processed.len(), 4);

    assert!(queue.get(&complete).await.unwrap().is_none());

    let retried = queue.get(&retry).await.unwrap().unwrap();
    assert_eq!(retried.retry_count, 1);
    assert!(retried.scheduled_at > retried.created_at);

    let failed = queue.failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, fail);
    let exhausted: Vec<_> = processed
        .iter()
        .filter(|entry| entry.exhausted)
        .map(|entry| entry.operation.id)
        .collect();
    assert_eq!(exhausted, vec![fail]);

    let parked = queue.awaiting_decision().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].id, park);
    assert_eq!(
        parked[0].conflict_snapshot,
        Some(json!({"id": "p1", "title": "server"}))
    );

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.awaiting_decision, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn release_returns_parked_operation_to_pending() {
    let queue = queue().await;
    let id = queue.enqueue(post(Priority::Medium)).await.unwrap();
    queue.park(&id, &json!({"title": "server"})).await.unwrap();
    assert!(queue.pending(10).await.unwrap().is_empty());

    let payload = OperationPayload::new(json!({"id": "p1", "title": "mine"}));
    queue
        .release(&id, &payload, Some(ConflictStrategy::ClientWins))
        .await
        .unwrap();

    let pending = queue.pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, payload);
    assert_eq!(
        pending[0].conflict_strategy,
        Some(ConflictStrategy::ClientWins)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_pulls_batches_until_empty() {
    let queue = queue().await;
    for _ in 0..5 {
        queue.enqueue(post(Priority::Medium)).await.unwrap();
    }

    let recorder = Recorder::completing();
    let options = ProcessOptions {
        batch_size: 2,
        ..ProcessOptions::default()
    };

    let single = queue.process(&recorder, options).await.unwrap().unwrap();
    assert_eq!(single.len(), 2);

    let drained = queue
        .process(&recorder, options.draining())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(drained.len(), 3);
    assert_eq!(queue.stats().await.unwrap().total, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn min_priority_filters_batch() {
    let queue = queue().await;
    for priority in [Priority::Low, Priority::Medium, Priority::High, Priority::Critical] {
        queue.enqueue(post(priority)).await.unwrap();
    }

    let recorder = Recorder::completing();
    let options = ProcessOptions {
        concurrency: 1,
        ..ProcessOptions::default()
    }
    .with_min_priority(Priority::High);
    queue.process(&recorder, options).await.unwrap().unwrap();

    assert_eq!(recorder.seen(), vec![Priority::Critical, Priority::High]);
    assert_eq!(queue.pending(10).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_weight_pending_by_priority() {
    let queue = queue().await;
    for priority in [Priority::Low, Priority::Critical, Priority::Critical] {
        queue.enqueue(post(priority)).await.unwrap();
    }

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.weighted_pending, 1 + 8 + 8);
    assert_eq!(stats.by_priority.get(&Priority::Critical), Some(&2));
    assert_eq!(stats.by_type.get(&ResourceType::Post), Some(&3));
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_and_clear() {
    let queue = queue().await;
    let id = queue.enqueue(post(Priority::Medium)).await.unwrap();
    queue.mark_failed(&id, "forbidden").await.unwrap();
    assert_eq!(queue.failed().await.unwrap().len(), 1);

    assert_eq!(queue.reset_failed().await.unwrap(), 1);
    assert_eq!(queue.pending(10).await.unwrap().len(), 1);

    assert_eq!(queue.clear().await.unwrap(), 1);
    assert!(!queue.remove(&id).await.unwrap());
}

/// Blocks inside `process` until released.
struct Gate {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl OperationProcessor for Gate {
    async fn process(&self, _operation: &OfflineOperation) -> OperationOutcome {
        self.entered.notify_one();
        self.release.notified().await;
        OperationOutcome::Completed { conflict: None }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_runs_are_coalesced() {
    let queue = Arc::new(queue().await);
    queue.enqueue(post(Priority::Medium)).await.unwrap();

    let gate = Arc::new(Gate {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let first = {
        let queue = queue.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            queue
                .process(gate.as_ref(), ProcessOptions::default())
                .await
        })
    };

    gate.entered.notified().await;
    assert!(queue.is_processing());
    let recorder = Recorder::completing();
    let overlapping = queue
        .process(&recorder, ProcessOptions::default())
        .await
        .unwrap();
    assert!(overlapping.is_none());
    assert_eq!(recorder.starts(), 0);

    gate.release.notify_one();
    let processed = first.await.unwrap().unwrap().unwrap();
    assert_eq!(processed.len(), 1);
    assert!(!queue.is_processing());

    // A run that owns the queue announces itself even with nothing to do
    let idle = queue
        .process(&recorder, ProcessOptions::default())
        .await
        .unwrap();
    assert_eq!(idle.map(|processed| processed.len()), Some(0));
    assert_eq!(recorder.starts(), 1);
}

/// Tracks how many operations are in flight at once.
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl OperationProcessor for Concurrency {
    async fn process(&self, _operation: &OfflineOperation) -> OperationOutcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        OperationOutcome::Completed { conflict: None }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fan_out_is_bounded() {
    let queue = queue().await;
    for _ in 0..8 {
        queue.enqueue(post(Priority::Medium)).await.unwrap();
    }

    let tracker = Concurrency {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    };
    let options = ProcessOptions {
        batch_size: 8,
        concurrency: 3,
        ..ProcessOptions::default()
    };
    let processed = queue.process(&tracker, options).await.unwrap().unwrap();

    assert_eq!(processed.len(), 8);
    assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
    assert!(tracker.peak.load(Ordering::SeqCst) >= 2);
}
