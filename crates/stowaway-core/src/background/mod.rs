//! Decides when sync work runs.
//!
//! A periodic loop syncs every `sync_interval` while auto-sync is enabled
//! (twice that while the app is backgrounded). Platform background triggers
//! run a High/Critical-only pass at most once per `background_min_interval`.
//! Scheduled tasks run when due; urgent ones run immediately while online and
//! every due task runs, highest priority first, when the network returns.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfiguration;
use crate::error::{Error, Result};
use crate::models::{Priority, SyncResult};
use crate::network::NetworkMonitor;
use crate::util::now_millis;

/// Runs sync passes on behalf of the scheduler.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    /// One full pass over pending operations.
    async fn run_sync(&self) -> Result<SyncResult>;

    /// One pass restricted to operations at or above `min_priority`.
    async fn run_priority_sync(&self, min_priority: Priority) -> Result<SyncResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    #[default]
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What a scheduled task does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    FullSync,
    PrioritySync { min_priority: Priority },
}

/// Request to run sync work later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBackgroundTask {
    pub action: TaskAction,
    pub priority: Priority,
    /// Earliest run time (Unix ms); `None` means now
    pub scheduled_at: Option<i64>,
}

impl NewBackgroundTask {
    pub const fn new(action: TaskAction, priority: Priority) -> Self {
        Self {
            action,
            priority,
            scheduled_at: None,
        }
    }

    #[must_use]
    pub const fn at(mut self, scheduled_at: i64) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundTask {
    pub id: TaskId,
    pub action: TaskAction,
    pub priority: Priority,
    pub scheduled_at: i64,
    pub created_at: i64,
}

/// Counters describing scheduler activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackgroundStats {
    pub running: bool,
    pub app_state: AppState,
    pub current_interval_ms: u64,
    pub scheduled_tasks: usize,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    /// Runs refused because sync was offline or paused
    pub skipped_runs: u64,
    /// Platform triggers ignored by throttling or the Wi-Fi rule
    pub skipped_triggers: u64,
    pub last_run_at: Option<i64>,
    pub next_run_at: Option<i64>,
}

struct ServiceState {
    config: SyncConfiguration,
    app_state: AppState,
    tasks: Vec<BackgroundTask>,
    next_task_id: u64,
    last_trigger_at: Option<i64>,
    worker: Option<(CancellationToken, JoinHandle<()>)>,
    stats: BackgroundStats,
}

impl ServiceState {
    fn interval(&self) -> Duration {
        let base = self.config.sync_interval();
        match self.app_state {
            AppState::Foreground => base,
            AppState::Background => base.saturating_mul(2),
        }
    }

    /// Remove and return due tasks, highest priority first, then oldest.
    fn take_due(&mut self, now: i64) -> Vec<BackgroundTask> {
        let (mut due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|task| task.scheduled_at <= now);
        self.tasks = waiting;
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });
        due
    }
}

struct Inner {
    runner: Arc<dyn SyncRunner>,
    network: Arc<dyn NetworkMonitor>,
    state: Mutex<ServiceState>,
    reschedule: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, outcome: &Result<SyncResult>) {
        let mut state = self.state();
        let stats = &mut state.stats;
        stats.total_runs += 1;
        stats.last_run_at = Some(now_millis());
        match outcome {
            Ok(result) if result.success => stats.successful_runs += 1,
            Ok(_) => stats.failed_runs += 1,
            Err(Error::Offline | Error::SyncPaused) => stats.skipped_runs += 1,
            Err(error) => {
                stats.failed_runs += 1;
                tracing::warn!("Background sync failed: {}", error);
            }
        }
    }

    async fn run_action(&self, action: TaskAction) -> Result<SyncResult> {
        let outcome = match action {
            TaskAction::FullSync => self.runner.run_sync().await,
            TaskAction::PrioritySync { min_priority } => {
                self.runner.run_priority_sync(min_priority).await
            }
        };
        self.record(&outcome);
        outcome
    }

    /// Run every due task; returns whether one of them was a full sync.
    async fn run_due_tasks(&self) -> bool {
        let due = self.state().take_due(now_millis());
        let mut full_sync = false;
        for task in due {
            tracing::debug!("Running {} ({} priority)", task.id, task.priority);
            full_sync |= task.action == TaskAction::FullSync;
            // Failures are counted in the stats and must not stop later tasks.
            let _ = self.run_action(task.action).await;
        }
        full_sync
    }

    async fn tick(&self) {
        if !self.network.is_online() {
            tracing::debug!("Skipping periodic sync while offline");
            return;
        }
        if !self.run_due_tasks().await {
            let _ = self.run_action(TaskAction::FullSync).await;
        }
    }
}

async fn run_loop(inner: Arc<Inner>, token: CancellationToken) {
    loop {
        let interval = {
            let mut state = inner.state();
            let interval = state.interval();
            let millis = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
            state.stats.next_run_at = Some(now_millis().saturating_add(millis));
            interval
        };

        tokio::select! {
            () = token.cancelled() => break,
            () = inner.reschedule.notified() => continue,
            () = tokio::time::sleep(interval) => {}
        }
        inner.tick().await;
    }
    inner.state().stats.next_run_at = None;
    tracing::debug!("Background sync loop stopped");
}

/// Lifecycle- and network-aware sync scheduler.
#[derive(Clone)]
pub struct BackgroundSyncService {
    inner: Arc<Inner>,
}

impl BackgroundSyncService {
    pub fn new(
        runner: Arc<dyn SyncRunner>,
        network: Arc<dyn NetworkMonitor>,
        config: &SyncConfiguration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                network,
                state: Mutex::new(ServiceState {
                    config: config.clone(),
                    app_state: AppState::Foreground,
                    tasks: Vec::new(),
                    next_task_id: 1,
                    last_trigger_at: None,
                    worker: None,
                    stats: BackgroundStats::default(),
                }),
                reschedule: Notify::new(),
            }),
        }
    }

    /// Start the periodic loop if auto-sync is enabled. Idempotent.
    pub fn start(&self) {
        let mut state = self.inner.state();
        if state.worker.is_some() || !state.config.auto_sync_enabled {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(Arc::clone(&self.inner), token.clone()));
        state.worker = Some((token, handle));
        tracing::info!(
            "Background sync started (every {} ms)",
            state.interval().as_millis()
        );
    }

    /// Stop the periodic loop and wait for it to finish.
    pub async fn stop(&self) {
        let worker = self.inner.state().worker.take();
        if let Some((token, handle)) = worker {
            token.cancel();
            if let Err(error) = handle.await {
                tracing::warn!("Background sync loop ended abnormally: {}", error);
            }
            tracing::info!("Background sync stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().worker.is_some()
    }

    /// Backgrounded apps sync at half the foreground rate.
    pub fn set_app_state(&self, app_state: AppState) {
        let changed = {
            let mut state = self.inner.state();
            let changed = state.app_state != app_state;
            state.app_state = app_state;
            changed
        };
        if changed {
            tracing::debug!("App state changed to {:?}", app_state);
            self.inner.reschedule.notify_one();
        }
    }

    /// Apply a new configuration, restarting the loop when auto-sync flips.
    pub async fn update_configuration(&self, config: &SyncConfiguration) {
        let was_enabled = {
            let mut state = self.inner.state();
            let was_enabled = state.config.auto_sync_enabled;
            state.config = config.clone();
            was_enabled
        };
        match (was_enabled, config.auto_sync_enabled) {
            (false, true) => self.start(),
            (true, false) => self.stop().await,
            _ => self.inner.reschedule.notify_one(),
        }
    }

    /// Schedule work. Urgent work that is already due runs right away when
    /// online.
    pub async fn schedule_task(&self, task: NewBackgroundTask) -> TaskId {
        let now = now_millis();
        let scheduled = BackgroundTask {
            id: {
                let mut state = self.inner.state();
                let id = TaskId(state.next_task_id);
                state.next_task_id += 1;
                id
            },
            action: task.action,
            priority: task.priority,
            scheduled_at: task.scheduled_at.unwrap_or(now),
            created_at: now,
        };
        let id = scheduled.id;

        let due = scheduled.scheduled_at <= now;
        if due && scheduled.priority.is_urgent() && self.inner.network.is_online() {
            tracing::debug!("Running urgent {} immediately", id);
            let _ = self.inner.run_action(scheduled.action).await;
            return id;
        }

        let mut state = self.inner.state();
        state.tasks.push(scheduled);
        state.stats.scheduled_tasks = state.tasks.len();
        id
    }

    pub fn cancel_task(&self, id: TaskId) -> bool {
        let mut state = self.inner.state();
        let before = state.tasks.len();
        state.tasks.retain(|task| task.id != id);
        state.stats.scheduled_tasks = state.tasks.len();
        state.tasks.len() != before
    }

    pub fn scheduled_tasks(&self) -> Vec<BackgroundTask> {
        self.inner.state().tasks.clone()
    }

    /// React to connectivity changes: on reconnect run due tasks, then sync.
    pub async fn handle_network_change(&self, online: bool) {
        if !online {
            return;
        }
        tracing::info!("Network restored, running due sync work");
        let ran_full_sync = self.inner.run_due_tasks().await;
        let auto_sync = self.inner.state().config.auto_sync_enabled;
        if auto_sync && !ran_full_sync {
            let _ = self.inner.run_action(TaskAction::FullSync).await;
        }
    }

    /// Platform background trigger: a throttled High/Critical-only pass.
    ///
    /// Returns `None` when the trigger was skipped.
    pub async fn handle_background_trigger(&self) -> Option<Result<SyncResult>> {
        let now = now_millis();
        let network = self.inner.network.current_status();
        {
            let mut state = self.inner.state();
            let min_period =
                i64::try_from(state.config.background_min_interval_ms).unwrap_or(i64::MAX);
            let throttled = state
                .last_trigger_at
                .is_some_and(|last| now.saturating_sub(last) < min_period);
            let off_wifi = state.config.wifi_only_in_background && !network.is_wifi();
            if throttled || off_wifi || !network.is_online() {
                state.stats.skipped_triggers += 1;
                tracing::debug!(
                    "Skipping background trigger (throttled={}, off_wifi={}, online={})",
                    throttled,
                    off_wifi,
                    network.is_online()
                );
                return None;
            }
            state.last_trigger_at = Some(now);
        }

        Some(
            self.inner
                .run_action(TaskAction::PrioritySync {
                    min_priority: Priority::High,
                })
                .await,
        )
    }

    /// Run a full pass now, regardless of the timer.
    pub async fn force_sync_now(&self) -> Result<SyncResult> {
        self.inner.run_action(TaskAction::FullSync).await
    }

    pub fn stats(&self) -> BackgroundStats {
        let state = self.inner.state();
        BackgroundStats {
            running: state.worker.is_some(),
            app_state: state.app_state,
            current_interval_ms: u64::try_from(state.interval().as_millis()).unwrap_or(u64::MAX),
            scheduled_tasks: state.tasks.len(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionType, ManualNetworkMonitor};
    use crate::test_support::{eventually, init_tracing};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct CountingRunner {
        calls: Mutex<Vec<Option<Priority>>>,
    }

    impl CountingRunner {
        fn calls(&self) -> Vec<Option<Priority>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncRunner for CountingRunner {
        async fn run_sync(&self) -> Result<SyncResult> {
            self.calls.lock().unwrap().push(None);
            Ok(SyncResult {
                success: true,
                ..SyncResult::default()
            })
        }

        async fn run_priority_sync(&self, min_priority: Priority) -> Result<SyncResult> {
            self.calls.lock().unwrap().push(Some(min_priority));
            Ok(SyncResult {
                success: true,
                ..SyncResult::default()
            })
        }
    }

    fn service(
        config: SyncConfiguration,
    ) -> (BackgroundSyncService, Arc<CountingRunner>, Arc<ManualNetworkMonitor>) {
        init_tracing();
        let runner = Arc::new(CountingRunner::default());
        let network = Arc::new(ManualNetworkMonitor::default());
        let service = BackgroundSyncService::new(runner.clone(), network.clone(), &config);
        (service, runner, network)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_loop_runs_until_stopped() {
        let (service, runner, _network) = service(SyncConfiguration {
            sync_interval_ms: 20,
            ..SyncConfiguration::default()
        });
        service.start();
        service.start();
        assert!(service.is_running());

        let counted = &runner;
        assert!(eventually(|| async move { counted.calls().len() >= 3 }).await);
        service.stop().await;
        assert!(!service.is_running());

        let after_stop = runner.calls().len();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runner.calls().len(), after_stop);
        assert!(runner.calls().iter().all(Option::is_none));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn does_not_start_without_auto_sync() {
        let (service, _runner, _network) = service(SyncConfiguration {
            auto_sync_enabled: false,
            ..SyncConfiguration::default()
        });
        service.start();
        assert!(!service.is_running());

        service
            .update_configuration(&SyncConfiguration::default())
            .await;
        assert!(service.is_running());
        service
            .update_configuration(&SyncConfiguration {
                auto_sync_enabled: false,
                ..SyncConfiguration::default()
            })
            .await;
        assert!(!service.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backgrounding_doubles_the_interval() {
        let (service, _runner, _network) = service(SyncConfiguration {
            sync_interval_ms: 60_000,
            ..SyncConfiguration::default()
        });
        assert_eq!(service.stats().current_interval_ms, 60_000);

        service.set_app_state(AppState::Background);
        assert_eq!(service.stats().current_interval_ms, 120_000);
        assert_eq!(service.stats().app_state, AppState::Background);

        service.set_app_state(AppState::Foreground);
        assert_eq!(service.stats().current_interval_ms, 60_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_trigger_is_throttled_and_filtered() {
        let (service, runner, _network) = service(SyncConfiguration::default());

        assert!(service.handle_background_trigger().await.is_some());
        assert!(service.handle_background_trigger().await.is_none());
        assert_eq!(runner.calls(), vec![Some(Priority::High)]);
        assert_eq!(service.stats().skipped_triggers, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_trigger_respects_wifi_only() {
        let (service, runner, network) = service(SyncConfiguration {
            wifi_only_in_background: true,
            ..SyncConfiguration::default()
        });
        network.set_online(ConnectionType::Cellular);

        assert!(service.handle_background_trigger().await.is_none());
        assert!(runner.calls().is_empty());

        network.set_online(ConnectionType::Wifi);
        assert!(service.handle_background_trigger().await.is_some());
        assert_eq!(runner.calls(), vec![Some(Priority::High)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn urgent_tasks_run_immediately_when_online() {
        let (service, runner, _network) = service(SyncConfiguration::default());

        service
            .schedule_task(NewBackgroundTask::new(
                TaskAction::PrioritySync {
                    min_priority: Priority::Critical,
                },
                Priority::Critical,
            ))
            .await;
        assert_eq!(runner.calls(), vec![Some(Priority::Critical)]);

        let later = service
            .schedule_task(NewBackgroundTask::new(TaskAction::FullSync, Priority::Low))
            .await;
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(service.stats().scheduled_tasks, 1);

        assert!(service.cancel_task(later));
        assert!(!service.cancel_task(later));
        assert!(service.scheduled_tasks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn urgent_tasks_wait_for_their_scheduled_time() {
        let (service, runner, _network) = service(SyncConfiguration::default());

        let deferred = service
            .schedule_task(
                NewBackgroundTask::new(
                    TaskAction::PrioritySync {
                        min_priority: Priority::High,
                    },
                    Priority::High,
                )
                .at(now_millis() + 3_600_000),
            )
            .await;

        assert!(runner.calls().is_empty());
        assert_eq!(
            service
                .scheduled_tasks()
                .iter()
                .map(|task| task.id)
                .collect::<Vec<_>>(),
            vec![deferred]
        );
        assert_eq!(service.stats().scheduled_tasks, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_runs_due_tasks_by_priority() {
        let (service, runner, network) = service(SyncConfiguration::default());
        network.set_offline();

        let past = now_millis() - 1_000;
        for priority in [Priority::Low, Priority::Critical, Priority::Medium] {
            service
                .schedule_task(
                    NewBackgroundTask::new(
                        TaskAction::PrioritySync {
                            min_priority: priority,
                        },
                        priority,
                    )
                    .at(past),
                )
                .await;
        }
        let future = service
            .schedule_task(
                NewBackgroundTask::new(TaskAction::FullSync, Priority::High)
                    .at(now_millis() + 3_600_000),
            )
            .await;
        assert!(runner.calls().is_empty());

        network.set_online(ConnectionType::Wifi);
        service.handle_network_change(true).await;

        assert_eq!(
            runner.calls(),
            vec![
                Some(Priority::Critical),
                Some(Priority::Medium),
                Some(Priority::Low),
                None,
            ]
        );
        assert_eq!(
            service
                .scheduled_tasks()
                .iter()
                .map(|task| task.id)
                .collect::<Vec<_>>(),
            vec![future]
        );
        assert_eq!(service.stats().total_runs, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_sync_runs_a_full_pass() {
        let (service, runner, _network) = service(SyncConfiguration::default());
        let result = service.force_sync_now().await.unwrap();
        assert!(result.success);
        assert_eq!(runner.calls(), vec![None]);
        assert_eq!(service.stats().successful_runs, 1);
        assert!(service.stats().last_run_at.is_some());
    }
}
