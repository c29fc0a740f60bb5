//! Sync policy configuration.
//!
//! A `SyncConfiguration` is supplied when the engine is constructed and is
//! only replaced through an explicit `SyncConfigurationUpdate`. Every
//! component reads its knobs from here: queue batch size and backoff curve,
//! fan-out limits, storage quota, and default conflict strategies.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ConflictStrategy, Priority, ResourceType, DEFAULT_MAX_RETRIES};

const DEFAULT_SYNC_INTERVAL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 500 * 1024 * 1024;
const DEFAULT_CONCURRENCY: usize = 3;
const DEFAULT_BACKGROUND_MIN_INTERVAL_MS: u64 = 15_000;

/// Exponential backoff curve for retried operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay
    pub max_delay_ms: u64,
    /// Maximum jitter as a fraction of the delay, in `[0, 1)`
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 5 * 60 * 1000,
            jitter_ratio: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay for the given retry count (1-indexed).
    ///
    /// `min(base * multiplier^(retry_count - 1), max)`
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry_count - 1).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped as u64)
    }

    /// Delay for the given retry count including up to `jitter_ratio` random jitter.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let base = self.base_delay(retry_count);
        if self.jitter_ratio <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..self.jitter_ratio);
        base + base.mul_f64(jitter)
    }
}

/// Relative weight of each priority level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityWeights {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            low: 1,
            medium: 2,
            high: 4,
            critical: 8,
        }
    }
}

impl PriorityWeights {
    pub const fn weight(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Low => self.low,
            Priority::Medium => self.medium,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }
}

/// Per-session sync policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfiguration {
    /// Run periodic background sync
    pub auto_sync_enabled: bool,
    /// Periodic sync interval in the foreground
    pub sync_interval_ms: u64,
    /// Operations pulled per batch
    pub batch_size: usize,
    /// Default retry ceiling for new operations
    pub max_retries: u32,
    /// Retry backoff curve
    pub backoff: BackoffPolicy,
    /// Bytes of downloaded content allowed on disk
    pub storage_quota_bytes: u64,
    /// Weight of each priority level
    pub priority_weights: PriorityWeights,
    /// Default conflict strategy per resource type
    pub conflict_strategies: BTreeMap<ResourceType, ConflictStrategy>,
    /// Operations in flight at once within a batch
    pub operation_concurrency: usize,
    /// Downloads in flight at once
    pub max_concurrent_downloads: usize,
    /// Skip platform background triggers when not on Wi-Fi
    pub wifi_only_in_background: bool,
    /// Minimum period between platform background triggers
    pub background_min_interval_ms: u64,
}

impl Default for SyncConfiguration {
    fn default() -> Self {
        Self {
            auto_sync_enabled: true,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            storage_quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
            priority_weights: PriorityWeights::default(),
            conflict_strategies: BTreeMap::from([
                (ResourceType::UserProfile, ConflictStrategy::Merge),
                (ResourceType::Post, ConflictStrategy::Merge),
            ]),
            operation_concurrency: DEFAULT_CONCURRENCY,
            max_concurrent_downloads: DEFAULT_CONCURRENCY,
            wifi_only_in_background: false,
            background_min_interval_ms: DEFAULT_BACKGROUND_MIN_INTERVAL_MS,
        }
    }
}

impl SyncConfiguration {
    /// Parse a configuration from JSON; missing fields take defaults.
    pub fn from_json_str(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or overload the engine.
    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_ms == 0 {
            return Err(Error::InvalidInput(
                "sync_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.operation_concurrency == 0 || self.max_concurrent_downloads == 0 {
            return Err(Error::InvalidInput(
                "concurrency limits must be greater than zero".to_string(),
            ));
        }
        if !(self.backoff.multiplier >= 1.0) {
            return Err(Error::InvalidInput(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter_ratio) {
            return Err(Error::InvalidInput(
                "backoff jitter_ratio must be in [0, 1)".to_string(),
            ));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(Error::InvalidInput(
                "backoff max_delay_ms must not be below base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub const fn background_min_interval(&self) -> Duration {
        Duration::from_millis(self.background_min_interval_ms)
    }

    /// Apply a partial update, validating the result before committing it.
    pub fn apply(&mut self, update: SyncConfigurationUpdate) -> Result<()> {
        let mut next = self.clone();
        if let Some(value) = update.auto_sync_enabled {
            next.auto_sync_enabled = value;
        }
        if let Some(value) = update.sync_interval_ms {
            next.sync_interval_ms = value;
        }
        if let Some(value) = update.batch_size {
            next.batch_size = value;
        }
        if let Some(value) = update.max_retries {
            next.max_retries = value;
        }
        if let Some(value) = update.backoff {
            next.backoff = value;
        }
        if let Some(value) = update.storage_quota_bytes {
            next.storage_quota_bytes = value;
        }
        if let Some(value) = update.priority_weights {
            next.priority_weights = value;
        }
        if let Some(value) = update.conflict_strategies {
            next.conflict_strategies.extend(value);
        }
        if let Some(value) = update.operation_concurrency {
            next.operation_concurrency = value;
        }
        if let Some(value) = update.max_concurrent_downloads {
            next.max_concurrent_downloads = value;
        }
        if let Some(value) = update.wifi_only_in_background {
            next.wifi_only_in_background = value;
        }
        if let Some(value) = update.background_min_interval_ms {
            next.background_min_interval_ms = value;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Partial configuration change; `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfigurationUpdate {
    pub auto_sync_enabled: Option<bool>,
    pub sync_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub storage_quota_bytes: Option<u64>,
    pub priority_weights: Option<PriorityWeights>,
    /// Merged into the existing per-type map
    pub conflict_strategies: Option<BTreeMap<ResourceType, ConflictStrategy>>,
    pub operation_concurrency: Option<usize>,
    pub max_concurrent_downloads: Option<usize>,
    pub wifi_only_in_background: Option<bool>,
    pub background_min_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_matches_documented_bounds() {
        let policy = BackoffPolicy::default();
        for (retry, low) in [(1_u32, 1_000_u64), (2, 2_000), (3, 4_000)] {
            for _ in 0..50 {
                let delay = u64::try_from(policy.delay(retry).as_millis()).unwrap();
                assert!(delay >= low, "retry {retry}: {delay} < {low}");
                assert!(delay < low + low / 10, "retry {retry}: {delay} too large");
            }
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(20), Duration::from_millis(300_000));
        assert_eq!(policy.base_delay(0), Duration::ZERO);
    }

    #[test]
    fn parse_fills_defaults() {
        let config = SyncConfiguration::from_json_str(r#"{"batch_size": 25}"#).unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.operation_concurrency, 3);
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(
            config.conflict_strategies.get(&ResourceType::Post),
            Some(&ConflictStrategy::Merge)
        );
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let error = SyncConfiguration::from_json_str(r#"{"batchSize": 25}"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn parse_reads_strategy_map() {
        let config = SyncConfiguration::from_json_str(
            r#"{"conflict_strategies": {"comment": "server_wins"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.conflict_strategies.get(&ResourceType::Comment),
            Some(&ConflictStrategy::ServerWins)
        );
    }

    #[test]
    fn apply_rejects_invalid_update_and_keeps_previous() {
        let mut config = SyncConfiguration::default();
        let error = config
            .apply(SyncConfigurationUpdate {
                batch_size: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(error.to_string().contains("batch_size"));
        assert_eq!(config.batch_size, 10);

        config
            .apply(SyncConfigurationUpdate {
                sync_interval_ms: Some(1_000),
                conflict_strategies: Some(BTreeMap::from([(
                    ResourceType::Message,
                    ConflictStrategy::ClientWins,
                )])),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.sync_interval(), Duration::from_secs(1));
        assert_eq!(config.conflict_strategies.len(), 3);
    }

    #[test]
    fn priority_weights_lookup() {
        let weights = PriorityWeights::default();
        assert_eq!(weights.weight(Priority::Low), 1);
        assert_eq!(weights.weight(Priority::Critical), 8);
    }
}
