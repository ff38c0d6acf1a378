//! Sync policy configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use offsync_common::{Error, Result};

use crate::conflict::ConflictResolution;

/// Configuration for the sync engine, manager and cache.
///
/// Immutable for the lifetime of a session. Durations are stored as whole
/// seconds so config files stay human-editable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between automatic sync passes.
    pub sync_interval_secs: u64,
    /// Retryable failures tolerated before a record becomes FAILED.
    pub retry_attempts: u32,
    /// Records per batch.
    pub batch_size: usize,
    /// Concurrent remote calls; defaults to `batch_size`.
    pub max_in_flight: Option<usize>,
    /// Strategy applied to newly detected conflicts.
    pub conflict_resolution: ConflictResolution,
    /// Skip automatic passes unless on an unmetered network.
    pub sync_only_on_wifi: bool,
    /// Skip automatic passes unless the device is charging.
    pub sync_only_when_charging: bool,
    /// Deadline for a single remote call.
    pub request_timeout_secs: u64,
    /// Maximum number of cache entries.
    pub cache_capacity: usize,
    /// TTL for entries written by the engine and read-through helper.
    pub cache_ttl_secs: u64,
    /// Seconds between background cache sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 15 * 60,
            retry_attempts: 3,
            batch_size: 50,
            max_in_flight: None,
            conflict_resolution: ConflictResolution::ServerWins,
            sync_only_on_wifi: false,
            sync_only_when_charging: false,
            request_timeout_secs: 30,
            cache_capacity: 256,
            cache_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// Whole seconds, rounding any fraction up so a short duration never
/// becomes zero.
fn whole_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

impl SyncConfig {
    /// Set the automatic sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_secs = whole_secs(interval);
        self
    }

    /// Set the retry budget per record.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the in-flight limit.
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = Some(limit);
        self
    }

    /// Set the default conflict strategy.
    pub fn with_conflict_resolution(mut self, strategy: ConflictResolution) -> Self {
        self.conflict_resolution = strategy;
        self
    }

    /// Only auto-sync on wifi.
    pub fn with_wifi_only(mut self, wifi_only: bool) -> Self {
        self.sync_only_on_wifi = wifi_only;
        self
    }

    /// Only auto-sync while charging.
    pub fn with_charging_only(mut self, charging_only: bool) -> Self {
        self.sync_only_when_charging = charging_only;
        self
    }

    /// Set the per-call deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = whole_secs(timeout);
        self
    }

    /// Set cache capacity and TTL.
    pub fn with_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.cache_capacity = capacity;
        self.cache_ttl_secs = whole_secs(ttl);
        self
    }

    /// Set how often the background sweeper purges expired cache entries.
    pub fn with_sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval_secs = whole_secs(every);
        self
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Effective concurrent call limit.
    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight.unwrap_or(self.batch_size).max(1)
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    /// - Zero batch size, retry budget, in-flight limit, sync or sweep
    ///   interval, request timeout or cache capacity
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_in_flight == Some(0) {
            return Err(Error::InvalidInput(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(Error::InvalidInput(
                "sync_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::InvalidInput(
                "sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(Error::InvalidInput(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file, falling back to defaults if it doesn't exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).await?;
        Self::from_json(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.in_flight_limit(), config.batch_size);
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::default()
            .with_batch_size(2)
            .with_retry_attempts(5)
            .with_sync_interval(Duration::from_secs(10))
            .with_wifi_only(true);

        assert_eq!(config.batch_size, 2);
        assert_eq!(config.retry_attempts, 5);
        assert_eq!(config.sync_interval(), Duration::from_secs(10));
        assert!(config.sync_only_on_wifi);
        assert_eq!(config.in_flight_limit(), 2);
    }

    #[test]
    fn test_sub_second_durations_round_up() {
        let config = SyncConfig::default()
            .with_sync_interval(Duration::from_millis(500))
            .with_request_timeout(Duration::from_millis(1500))
            .with_sweep_interval(Duration::from_millis(1));

        assert_eq!(config.sync_interval(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), Duration::from_secs(2));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());

        let zero = SyncConfig::default().with_sync_interval(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let config = SyncConfig::default().with_batch_size(0);
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(r#"{"batch_size": 7, "conflict_resolution": "MERGE"}"#)
            .unwrap();
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.conflict_resolution, ConflictResolution::Merge);
        assert_eq!(config.retry_attempts, 3);
    }

    #[tokio::test]
    async fn test_load_missing_file_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = SyncConfig::load(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config, SyncConfig::default());
    }
}
