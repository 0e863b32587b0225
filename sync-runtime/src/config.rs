//! # Engine Configuration Module
//!
//! Provides configuration management for the sync engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an
//! `EngineConfig` instance holding all tunable settings for the queue,
//! dispatcher, network monitor and conflict handling. It enforces fail-fast
//! validation so invalid settings are rejected before the engine starts.
//!
//! ## Usage
//!
//! ```rust
//! use sync_runtime::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .max_sync_attempts(3)
//!     .base_backoff_ms(250)
//!     .dispatch_fanout_limit(2)
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.max_sync_attempts, 3);
//! ```

use crate::error::{Error, Result};
use std::time::Duration;

/// Configuration for the sync engine.
///
/// Use [`EngineConfigBuilder`] to construct instances; the defaults are
/// suitable for an interactive task manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum dispatch attempts before an item is marked terminally failed.
    pub max_sync_attempts: u32,

    /// Initial retry backoff in milliseconds; doubles with each failed attempt.
    pub base_backoff_ms: u64,

    /// Upper bound on the computed backoff delay in milliseconds.
    pub backoff_ceiling_ms: u64,

    /// Maximum number of concurrent dispatch attempts per cycle.
    pub dispatch_fanout_limit: usize,

    /// Consecutive dispatch failures (while the link is up) before the
    /// network status degrades.
    pub degraded_failure_threshold: u32,

    /// Timeout applied to an active connectivity probe, in milliseconds.
    pub network_probe_timeout_ms: u64,

    /// Timeout for a single dispatch attempt when the network is `Online`,
    /// in milliseconds.
    pub attempt_timeout_ms: u64,

    /// Timeout for a single dispatch attempt when the network is `Degraded`,
    /// in milliseconds. Degraded links are slow, not dead, so this is
    /// typically a multiple of `attempt_timeout_ms`.
    pub degraded_attempt_timeout_ms: u64,

    /// Interval between periodic dispatch cycles, in seconds.
    pub sync_interval_secs: u64,

    /// How long synced items are retained before pruning, in seconds.
    pub synced_retention_secs: u64,

    /// Buffer size of the broadcast event channel.
    pub event_buffer_size: usize,
}

impl EngineConfig {
    /// Creates a new builder for constructing an `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Attempt, backoff, fanout and threshold values are non-zero
    /// - The backoff ceiling is not below the base backoff
    /// - Timeouts are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.max_sync_attempts == 0 {
            return Err(Error::Config(
                "max_sync_attempts must be greater than 0".to_string(),
            ));
        }

        if self.base_backoff_ms == 0 {
            return Err(Error::Config(
                "base_backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.backoff_ceiling_ms < self.base_backoff_ms {
            return Err(Error::Config(format!(
                "backoff_ceiling_ms ({}) must not be below base_backoff_ms ({})",
                self.backoff_ceiling_ms, self.base_backoff_ms
            )));
        }

        if self.dispatch_fanout_limit == 0 {
            return Err(Error::Config(
                "dispatch_fanout_limit must be greater than 0".to_string(),
            ));
        }

        if self.degraded_failure_threshold == 0 {
            return Err(Error::Config(
                "degraded_failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.network_probe_timeout_ms == 0 || self.attempt_timeout_ms == 0 {
            return Err(Error::Config(
                "timeouts must be greater than 0ms".to_string(),
            ));
        }

        if self.degraded_attempt_timeout_ms < self.attempt_timeout_ms {
            return Err(Error::Config(format!(
                "degraded_attempt_timeout_ms ({}) must not be below attempt_timeout_ms ({})",
                self.degraded_attempt_timeout_ms, self.attempt_timeout_ms
            )));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "event_buffer_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Probe timeout as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.network_probe_timeout_ms)
    }

    /// Per-attempt timeout for the given degraded flag.
    pub fn attempt_timeout(&self, degraded: bool) -> Duration {
        if degraded {
            Duration::from_millis(self.degraded_attempt_timeout_ms)
        } else {
            Duration::from_millis(self.attempt_timeout_ms)
        }
    }

    /// Interval between periodic dispatch cycles.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sync_attempts: 5,
            base_backoff_ms: 500,
            backoff_ceiling_ms: 60_000,
            dispatch_fanout_limit: 4,
            degraded_failure_threshold: 3,
            network_probe_timeout_ms: 3_000,
            attempt_timeout_ms: 10_000,
            degraded_attempt_timeout_ms: 30_000,
            sync_interval_secs: 60,
            synced_retention_secs: 3_600,
            event_buffer_size: 100,
        }
    }
}

/// Builder for constructing [`EngineConfig`] instances.
///
/// Unset fields fall back to the defaults; `build()` runs validation and
/// rejects inconsistent settings with an actionable message.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    max_sync_attempts: Option<u32>,
    base_backoff_ms: Option<u64>,
    backoff_ceiling_ms: Option<u64>,
    dispatch_fanout_limit: Option<usize>,
    degraded_failure_threshold: Option<u32>,
    network_probe_timeout_ms: Option<u64>,
    attempt_timeout_ms: Option<u64>,
    degraded_attempt_timeout_ms: Option<u64>,
    sync_interval_secs: Option<u64>,
    synced_retention_secs: Option<u64>,
    event_buffer_size: Option<usize>,
}

impl EngineConfigBuilder {
    /// Sets the maximum dispatch attempts per item.
    pub fn max_sync_attempts(mut self, attempts: u32) -> Self {
        self.max_sync_attempts = Some(attempts);
        self
    }

    /// Sets the initial retry backoff in milliseconds.
    pub fn base_backoff_ms(mut self, ms: u64) -> Self {
        self.base_backoff_ms = Some(ms);
        self
    }

    /// Sets the upper bound on the retry backoff in milliseconds.
    pub fn backoff_ceiling_ms(mut self, ms: u64) -> Self {
        self.backoff_ceiling_ms = Some(ms);
        self
    }

    /// Sets the maximum number of concurrent dispatch attempts.
    pub fn dispatch_fanout_limit(mut self, limit: usize) -> Self {
        self.dispatch_fanout_limit = Some(limit);
        self
    }

    /// Sets the consecutive-failure threshold for the `Degraded` status.
    pub fn degraded_failure_threshold(mut self, threshold: u32) -> Self {
        self.degraded_failure_threshold = Some(threshold);
        self
    }

    /// Sets the connectivity probe timeout in milliseconds.
    pub fn network_probe_timeout_ms(mut self, ms: u64) -> Self {
        self.network_probe_timeout_ms = Some(ms);
        self
    }

    /// Sets the per-attempt timeout (online) in milliseconds.
    pub fn attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.attempt_timeout_ms = Some(ms);
        self
    }

    /// Sets the per-attempt timeout (degraded) in milliseconds.
    pub fn degraded_attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.degraded_attempt_timeout_ms = Some(ms);
        self
    }

    /// Sets the periodic dispatch interval in seconds.
    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.sync_interval_secs = Some(secs);
        self
    }

    /// Sets the retention window for synced items in seconds.
    pub fn synced_retention_secs(mut self, secs: u64) -> Self {
        self.synced_retention_secs = Some(secs);
        self
    }

    /// Sets the broadcast event channel buffer size.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final [`EngineConfig`], validating all settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] with an actionable message when a setting
    /// is zero where it must not be, or when the backoff ceiling or the
    /// degraded timeout is below its respective base value.
    pub fn build(self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();

        let config = EngineConfig {
            max_sync_attempts: self.max_sync_attempts.unwrap_or(defaults.max_sync_attempts),
            base_backoff_ms: self.base_backoff_ms.unwrap_or(defaults.base_backoff_ms),
            backoff_ceiling_ms: self
                .backoff_ceiling_ms
                .unwrap_or(defaults.backoff_ceiling_ms),
            dispatch_fanout_limit: self
                .dispatch_fanout_limit
                .unwrap_or(defaults.dispatch_fanout_limit),
            degraded_failure_threshold: self
                .degraded_failure_threshold
                .unwrap_or(defaults.degraded_failure_threshold),
            network_probe_timeout_ms: self
                .network_probe_timeout_ms
                .unwrap_or(defaults.network_probe_timeout_ms),
            attempt_timeout_ms: self.attempt_timeout_ms.unwrap_or(defaults.attempt_timeout_ms),
            degraded_attempt_timeout_ms: self
                .degraded_attempt_timeout_ms
                .unwrap_or(defaults.degraded_attempt_timeout_ms),
            sync_interval_secs: self.sync_interval_secs.unwrap_or(defaults.sync_interval_secs),
            synced_retention_secs: self
                .synced_retention_secs
                .unwrap_or(defaults.synced_retention_secs),
            event_buffer_size: self.event_buffer_size.unwrap_or(defaults.event_buffer_size),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_sync_attempts, 5);
        assert_eq!(config.base_backoff_ms, 500);
        assert_eq!(config.degraded_failure_threshold, 3);
        assert_eq!(config.dispatch_fanout_limit, 4);
    }

    #[test]
    fn test_builder_overrides_defaults() {
        let config = EngineConfig::builder()
            .max_sync_attempts(3)
            .base_backoff_ms(250)
            .backoff_ceiling_ms(8_000)
            .build()
            .unwrap();

        assert_eq!(config.max_sync_attempts, 3);
        assert_eq!(config.base_backoff_ms, 250);
        assert_eq!(config.backoff_ceiling_ms, 8_000);
        // Unset fields keep the defaults
        assert_eq!(config.dispatch_fanout_limit, 4);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = EngineConfig::builder().max_sync_attempts(0).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_fanout_rejected() {
        let result = EngineConfig::builder().dispatch_fanout_limit(0).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_ceiling_below_base_rejected() {
        let result = EngineConfig::builder()
            .base_backoff_ms(1_000)
            .backoff_ceiling_ms(500)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_degraded_timeout_below_online_timeout_rejected() {
        let result = EngineConfig::builder()
            .attempt_timeout_ms(10_000)
            .degraded_attempt_timeout_ms(5_000)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_duration_helpers() {
        let config = EngineConfig::default();
        assert_eq!(config.probe_timeout(), Duration::from_millis(3_000));
        assert_eq!(config.attempt_timeout(false), Duration::from_millis(10_000));
        assert_eq!(config.attempt_timeout(true), Duration::from_millis(30_000));
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
    }
}
