// ABOUTME: ManagerConfig and friends - every tunable the lock service reads.
// ABOUTME: Defaults match a single-process agency; TOML keys mirror field names.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::deadlock::ResolutionStrategy;
use crate::error::ConfigError;
use crate::lock::expiry_after;

/// Thresholds used to classify deadlock severity.
///
/// Priorities are 1 (most urgent) to 10 (least urgent). A cycle is `high`
/// when it is at least `high_cycle_len` agents long or any participant has
/// priority `<= high_priority_max`. A two-agent cycle whose participants
/// all have priority `>= low_priority_min` is `low`. Everything else is
/// `medium`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityPolicy {
    pub high_priority_max: u8,
    pub low_priority_min: u8,
    pub high_cycle_len: usize,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            high_priority_max: 3,
            low_priority_min: 6,
            high_cycle_len: 4,
        }
    }
}

/// Settings for the background deadlock monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    pub auto_resolve: bool,
    pub strategy: ResolutionStrategy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            auto_resolve: true,
            strategy: ResolutionStrategy::Priority,
        }
    }
}

impl MonitorConfig {
    /// Monitor period as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration for a `ConcurrencyService`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Capacity of the lock event log.
    pub history_size: usize,
    /// Capacity of the conflict history.
    pub conflict_history_size: usize,
    /// Timeout applied to queued requests that do not specify one.
    pub default_timeout_ms: u64,
    /// Soft lease applied to every grant that does not specify one.
    pub default_lease_ms: Option<u64>,
    /// Maximum waiters per resource. `None` means unbounded.
    pub max_queue_depth: Option<usize>,
    /// Undelivered messages buffered per live subscriber.
    pub subscriber_buffer: usize,
    /// Default N for analytics top lists.
    pub top_n: usize,
    pub monitor: MonitorConfig,
    pub severity: SeverityPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            history_size: 1_000,
            conflict_history_size: 1_000,
            default_timeout_ms: 30_000,
            default_lease_ms: None,
            max_queue_depth: None,
            subscriber_buffer: 256,
            top_n: 10,
            monitor: MonitorConfig::default(),
            severity: SeverityPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size == 0 {
            return Err(ConfigError::Invalid("history_size must be positive".into()));
        }
        if self.conflict_history_size == 0 {
            return Err(ConfigError::Invalid(
                "conflict_history_size must be positive".into(),
            ));
        }
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "subscriber_buffer must be positive".into(),
            ));
        }
        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.interval_ms must be positive".into(),
            ));
        }
        if self.max_queue_depth == Some(0) {
            return Err(ConfigError::Invalid(
                "max_queue_depth must be positive when set".into(),
            ));
        }
        let now = Instant::now();
        if now.checked_add(self.default_timeout()).is_none() {
            return Err(ConfigError::Invalid(
                "default_timeout_ms is out of range".into(),
            ));
        }
        if let Some(lease) = self.default_lease() {
            if expiry_after(Utc::now(), now, lease).is_none() {
                return Err(ConfigError::Invalid(
                    "default_lease_ms is out of range".into(),
                ));
            }
        }
        let severity = &self.severity;
        if !(1..=10).contains(&severity.high_priority_max)
            || !(1..=10).contains(&severity.low_priority_min)
        {
            return Err(ConfigError::Invalid(
                "severity thresholds must be priorities in 1..=10".into(),
            ));
        }
        if severity.high_priority_max >= severity.low_priority_min {
            return Err(ConfigError::Invalid(
                "severity.high_priority_max must be below severity.low_priority_min".into(),
            ));
        }
        if severity.high_cycle_len < 3 {
            return Err(ConfigError::Invalid(
                "severity.high_cycle_len must be at least 3".into(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn default_lease(&self) -> Option<Duration> {
        self.default_lease_ms.map(Duration::from_millis)
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn with_conflict_history_size(mut self, size: usize) -> Self {
        self.conflict_history_size = size;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_default_lease(mut self, lease: Duration) -> Self {
        self.default_lease_ms = Some(lease.as_millis() as u64);
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    pub fn with_subscriber_buffer(mut self, size: usize) -> Self {
        self.subscriber_buffer = size;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_severity(mut self, severity: SeverityPolicy) -> Self {
        self.severity = severity;
        self
    }
}
