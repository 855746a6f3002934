//! Tracker configuration.
//!
//! These structures define the configurable aspects of a worker's allocator:
//! reclamation behavior, the emulated host memory budget, and the optional
//! background reclaim task.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    BACKGROUND_RECLAIM_THRESHOLD, DEFAULT_MEMORY_BUDGET, DEFAULT_RECLAMATION_STEP, SEGMENT_SIZE,
};

/// Configuration for a worker's tracker.
///
/// # Example
///
/// ```rust
/// use logmem_common::config::TrackerConfig;
///
/// let config = TrackerConfig::default();
/// assert_eq!(config.lsa_reclamation_step, 1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Enable the idle compactor: when the host loop is idle, the sparsest
    /// region is compacted one segment at a time.
    /// Default: false
    pub defragment_on_idle: bool,

    /// Escalate allocation failure to process abort once retries are
    /// exhausted.
    /// Default: false
    pub abort_on_lsa_bad_alloc: bool,

    /// Capture backtraces in the allocation sanitizer. Better reports but
    /// slower.
    /// Default: false
    pub sanitizer_report_backtrace: bool,

    /// Minimum number of segments reclaimed during a single reclamation
    /// cycle.
    /// Default: 1
    pub lsa_reclamation_step: usize,

    /// Per-worker memory budget emulating the host allocator's capacity.
    /// Default: 1 GiB
    pub memory_budget: usize,

    /// Background reclaim task configuration; `None` disables the task.
    /// Default: None
    pub background_reclaim: Option<BackgroundReclaimConfig>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            defragment_on_idle: false,
            abort_on_lsa_bad_alloc: false,
            sanitizer_report_backtrace: false,
            lsa_reclamation_step: DEFAULT_RECLAMATION_STEP,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            background_reclaim: None,
        }
    }
}

impl TrackerConfig {
    /// Creates a minimal configuration for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            memory_budget: 64 * 1024 * 1024, // 64 MB for tests
            ..Default::default()
        }
    }

    /// Sets the memory budget.
    #[must_use]
    pub fn with_memory_budget(mut self, budget: usize) -> Self {
        self.memory_budget = budget;
        self
    }

    /// Sets the reclamation step.
    #[must_use]
    pub fn with_reclamation_step(mut self, step: usize) -> Self {
        self.lsa_reclamation_step = step;
        self
    }

    /// Enables the background reclaim task with default settings.
    #[must_use]
    pub fn with_background_reclaim(mut self) -> Self {
        self.background_reclaim = Some(BackgroundReclaimConfig::default());
        self
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.lsa_reclamation_step == 0 {
            return Err("lsa_reclamation_step must be at least 1".to_string());
        }

        if self.memory_budget < SEGMENT_SIZE * 16 {
            return Err("memory_budget must be at least 16 segments".to_string());
        }

        if let Some(bg) = &self.background_reclaim {
            bg.validate()?;
        }

        Ok(())
    }
}

/// Background reclaim task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundReclaimConfig {
    /// Reclaim starts when free host memory falls below this threshold.
    /// Default: 60 MB
    pub free_memory_threshold: usize,

    /// How often the task re-checks memory levels while idle.
    /// Default: 50ms
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for BackgroundReclaimConfig {
    fn default() -> Self {
        Self {
            free_memory_threshold: BACKGROUND_RECLAIM_THRESHOLD,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl BackgroundReclaimConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval.is_zero() {
            return Err("background_reclaim.poll_interval must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Serde helper for Duration using humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.lsa_reclamation_step, 1);
        assert!(config.background_reclaim.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrackerConfig::default();
        config.lsa_reclamation_step = 0;
        assert!(config.validate().is_err());

        config.lsa_reclamation_step = 1;
        config.memory_budget = SEGMENT_SIZE; // Too small
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_testing_config() {
        let config = TrackerConfig::for_testing();
        assert_eq!(config.memory_budget, 64 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_background_reclaim_config() {
        let config = TrackerConfig::default().with_background_reclaim();
        let bg = config.background_reclaim.unwrap();
        assert_eq!(bg.free_memory_threshold, BACKGROUND_RECLAIM_THRESHOLD);
        assert_eq!(bg.poll_interval, Duration::from_millis(50));
    }
}
