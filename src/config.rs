//! Scan engine configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/scan.toml`)
//! 2. Environment variables (prefixed with `DAQ_SCAN_`, sections separated by `__`)
//!
//! Every field has a default, so an empty or missing file yields
//! [`ScanConfig::default`].
//!
//! # Example
//! ```no_run
//! use daq_scan::config::ScanConfig;
//!
//! let config = ScanConfig::load()?;
//! println!("Queue capacity: {}", config.pipeline.queue_capacity);
//! # Ok::<(), daq_scan::ScanError>(())
//! ```

use crate::error::{ScanError, ScanResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level scan engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Data-point pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Motion and polling settings
    #[serde(default)]
    pub motion: MotionConfig,
    /// Scan lifecycle settings
    #[serde(default)]
    pub scan: LifecycleConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Data-point pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of points waiting to be published before `submit` blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of deferred values resolved in parallel
    #[serde(default = "default_deferred_pool_size")]
    pub deferred_pool_size: usize,
    /// Read detectors in a background task while the next point moves
    #[serde(default)]
    pub concurrent_readout: bool,
}

/// Motion, busy and pause polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Interval between busy queries while waiting for a level to settle
    #[serde(default = "default_busy_poll")]
    pub busy_poll_interval_ms: u64,
    /// Interval between motion queries during a hardware-triggered line
    #[serde(default = "default_motion_poll")]
    pub motion_poll_interval_ms: u64,
    /// Interval between status checks while paused
    #[serde(default = "default_pause_poll")]
    pub pause_poll_interval_ms: u64,
    /// Relative tolerance when hardware-triggered detectors report collection times
    #[serde(default = "default_collection_time_tolerance")]
    pub collection_time_tolerance: f64,
}

/// Scan lifecycle configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Move scannables back to where they started once the scan completes
    #[serde(default)]
    pub return_to_original_positions: bool,
}

// Default value functions
fn default_name() -> String {
    "daq_scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    3
}

fn default_deferred_pool_size() -> usize {
    3
}

fn default_busy_poll() -> u64 {
    10
}

fn default_motion_poll() -> u64 {
    50
}

fn default_pause_poll() -> u64 {
    100
}

fn default_collection_time_tolerance() -> f64 {
    0.001
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            deferred_pool_size: default_deferred_pool_size(),
            concurrent_readout: false,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            busy_poll_interval_ms: default_busy_poll(),
            motion_poll_interval_ms: default_motion_poll(),
            pause_poll_interval_ms: default_pause_poll(),
            collection_time_tolerance: default_collection_time_tolerance(),
        }
    }
}

impl MotionConfig {
    /// Busy polling interval as a `Duration`
    #[must_use]
    pub fn busy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.busy_poll_interval_ms)
    }

    /// Motion polling interval as a `Duration`
    #[must_use]
    pub fn motion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.motion_poll_interval_ms)
    }

    /// Pause polling interval as a `Duration`
    #[must_use]
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }
}

impl ScanConfig {
    /// Load configuration from `config/scan.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix `DAQ_SCAN_`.
    /// Example: `DAQ_SCAN_PIPELINE__QUEUE_CAPACITY=8`
    pub fn load() -> ScanResult<Self> {
        Self::load_from("config/scan.toml")
    }

    /// Load configuration from a specific file path and validate it
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_SCAN_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ScanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ScanError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(ScanError::Config(
                "pipeline.queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.pipeline.deferred_pool_size == 0 {
            return Err(ScanError::Config(
                "pipeline.deferred_pool_size must be at least 1".to_string(),
            ));
        }

        let tolerance = self.motion.collection_time_tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(ScanError::Config(format!(
                "Invalid collection_time_tolerance {tolerance}. Must be a non-negative number"
            )));
        }

        if self.motion.busy_poll_interval_ms == 0 || self.motion.motion_poll_interval_ms == 0 {
            return Err(ScanError::Config(
                "Polling intervals must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the configuration as TOML, e.g. to seed a new config file
    pub fn to_toml_string(&self) -> ScanResult<String> {
        toml::to_string_pretty(self).map_err(|e| ScanError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.queue_capacity, 3);
        assert_eq!(config.pipeline.deferred_pool_size, 3);
        assert!(!config.pipeline.concurrent_readout);
        assert_eq!(config.motion.pause_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nconcurrent_readout = true\nqueue_capacity = 8").unwrap();

        let config = ScanConfig::load_from(file.path()).unwrap();
        assert!(config.pipeline.concurrent_readout);
        assert_eq!(config.pipeline.queue_capacity, 8);
        assert_eq!(config.pipeline.deferred_pool_size, 3);
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ScanConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(ScanError::Config(_))));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nqueue_capacity = 0").unwrap();

        let err = ScanConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_negative_tolerance_rejected() {
        let mut config = ScanConfig::default();
        config.motion.collection_time_tolerance = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let mut config = ScanConfig::default();
        config.scan.return_to_original_positions = true;
        let rendered = config.to_toml_string().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(rendered.as_bytes()).unwrap();
        assert_eq!(ScanConfig::load_from(file.path()).unwrap(), config);
    }
}
