//! Engine configuration.
//!
//! `EngineConfig` carries everything about *how* a query runs (parallelism,
//! split size, calibration policy). *What* is computed lives in
//! [`QuerySpec`](crate::query::QuerySpec). The config can be built in code,
//! loaded from a TOML file, and overridden from the environment.

use std::path::Path;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::aggregate::Estimator;
use crate::calibrate::ZeroSignalPolicy;
use crate::error::{ApproxError, Result};

/// Default parallelism level (number of CPU cores)
pub fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

fn default_reducers() -> usize {
    1
}

fn default_split_size() -> u64 {
    32 * 1024 * 1024 // 32 MB
}

fn default_seed() -> u64 {
    0x5EED_0F_A991
}

fn default_pilot_sample_size() -> u64 {
    10_000
}

fn default_minimum_sample_size() -> u64 {
    100
}

fn default_fallback_sample_size() -> u64 {
    10_000
}

fn default_max_task_attempts() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration for running queries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads
    pub parallelism: usize,
    /// Number of reduce buckets partial sums are shuffled into
    #[serde(default = "default_reducers")]
    pub reducers: usize,
    /// Target size in bytes of one input partition
    #[serde(default = "default_split_size")]
    pub split_size: u64,
    /// Seed of the per-partition sampling streams
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Per-partition sample size of the pilot pass
    #[serde(default = "default_pilot_sample_size")]
    pub pilot_sample_size: u64,
    /// Lower bound of a calibrated per-partition size
    #[serde(default = "default_minimum_sample_size")]
    pub minimum_sample_size: u64,
    /// Size used for partitions the pilot saw no matches in
    #[serde(default = "default_fallback_sample_size")]
    pub fallback_sample_size: u64,
    /// What to do with partitions the pilot saw no matches in
    pub zero_signal_policy: ZeroSignalPolicy,
    /// Attempts per partition task before the pass fails
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: usize,
    /// How sampled sums are turned into estimates
    pub estimator: Estimator,
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            reducers: default_reducers(),
            split_size: default_split_size(),
            seed: default_seed(),
            pilot_sample_size: default_pilot_sample_size(),
            minimum_sample_size: default_minimum_sample_size(),
            fallback_sample_size: default_fallback_sample_size(),
            zero_signal_policy: ZeroSignalPolicy::default(),
            max_task_attempts: default_max_task_attempts(),
            estimator: Estimator::default(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Smallest split accepted; anything lower produces one partition per few lines.
    const MIN_SPLIT_SIZE: u64 = 1024;

    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ApproxError::config(format!("failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            ApproxError::config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply `APPROXAGG_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(p) = env_parse::<usize>("APPROXAGG_PARALLELISM") {
            self.parallelism = p;
        }
        if let Some(seed) = env_parse::<u64>("APPROXAGG_SEED") {
            self.seed = seed;
        }
        if let Some(size) = env_parse::<u64>("APPROXAGG_SPLIT_SIZE") {
            self.split_size = size;
        }
    }

    /// Set the number of worker threads.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the number of reduce buckets.
    pub fn with_reducers(mut self, reducers: usize) -> Self {
        self.reducers = reducers.max(1);
        self
    }

    /// Set the target partition size in bytes.
    pub fn with_split_size(mut self, split_size: u64) -> Self {
        self.split_size = split_size;
        self
    }

    /// Set the sampling seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the pilot per-partition sample size.
    pub fn with_pilot_sample_size(mut self, size: u64) -> Self {
        self.pilot_sample_size = size;
        self
    }

    /// Set the lower bound of calibrated sizes.
    pub fn with_minimum_sample_size(mut self, size: u64) -> Self {
        self.minimum_sample_size = size;
        self
    }

    /// Set the size used for partitions without pilot matches.
    pub fn with_fallback_sample_size(mut self, size: u64) -> Self {
        self.fallback_sample_size = size;
        self
    }

    /// Set the zero-signal policy.
    pub fn with_zero_signal_policy(mut self, policy: ZeroSignalPolicy) -> Self {
        self.zero_signal_policy = policy;
        self
    }

    /// Set the number of attempts per partition task.
    pub fn with_max_task_attempts(mut self, attempts: usize) -> Self {
        self.max_task_attempts = attempts.max(1);
        self
    }

    /// Set the estimator.
    pub fn with_estimator(mut self, estimator: Estimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(ApproxError::config("parallelism must be > 0"));
        }
        if self.reducers == 0 {
            return Err(ApproxError::config("reducers must be > 0"));
        }
        if self.split_size < Self::MIN_SPLIT_SIZE {
            return Err(ApproxError::config(format!(
                "split_size must be at least {} bytes, got {}",
                Self::MIN_SPLIT_SIZE,
                self.split_size
            )));
        }
        if self.pilot_sample_size == 0 {
            return Err(ApproxError::config("pilot_sample_size must be > 0"));
        }
        if self.minimum_sample_size == 0 {
            return Err(ApproxError::config("minimum_sample_size must be > 0"));
        }
        if self.max_task_attempts == 0 {
            return Err(ApproxError::config("max_task_attempts must be > 0"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert!(config.parallelism >= 1);
        assert_eq!(config.pilot_sample_size, 10_000);
        assert_eq!(config.estimator, Estimator::HorvitzThompson);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_parallelism(0)
            .with_reducers(3)
            .with_seed(7)
            .with_estimator(Estimator::Unscaled);

        assert_eq!(config.parallelism, 1);
        assert_eq!(config.reducers, 3);
        assert_eq!(config.seed, 7);
        assert_eq!(config.estimator, Estimator::Unscaled);
    }

    #[test]
    fn test_config_validation() {
        let config = EngineConfig::new().with_split_size(10);
        assert!(config.validate().is_err());

        let config = EngineConfig::new().with_pilot_sample_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml_partial() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "parallelism = 3").unwrap();
        writeln!(file, "pilot_sample_size = 500").unwrap();
        writeln!(file, "zero_signal_policy = \"skip\"").unwrap();
        writeln!(file, "estimator = \"unscaled\"").unwrap();
        file.flush().unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.parallelism, 3);
        assert_eq!(config.pilot_sample_size, 500);
        assert_eq!(config.zero_signal_policy, ZeroSignalPolicy::Skip);
        assert_eq!(config.estimator, Estimator::Unscaled);
        // Untouched keys keep their defaults
        assert_eq!(config.minimum_sample_size, 100);
        assert_eq!(config.max_task_attempts, 2);
    }

    #[test]
    fn test_config_from_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "parallelism = \"many\"").unwrap();
        file.flush().unwrap();

        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ApproxError::Config { .. }));
    }
}
