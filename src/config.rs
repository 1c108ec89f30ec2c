use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::DistributionStrategy;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub locks: LockConfig,
}

/// Worker pool sizing, supervision and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Scale up when the busy fraction reaches this.
    pub scale_up_threshold: f64,
    /// Scale down when the busy fraction is at or below this.
    pub scale_down_threshold: f64,
    pub worker_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub strategy: DistributionStrategy,
    /// How long `shutdown` waits for running attempts before aborting them.
    pub shutdown_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            worker_timeout_ms: 300_000,
            health_check_interval_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
            strategy: DistributionStrategy::default(),
            shutdown_grace_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Backoff before the retry that follows `retry_count` earlier retries.
    ///
    /// `min(retry_delay × multiplier^retry_count, max_retry_delay)`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_retry_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Bounds for DAG grouping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GroupingConfig {
    pub min_group_size: usize,
    pub max_group_size: usize,
    pub max_concurrent_groups: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            min_group_size: 3,
            max_group_size: 10,
            max_concurrent_groups: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub lock_ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 300_000,
        }
    }
}

impl LockConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Load from `~/.conductor/conductor.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        let grouping = &self.grouping;

        if pool.min_workers == 0 {
            return Err(Error::Config("min_workers must be at least 1".to_string()));
        }
        if pool.min_workers > pool.max_workers {
            return Err(Error::Config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                pool.min_workers, pool.max_workers
            )));
        }
        for (name, value) in [
            ("scale_up_threshold", pool.scale_up_threshold),
            ("scale_down_threshold", pool.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be within [0, 1]", name)));
            }
        }
        if pool.scale_down_threshold >= pool.scale_up_threshold {
            return Err(Error::Config(
                "scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }
        if pool.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoff_multiplier must be >= 1".to_string()));
        }
        if pool.worker_timeout_ms == 0 || pool.health_check_interval_ms == 0 {
            return Err(Error::Config(
                "worker_timeout_ms and health_check_interval_ms must be non-zero".to_string(),
            ));
        }
        if grouping.min_group_size == 0 || grouping.min_group_size > grouping.max_group_size {
            return Err(Error::Config(format!(
                "group sizes must satisfy 1 <= min ({}) <= max ({})",
                grouping.min_group_size, grouping.max_group_size
            )));
        }
        if grouping.max_concurrent_groups == 0 {
            return Err(Error::Config(
                "max_concurrent_groups must be at least 1".to_string(),
            ));
        }
        if self.locks.lock_ttl_ms == 0 {
            return Err(Error::Config("lock_ttl_ms must be non-zero".to_string()));
        }
        Ok(())
    }
}
