//! Configuration management.
//!
//! Values come from an optional file layered under `SQLBATCH__*` environment
//! variables, e.g. `SQLBATCH__BATCH__MAX_QUEUED_JOBS=50`. Every field has a
//! default, so an empty environment yields a working local setup.

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};
use crate::jobs::{
    JobServiceConfig, JobStoreConfig, PgExecutorConfig, SchedulerConfig, SeekerConfig,
    DEFAULT_MAX_PAYLOAD_BYTES,
};
use crate::telemetry::LoggingConfig;

const ENV_PREFIX: &str = "SQLBATCH";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Admission, retention and discovery limits
    #[serde(default)]
    pub batch: BatchConfig,

    /// Scheduling loop
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Tenant database execution
    #[serde(default)]
    pub executor: PgExecutorConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum queued jobs per tenant
    #[serde(default = "default_max_queued_jobs")]
    pub max_queued_jobs: usize,

    /// Seconds a finished job is kept before expiring
    #[serde(default = "default_finished_jobs_ttl_secs")]
    pub finished_jobs_ttl_secs: u64,

    /// SCAN pages per discovery walk
    #[serde(default = "default_max_scan_attempts")]
    pub max_scan_attempts: usize,

    /// COUNT hint per SCAN page
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,

    /// Largest accepted query payload in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queued_jobs: default_max_queued_jobs(),
            finished_jobs_ttl_secs: default_finished_jobs_ttl_secs(),
            max_scan_attempts: default_max_scan_attempts(),
            scan_count: default_scan_count(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl BatchConfig {
    pub fn store_config(&self) -> JobStoreConfig {
        JobStoreConfig {
            max_queued_jobs: self.max_queued_jobs,
            finished_jobs_ttl_secs: self.finished_jobs_ttl_secs,
        }
    }

    pub fn seeker_config(&self) -> SeekerConfig {
        SeekerConfig {
            max_attempts: self.max_scan_attempts,
            scan_count: self.scan_count,
        }
    }

    pub fn service_config(&self) -> JobServiceConfig {
        JobServiceConfig {
            max_payload_bytes: self.max_payload_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

// Default value functions
fn default_max_queued_jobs() -> usize { 100 }
fn default_finished_jobs_ttl_secs() -> u64 { 2 * 3600 }
fn default_max_scan_attempts() -> usize { 50 }
fn default_scan_count() -> usize { 100 }
fn default_max_payload_bytes() -> usize { DEFAULT_MAX_PAYLOAD_BYTES }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that would stall the scheduler or admit nothing.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.batch.max_queued_jobs, "batch.max_queued_jobs"),
            (self.batch.max_scan_attempts, "batch.max_scan_attempts"),
            (self.batch.scan_count, "batch.scan_count"),
            (self.batch.max_payload_bytes, "batch.max_payload_bytes"),
            (self.scheduler.concurrency, "scheduler.concurrency"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(BatchError::new(
                    crate::error::ErrorCode::ConfigurationError,
                    format!("{} must be greater than zero", name),
                ));
            }
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
