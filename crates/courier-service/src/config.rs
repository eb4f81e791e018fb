//! Configuration for the Courier pipeline service.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::{
    client::ClientConfig,
    health::HealthConfig,
    retry::{BackoffStrategy, RetryPolicy},
    scheduler::SchedulerConfig,
    DeliveryConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `COURIER_` (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// The service works out-of-the-box with its defaults; the database lands
/// in `data_dir` and everything else is tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    /// Directory holding the delivery ledger database.
    ///
    /// Environment variable: `COURIER_DATA_DIR`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // Delivery
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `COURIER_WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count")]
    pub worker_pool_size: usize,
    /// Maximum items to claim per worker batch.
    ///
    /// Environment variable: `COURIER_WORKER_BATCH_SIZE`
    #[serde(default = "default_batch_size")]
    pub worker_batch_size: usize,
    /// Worker poll interval in seconds.
    ///
    /// Environment variable: `COURIER_POLL_INTERVAL_SECONDS`
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// HTTP timeout per delivery attempt in seconds.
    ///
    /// Environment variable: `COURIER_DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,
    /// Age in seconds after which a claimed item counts as orphaned.
    ///
    /// Environment variable: `COURIER_ORPHAN_MAX_AGE_SECONDS`
    #[serde(default = "default_orphan_max_age")]
    pub orphan_max_age_seconds: u64,

    // Retry
    /// Maximum delivery attempts per item.
    ///
    /// Environment variable: `COURIER_MAX_RETRY_ATTEMPTS`
    #[serde(default = "default_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Base backoff delay in seconds.
    ///
    /// Environment variable: `COURIER_RETRY_BASE_DELAY_SECONDS`
    #[serde(default = "default_base_delay")]
    pub retry_base_delay_seconds: u64,
    /// Cap on the backoff delay in seconds.
    ///
    /// Environment variable: `COURIER_RETRY_MAX_DELAY_SECONDS`
    #[serde(default = "default_max_delay")]
    pub retry_max_delay_seconds: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `COURIER_RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor")]
    pub retry_jitter_factor: f64,

    // Health
    /// Consecutive transient failures before a target degrades.
    ///
    /// Environment variable: `COURIER_HEALTH_DEGRADE_THRESHOLD`
    #[serde(default = "default_degrade_threshold")]
    pub health_degrade_threshold: u32,

    // Scheduler
    /// How often scheduled bindings are checked, in seconds.
    ///
    /// Environment variable: `COURIER_SCHEDULER_CHECK_INTERVAL_SECONDS`
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_check_interval_seconds: u64,

    // Shutdown
    /// Maximum time to wait for workers during graceful shutdown, seconds.
    ///
    /// Environment variable: `COURIER_SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log level filter.
    ///
    /// Environment variable: `COURIER_LOG`
    #[serde(default = "default_log_level")]
    pub log: String,
}

impl Config {
    /// Loads configuration from defaults, `courier.toml`, and `COURIER_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when a source fails to parse or a value fails
    /// validation.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed("COURIER_"));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the SQLite ledger database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("courier.db")
    }

    /// Converts to the delivery engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_pool_size,
            batch_size: self.worker_batch_size,
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            orphan_max_age: Duration::from_secs(self.orphan_max_age_seconds),
        }
    }

    /// Converts to HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            user_agent: "Courier/0.1".to_string(),
            max_redirects: 5,
            verify_tls: true,
        }
    }

    /// Converts to the retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_secs(self.retry_base_delay_seconds),
            max_delay: Duration::from_secs(self.retry_max_delay_seconds),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Converts to the health tracker configuration.
    pub fn to_health_config(&self) -> HealthConfig {
        HealthConfig { degrade_threshold: self.health_degrade_threshold }
    }

    /// Converts to the scheduler configuration.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            check_interval: Duration::from_secs(self.scheduler_check_interval_seconds),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.worker_batch_size == 0 {
            anyhow::bail!("worker_batch_size must be greater than 0");
        }

        if self.poll_interval_seconds == 0 || self.poll_interval_seconds > 5 {
            anyhow::bail!("poll_interval_seconds must be between 1 and 5");
        }

        if self.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.health_degrade_threshold == 0 {
            anyhow::bail!("health_degrade_threshold must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            worker_pool_size: default_worker_count(),
            worker_batch_size: default_batch_size(),
            poll_interval_seconds: default_poll_interval(),
            delivery_timeout_seconds: default_delivery_timeout(),
            orphan_max_age_seconds: default_orphan_max_age(),
            max_retry_attempts: default_retry_attempts(),
            retry_base_delay_seconds: default_base_delay(),
            retry_max_delay_seconds: default_max_delay(),
            retry_jitter_factor: default_jitter_factor(),
            health_degrade_threshold: default_degrade_threshold(),
            scheduler_check_interval_seconds: default_scheduler_interval(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            log: default_log_level(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_worker_count() -> usize {
    courier_delivery::DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    courier_delivery::DEFAULT_BATCH_SIZE
}

fn default_poll_interval() -> u64 {
    courier_delivery::DEFAULT_POLL_INTERVAL_SECONDS
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_orphan_max_age() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    3600
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_degrade_threshold() -> u32 {
    3
}

fn default_scheduler_interval() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
