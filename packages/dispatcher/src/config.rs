use std::time::Duration;

use config::{Config, Environment, File};
use reliability::{EventIdOptions, RetryConfig};
use serde::Deserialize;

use crate::error::Result;

/// Processed-event tracking.
#[derive(Debug, Deserialize, Clone)]
pub struct DedupSettings {
    /// How long a delivered event is remembered. Default: 3600000 (1 hour).
    #[serde(default = "default_dedup_ttl_ms")]
    pub ttl_ms: u64,
    /// Seconds between sweeps of expired markers. Default: 60.
    #[serde(default = "default_dedup_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Make every event id unique by mixing in the arrival time. Default: false.
    #[serde(default)]
    pub include_timestamp: bool,
    /// Only these payload fields take part in the event id. Default: all.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

fn default_dedup_ttl_ms() -> u64 {
    3_600_000
}
fn default_dedup_cleanup_interval_secs() -> u64 {
    60
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_dedup_ttl_ms(),
            cleanup_interval_secs: default_dedup_cleanup_interval_secs(),
            include_timestamp: false,
            fields: None,
        }
    }
}

impl DedupSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn id_options(&self) -> EventIdOptions {
        EventIdOptions {
            include_timestamp: self.include_timestamp,
            fields: self.fields.clone(),
        }
    }
}

/// Schedule lock settings.
#[derive(Debug, Deserialize, Clone)]
pub struct LockSettings {
    /// Lock lifetime when a schedule does not set its own. Default: 300000 (5 minutes).
    #[serde(default = "default_lock_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Seconds between sweeps of expired locks. Default: 30.
    #[serde(default = "default_lock_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_lock_timeout_ms() -> u64 {
    300_000
}
fn default_lock_cleanup_interval_secs() -> u64 {
    30
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_lock_timeout_ms(),
            cleanup_interval_secs: default_lock_cleanup_interval_secs(),
        }
    }
}

impl LockSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// External command that receives each event as JSON on stdin.
#[derive(Debug, Deserialize, Clone)]
pub struct HandlerConfig {
    /// Program to run. Default: "cat".
    #[serde(default = "default_handler_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_handler_command() -> String {
    "cat".into()
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            command: default_handler_command(),
            args: Vec::new(),
        }
    }
}

/// A command run on a fixed interval under a schedule lock.
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    pub id: String,
    pub interval_secs: u64,
    /// Lock lifetime for this schedule. Falls back to `locks.default_timeout_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Dispatcher application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DispatcherAppConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub locks: LockSettings,
    #[serde(default)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

impl DispatcherAppConfig {
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("DISPATCHER_CONFIG").unwrap_or_else(|_| "config/dispatcher".to_string());

        let s = Config::builder()
            .set_default("retry.max_retries", 3_i64)?
            .set_default("retry.base_delay_ms", 1000_i64)?
            .set_default("retry.max_delay_ms", 30_000_i64)?
            .set_default("retry.jitter", 0.1)?
            .set_default("dedup.ttl_ms", 3_600_000_i64)?
            .set_default("dedup.cleanup_interval_secs", 60_i64)?
            .set_default("locks.default_timeout_ms", 300_000_i64)?
            .set_default("locks.cleanup_interval_secs", 30_i64)?
            .set_default("handler.command", "cat")?
            .add_source(File::with_name(&config_path).required(false))
            .add_source(Environment::with_prefix("DISPATCHER").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }
}
