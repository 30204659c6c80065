use serde::Deserialize;
use std::fs;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Static tenant overrides used by the binary's tenant config.
    #[serde(default)]
    pub tenants: Vec<TenantSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub backend: Backend,
    pub path: String,
    /// SlateDB WAL flush interval. Tests use a small value to keep commits fast.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    S3,
    Memory,
    Url,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
            enabled: false,
        }
    }
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

/// Toggles for each subsystem run by `processor::Processor::run`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunMode {
    /// Pull partitions from the ready side and execute items.
    pub partition: bool,
    /// Bias ready-side partition selection towards accounts.
    pub account: bool,
    /// Run the shadow scanner (backlog refill).
    pub shadow_partition: bool,
    /// Run the backlog normalizer.
    pub normalize_partition: bool,
    /// Contend for the scavenger config lease and reclaim expired leases.
    pub scavenger: bool,
    /// Contend for the active checker config lease and prune active sets.
    pub active_checker: bool,
    /// Claim guaranteed-capacity slots.
    pub guaranteed_capacity: bool,
    /// Percentage (0..=100) of ticks that take the account-biased path.
    pub account_weight: u32,
    /// Probability (0.0..=1.0) of skipping continuations on a tick.
    pub continuation_skip_probability: f64,
    /// Probability (0.0..=1.0) of an account-level active check per backlog.
    pub active_check_account_probability: f64,
    /// Only report active-set leaks, never remove.
    pub active_check_read_only: bool,
}

impl Default for RunMode {
    fn default() -> Self {
        Self {
            partition: true,
            account: true,
            shadow_partition: true,
            normalize_partition: true,
            scavenger: true,
            active_checker: true,
            guaranteed_capacity: false,
            account_weight: 85,
            continuation_skip_probability: 0.2,
            active_check_account_probability: 0.1,
            active_check_read_only: false,
        }
    }
}

/// Tunables for the queue shard and its processor loops.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub run_mode: RunMode,
    pub num_workers: usize,
    pub num_shadow_workers: usize,
    pub num_normalize_workers: usize,
    pub poll_tick_ms: u64,
    pub shadow_poll_tick_ms: u64,
    pub normalize_poll_tick_ms: u64,
    pub scavenger_tick_ms: u64,
    pub active_check_tick_ms: u64,
    pub guaranteed_capacity_tick_ms: u64,
    pub scavenger_peek_size: usize,
    pub partition_peek_max: usize,
    pub account_peek_max: usize,
    pub queue_peek_min: usize,
    pub queue_peek_max: usize,
    pub shadow_partition_peek_max: usize,
    pub shadow_account_peek_max: usize,
    pub backlog_peek_max: usize,
    pub backlog_refill_limit: usize,
    pub backlog_normalize_threshold: usize,
    pub partition_lease_ms: i64,
    pub queue_lease_ms: i64,
    pub shadow_lease_ms: i64,
    pub normalize_lease_ms: i64,
    pub config_lease_ms: i64,
    pub account_lease_ms: i64,
    pub idempotency_ttl_ms: i64,
    pub continuation_limit: usize,
    pub continuation_max_count: u32,
    pub continuation_cooldown_ms: i64,
    pub active_check_peek: usize,
    pub active_check_page_size: usize,
    pub active_check_page_sleep_ms: u64,
    pub active_check_cooldown_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::default(),
            num_workers: 100,
            num_shadow_workers: 100,
            num_normalize_workers: 10,
            poll_tick_ms: 10,
            shadow_poll_tick_ms: 500,
            normalize_poll_tick_ms: 500,
            scavenger_tick_ms: 1_000,
            active_check_tick_ms: 10_000,
            guaranteed_capacity_tick_ms: 30_000,
            scavenger_peek_size: 100,
            partition_peek_max: 300,
            account_peek_max: 30,
            queue_peek_min: 300,
            queue_peek_max: 5_000,
            shadow_partition_peek_max: 300,
            shadow_account_peek_max: 30,
            backlog_peek_max: 100,
            backlog_refill_limit: 1_000,
            backlog_normalize_threshold: 100,
            partition_lease_ms: 4_000,
            queue_lease_ms: 20_000,
            shadow_lease_ms: 10_000,
            normalize_lease_ms: 10_000,
            config_lease_ms: 10_000,
            account_lease_ms: 20_000,
            idempotency_ttl_ms: 12 * 60 * 60 * 1_000,
            continuation_limit: 256,
            continuation_max_count: 5,
            continuation_cooldown_ms: 10_000,
            active_check_peek: 10,
            active_check_page_size: 20,
            active_check_page_sleep_ms: 100,
            active_check_cooldown_ms: 5 * 60 * 1_000,
        }
    }
}

/// Tenant limits loaded from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct TenantSettings {
    pub account_id: Uuid,
    #[serde(default)]
    pub key_queues: bool,
    #[serde(default)]
    pub disable_lease_checks: bool,
    #[serde(default)]
    pub account_concurrency: i64,
    #[serde(default)]
    pub guaranteed_workers: u32,
    #[serde(default)]
    pub guaranteed_priority: u32,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let default = Self {
            database: DatabaseConfig {
                backend: Backend::Fs,
                path: "/tmp/shoal".to_string(),
                flush_interval_ms: None,
            },
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            queue: QueueConfig::default(),
            tenants: Vec::new(),
        };

        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(default),
        }
    }
}
