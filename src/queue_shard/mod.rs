//! A queue shard: one SlateDB instance holding items, partitions, backlogs and
//! every index over them.
//!
//! Operations are split across submodules:
//!
//! - `script`: transaction primitives (hashes, ordered sets, expiring strings)
//! - `helpers`: pointer propagation shared by scripts
//! - `enqueue`: admission into a ready queue or backlog
//! - `peek`: ordered-set pagination
//! - `lease`: item lease, extend, dequeue and requeue
//! - `partitions`: ready-side partition lease and requeue
//! - `shadow`: shadow partition lease, extend, requeue and peeks
//! - `refill`: backlog to ready admission
//! - `normalize`: draining outdated backlogs
//! - `scavenge`: reclaiming expired leases
//! - `active`: active-set reconciliation
//! - `capacity`: guaranteed-capacity account leases
//! - `accessors`: read-only counts and iterators
//! - `config_lease`: leader leases for background loops
//! - `steps`: step output store

mod accessors;
mod active;
mod capacity;
mod config_lease;
mod enqueue;
mod helpers;
mod lease;
mod normalize;
mod partitions;
mod peek;
mod refill;
mod scavenge;
pub(crate) mod script;
mod shadow;
mod steps;

pub use accessors::JobInfo;
pub use active::ActiveCheckResult;
pub use capacity::GuaranteedCapacity;
pub use enqueue::EnqueueOptions;
pub use helpers::{STATUS_IN_PROGRESS, STATUS_QUEUED};
pub use lease::{DequeueOptions, LeaseOptions};
pub use partitions::PartitionLeaseOptions;
pub use peek::{PeekResult, Peeker};
pub use refill::RefillResult;
pub use script::ScoreRange;

use std::sync::Arc;

use parking_lot::Mutex;
use slatedb::Db;
use thiserror::Error;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::keys::KeyGenerator;
use crate::metrics::Metrics;
use crate::settings::{DatabaseConfig, QueueConfig};
use crate::storage::open_queue_db;
use crate::tenant::TenantConfig;

/// The dimension that limited a refill or lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constraint {
    NotLimited,
    Account,
    Function,
    CustomKey1,
    CustomKey2,
    Throttle,
}

impl Constraint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Constraint::NotLimited => "not_limited",
            Constraint::Account => "account",
            Constraint::Function => "function",
            Constraint::CustomKey1 => "custom_key_1",
            Constraint::CustomKey2 => "custom_key_2",
            Constraint::Throttle => "throttle",
        }
    }

    pub(crate) fn custom(index: usize) -> Self {
        if index <= 1 {
            Constraint::CustomKey1
        } else {
            Constraint::CustomKey2
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error("json serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("transaction conflict during {0}, exceeded max retries")]
    TransactionConflict(String),
    #[error("decode task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("queue item already exists: {0}")]
    ItemAlreadyExists(String),
    #[error("queue item not found: {0}")]
    ItemNotFound(String),
    #[error("queue item already leased: {0}")]
    ItemAlreadyLeased(String),
    #[error("lease not found for queue item {0}")]
    LeaseNotFound(String),
    #[error("lease mismatch for queue item {0}")]
    LeaseMismatch(String),

    #[error("partition not found: {0}")]
    PartitionNotFound(String),
    #[error("partition already leased: {0}")]
    PartitionAlreadyLeased(String),
    #[error("partition garbage collected: {0}")]
    PartitionGarbageCollected(String),
    #[error("partition paused: {0}")]
    PartitionPaused(String),

    #[error("partition concurrency limit reached for {key}")]
    PartitionConcurrencyLimit { key: String },
    #[error("account concurrency limit reached for {key}")]
    AccountConcurrencyLimit { key: String },
    #[error("custom concurrency limit {index} reached for {key}")]
    CustomConcurrencyLimit { index: usize, key: String },
    #[error("queue item throttled on {key}")]
    QueueItemThrottled { key: String },

    #[error("shadow partition not found: {0}")]
    ShadowPartitionNotFound(String),
    #[error("shadow partition already leased: {0}")]
    ShadowPartitionAlreadyLeased(String),
    #[error("shadow partition lease not found: {0}")]
    ShadowPartitionLeaseNotFound(String),
    #[error("shadow partition refill paused: {0}")]
    ShadowPartitionPaused(String),

    #[error("backlog already leased for normalization: {0}")]
    BacklogAlreadyLeasedForNormalization(String),
    #[error("backlog normalization lease expired: {0}")]
    BacklogNormalizationLeaseExpired(String),

    #[error("guaranteed capacity lease index {index} exceeds limit {limit}")]
    ShardLeaseExceedsLimits { index: usize, limit: u32 },
    #[error("guaranteed capacity lease not found for {0}")]
    ShardLeaseNotFound(String),
    #[error("guaranteed capacity lease expired for {0}")]
    ShardLeaseExpired(String),
    #[error("guaranteed capacity slot {index} already leased for {key}")]
    AllShardsAlreadyLeased { key: String, index: usize },
    #[error("guaranteed capacity lease index {index} is invalid, next free slot is {next}")]
    ShardLeaseIndexInvalid { index: usize, next: usize },
    #[error("guaranteed capacity not found for {0}")]
    GuaranteedCapacityNotFound(String),

    #[error("config lease already held: {0}")]
    ConfigAlreadyLeased(String),
    #[error("peek limit {limit} exceeds maximum {max}")]
    PeekExceedsMaxLimits { limit: usize, max: usize },
    #[error("step {step_id} of run {run_id} already saved with different data")]
    DuplicateResponse { run_id: String, step_id: String },
}

impl QueueError {
    /// Constraint dimension for concurrency and throttle rejections.
    pub fn constraint(&self) -> Option<Constraint> {
        match self {
            QueueError::PartitionConcurrencyLimit { .. } => Some(Constraint::Function),
            QueueError::AccountConcurrencyLimit { .. } => Some(Constraint::Account),
            QueueError::CustomConcurrencyLimit { index, .. } => Some(Constraint::custom(*index)),
            QueueError::QueueItemThrottled { .. } => Some(Constraint::Throttle),
            _ => None,
        }
    }

    /// Key of the limit that tripped, if this is a constraint rejection.
    pub fn constraint_key(&self) -> Option<&str> {
        match self {
            QueueError::PartitionConcurrencyLimit { key }
            | QueueError::AccountConcurrencyLimit { key }
            | QueueError::CustomConcurrencyLimit { key, .. }
            | QueueError::QueueItemThrottled { key } => Some(key),
            _ => None,
        }
    }

    /// Contention that resolves on its own; callers move on and retry next tick.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            QueueError::ItemAlreadyExists(_)
                | QueueError::ItemAlreadyLeased(_)
                | QueueError::PartitionAlreadyLeased(_)
                | QueueError::ShadowPartitionAlreadyLeased(_)
                | QueueError::BacklogAlreadyLeasedForNormalization(_)
                | QueueError::ConfigAlreadyLeased(_)
                | QueueError::TransactionConflict(_)
        )
    }
}

/// Generates lease ids whose timestamp is the lease expiry.
///
/// Two leases expiring in the same millisecond get strictly increasing ids.
#[derive(Default)]
pub(crate) struct LeaseIds {
    last: Mutex<Option<Ulid>>,
}

impl LeaseIds {
    pub(crate) fn next(&self, expires_at_ms: i64) -> Ulid {
        let ts = expires_at_ms.max(0) as u64;
        let mut last = self.last.lock();
        let id = match *last {
            Some(prev) if prev.timestamp_ms() == ts => prev
                .increment()
                .unwrap_or_else(|| Ulid::from_parts(ts, rand::random::<u128>())),
            _ => Ulid::from_parts(ts, rand::random::<u128>()),
        };
        *last = Some(id);
        id
    }
}

/// Everything a shard needs besides its database location.
pub struct ShardOptions {
    pub name: String,
    pub queue: QueueConfig,
    pub tenants: Arc<dyn TenantConfig>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<Metrics>,
    pub key_generator: KeyGenerator,
}

impl ShardOptions {
    pub fn new(tenants: Arc<dyn TenantConfig>) -> Self {
        Self {
            name: "default".to_string(),
            queue: QueueConfig::default(),
            tenants,
            clock: Arc::new(SystemClock),
            metrics: None,
            key_generator: KeyGenerator::default(),
        }
    }
}

/// A single queue shard. Owns the SlateDB instance.
pub struct QueueShard {
    pub(crate) name: String,
    pub(crate) db: Arc<Db>,
    pub(crate) kg: KeyGenerator,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) tenants: Arc<dyn TenantConfig>,
    pub(crate) config: QueueConfig,
    pub(crate) lease_ids: LeaseIds,
    pub(crate) metrics: Option<Metrics>,
}

impl QueueShard {
    pub async fn open(cfg: &DatabaseConfig, options: ShardOptions) -> Result<Arc<Self>, QueueError> {
        let (db, root) = open_queue_db(cfg).await?;
        tracing::info!(shard = %options.name, path = %root, "opened queue shard");

        Ok(Arc::new(Self {
            name: options.name,
            db,
            kg: options.key_generator,
            clock: options.clock,
            tenants: options.tenants,
            config: options.queue,
            lease_ids: LeaseIds::default(),
            metrics: options.metrics,
        }))
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.db.close().await?;
        tracing::info!(shard = %self.name, "closed queue shard");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn key_generator(&self) -> &KeyGenerator {
        &self.kg
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn tenants(&self) -> &Arc<dyn TenantConfig> {
        &self.tenants
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}
