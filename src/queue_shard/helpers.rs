//! Pointer propagation shared by scripts.
//!
//! Every index above a queue stores the minimum score of the level below it.
//! Scripts call these helpers after touching a queue so the chain stays exact
//! within the same transaction.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::item::QueueItem;
use crate::keys::KeyGenerator;
use crate::partition::{QueuePartition, ShadowPartition};
use crate::queue_shard::script::{Script, retry_on_txn_conflict};
use crate::queue_shard::{QueueError, QueueShard};

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_IN_PROGRESS: &str = "in_progress";

/// Names of the registered scripts, used for retries, logs and metrics.
pub(crate) mod scripts {
    pub const ENQUEUE: &str = "enqueue";
    pub const LEASE: &str = "lease";
    pub const EXTEND_LEASE: &str = "extend_lease";
    pub const DEQUEUE: &str = "dequeue";
    pub const REQUEUE: &str = "requeue";
    pub const PARTITION_LEASE: &str = "partition_lease";
    pub const PARTITION_REQUEUE: &str = "partition_requeue";
    pub const PARTITION_DEQUEUE: &str = "partition_dequeue";
    pub const PAUSE_FUNCTION: &str = "pause_function";
    pub const SHADOW_LEASE: &str = "shadow_partition_lease";
    pub const SHADOW_EXTEND: &str = "shadow_partition_extend_lease";
    pub const SHADOW_REQUEUE: &str = "shadow_partition_requeue";
    pub const SHADOW_PAUSE_REFILL: &str = "shadow_partition_pause_refill";
    pub const SHADOW_REFRESH: &str = "shadow_partition_refresh";
    pub const BACKLOG_REFILL: &str = "backlog_refill";
    pub const PREPARE_NORMALIZE: &str = "backlog_prepare_normalize";
    pub const NORMALIZE_LEASE: &str = "backlog_normalize_lease";
    pub const NORMALIZE_EXTEND: &str = "backlog_normalize_extend_lease";
    pub const NORMALIZE_PAGE: &str = "backlog_normalize_page";
    pub const NORMALIZE_FINISH: &str = "backlog_normalize_finish";
    pub const SCAVENGE: &str = "scavenge";
    pub const REMOVE_POINTERS: &str = "remove_pointers";
    pub const ACTIVE_CHECK: &str = "active_check";
    pub const ACTIVE_CHECK_FINISH: &str = "active_check_finish";
    pub const CAPACITY_SET: &str = "guaranteed_capacity_set";
    pub const CAPACITY_ACQUIRE: &str = "guaranteed_capacity_acquire";
    pub const CAPACITY_RENEW: &str = "guaranteed_capacity_renew";
    pub const CONFIG_LEASE: &str = "config_lease";
    pub const SAVE_STEP: &str = "save_step";
    pub const INDEX_REPAIR: &str = "index_repair";
}

/// Per-function metadata written on first enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FnMetadata {
    #[serde(rename = "id")]
    pub function_id: Uuid,
    #[serde(rename = "off", default)]
    pub paused: bool,
}

impl QueueShard {
    /// Run a named script with conflict retries.
    pub(crate) async fn run_script<T, F, Fut>(&self, name: &'static str, f: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let result = retry_on_txn_conflict(name, f).await;
        if let Err(QueueError::TransactionConflict(_)) = &result {
            warn!(shard = %self.name, script = name, "script gave up after repeated conflicts");
            if let Some(m) = &self.metrics {
                m.record_script_conflict(name);
            }
        }
        result
    }
}

pub(crate) async fn load_item(
    s: &Script,
    kg: &KeyGenerator,
    item_id: &str,
) -> Result<Option<QueueItem>, QueueError> {
    s.hget(&kg.queue_item(), item_id).await
}

pub(crate) async fn load_partition(
    s: &Script,
    kg: &KeyGenerator,
    partition_id: &str,
) -> Result<Option<QueuePartition>, QueueError> {
    s.hget(&kg.partition_item(), partition_id).await
}

pub(crate) async fn load_shadow_partition(
    s: &Script,
    kg: &KeyGenerator,
    partition_id: &str,
) -> Result<Option<ShadowPartition>, QueueError> {
    s.hget(&kg.shadow_partition_meta(), partition_id).await
}

/// Active sets an item is charged to.
pub(crate) fn item_active_sets(kg: &KeyGenerator, item: &QueueItem) -> Vec<String> {
    let mut sets = vec![kg.active_partition(&item.partition_id())];
    if !item.is_system() {
        sets.push(kg.active_account(&item.account_id()));
    }
    for key in &item.data.custom_concurrency_keys {
        sets.push(kg.active_custom(&key.canonical_id()));
    }
    sets
}

pub(crate) async fn mark_queued(
    s: &Script,
    kg: &KeyGenerator,
    item: &QueueItem,
) -> Result<(), QueueError> {
    s.zrem(&kg.status(STATUS_IN_PROGRESS, &item.function_id), &item.id)
        .await?;
    s.zadd(&kg.status(STATUS_QUEUED, &item.function_id), &item.id, item.at_ms)
        .await?;
    Ok(())
}

pub(crate) async fn mark_in_progress(
    s: &Script,
    kg: &KeyGenerator,
    item: &QueueItem,
    expires_at_ms: i64,
) -> Result<(), QueueError> {
    s.zrem(&kg.status(STATUS_QUEUED, &item.function_id), &item.id)
        .await?;
    s.zadd(
        &kg.status(STATUS_IN_PROGRESS, &item.function_id),
        &item.id,
        expires_at_ms,
    )
    .await?;
    Ok(())
}

pub(crate) async fn clear_status(
    s: &Script,
    kg: &KeyGenerator,
    item: &QueueItem,
) -> Result<(), QueueError> {
    s.zrem(&kg.status(STATUS_QUEUED, &item.function_id), &item.id)
        .await?;
    s.zrem(&kg.status(STATUS_IN_PROGRESS, &item.function_id), &item.id)
        .await?;
    Ok(())
}

// ready side

/// Re-point the partition at its earliest ready item. Leased or forced
/// partitions keep their pointer; an empty ready queue leaves it alone.
pub(crate) async fn update_ready_pointers(
    s: &Script,
    kg: &KeyGenerator,
    partition: &QueuePartition,
    now_ms: i64,
) -> Result<(), QueueError> {
    if partition.is_leased(now_ms) || partition.force_at_ms > now_ms {
        return Ok(());
    }
    let Some((_, earliest)) = s.zmin(&kg.ready(&partition.id)).await? else {
        return Ok(());
    };
    set_ready_pointer(s, kg, partition, earliest).await
}

pub(crate) async fn set_ready_pointer(
    s: &Script,
    kg: &KeyGenerator,
    partition: &QueuePartition,
    score: i64,
) -> Result<(), QueueError> {
    s.zadd(&kg.global_partition_index(), &partition.id, score)
        .await?;
    if let Some(account_id) = partition.account_id {
        let account_set = kg.account_partition_index(&account_id);
        s.zadd(&account_set, &partition.id, score).await?;
        refresh_account_pointer(s, &account_set, &kg.global_account_index(), &account_id).await?;
    }
    Ok(())
}

pub(crate) async fn remove_ready_pointer(
    s: &Script,
    kg: &KeyGenerator,
    partition: &QueuePartition,
) -> Result<(), QueueError> {
    s.zrem(&kg.global_partition_index(), &partition.id).await?;
    if let Some(account_id) = partition.account_id {
        let account_set = kg.account_partition_index(&account_id);
        s.zrem(&account_set, &partition.id).await?;
        refresh_account_pointer(s, &account_set, &kg.global_account_index(), &account_id).await?;
    }
    Ok(())
}

/// An account's score in a global account index is the minimum of its own index.
async fn refresh_account_pointer(
    s: &Script,
    account_set: &str,
    global_set: &str,
    account_id: &Uuid,
) -> Result<(), QueueError> {
    let member = account_id.to_string();
    match s.zmin(account_set).await? {
        Some((_, score)) => {
            s.zadd(global_set, &member, score).await?;
        }
        None => {
            s.zrem(global_set, &member).await?;
        }
    }
    Ok(())
}

/// Keep the scavenger pointer equal to the partition's earliest lease expiry.
pub(crate) async fn update_scavenger_index(
    s: &Script,
    kg: &KeyGenerator,
    partition_id: &str,
) -> Result<(), QueueError> {
    match s.zmin(&kg.in_progress(partition_id)).await? {
        Some((_, earliest)) => {
            s.zadd(&kg.scavenger_index(), partition_id, earliest).await?;
        }
        None => {
            s.zrem(&kg.scavenger_index(), partition_id).await?;
        }
    }
    Ok(())
}

// shadow side

/// Recompute the backlog's score in its shadow partition, then the
/// shadow partition's pointers.
pub(crate) async fn update_backlog_pointer(
    s: &Script,
    kg: &KeyGenerator,
    sp: &ShadowPartition,
    backlog_id: &str,
    now_ms: i64,
) -> Result<(), QueueError> {
    let shadow_set = kg.shadow_partition_set(&sp.partition_id);
    match s.zmin(&kg.backlog_set(backlog_id)).await? {
        Some((_, earliest)) => {
            s.zadd(&shadow_set, backlog_id, earliest).await?;
        }
        None => {
            s.zrem(&shadow_set, backlog_id).await?;
        }
    }
    update_shadow_partition_pointers(s, kg, sp, now_ms).await
}

pub(crate) async fn update_shadow_partition_pointers(
    s: &Script,
    kg: &KeyGenerator,
    sp: &ShadowPartition,
    now_ms: i64,
) -> Result<(), QueueError> {
    if sp.is_leased(now_ms) || sp.force_at_ms > now_ms {
        return Ok(());
    }
    match s.zmin(&kg.shadow_partition_set(&sp.partition_id)).await? {
        Some((_, earliest)) => set_shadow_pointer(s, kg, sp, earliest).await,
        None => remove_shadow_pointer(s, kg, sp).await,
    }
}

pub(crate) async fn set_shadow_pointer(
    s: &Script,
    kg: &KeyGenerator,
    sp: &ShadowPartition,
    score: i64,
) -> Result<(), QueueError> {
    s.zadd(&kg.global_shadow_partition_set(), &sp.partition_id, score)
        .await?;
    if let Some(account_id) = sp.account_id {
        let account_set = kg.account_shadow_partition_set(&account_id);
        s.zadd(&account_set, &sp.partition_id, score).await?;
        refresh_account_pointer(
            s,
            &account_set,
            &kg.global_account_shadow_partitions(),
            &account_id,
        )
        .await?;
    }
    Ok(())
}

pub(crate) async fn remove_shadow_pointer(
    s: &Script,
    kg: &KeyGenerator,
    sp: &ShadowPartition,
) -> Result<(), QueueError> {
    s.zrem(&kg.global_shadow_partition_set(), &sp.partition_id)
        .await?;
    if let Some(account_id) = sp.account_id {
        let account_set = kg.account_shadow_partition_set(&account_id);
        s.zrem(&account_set, &sp.partition_id).await?;
        refresh_account_pointer(
            s,
            &account_set,
            &kg.global_account_shadow_partitions(),
            &account_id,
        )
        .await?;
    }
    Ok(())
}

/// Account used by the normalize indexes; system partitions share the nil account.
pub(crate) fn normalize_account(sp: &ShadowPartition) -> Uuid {
    sp.account_id.unwrap_or(Uuid::nil())
}
