//! Partitions, shadow partitions and backlogs.
//!
//! A partition owns a ready queue and an in-progress set. Its shadow partition
//! owns one backlog per throttle + concurrency-key fingerprint; items wait in a
//! backlog until refill admits them into the ready queue.

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::item::{ConcurrencyScope, ItemKind, QueueItem, short_hash};

/// Routing handle for a function or a named system queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePartition {
    pub id: String,
    #[serde(rename = "queue", default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(rename = "wid", default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<Uuid>,
    #[serde(rename = "wsID", default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<Uuid>,
    #[serde(rename = "aID", default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(rename = "off", default)]
    pub paused: bool,
    /// Last time the partition was leased.
    #[serde(default)]
    pub last: i64,
    #[serde(rename = "forceAtMS", default)]
    pub force_at_ms: i64,
    #[serde(rename = "leaseID", default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Ulid>,
}

impl QueuePartition {
    pub fn for_item(item: &QueueItem) -> Self {
        Self {
            id: item.partition_id(),
            queue_name: item.queue_name.clone(),
            function_id: (!item.is_system()).then_some(item.function_id),
            env_id: (!item.is_system()).then_some(item.workspace_id),
            account_id: (!item.is_system()).then_some(item.account_id()),
            paused: false,
            last: 0,
            force_at_ms: 0,
            lease_id: None,
        }
    }

    /// The ready-side partition of a shadow partition.
    pub fn for_shadow(sp: &ShadowPartition) -> Self {
        Self {
            id: sp.partition_id.clone(),
            queue_name: sp.system_queue_name.clone(),
            function_id: sp.function_id,
            env_id: sp.env_id,
            account_id: sp.account_id,
            paused: false,
            last: 0,
            force_at_ms: 0,
            lease_id: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.queue_name.is_some()
    }

    pub fn is_leased(&self, now_ms: i64) -> bool {
        self.lease_id
            .map(|l| l.timestamp_ms() as i64 > now_ms)
            .unwrap_or(false)
    }
}

/// Limit for one custom concurrency key expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrencyLimit {
    #[serde(rename = "m")]
    pub scope: ConcurrencyScope,
    #[serde(rename = "k")]
    pub key_expression_hash: String,
    #[serde(rename = "l")]
    pub limit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowPartitionConcurrency {
    #[serde(rename = "sc", default)]
    pub system_concurrency: i64,
    #[serde(rename = "ac", default)]
    pub account_concurrency: i64,
    #[serde(rename = "fc", default)]
    pub function_concurrency: i64,
    #[serde(rename = "cck", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrencyLimit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowPartitionThrottle {
    #[serde(rename = "tkh")]
    pub key_expression_hash: String,
    #[serde(rename = "l")]
    pub limit: i64,
    #[serde(rename = "b", default)]
    pub burst: i64,
    #[serde(rename = "p")]
    pub period_secs: i64,
}

/// Current constraints of a function, as reported by tenant configuration.
///
/// A limit of zero or less means the dimension is unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionConstraints {
    pub function_version: i32,
    pub concurrency: ShadowPartitionConcurrency,
    pub throttle: Option<ShadowPartitionThrottle>,
}

/// Pre-admission side of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowPartition {
    #[serde(rename = "id")]
    pub partition_id: String,
    #[serde(rename = "fv", default)]
    pub function_version: i32,
    #[serde(rename = "leaseID", default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Ulid>,
    #[serde(rename = "fid", default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<Uuid>,
    #[serde(rename = "eid", default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<Uuid>,
    #[serde(rename = "aid", default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(rename = "queueName", default, skip_serializing_if = "Option::is_none")]
    pub system_queue_name: Option<String>,
    #[serde(rename = "norefill", default)]
    pub pause_refill: bool,
    #[serde(rename = "noenqueue", default)]
    pub pause_enqueue: bool,
    #[serde(rename = "forceAtMS", default)]
    pub force_at_ms: i64,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ShadowPartitionConcurrency>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ShadowPartitionThrottle>,
}

impl ShadowPartition {
    pub fn for_item(item: &QueueItem, constraints: &PartitionConstraints) -> Self {
        let mut sp = Self {
            partition_id: item.partition_id(),
            function_version: 0,
            lease_id: None,
            function_id: (!item.is_system()).then_some(item.function_id),
            env_id: (!item.is_system()).then_some(item.workspace_id),
            account_id: (!item.is_system()).then_some(item.account_id()),
            system_queue_name: item.queue_name.clone(),
            pause_refill: false,
            pause_enqueue: false,
            force_at_ms: 0,
            concurrency: None,
            throttle: None,
        };
        sp.apply_constraints(constraints);
        sp
    }

    /// Overwrite limits with the latest tenant configuration.
    pub fn apply_constraints(&mut self, constraints: &PartitionConstraints) {
        self.function_version = constraints.function_version;
        self.concurrency = Some(constraints.concurrency.clone());
        self.throttle = constraints.throttle.clone();
    }

    pub fn is_leased(&self, now_ms: i64) -> bool {
        self.lease_id
            .map(|l| l.timestamp_ms() as i64 > now_ms)
            .unwrap_or(false)
    }

    pub fn account_limit(&self) -> i64 {
        self.concurrency
            .as_ref()
            .map(|c| c.account_concurrency)
            .unwrap_or(0)
    }

    pub fn function_limit(&self) -> i64 {
        self.concurrency
            .as_ref()
            .map(|c| {
                if self.system_queue_name.is_some() {
                    c.system_concurrency
                } else {
                    c.function_concurrency
                }
            })
            .unwrap_or(0)
    }

    /// Current limit of a backlog's concurrency key, if still configured.
    pub fn custom_key_limit(&self, key: &BacklogConcurrencyKey) -> Option<i64> {
        self.concurrency.as_ref().and_then(|c| {
            c.custom_concurrency_keys
                .iter()
                .find(|l| l.scope == key.scope && l.key_expression_hash == key.key_expression_hash)
                .map(|l| l.limit)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogConcurrencyKey {
    #[serde(rename = "kid")]
    pub canonical_key_id: String,
    #[serde(rename = "cs")]
    pub scope: ConcurrencyScope,
    #[serde(rename = "cse")]
    pub entity_id: Uuid,
    #[serde(rename = "cke")]
    pub key_expression_hash: String,
    #[serde(rename = "ckv")]
    pub value_hash: String,
    #[serde(rename = "ckuv", default)]
    pub unhashed_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogThrottle {
    #[serde(rename = "tk")]
    pub key: String,
    #[serde(rename = "tkh")]
    pub key_expression_hash: String,
}

/// Why a backlog no longer matches its shadow partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutdatedReason {
    Unchanged,
    ThrottleRemoved,
    ThrottleKeyChanged,
    CustomKeyCountMismatch,
    CustomKeyNotFound,
}

impl OutdatedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutdatedReason::Unchanged => "unchanged",
            OutdatedReason::ThrottleRemoved => "throttle_removed",
            OutdatedReason::ThrottleKeyChanged => "throttle_key_changed",
            OutdatedReason::CustomKeyCountMismatch => "custom_key_count_mismatch",
            OutdatedReason::CustomKeyNotFound => "custom_key_not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBacklog {
    #[serde(rename = "id")]
    pub backlog_id: String,
    #[serde(rename = "sid")]
    pub shadow_partition_id: String,
    #[serde(default)]
    pub start: bool,
    #[serde(rename = "ck", default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency_keys: Vec<BacklogConcurrencyKey>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<BacklogThrottle>,
    /// Function version of the first item that created the backlog.
    #[serde(rename = "fv", default, skip_serializing_if = "is_zero")]
    pub earliest_function_version: i32,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl QueueBacklog {
    /// The backlog an item belongs to under its current throttle and keys.
    pub fn for_item(item: &QueueItem) -> Self {
        let start = item.data.kind == ItemKind::Start;
        let throttle = item.data.throttle.as_ref().map(|t| BacklogThrottle {
            key: t.key.clone(),
            key_expression_hash: t.key_expression_hash.clone(),
        });
        let concurrency_keys: Vec<BacklogConcurrencyKey> = item
            .data
            .custom_concurrency_keys
            .iter()
            .map(|k| BacklogConcurrencyKey {
                canonical_key_id: k.canonical_id(),
                scope: k.scope,
                entity_id: k.entity_id,
                key_expression_hash: k.key_expression_hash.clone(),
                value_hash: k.value_hash.clone(),
                unhashed_value: k.unhashed_value.clone(),
            })
            .collect();

        let mut backlog_id = format!("fn:{}", item.partition_id());
        if start {
            backlog_id.push_str(":start");
        }
        if let Some(t) = &throttle {
            backlog_id.push_str(&format!(":t{}", short_hash(&t.key)));
        }
        for (i, k) in concurrency_keys.iter().enumerate() {
            backlog_id.push_str(&format!(":c{}{}", i + 1, short_hash(&k.canonical_key_id)));
        }

        Self {
            backlog_id,
            shadow_partition_id: item.partition_id(),
            start,
            concurrency_keys,
            throttle,
            earliest_function_version: item.data.identifier.function_version,
        }
    }

    /// No throttle and no custom keys.
    pub fn is_default(&self) -> bool {
        self.throttle.is_none() && self.concurrency_keys.is_empty()
    }

    pub fn is_outdated(&self, sp: &ShadowPartition) -> OutdatedReason {
        let Some(concurrency) = &sp.concurrency else {
            return OutdatedReason::Unchanged;
        };
        // constraints older than the backlog's items cannot judge it
        if self.earliest_function_version > 0
            && sp.function_version > 0
            && self.earliest_function_version > sp.function_version
        {
            return OutdatedReason::Unchanged;
        }
        // default backlogs hold items enqueued before any keys existed
        if self.is_default() {
            return OutdatedReason::Unchanged;
        }

        if let Some(throttle) = &self.throttle {
            match &sp.throttle {
                None => return OutdatedReason::ThrottleRemoved,
                Some(current) if current.key_expression_hash != throttle.key_expression_hash => {
                    return OutdatedReason::ThrottleKeyChanged;
                }
                Some(_) => {}
            }
        }

        if self.concurrency_keys.len() != concurrency.custom_concurrency_keys.len() {
            return OutdatedReason::CustomKeyCountMismatch;
        }
        for key in &self.concurrency_keys {
            let found = concurrency
                .custom_concurrency_keys
                .iter()
                .any(|l| l.scope == key.scope && l.key_expression_hash == key.key_expression_hash);
            if !found {
                return OutdatedReason::CustomKeyNotFound;
            }
        }

        OutdatedReason::Unchanged
    }
}
