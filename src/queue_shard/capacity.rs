//! Guaranteed-capacity account leases.
//!
//! An account with guaranteed capacity `n` has numbered lease slots `0..n`.
//! Slots are claimed in order; a claim names the slot it expects to take so
//! two workers racing for the same slot cannot both win.

use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;
use uuid::Uuid;

use crate::keys::KeyGenerator;
use crate::queue_shard::helpers::scripts;
use crate::queue_shard::script::Script;
use crate::queue_shard::{QueueError, QueueShard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteedCapacity {
    #[serde(rename = "n", default)]
    pub name: String,
    #[serde(rename = "s")]
    pub scope: String,
    #[serde(rename = "a")]
    pub account_id: Uuid,
    #[serde(rename = "p", default)]
    pub priority: u32,
    #[serde(rename = "gc")]
    pub guaranteed_capacity: u32,
    /// Lease ids by slot; a lease's timestamp is its expiry.
    #[serde(rename = "l", default, skip_serializing_if = "Vec::is_empty")]
    pub leases: Vec<Ulid>,
}

impl GuaranteedCapacity {
    pub fn for_account(account_id: Uuid, priority: u32, guaranteed_capacity: u32) -> Self {
        Self {
            name: String::new(),
            scope: "account".to_string(),
            account_id,
            priority,
            guaranteed_capacity,
            leases: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        capacity_key(&self.account_id)
    }

    /// Leases that have not expired at `now_ms`.
    pub fn valid_leases(&self, now_ms: i64) -> Vec<Ulid> {
        self.leases
            .iter()
            .copied()
            .filter(|l| l.timestamp_ms() as i64 > now_ms)
            .collect()
    }
}

fn capacity_key(account_id: &Uuid) -> String {
    format!("a:{}", account_id)
}

/// Insert or update an entry, keeping its current leases.
pub(crate) async fn upsert_capacity(
    s: &Script,
    kg: &KeyGenerator,
    capacity: &GuaranteedCapacity,
) -> Result<(), QueueError> {
    let key = capacity.key();
    let existing: Option<GuaranteedCapacity> = s.hget(&kg.guaranteed_capacity_map(), &key).await?;
    let mut entry = capacity.clone();
    if let Some(existing) = existing {
        if existing.priority == entry.priority
            && existing.guaranteed_capacity == entry.guaranteed_capacity
            && existing.name == entry.name
        {
            return Ok(());
        }
        entry.leases = existing.leases;
    }
    s.hset(&kg.guaranteed_capacity_map(), &key, &entry)
}

impl QueueShard {
    pub async fn set_guaranteed_capacity(&self, capacity: &GuaranteedCapacity) -> Result<(), QueueError> {
        self.run_script(scripts::CAPACITY_SET, || async {
            let s = Script::begin(&self.db).await?;
            upsert_capacity(&s, &self.kg, capacity).await?;
            s.commit().await
        })
        .await
    }

    pub async fn remove_guaranteed_capacity(&self, account_id: Uuid) -> Result<(), QueueError> {
        self.run_script(scripts::CAPACITY_SET, || async {
            let s = Script::begin(&self.db).await?;
            s.hdel(&self.kg.guaranteed_capacity_map(), &capacity_key(&account_id))?;
            s.commit().await
        })
        .await
    }

    pub async fn guaranteed_capacity(&self, account_id: Uuid) -> Result<Option<GuaranteedCapacity>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        s.hget(&self.kg.guaranteed_capacity_map(), &capacity_key(&account_id))
            .await
    }

    pub async fn guaranteed_capacities(&self) -> Result<Vec<GuaranteedCapacity>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        let mut out = Vec::new();
        for (_, raw) in s.hgetall_raw(&self.kg.guaranteed_capacity_map()).await? {
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    /// Claim slot `index` of an account's guaranteed capacity.
    ///
    /// `index` must be the next free slot: a lower index is already held
    /// (`AllShardsAlreadyLeased`) and a higher one skips a slot
    /// (`ShardLeaseIndexInvalid`).
    pub async fn acquire_account_lease(
        &self,
        account_id: Uuid,
        index: usize,
        duration_ms: i64,
    ) -> Result<Ulid, QueueError> {
        let lease_id = self
            .run_script(scripts::CAPACITY_ACQUIRE, || async {
                let kg = &self.kg;
                let key = capacity_key(&account_id);
                let now_ms = self.now_ms();
                let s = Script::begin(&self.db).await?;
                let Some(mut entry) = s
                    .hget::<GuaranteedCapacity>(&kg.guaranteed_capacity_map(), &key)
                    .await?
                else {
                    return Err(QueueError::GuaranteedCapacityNotFound(key));
                };

                let mut valid = entry.valid_leases(now_ms);
                if index < valid.len() {
                    return Err(QueueError::AllShardsAlreadyLeased { key, index });
                }
                if index > valid.len() {
                    return Err(QueueError::ShardLeaseIndexInvalid {
                        index,
                        next: valid.len(),
                    });
                }
                if index >= entry.guaranteed_capacity as usize {
                    return Err(QueueError::ShardLeaseExceedsLimits {
                        index,
                        limit: entry.guaranteed_capacity,
                    });
                }

                let lease_id = self.lease_ids.next(now_ms + duration_ms);
                valid.push(lease_id);
                entry.leases = valid;
                s.hset(&kg.guaranteed_capacity_map(), &key, &entry)?;
                s.commit().await?;
                Ok(lease_id)
            })
            .await?;
        debug!(shard = %self.name, account = %account_id, index, lease = %lease_id, "acquired account lease");
        Ok(lease_id)
    }

    /// Rotate a held account lease. A zero duration releases it.
    pub async fn renew_account_lease(
        &self,
        account_id: Uuid,
        lease_id: Ulid,
        duration_ms: i64,
    ) -> Result<Ulid, QueueError> {
        self.run_script(scripts::CAPACITY_RENEW, || async {
            let kg = &self.kg;
            let key = capacity_key(&account_id);
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            let Some(mut entry) = s
                .hget::<GuaranteedCapacity>(&kg.guaranteed_capacity_map(), &key)
                .await?
            else {
                return Err(QueueError::GuaranteedCapacityNotFound(key));
            };
            let Some(slot) = entry.leases.iter().position(|l| *l == lease_id) else {
                return Err(QueueError::ShardLeaseNotFound(key));
            };
            if lease_id.timestamp_ms() as i64 <= now_ms {
                return Err(QueueError::ShardLeaseExpired(key));
            }
            let next = self.lease_ids.next(now_ms + duration_ms.max(0));
            entry.leases[slot] = next;
            s.hset(&kg.guaranteed_capacity_map(), &key, &entry)?;
            s.commit().await?;
            Ok(next)
        })
        .await
    }
}
