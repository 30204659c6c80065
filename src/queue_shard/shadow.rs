//! Shadow partition lease, extend, requeue and peeks.
//!
//! A shadow partition is leased by one shadow worker at a time. While leased
//! (or forced into the future) its pointers sit at the lease expiry or forced
//! time instead of its earliest backlog.

use tracing::debug;
use ulid::Ulid;
use uuid::Uuid;

use crate::partition::{PartitionConstraints, QueueBacklog, ShadowPartition};
use crate::queue_shard::helpers::{
    load_shadow_partition, remove_shadow_pointer, scripts, set_shadow_pointer,
    update_shadow_partition_pointers,
};
use crate::queue_shard::partitions::parse_accounts;
use crate::queue_shard::peek::{PeekResult, Peeker};
use crate::queue_shard::script::{ScoreRange, Script};
use crate::queue_shard::{QueueError, QueueShard};

impl QueueShard {
    pub async fn shadow_partition_lease(
        &self,
        partition_id: &str,
        duration_ms: i64,
    ) -> Result<Ulid, QueueError> {
        self.run_script(scripts::SHADOW_LEASE, || async {
            let kg = &self.kg;
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            let Some(mut sp) = load_shadow_partition(&s, kg, partition_id).await? else {
                return Err(QueueError::ShadowPartitionNotFound(partition_id.to_string()));
            };
            if sp.is_leased(now_ms) {
                return Err(QueueError::ShadowPartitionAlreadyLeased(
                    partition_id.to_string(),
                ));
            }
            let expires_at_ms = now_ms + duration_ms;
            let lease_id = self.lease_ids.next(expires_at_ms);
            sp.lease_id = Some(lease_id);
            s.hset(&kg.shadow_partition_meta(), partition_id, &sp)?;
            set_shadow_pointer(&s, kg, &sp, expires_at_ms).await?;
            s.commit().await?;
            Ok(lease_id)
        })
        .await
    }

    /// Renew a held shadow partition lease. Fails with `ShadowPartitionPaused`
    /// once refill has been paused so the holder stops working on it.
    pub async fn shadow_partition_extend_lease(
        &self,
        partition_id: &str,
        lease_id: Ulid,
        duration_ms: i64,
    ) -> Result<Ulid, QueueError> {
        self.run_script(scripts::SHADOW_EXTEND, || async {
            let kg = &self.kg;
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            let Some(mut sp) = load_shadow_partition(&s, kg, partition_id).await? else {
                return Err(QueueError::ShadowPartitionNotFound(partition_id.to_string()));
            };
            check_shadow_lease(&sp, partition_id, lease_id)?;
            if sp.pause_refill {
                return Err(QueueError::ShadowPartitionPaused(partition_id.to_string()));
            }
            let expires_at_ms = now_ms + duration_ms;
            let next = self.lease_ids.next(expires_at_ms);
            sp.lease_id = Some(next);
            s.hset(&kg.shadow_partition_meta(), partition_id, &sp)?;
            set_shadow_pointer(&s, kg, &sp, expires_at_ms).await?;
            s.commit().await?;
            Ok(next)
        })
        .await
    }

    /// Release a shadow partition lease. With `force_until_ms` the partition
    /// stays hidden until then; otherwise it is visible at its earliest backlog.
    pub async fn shadow_partition_requeue(
        &self,
        partition_id: &str,
        lease_id: Ulid,
        force_until_ms: Option<i64>,
    ) -> Result<(), QueueError> {
        self.run_script(scripts::SHADOW_REQUEUE, || async {
            let kg = &self.kg;
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            let Some(mut sp) = load_shadow_partition(&s, kg, partition_id).await? else {
                return Err(QueueError::ShadowPartitionNotFound(partition_id.to_string()));
            };
            check_shadow_lease(&sp, partition_id, lease_id)?;
            sp.lease_id = None;
            match force_until_ms {
                Some(until) => {
                    sp.force_at_ms = until;
                    s.hset(&kg.shadow_partition_meta(), partition_id, &sp)?;
                    if s.zcard(&kg.shadow_partition_set(partition_id)).await? > 0 {
                        set_shadow_pointer(&s, kg, &sp, until).await?;
                    } else {
                        remove_shadow_pointer(&s, kg, &sp).await?;
                    }
                }
                None => {
                    sp.force_at_ms = 0;
                    s.hset(&kg.shadow_partition_meta(), partition_id, &sp)?;
                    update_shadow_partition_pointers(&s, kg, &sp, now_ms).await?;
                }
            }
            s.commit().await
        })
        .await?;
        debug!(shard = %self.name, partition = %partition_id, force_until = ?force_until_ms, "requeued shadow partition");
        Ok(())
    }

    /// Shadow partitions visible by `until_ms`, globally or within one account.
    pub async fn shadow_partition_peek(
        &self,
        account_id: Option<Uuid>,
        sequential: bool,
        until_ms: i64,
        limit: usize,
    ) -> Result<PeekResult<ShadowPartition>, QueueError> {
        let set = match account_id {
            Some(a) => self.kg.account_shadow_partition_set(&a),
            None => self.kg.global_shadow_partition_set(),
        };
        Peeker::new(
            self,
            set,
            self.kg.shadow_partition_meta(),
            self.config.shadow_partition_peek_max,
            "shadow_partition",
        )
        .remove_missing_pointers()
        .peek(sequential, ScoreRange::up_to(until_ms), limit)
        .await
    }

    /// Accounts with shadow partitions visible by `until_ms`.
    pub async fn shadow_account_peek(
        &self,
        sequential: bool,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<Uuid>, QueueError> {
        if limit > self.config.shadow_account_peek_max {
            return Err(QueueError::PeekExceedsMaxLimits {
                limit,
                max: self.config.shadow_account_peek_max,
            });
        }
        let (members, _) = self
            .peek_members(
                &self.kg.global_account_shadow_partitions(),
                sequential,
                ScoreRange::up_to(until_ms),
                limit,
            )
            .await?;
        Ok(parse_accounts(members))
    }

    /// Backlogs of a shadow partition with items visible by `until_ms`.
    pub async fn backlog_peek(
        &self,
        partition_id: &str,
        sequential: bool,
        until_ms: i64,
        limit: usize,
    ) -> Result<PeekResult<QueueBacklog>, QueueError> {
        Peeker::new(
            self,
            self.kg.shadow_partition_set(partition_id),
            self.kg.backlog_meta(),
            self.config.backlog_peek_max,
            "backlog",
        )
        .remove_missing_pointers()
        .peek(sequential, ScoreRange::up_to(until_ms), limit)
        .await
    }

    /// Stop or resume refilling a shadow partition's backlogs.
    pub async fn set_pause_refill(&self, partition_id: &str, paused: bool) -> Result<(), QueueError> {
        self.run_script(scripts::SHADOW_PAUSE_REFILL, || async {
            let kg = &self.kg;
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            let Some(mut sp) = load_shadow_partition(&s, kg, partition_id).await? else {
                return Err(QueueError::ShadowPartitionNotFound(partition_id.to_string()));
            };
            sp.pause_refill = paused;
            s.hset(&kg.shadow_partition_meta(), partition_id, &sp)?;
            if !paused {
                update_shadow_partition_pointers(&s, kg, &sp, now_ms).await?;
            }
            s.commit().await
        })
        .await
    }

    /// Store the latest tenant limits on a shadow partition.
    pub async fn refresh_shadow_partition_constraints(
        &self,
        partition_id: &str,
        constraints: &PartitionConstraints,
    ) -> Result<ShadowPartition, QueueError> {
        self.run_script(scripts::SHADOW_REFRESH, || async {
            let kg = &self.kg;
            let s = Script::begin(&self.db).await?;
            let Some(mut sp) = load_shadow_partition(&s, kg, partition_id).await? else {
                return Err(QueueError::ShadowPartitionNotFound(partition_id.to_string()));
            };
            if sp.concurrency.as_ref() == Some(&constraints.concurrency)
                && sp.throttle == constraints.throttle
                && sp.function_version == constraints.function_version
            {
                return Ok(sp);
            }
            sp.apply_constraints(constraints);
            s.hset(&kg.shadow_partition_meta(), partition_id, &sp)?;
            s.commit().await?;
            Ok(sp)
        })
        .await
    }
}

fn check_shadow_lease(sp: &ShadowPartition, partition_id: &str, lease_id: Ulid) -> Result<(), QueueError> {
    match sp.lease_id {
        None => Err(QueueError::ShadowPartitionLeaseNotFound(
            partition_id.to_string(),
        )),
        Some(current) if current != lease_id => Err(QueueError::ShadowPartitionAlreadyLeased(
            partition_id.to_string(),
        )),
        Some(_) => Ok(()),
    }
}
