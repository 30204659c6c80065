//! Ready-side partition lease, requeue and peeks.

use tracing::{debug, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::partition::{PartitionConstraints, QueuePartition};
use crate::queue_shard::helpers::{
    FnMetadata, load_partition, remove_ready_pointer, scripts, set_ready_pointer,
};
use crate::queue_shard::peek::{PeekResult, Peeker};
use crate::queue_shard::script::{ScoreRange, Script};
use crate::queue_shard::{QueueError, QueueShard};

#[derive(Debug, Clone, Default)]
pub struct PartitionLeaseOptions {
    /// Lease even if the partition or account is at its in-progress limit.
    pub disable_concurrency_checks: bool,
}

impl QueueShard {
    /// Exclusive lease on a partition for scheduling its ready queue.
    pub async fn partition_lease(
        &self,
        partition_id: &str,
        duration_ms: i64,
        opts: PartitionLeaseOptions,
    ) -> Result<Ulid, QueueError> {
        let account = self
            .partition(partition_id)
            .await?
            .and_then(|p| p.account_id);
        let constraints = self
            .tenants
            .partition_constraints(account, partition_id)
            .await;

        let lease_id = self
            .run_script(scripts::PARTITION_LEASE, || {
                self.partition_lease_inner(partition_id, duration_ms, &constraints, &opts)
            })
            .await?;
        debug!(shard = %self.name, partition = %partition_id, lease = %lease_id, "leased partition");
        Ok(lease_id)
    }

    async fn partition_lease_inner(
        &self,
        partition_id: &str,
        duration_ms: i64,
        constraints: &PartitionConstraints,
        opts: &PartitionLeaseOptions,
    ) -> Result<Ulid, QueueError> {
        let kg = &self.kg;
        let now_ms = self.now_ms();
        let s = Script::begin(&self.db).await?;

        let Some(mut partition) = load_partition(&s, kg, partition_id).await? else {
            return Err(QueueError::PartitionNotFound(partition_id.to_string()));
        };
        if partition.paused {
            return Err(QueueError::PartitionPaused(partition_id.to_string()));
        }
        if partition.is_leased(now_ms) {
            return Err(QueueError::PartitionAlreadyLeased(partition_id.to_string()));
        }

        if !opts.disable_concurrency_checks {
            let function_limit = if partition.is_system() {
                constraints.concurrency.system_concurrency
            } else {
                constraints.concurrency.function_concurrency
            };
            if function_limit > 0 && s.zcard(&kg.in_progress(partition_id)).await? >= function_limit {
                return Err(QueueError::PartitionConcurrencyLimit {
                    key: partition_id.to_string(),
                });
            }
            if let Some(account_id) = partition.account_id {
                let limit = constraints.concurrency.account_concurrency;
                if limit > 0 && s.zcard(&kg.in_progress_account(&account_id)).await? >= limit {
                    return Err(QueueError::AccountConcurrencyLimit {
                        key: account_id.to_string(),
                    });
                }
            }
        }

        let expires_at_ms = now_ms + duration_ms;
        let lease_id = self.lease_ids.next(expires_at_ms);
        partition.lease_id = Some(lease_id);
        partition.last = now_ms;
        s.hset(&kg.partition_item(), partition_id, &partition)?;
        set_ready_pointer(&s, kg, &partition, expires_at_ms).await?;

        s.commit().await?;
        Ok(lease_id)
    }

    /// Release a partition lease and schedule its next visit.
    ///
    /// With `force` the partition is hidden until `at_ms` even if it has
    /// earlier items. A partition with no ready or in-progress items is
    /// deleted and `PartitionGarbageCollected` returned.
    pub async fn partition_requeue(
        &self,
        partition_id: &str,
        at_ms: i64,
        force: bool,
    ) -> Result<(), QueueError> {
        let result = self
            .run_script(scripts::PARTITION_REQUEUE, || {
                self.partition_requeue_inner(partition_id, at_ms, force)
            })
            .await;
        if let Err(QueueError::PartitionGarbageCollected(_)) = &result {
            debug!(shard = %self.name, partition = %partition_id, "garbage collected empty partition");
        }
        result
    }

    async fn partition_requeue_inner(
        &self,
        partition_id: &str,
        at_ms: i64,
        force: bool,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        let s = Script::begin(&self.db).await?;

        let Some(mut partition) = load_partition(&s, kg, partition_id).await? else {
            return Err(QueueError::PartitionNotFound(partition_id.to_string()));
        };

        let earliest = s.zmin(&kg.ready(partition_id)).await?.map(|(_, score)| score);
        if earliest.is_none() && s.zcard(&kg.in_progress(partition_id)).await? == 0 {
            remove_ready_pointer(&s, kg, &partition).await?;
            s.hdel(&kg.partition_item(), partition_id)?;
            s.commit().await?;
            return Err(QueueError::PartitionGarbageCollected(partition_id.to_string()));
        }

        partition.lease_id = None;
        let score = if force {
            partition.force_at_ms = at_ms;
            at_ms
        } else {
            partition.force_at_ms = 0;
            earliest.map(|e| e.min(at_ms)).unwrap_or(at_ms)
        };
        s.hset(&kg.partition_item(), partition_id, &partition)?;
        set_ready_pointer(&s, kg, &partition, score).await?;

        s.commit().await
    }

    /// Drop a partition and its pointers if it has nothing queued or running.
    pub async fn partition_dequeue(&self, partition_id: &str) -> Result<bool, QueueError> {
        self.run_script(scripts::PARTITION_DEQUEUE, || async {
            let kg = &self.kg;
            let s = Script::begin(&self.db).await?;
            let Some(partition) = load_partition(&s, kg, partition_id).await? else {
                return Ok(false);
            };
            if s.zcard(&kg.ready(partition_id)).await? > 0
                || s.zcard(&kg.in_progress(partition_id)).await? > 0
            {
                return Ok(false);
            }
            remove_ready_pointer(&s, kg, &partition).await?;
            s.hdel(&kg.partition_item(), partition_id)?;
            s.commit().await?;
            Ok(true)
        })
        .await
    }

    /// Partitions visible by `until_ms`, globally or within one account.
    pub async fn partition_peek(
        &self,
        account_id: Option<Uuid>,
        sequential: bool,
        until_ms: i64,
        limit: usize,
    ) -> Result<PeekResult<QueuePartition>, QueueError> {
        let set = match account_id {
            Some(a) => self.kg.account_partition_index(&a),
            None => self.kg.global_partition_index(),
        };
        Peeker::new(
            self,
            set,
            self.kg.partition_item(),
            self.config.partition_peek_max,
            "partition",
        )
        .remove_missing_pointers()
        .peek(sequential, ScoreRange::up_to(until_ms), limit)
        .await
    }

    /// Accounts with partitions visible by `until_ms`.
    pub async fn account_peek(
        &self,
        sequential: bool,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<Uuid>, QueueError> {
        if limit > self.config.account_peek_max {
            return Err(QueueError::PeekExceedsMaxLimits {
                limit,
                max: self.config.account_peek_max,
            });
        }
        let (members, _) = self
            .peek_members(
                &self.kg.global_account_index(),
                sequential,
                ScoreRange::up_to(until_ms),
                limit,
            )
            .await?;
        Ok(parse_accounts(members))
    }

    /// Pause or resume a function. Paused partitions cannot be leased.
    pub async fn set_function_paused(&self, function_id: Uuid, paused: bool) -> Result<(), QueueError> {
        let field = function_id.to_string();
        self.run_script(scripts::PAUSE_FUNCTION, || async {
            let kg = &self.kg;
            let s = Script::begin(&self.db).await?;
            s.hset(
                &kg.fn_metadata(),
                &field,
                &FnMetadata {
                    function_id,
                    paused,
                },
            )?;
            if let Some(mut partition) = load_partition(&s, kg, &field).await? {
                partition.paused = paused;
                s.hset(&kg.partition_item(), &field, &partition)?;
            }
            s.commit().await
        })
        .await?;
        debug!(shard = %self.name, function = %function_id, paused, "set function paused");
        Ok(())
    }
}

pub(crate) fn parse_accounts(members: Vec<(String, i64)>) -> Vec<Uuid> {
    members
        .into_iter()
        .filter_map(|(member, _)| match Uuid::parse_str(&member) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(%member, error = %e, "ignoring malformed account pointer");
                None
            }
        })
        .collect()
}
