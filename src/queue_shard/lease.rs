//! Item lease, extend, dequeue and requeue.

use tracing::debug;
use ulid::Ulid;

use crate::item::QueueItem;
use crate::partition::{PartitionConstraints, QueueBacklog, QueuePartition, ShadowPartition};
use crate::queue_shard::helpers::{
    clear_status, item_active_sets, load_item, load_partition, load_shadow_partition,
    mark_in_progress, mark_queued, remove_ready_pointer, scripts, update_backlog_pointer,
    update_ready_pointers, update_scavenger_index,
};
use crate::queue_shard::script::Script;
use crate::queue_shard::{QueueError, QueueShard};

#[derive(Debug, Clone, Default)]
pub struct LeaseOptions {
    /// Skip the active-set limit checks for this lease.
    pub disable_constraint_checks: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DequeueOptions {
    /// Do not record the id as seen; it may be enqueued again right away.
    pub disable_idempotency: bool,
}

/// Where a requeued item goes back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequeueRoute {
    /// Items refilled from a backlog return to it; others to the ready queue.
    Origin,
    Ready,
}

impl QueueShard {
    /// Lease an item for `duration_ms`. The returned lease id embeds the expiry.
    pub async fn lease(
        &self,
        item: &QueueItem,
        duration_ms: i64,
        opts: LeaseOptions,
    ) -> Result<Ulid, QueueError> {
        let account = (!item.is_system()).then(|| item.account_id());
        let constraints = self
            .tenants
            .partition_constraints(account, &item.partition_id())
            .await;
        let disable_checks = opts.disable_constraint_checks
            || match account {
                Some(a) => self.tenants.disable_lease_checks(a).await,
                None => false,
            };

        let result = self
            .run_script(scripts::LEASE, || {
                self.lease_inner(&item.id, duration_ms, &constraints, disable_checks)
            })
            .await;

        match &result {
            Ok((lease_id, leased)) => {
                debug!(shard = %self.name, id = %item.id, lease = %lease_id, "leased item");
                if let Some(m) = &self.metrics {
                    let latency_ms = (self.now_ms() - leased.at_ms).max(0);
                    m.record_lease(&self.name, latency_ms as f64 / 1000.0);
                }
            }
            Err(e) => {
                if let (Some(c), Some(m)) = (e.constraint(), &self.metrics) {
                    m.record_lease_constraint(&self.name, c.as_str());
                }
            }
        }
        result.map(|(lease_id, _)| lease_id)
    }

    async fn lease_inner(
        &self,
        item_id: &str,
        duration_ms: i64,
        constraints: &PartitionConstraints,
        disable_checks: bool,
    ) -> Result<(Ulid, QueueItem), QueueError> {
        let kg = &self.kg;
        let now_ms = self.now_ms();
        let s = Script::begin(&self.db).await?;

        let Some(mut item) = load_item(&s, kg, item_id).await? else {
            return Err(QueueError::ItemNotFound(item_id.to_string()));
        };
        if item.is_leased(now_ms) {
            return Err(QueueError::ItemAlreadyLeased(item_id.to_string()));
        }

        if !disable_checks {
            self.check_lease_limits(&s, &item, constraints).await?;
        }

        if item.refilled_from.is_none() {
            if let Some(throttle) = &item.data.throttle {
                let gcra = throttle.gcra();
                let key = kg.throttle(&throttle.key);
                let tat = s
                    .get_string(&key, now_ms)
                    .await?
                    .and_then(|v| v.parse::<i64>().ok());
                if gcra.capacity(now_ms, tat) <= 0 {
                    return Err(QueueError::QueueItemThrottled {
                        key: throttle.key.clone(),
                    });
                }
                let next = gcra.consume(now_ms, tat, 1);
                s.set_string(&key, &next.to_string(), Some(now_ms + gcra.ttl_ms(next, now_ms)))?;
            }
        }

        let expires_at_ms = now_ms + duration_ms;
        let lease_id = self.lease_ids.next(expires_at_ms);
        let partition_id = item.partition_id();
        item.lease_id = Some(lease_id);
        if item.earliest_peek_time == 0 {
            item.earliest_peek_time = now_ms;
        }
        s.hset(&kg.queue_item(), &item.id, &item)?;

        s.zrem(&kg.ready(&partition_id), &item.id).await?;
        s.zadd(&kg.in_progress(&partition_id), &item.id, expires_at_ms)
            .await?;
        if !item.is_system() {
            s.zadd(
                &kg.in_progress_account(&item.account_id()),
                &item.id,
                expires_at_ms,
            )
            .await?;
        }
        s.zadd_lower(&kg.scavenger_index(), &partition_id, expires_at_ms)
            .await?;
        for set in item_active_sets(kg, &item) {
            s.zadd(&set, &item.id, now_ms).await?;
        }
        mark_in_progress(&s, kg, &item, expires_at_ms).await?;

        s.commit().await?;
        Ok((lease_id, item))
    }

    /// A set already holding the item never rejects it; otherwise a full set does.
    async fn check_lease_limits(
        &self,
        s: &Script,
        item: &QueueItem,
        constraints: &PartitionConstraints,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        let partition_id = item.partition_id();

        let function_limit = if item.is_system() {
            constraints.concurrency.system_concurrency
        } else {
            constraints.concurrency.function_concurrency
        };
        if at_limit(s, &kg.active_partition(&partition_id), &item.id, function_limit).await? {
            return Err(QueueError::PartitionConcurrencyLimit { key: partition_id });
        }

        if !item.is_system() {
            let account = item.account_id();
            let limit = constraints.concurrency.account_concurrency;
            if at_limit(s, &kg.active_account(&account), &item.id, limit).await? {
                return Err(QueueError::AccountConcurrencyLimit {
                    key: account.to_string(),
                });
            }
        }

        for (i, key) in item.data.custom_concurrency_keys.iter().enumerate() {
            let canonical = key.canonical_id();
            if at_limit(s, &kg.active_custom(&canonical), &item.id, key.limit).await? {
                return Err(QueueError::CustomConcurrencyLimit {
                    index: i + 1,
                    key: canonical,
                });
            }
        }
        Ok(())
    }

    /// Move a held lease forward. The old lease id stops being valid.
    pub async fn extend_lease(
        &self,
        item: &QueueItem,
        lease_id: Ulid,
        duration_ms: i64,
    ) -> Result<Ulid, QueueError> {
        self.run_script(scripts::EXTEND_LEASE, || {
            self.extend_lease_inner(&item.id, lease_id, duration_ms)
        })
        .await
    }

    async fn extend_lease_inner(
        &self,
        item_id: &str,
        lease_id: Ulid,
        duration_ms: i64,
    ) -> Result<Ulid, QueueError> {
        let kg = &self.kg;
        let now_ms = self.now_ms();
        let s = Script::begin(&self.db).await?;

        let Some(mut item) = load_item(&s, kg, item_id).await? else {
            return Err(QueueError::ItemNotFound(item_id.to_string()));
        };
        match item.lease_id {
            None => return Err(QueueError::LeaseNotFound(item_id.to_string())),
            Some(current) if current != lease_id => {
                return Err(QueueError::LeaseMismatch(item_id.to_string()));
            }
            Some(_) => {}
        }

        let expires_at_ms = now_ms + duration_ms;
        let next = self.lease_ids.next(expires_at_ms);
        let partition_id = item.partition_id();
        item.lease_id = Some(next);
        s.hset(&kg.queue_item(), &item.id, &item)?;

        s.zadd(&kg.in_progress(&partition_id), &item.id, expires_at_ms)
            .await?;
        if !item.is_system() {
            s.zadd(
                &kg.in_progress_account(&item.account_id()),
                &item.id,
                expires_at_ms,
            )
            .await?;
        }
        update_scavenger_index(&s, kg, &partition_id).await?;
        mark_in_progress(&s, kg, &item, expires_at_ms).await?;

        s.commit().await?;
        Ok(next)
    }

    /// Remove a finished item from every index. Missing items are a no-op.
    pub async fn dequeue(&self, item: &QueueItem, opts: DequeueOptions) -> Result<(), QueueError> {
        let removed = self
            .run_script(scripts::DEQUEUE, || self.dequeue_inner(&item.id, &opts))
            .await?;
        if removed {
            debug!(shard = %self.name, id = %item.id, "dequeued item");
            if let Some(m) = &self.metrics {
                m.record_dequeue(&self.name);
            }
        }
        Ok(())
    }

    async fn dequeue_inner(&self, item_id: &str, opts: &DequeueOptions) -> Result<bool, QueueError> {
        let kg = &self.kg;
        let now_ms = self.now_ms();
        let s = Script::begin(&self.db).await?;

        let Some(item) = load_item(&s, kg, item_id).await? else {
            return Ok(false);
        };
        let partition_id = item.partition_id();

        s.zrem(&kg.in_progress(&partition_id), &item.id).await?;
        if !item.is_system() {
            s.zrem(&kg.in_progress_account(&item.account_id()), &item.id)
                .await?;
        }
        s.zrem(&kg.ready(&partition_id), &item.id).await?;
        for set in item_active_sets(kg, &item) {
            s.zrem(&set, &item.id).await?;
        }
        s.zrem(
            &kg.run_index(&item.data.identifier.run_id.to_string()),
            &item.id,
        )
        .await?;
        clear_status(&s, kg, &item).await?;
        s.hdel(&kg.queue_item(), &item.id)?;

        // cancelled before refill
        let backlog = QueueBacklog::for_item(&item);
        if s.zrem(&kg.backlog_set(&backlog.backlog_id), &item.id).await? {
            if let Some(sp) = load_shadow_partition(&s, kg, &partition_id).await? {
                update_backlog_pointer(&s, kg, &sp, &backlog.backlog_id, now_ms).await?;
            }
        }

        update_scavenger_index(&s, kg, &partition_id).await?;

        if !opts.disable_idempotency {
            let period = item
                .idempotency_period_ms
                .unwrap_or(self.config.idempotency_ttl_ms);
            s.set_string(&kg.idempotency(&item.id), "1", Some(now_ms + period))?;
        }

        if s.zcard(&kg.ready(&partition_id)).await? == 0
            && s.zcard(&kg.in_progress(&partition_id)).await? == 0
        {
            if let Some(partition) = load_partition(&s, kg, &partition_id).await? {
                if !partition.is_leased(now_ms) {
                    remove_ready_pointer(&s, kg, &partition).await?;
                }
            }
        }

        s.commit().await?;
        Ok(true)
    }

    /// Return a leased item to the queue at `at_ms`.
    ///
    /// `item` carries the caller's view of the payload (e.g. a bumped attempt).
    /// Items refilled from a backlog go back into their backlog.
    pub async fn requeue(&self, item: &QueueItem, at_ms: i64) -> Result<(), QueueError> {
        let account = (!item.is_system()).then(|| item.account_id());
        let constraints = self
            .tenants
            .partition_constraints(account, &item.partition_id())
            .await;
        self.run_script(scripts::REQUEUE, || async {
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            let Some(mut stored) = load_item(&s, &self.kg, &item.id).await? else {
                return Err(QueueError::ItemNotFound(item.id.clone()));
            };
            stored.data = item.data.clone();
            self.requeue_in_script(&s, stored, at_ms, RequeueRoute::Origin, &constraints, now_ms)
                .await?;
            s.commit().await
        })
        .await?;

        debug!(shard = %self.name, id = %item.id, at = at_ms, "requeued item");
        if let Some(m) = &self.metrics {
            m.record_requeue(&self.name, "requeue");
        }
        Ok(())
    }

    /// Release the item's lease and put it back in a queue.
    pub(crate) async fn requeue_in_script(
        &self,
        s: &Script,
        mut item: QueueItem,
        at_ms: i64,
        route: RequeueRoute,
        constraints: &PartitionConstraints,
        now_ms: i64,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        let partition_id = item.partition_id();

        item.lease_id = None;
        item.at_ms = at_ms;
        item.wall_time_ms = at_ms;

        s.zrem(&kg.in_progress(&partition_id), &item.id).await?;
        if !item.is_system() {
            s.zrem(&kg.in_progress_account(&item.account_id()), &item.id)
                .await?;
        }
        for set in item_active_sets(kg, &item) {
            s.zrem(&set, &item.id).await?;
        }
        update_scavenger_index(s, kg, &partition_id).await?;
        s.zadd(
            &kg.run_index(&item.data.identifier.run_id.to_string()),
            &item.id,
            item.at_ms,
        )
        .await?;
        mark_queued(s, kg, &item).await?;

        if route == RequeueRoute::Origin && item.refilled_from.is_some() {
            item.refilled_from = None;
            item.refilled_at = 0;
            s.zrem(&kg.ready(&partition_id), &item.id).await?;

            let sp = match load_shadow_partition(s, kg, &partition_id).await? {
                Some(sp) => sp,
                None => {
                    let sp = ShadowPartition::for_item(&item, constraints);
                    s.hset(&kg.shadow_partition_meta(), &partition_id, &sp)?;
                    sp
                }
            };
            let backlog = QueueBacklog::for_item(&item);
            if !s.hexists(&kg.backlog_meta(), &backlog.backlog_id).await? {
                s.hset(&kg.backlog_meta(), &backlog.backlog_id, &backlog)?;
            }
            s.hset(&kg.queue_item(), &item.id, &item)?;
            s.zadd(
                &kg.backlog_set(&backlog.backlog_id),
                &item.id,
                item.score(now_ms),
            )
            .await?;
            update_backlog_pointer(s, kg, &sp, &backlog.backlog_id, now_ms).await?;
        } else {
            s.hset(&kg.queue_item(), &item.id, &item)?;
            s.zadd(&kg.ready(&partition_id), &item.id, item.score(now_ms))
                .await?;
            let partition = match load_partition(s, kg, &partition_id).await? {
                Some(p) => p,
                None => {
                    let p = QueuePartition::for_item(&item);
                    s.hset(&kg.partition_item(), &partition_id, &p)?;
                    p
                }
            };
            update_ready_pointers(s, kg, &partition, now_ms).await?;
        }
        Ok(())
    }
}

/// Whether adding `member` to `set` would exceed `limit`. Limits <= 0 are unlimited.
async fn at_limit(s: &Script, set: &str, member: &str, limit: i64) -> Result<bool, QueueError> {
    if limit <= 0 || s.zscore(set, member).await?.is_some() {
        return Ok(false);
    }
    Ok(s.zcard(set).await? >= limit)
}
