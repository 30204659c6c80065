//! Backlog refill: admitting backlog items into the ready queue.
//!
//! Capacity is the free room in every active set the backlog is charged to.
//! The first dimension without room stops the refill and is reported back so
//! the shadow worker can cool the partition down.

use tracing::debug;

use crate::gcra::Gcra;
use crate::partition::{QueueBacklog, QueuePartition, ShadowPartition};
use crate::queue_shard::Constraint;
use crate::queue_shard::helpers::{
    item_active_sets, load_item, load_partition, load_shadow_partition, scripts,
    update_backlog_pointer, update_ready_pointers,
};
use crate::queue_shard::script::{ScoreRange, Script};
use crate::queue_shard::{QueueError, QueueShard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefillResult {
    pub refilled: usize,
    pub refilled_ids: Vec<String>,
    /// Backlog items visible by the refill's time bound.
    pub backlog_count_until: usize,
    pub total_backlog_count: usize,
    /// Free room before the refill; `i64::MAX` when nothing limits it.
    pub capacity: i64,
    /// Items the refill attempted to move.
    pub refill: usize,
    pub constraint: Constraint,
    /// Set when throttled: the earliest time another item may pass.
    pub retry_at_ms: Option<i64>,
}

impl RefillResult {
    fn limited(constraint: Constraint, until: usize, total: usize) -> Self {
        Self {
            refilled: 0,
            refilled_ids: Vec::new(),
            backlog_count_until: until,
            total_backlog_count: total,
            capacity: 0,
            refill: 0,
            constraint,
            retry_at_ms: None,
        }
    }
}

impl QueueShard {
    /// Move up to the free capacity of backlog items with scores up to
    /// `until_ms` into the ready queue.
    pub async fn backlog_refill(
        &self,
        backlog: &QueueBacklog,
        sp: &ShadowPartition,
        until_ms: i64,
    ) -> Result<RefillResult, QueueError> {
        let result = self
            .run_script(scripts::BACKLOG_REFILL, || {
                self.backlog_refill_inner(backlog, &sp.partition_id, until_ms)
            })
            .await?;

        debug!(
            shard = %self.name,
            backlog = %backlog.backlog_id,
            refilled = result.refilled,
            constraint = result.constraint.as_str(),
            "refilled backlog"
        );
        if let Some(m) = &self.metrics {
            m.record_refill(&self.name, result.constraint.as_str(), result.refilled as u64);
        }
        Ok(result)
    }

    async fn backlog_refill_inner(
        &self,
        backlog: &QueueBacklog,
        partition_id: &str,
        until_ms: i64,
    ) -> Result<RefillResult, QueueError> {
        let kg = &self.kg;
        let now_ms = self.now_ms();
        let s = Script::begin(&self.db).await?;

        let Some(sp) = load_shadow_partition(&s, kg, partition_id).await? else {
            return Err(QueueError::ShadowPartitionNotFound(partition_id.to_string()));
        };
        let backlog_set = kg.backlog_set(&backlog.backlog_id);
        let total = s.zcard(&backlog_set).await?.max(0) as usize;
        let count_until = s.zcount(&backlog_set, ScoreRange::up_to(until_ms)).await?;

        let mut limits: Vec<(Constraint, i64, String)> = Vec::new();
        if let Some(account_id) = sp.account_id {
            limits.push((Constraint::Account, sp.account_limit(), kg.active_account(&account_id)));
        }
        limits.push((
            Constraint::Function,
            sp.function_limit(),
            kg.active_partition(&sp.partition_id),
        ));
        for (i, key) in backlog.concurrency_keys.iter().enumerate() {
            if let Some(limit) = sp.custom_key_limit(key) {
                limits.push((
                    Constraint::custom(i + 1),
                    limit,
                    kg.active_custom(&key.canonical_key_id),
                ));
            }
        }

        let mut capacity = i64::MAX;
        for (constraint, limit, set) in limits {
            if limit <= 0 {
                continue;
            }
            let room = limit - s.zcard(&set).await?;
            if room <= 0 {
                if s
                    .get_string(&kg.active_checker_cooldown(&backlog.backlog_id), now_ms)
                    .await?
                    .is_none()
                {
                    s.zadd(&kg.active_checker_backlogs(), &backlog.backlog_id, now_ms)
                        .await?;
                }
                s.commit().await?;
                return Ok(RefillResult::limited(constraint, count_until, total));
            }
            capacity = capacity.min(room);
        }

        let mut refill = (capacity.max(0) as u64)
            .min(self.config.backlog_refill_limit as u64)
            .min(count_until as u64) as usize;

        let mut throttle: Option<(Gcra, String, Option<i64>)> = None;
        if let (Some(bt), Some(spt)) = (&backlog.throttle, &sp.throttle) {
            let gcra = Gcra::new(spt.limit, spt.burst, spt.period_secs * 1_000);
            let key = kg.throttle(&bt.key);
            let tat = s
                .get_string(&key, now_ms)
                .await?
                .and_then(|v| v.parse::<i64>().ok());
            let tokens = gcra.capacity(now_ms, tat);
            if tokens <= 0 && refill > 0 {
                let mut result = RefillResult::limited(Constraint::Throttle, count_until, total);
                result.capacity = capacity;
                result.retry_at_ms = Some(gcra.retry_at(now_ms, tat));
                return Ok(result);
            }
            refill = refill.min(tokens.max(0) as usize);
            throttle = Some((gcra, key, tat));
        }

        if refill == 0 {
            let mut result = RefillResult::limited(Constraint::NotLimited, count_until, total);
            result.capacity = capacity;
            return Ok(result);
        }

        let ids = s
            .zrange_by_score(&backlog_set, ScoreRange::up_to(until_ms), 0, refill)
            .await?;
        let ready_set = kg.ready(&sp.partition_id);
        let mut refilled_ids = Vec::with_capacity(ids.len());
        for (id, _) in ids {
            s.zrem(&backlog_set, &id).await?;
            let Some(mut item) = load_item(&s, kg, &id).await? else {
                continue;
            };
            item.refilled_from = Some(backlog.backlog_id.clone());
            item.refilled_at = now_ms;
            s.hset(&kg.queue_item(), &id, &item)?;
            s.zadd(&ready_set, &id, item.score(now_ms)).await?;
            for set in item_active_sets(kg, &item) {
                s.zadd(&set, &id, now_ms).await?;
            }
            refilled_ids.push(id);
        }

        if let Some((gcra, key, tat)) = throttle {
            if !refilled_ids.is_empty() {
                let next = gcra.consume(now_ms, tat, refilled_ids.len() as i64);
                s.set_string(&key, &next.to_string(), Some(now_ms + gcra.ttl_ms(next, now_ms)))?;
            }
        }

        let partition = match load_partition(&s, kg, &sp.partition_id).await? {
            Some(p) => p,
            None => {
                let p = QueuePartition::for_shadow(&sp);
                s.hset(&kg.partition_item(), &sp.partition_id, &p)?;
                p
            }
        };
        update_ready_pointers(&s, kg, &partition, now_ms).await?;
        update_backlog_pointer(&s, kg, &sp, &backlog.backlog_id, now_ms).await?;

        s.commit().await?;
        Ok(RefillResult {
            refilled: refilled_ids.len(),
            refilled_ids,
            backlog_count_until: count_until,
            total_backlog_count: total,
            capacity,
            refill,
            constraint: Constraint::NotLimited,
            retry_at_ms: None,
        })
    }
}
