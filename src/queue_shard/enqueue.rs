//! Admission of new items.

use tracing::debug;
use ulid::Ulid;
use uuid::Uuid;

use crate::item::{QueueItem, hash_id};
use crate::partition::{PartitionConstraints, QueueBacklog, QueuePartition, ShadowPartition};
use crate::queue_shard::capacity::{GuaranteedCapacity, upsert_capacity};
use crate::queue_shard::helpers::{
    FnMetadata, load_partition, load_shadow_partition, mark_queued, scripts,
    update_backlog_pointer, update_ready_pointers,
};
use crate::queue_shard::script::Script;
use crate::queue_shard::{QueueError, QueueShard};

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Write to the ready queue even if the account uses key queues.
    pub force_ready_queue: bool,
    /// Keep the original id instead of hashing it. Used when re-enqueuing
    /// an item that already carries a store id.
    pub keep_id: bool,
}

/// Where an enqueued item landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Ready,
    Backlog,
}

impl Route {
    fn as_str(&self) -> &'static str {
        match self {
            Route::Ready => "ready",
            Route::Backlog => "backlog",
        }
    }
}

struct Admission<'a> {
    item: &'a QueueItem,
    key_queues: bool,
    constraints: &'a PartitionConstraints,
    capacity: Option<GuaranteedCapacity>,
}

impl QueueShard {
    /// Admit one item to run at `at_ms`. Past times are clamped to now.
    ///
    /// The item's custom concurrency keys and throttle are evaluated by the
    /// tenant configuration before the item is stored. Fails with
    /// `ItemAlreadyExists` if the id is stored or was dequeued within its
    /// idempotency period.
    pub async fn enqueue(
        &self,
        mut item: QueueItem,
        at_ms: i64,
        opts: EnqueueOptions,
    ) -> Result<QueueItem, QueueError> {
        let now_ms = self.now_ms();
        if item.id.is_empty() {
            item.id = Ulid::from_parts(now_ms.max(0) as u64, rand::random::<u128>()).to_string();
        } else if !opts.keep_id {
            item.id = hash_id(&item.id);
        }
        item.at_ms = at_ms.max(now_ms);
        item.wall_time_ms = item.at_ms;
        item.enqueued_at = now_ms;
        item.lease_id = None;
        item.refilled_from = None;
        item.refilled_at = 0;

        self.tenants.refresh_item_constraints(&mut item).await;

        let account = (!item.is_system()).then(|| item.account_id());
        let key_queues = !opts.force_ready_queue
            && self.tenants.allow_key_queues(item.account_id()).await;
        let constraints = self
            .tenants
            .partition_constraints(account, &item.partition_id())
            .await;
        let capacity = match account {
            Some(a) => self
                .tenants
                .guaranteed_capacity(a)
                .await
                .map(|(priority, workers)| GuaranteedCapacity::for_account(a, priority, workers)),
            None => None,
        };

        let admission = Admission {
            item: &item,
            key_queues,
            constraints: &constraints,
            capacity,
        };
        let route = self
            .run_script(scripts::ENQUEUE, || self.enqueue_inner(&admission, now_ms))
            .await?;

        debug!(
            shard = %self.name,
            id = %item.id,
            partition = %item.partition_id(),
            route = route.as_str(),
            at = item.at_ms,
            "enqueued item"
        );
        if let Some(m) = &self.metrics {
            m.record_enqueue(&self.name, item.data.kind.as_str(), route.as_str());
        }
        Ok(item)
    }

    async fn enqueue_inner(&self, a: &Admission<'_>, now_ms: i64) -> Result<Route, QueueError> {
        let kg = &self.kg;
        let item = a.item;
        let s = Script::begin(&self.db).await?;

        if s.hexists(&kg.queue_item(), &item.id).await?
            || s.get_string(&kg.idempotency(&item.id), now_ms).await?.is_some()
        {
            return Err(QueueError::ItemAlreadyExists(item.id.clone()));
        }

        let partition_id = item.partition_id();
        let fn_field = item.function_id.to_string();
        let meta: Option<FnMetadata> = s.hget(&kg.fn_metadata(), &fn_field).await?;
        let paused = match meta {
            Some(meta) => meta.paused,
            None => {
                if !item.is_system() {
                    s.hset(
                        &kg.fn_metadata(),
                        &fn_field,
                        &FnMetadata {
                            function_id: item.function_id,
                            paused: false,
                        },
                    )?;
                }
                false
            }
        };

        let partition = match load_partition(&s, kg, &partition_id).await? {
            Some(p) => p,
            None => {
                let mut p = QueuePartition::for_item(item);
                p.paused = paused;
                s.hset(&kg.partition_item(), &partition_id, &p)?;
                p
            }
        };

        s.hset(&kg.queue_item(), &item.id, item)?;
        s.zadd(
            &kg.run_index(&item.data.identifier.run_id.to_string()),
            &item.id,
            item.at_ms,
        )
        .await?;
        mark_queued(&s, kg, item).await?;

        if let Some(capacity) = &a.capacity {
            upsert_capacity(&s, kg, capacity).await?;
        }

        let mut route = Route::Ready;
        if a.key_queues {
            let sp = match load_shadow_partition(&s, kg, &partition_id).await? {
                Some(mut sp) => {
                    sp.apply_constraints(a.constraints);
                    sp
                }
                None => ShadowPartition::for_item(item, a.constraints),
            };
            s.hset(&kg.shadow_partition_meta(), &partition_id, &sp)?;

            if !sp.pause_enqueue {
                let backlog = QueueBacklog::for_item(item);
                if !s.hexists(&kg.backlog_meta(), &backlog.backlog_id).await? {
                    s.hset(&kg.backlog_meta(), &backlog.backlog_id, &backlog)?;
                }
                s.zadd(
                    &kg.backlog_set(&backlog.backlog_id),
                    &item.id,
                    item.score(now_ms),
                )
                .await?;
                update_backlog_pointer(&s, kg, &sp, &backlog.backlog_id, now_ms).await?;
                route = Route::Backlog;
            }
        }

        if route == Route::Ready {
            s.zadd(&kg.ready(&partition_id), &item.id, item.score(now_ms))
                .await?;
            update_ready_pointers(&s, kg, &partition, now_ms).await?;
        }

        s.commit().await?;
        Ok(route)
    }

    /// Whether a function's partition is paused.
    pub async fn is_function_paused(&self, function_id: Uuid) -> Result<bool, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        let meta: Option<FnMetadata> = s
            .hget(&self.kg.fn_metadata(), &function_id.to_string())
            .await?;
        Ok(meta.map(|m| m.paused).unwrap_or(false))
    }
}
