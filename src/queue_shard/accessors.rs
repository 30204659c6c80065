//! Read-only counts, lookups and iterators.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use ulid::Ulid;
use uuid::Uuid;

use crate::item::{ItemKind, QueueItem};
use crate::partition::{QueueBacklog, QueuePartition, ShadowPartition};
use crate::queue_shard::helpers::{STATUS_IN_PROGRESS, scripts};
use crate::queue_shard::script::{ScoreRange, Script};
use crate::queue_shard::{QueueError, QueueShard};

/// One outstanding item of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: String,
    pub at_ms: i64,
    pub kind: ItemKind,
    pub attempt: u32,
    /// Items ahead of this one in its ready queue; zero while leased.
    pub position: usize,
    pub leased: bool,
}

impl QueueShard {
    pub async fn load_item(&self, item_id: &str) -> Result<Option<QueueItem>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        s.hget(&self.kg.queue_item(), item_id).await
    }

    pub async fn partition(&self, partition_id: &str) -> Result<Option<QueuePartition>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        s.hget(&self.kg.partition_item(), partition_id).await
    }

    pub async fn shadow_partition(&self, partition_id: &str) -> Result<Option<ShadowPartition>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        s.hget(&self.kg.shadow_partition_meta(), partition_id).await
    }

    pub async fn backlog(&self, backlog_id: &str) -> Result<Option<QueueBacklog>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        s.hget(&self.kg.backlog_meta(), backlog_id).await
    }

    /// Outstanding items of a run, ordered by scheduled time.
    pub async fn run_jobs(
        &self,
        run_id: Ulid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobInfo>, QueueError> {
        let kg = &self.kg;
        let now_ms = self.now_ms();
        let s = Script::snapshot(&self.db).await?;
        let ids = s
            .zrange_by_score(&kg.run_index(&run_id.to_string()), ScoreRange::all(), offset, limit)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for (id, _) in ids {
            let Some(item) = s.hget::<QueueItem>(&kg.queue_item(), &id).await? else {
                continue;
            };
            let leased = item.is_leased(now_ms);
            let position = if leased {
                0
            } else {
                let ready = kg.ready(&item.partition_id());
                match s.zscore(&ready, &id).await? {
                    Some(score) if score > i64::MIN => {
                        s.zcount(&ready, ScoreRange::up_to(score - 1)).await?
                    }
                    _ => 0,
                }
            };
            jobs.push(JobInfo {
                id,
                at_ms: item.at_ms,
                kind: item.data.kind,
                attempt: item.data.attempt,
                position,
                leased,
            });
        }
        Ok(jobs)
    }

    /// Items of a run that are queued, in a backlog or leased.
    pub async fn outstanding_job_count(&self, run_id: Ulid) -> Result<usize, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        Ok(s.zcard(&self.kg.run_index(&run_id.to_string())).await?.max(0) as usize)
    }

    /// Items of a function in `status` (`queued` or `in_progress`).
    pub async fn status_count(&self, function_id: Uuid, status: &str) -> Result<usize, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        Ok(s.zcard(&self.kg.status(status, &function_id)).await?.max(0) as usize)
    }

    /// Leased items of a function.
    pub async fn running_count(&self, function_id: Uuid) -> Result<usize, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        let in_progress = s.zcard(&self.kg.in_progress(&function_id.to_string())).await?;
        if in_progress > 0 {
            return Ok(in_progress as usize);
        }
        Ok(s.zcard(&self.kg.status(STATUS_IN_PROGRESS, &function_id))
            .await?
            .max(0) as usize)
    }

    /// Ready items of a partition with scores in `[from_ms, until_ms]`, fetched in pages.
    pub fn items_by_partition(
        &self,
        partition_id: &str,
        from_ms: i64,
        until_ms: i64,
        page_size: usize,
    ) -> BoxStream<'_, Result<QueueItem, QueueError>> {
        self.items_in_set(
            self.kg.ready(partition_id),
            ScoreRange::between(from_ms, until_ms),
            page_size,
        )
    }

    /// Items waiting in a backlog with scores up to `until_ms`, fetched in pages.
    pub fn items_by_backlog(
        &self,
        backlog_id: &str,
        until_ms: i64,
        page_size: usize,
    ) -> BoxStream<'_, Result<QueueItem, QueueError>> {
        self.items_in_set(
            self.kg.backlog_set(backlog_id),
            ScoreRange::up_to(until_ms),
            page_size,
        )
    }

    fn items_in_set(
        &self,
        set: String,
        range: ScoreRange,
        page_size: usize,
    ) -> BoxStream<'_, Result<QueueItem, QueueError>> {
        let page_size = page_size.max(1);
        stream::try_unfold(Some(0usize), move |cursor| {
            let set = set.clone();
            async move {
                let Some(offset) = cursor else {
                    return Ok::<_, QueueError>(None);
                };
                let s = Script::snapshot(&self.db).await?;
                let members = s.zrange_by_score(&set, range, offset, page_size).await?;
                let next = (members.len() == page_size).then_some(offset + page_size);
                let mut items = Vec::with_capacity(members.len());
                for (id, _) in members {
                    if let Some(item) = s.hget::<QueueItem>(&self.kg.queue_item(), &id).await? {
                        items.push(item);
                    }
                }
                Ok(Some((items, next)))
            }
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok::<_, QueueError>)))
        .try_flatten()
        .boxed()
    }

    /// Cardinality of any index.
    pub async fn index_len(&self, set: &str) -> Result<usize, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        Ok(s.zcard(set).await?.max(0) as usize)
    }

    /// Score of a member in any index.
    pub async fn index_score(&self, set: &str, member: &str) -> Result<Option<i64>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        s.zscore(set, member).await
    }

    /// Members of any index, lowest score first.
    pub async fn index_members(&self, set: &str, limit: usize) -> Result<Vec<(String, i64)>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        s.zrange_by_score(set, ScoreRange::all(), 0, limit).await
    }

    // repair tooling

    /// Insert a member into an index directly, bypassing every script.
    pub async fn index_insert(&self, set: &str, member: &str, score: i64) -> Result<(), QueueError> {
        self.run_script(scripts::INDEX_REPAIR, || async {
            let s = Script::begin(&self.db).await?;
            s.zadd(set, member, score).await?;
            s.commit().await
        })
        .await
    }

    /// Remove a member from an index directly, bypassing every script.
    pub async fn index_remove(&self, set: &str, member: &str) -> Result<bool, QueueError> {
        self.run_script(scripts::INDEX_REPAIR, || async {
            let s = Script::begin(&self.db).await?;
            let removed = s.zrem(set, member).await?;
            s.commit().await?;
            Ok(removed)
        })
        .await
    }
}
