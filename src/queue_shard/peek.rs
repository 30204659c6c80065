//! Ordered-set pagination.
//!
//! A `Peeker` reads members of one ordered set together with the JSON they
//! point at in a hash. Pointers whose hash entry is gone are handed to a
//! cleanup hook instead of failing the peek.

use std::marker::PhantomData;

use bytes::Bytes;
use futures::future::{BoxFuture, join_all};
use rand::Rng;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::item::QueueItem;
use crate::queue_shard::helpers::scripts;
use crate::queue_shard::script::{ScoreRange, Script};
use crate::queue_shard::{QueueError, QueueShard};

#[derive(Debug, Clone)]
pub struct PeekResult<T> {
    pub items: Vec<T>,
    /// Members inside the score window, including ones not returned.
    pub total_count: usize,
    /// Dangling pointers found and handed to the cleanup hook.
    pub removed_count: usize,
    /// Score of the last returned member; resume from here.
    pub cursor: i64,
}

impl<T> Default for PeekResult<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total_count: 0,
            removed_count: 0,
            cursor: 0,
        }
    }
}

type MissingHook<'a> =
    Box<dyn Fn(Vec<String>) -> BoxFuture<'a, Result<(), QueueError>> + Send + Sync + 'a>;

pub struct Peeker<'a, T> {
    shard: &'a QueueShard,
    set: String,
    hash: String,
    max: usize,
    kind: &'static str,
    on_missing: Option<MissingHook<'a>>,
    _entity: PhantomData<fn() -> T>,
}

impl<'a, T> Peeker<'a, T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        shard: &'a QueueShard,
        set: impl Into<String>,
        hash: impl Into<String>,
        max: usize,
        kind: &'static str,
    ) -> Self {
        Self {
            shard,
            set: set.into(),
            hash: hash.into(),
            max,
            kind,
            on_missing: None,
            _entity: PhantomData,
        }
    }

    pub fn on_missing<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<String>) -> BoxFuture<'a, Result<(), QueueError>> + Send + Sync + 'a,
    {
        self.on_missing = Some(Box::new(hook));
        self
    }

    /// Drop dangling members from the peeked set.
    pub fn remove_missing_pointers(self) -> Self {
        let shard = self.shard;
        let set = self.set.clone();
        self.on_missing(move |ids| {
            let set = set.clone();
            Box::pin(async move { shard.remove_pointers(&set, &ids).await })
        })
    }

    /// Up to `limit` members with scores in `range`, lowest first. Without
    /// `sequential` the page starts at a random offset inside the window.
    pub async fn peek(
        &self,
        sequential: bool,
        range: ScoreRange,
        limit: usize,
    ) -> Result<PeekResult<T>, QueueError> {
        if limit > self.max {
            return Err(QueueError::PeekExceedsMaxLimits {
                limit,
                max: self.max,
            });
        }

        let s = Script::snapshot(&self.shard.db).await?;
        let total_count = s.zcount(&self.set, range).await?;
        if total_count == 0 || limit == 0 {
            return Ok(PeekResult {
                total_count,
                ..Default::default()
            });
        }
        let offset = if !sequential && total_count > limit {
            rand::rng().random_range(0..=(total_count - limit))
        } else {
            0
        };

        let members = s.zrange_by_score(&self.set, range, offset, limit).await?;
        let raw: Vec<Option<Bytes>> = join_all(
            members
                .iter()
                .map(|(id, _)| s.hget_raw(&self.hash, id)),
        )
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;
        drop(s);

        let cursor = members.last().map(|(_, score)| *score).unwrap_or(0);
        let ids: Vec<String> = members.into_iter().map(|(id, _)| id).collect();
        let decoded = tokio::task::spawn_blocking(move || {
            ids.into_iter()
                .zip(raw)
                .map(|(id, raw)| {
                    let value = raw.map(|bytes| serde_json::from_slice::<T>(&bytes));
                    (id, value)
                })
                .collect::<Vec<_>>()
        })
        .await?;

        let mut items = Vec::with_capacity(decoded.len());
        let mut missing = Vec::new();
        for (id, value) in decoded {
            match value {
                Some(Ok(item)) => items.push(item),
                Some(Err(e)) => {
                    warn!(shard = %self.shard.name, set = %self.set, %id, error = %e, "skipping undecodable entry");
                }
                None => missing.push(id),
            }
        }

        let removed_count = missing.len();
        if !missing.is_empty() {
            if let Some(hook) = &self.on_missing {
                hook(missing).await?;
            }
        }

        if let Some(m) = &self.shard.metrics {
            m.record_peek_size(&self.shard.name, self.kind, items.len());
        }

        Ok(PeekResult {
            items,
            total_count,
            removed_count,
            cursor,
        })
    }

    /// First `limit` members regardless of score.
    pub async fn peek_all(&self, sequential: bool, limit: usize) -> Result<PeekResult<T>, QueueError> {
        self.peek(sequential, ScoreRange::all(), limit).await
    }
}

impl QueueShard {
    /// Ready items of a partition visible by `until_ms`, in score order.
    pub async fn item_peek(
        &self,
        partition_id: &str,
        until_ms: i64,
        limit: usize,
    ) -> Result<PeekResult<QueueItem>, QueueError> {
        Peeker::new(
            self,
            self.kg.ready(partition_id),
            self.kg.queue_item(),
            self.config.queue_peek_max,
            "item",
        )
        .remove_missing_pointers()
        .peek(true, ScoreRange::up_to(until_ms), limit)
        .await
    }

    /// Remove members from an index.
    pub(crate) async fn remove_pointers(&self, set: &str, ids: &[String]) -> Result<(), QueueError> {
        self.run_script(scripts::REMOVE_POINTERS, || async {
            let s = Script::begin(&self.db).await?;
            for id in ids {
                s.zrem(set, id).await?;
            }
            s.commit().await
        })
        .await?;
        warn!(shard = %self.name, %set, count = ids.len(), "removed dangling pointers");
        Ok(())
    }

    /// Members of an index that has no backing hash (accounts, normalize sets).
    pub(crate) async fn peek_members(
        &self,
        set: &str,
        sequential: bool,
        range: ScoreRange,
        limit: usize,
    ) -> Result<(Vec<(String, i64)>, usize), QueueError> {
        let s = Script::snapshot(&self.db).await?;
        let total = s.zcount(set, range).await?;
        if total == 0 || limit == 0 {
            return Ok((Vec::new(), total));
        }
        let offset = if !sequential && total > limit {
            rand::rng().random_range(0..=(total - limit))
        } else {
            0
        };
        let members = s.zrange_by_score(set, range, offset, limit).await?;
        Ok((members, total))
    }
}
