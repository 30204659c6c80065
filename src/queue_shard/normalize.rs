//! Draining outdated backlogs into the backlogs matching current config.
//!
//! Large backlogs are first parked in the normalize indexes
//! (`global -> account -> shadow partition -> backlog`) and drained by the
//! normalizer under an exclusive lease. Small ones are drained inline.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;
use uuid::Uuid;

use crate::item::QueueItem;
use crate::partition::{QueueBacklog, ShadowPartition};
use crate::queue_shard::helpers::{
    load_shadow_partition, normalize_account, scripts, update_backlog_pointer,
    update_shadow_partition_pointers,
};
use crate::queue_shard::partitions::parse_accounts;
use crate::queue_shard::peek::{PeekResult, Peeker};
use crate::queue_shard::script::{ScoreRange, Script};
use crate::queue_shard::{QueueError, QueueShard};

/// Items moved per normalization script.
const NORMALIZE_PAGE_SIZE: usize = 100;

impl QueueShard {
    /// Park a backlog for asynchronous normalization if it holds at least
    /// `threshold` items. Returns the backlog size and whether it was parked.
    pub async fn backlog_prepare_normalize(
        &self,
        backlog: &QueueBacklog,
        sp: &ShadowPartition,
        threshold: usize,
    ) -> Result<(usize, bool), QueueError> {
        let prepared = self
            .run_script(scripts::PREPARE_NORMALIZE, || async {
                let kg = &self.kg;
                let now_ms = self.now_ms();
                let s = Script::begin(&self.db).await?;
                let count = s.zcard(&kg.backlog_set(&backlog.backlog_id)).await?.max(0) as usize;
                if count < threshold {
                    return Ok((count, false));
                }

                let account = normalize_account(sp);
                s.zadd(
                    &kg.partition_normalize_set(&sp.partition_id),
                    &backlog.backlog_id,
                    now_ms,
                )
                .await?;
                s.zadd_lower(&kg.account_normalize_set(&account), &sp.partition_id, now_ms)
                    .await?;
                s.zadd_lower(&kg.global_account_normalize_set(), &account.to_string(), now_ms)
                    .await?;

                s.zrem(&kg.shadow_partition_set(&sp.partition_id), &backlog.backlog_id)
                    .await?;
                let current = load_shadow_partition(&s, kg, &sp.partition_id)
                    .await?
                    .unwrap_or_else(|| sp.clone());
                update_shadow_partition_pointers(&s, kg, &current, now_ms).await?;

                s.commit().await?;
                Ok((count, true))
            })
            .await?;
        if prepared.1 {
            debug!(shard = %self.name, backlog = %backlog.backlog_id, count = prepared.0, "backlog parked for normalization");
        }
        Ok(prepared)
    }

    /// Exclusive right to drain a backlog.
    pub async fn lease_backlog_for_normalization(
        &self,
        backlog_id: &str,
        duration_ms: i64,
    ) -> Result<Ulid, QueueError> {
        self.run_script(scripts::NORMALIZE_LEASE, || async {
            let key = self.kg.backlog_normalization_lease(backlog_id);
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            if s.get_string(&key, now_ms).await?.is_some() {
                return Err(QueueError::BacklogAlreadyLeasedForNormalization(
                    backlog_id.to_string(),
                ));
            }
            let expires_at_ms = now_ms + duration_ms;
            let lease_id = self.lease_ids.next(expires_at_ms);
            s.set_string(&key, &lease_id.to_string(), Some(expires_at_ms))?;
            s.commit().await?;
            Ok(lease_id)
        })
        .await
    }

    pub async fn extend_backlog_normalization_lease(
        &self,
        backlog_id: &str,
        lease_id: Ulid,
        duration_ms: i64,
    ) -> Result<Ulid, QueueError> {
        self.run_script(scripts::NORMALIZE_EXTEND, || async {
            let key = self.kg.backlog_normalization_lease(backlog_id);
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            match s.get_string(&key, now_ms).await? {
                None => {
                    return Err(QueueError::BacklogNormalizationLeaseExpired(
                        backlog_id.to_string(),
                    ));
                }
                Some(current) if current != lease_id.to_string() => {
                    return Err(QueueError::BacklogAlreadyLeasedForNormalization(
                        backlog_id.to_string(),
                    ));
                }
                Some(_) => {}
            }
            let expires_at_ms = now_ms + duration_ms;
            let next = self.lease_ids.next(expires_at_ms);
            s.set_string(&key, &next.to_string(), Some(expires_at_ms))?;
            s.commit().await?;
            Ok(next)
        })
        .await
    }

    /// Re-route every item of `backlog` into the backlog matching its
    /// re-evaluated keys and throttle, then drop `backlog` from every index.
    /// Returns the number of items moved.
    ///
    /// `lease` must be cancelled when the normalization lease is lost or the
    /// caller shuts down. It is checked before every page; once fired the
    /// drain stops with `BacklogNormalizationLeaseExpired`, leaving the
    /// remaining items in place.
    pub async fn normalize_backlog(
        &self,
        backlog: &QueueBacklog,
        sp: &ShadowPartition,
        lease: &CancellationToken,
    ) -> Result<usize, QueueError> {
        let backlog_set = self.kg.backlog_set(&backlog.backlog_id);
        let mut moved = 0usize;
        let mut kept = 0usize;

        loop {
            if lease.is_cancelled() {
                debug!(shard = %self.name, backlog = %backlog.backlog_id, moved, "normalization stopped");
                if moved > 0 {
                    if let Some(m) = &self.metrics {
                        m.record_normalized(&self.name, moved as u64);
                    }
                }
                return Err(QueueError::BacklogNormalizationLeaseExpired(
                    backlog.backlog_id.clone(),
                ));
            }
            let page = {
                let s = Script::snapshot(&self.db).await?;
                let ids = s
                    .zrange_by_score(&backlog_set, ScoreRange::all(), kept, NORMALIZE_PAGE_SIZE)
                    .await?;
                let mut items = Vec::with_capacity(ids.len());
                for (id, _) in ids {
                    let item: Option<QueueItem> = s.hget(&self.kg.queue_item(), &id).await?;
                    items.push((id, item));
                }
                items
            };
            if page.is_empty() {
                break;
            }

            let mut refreshed = Vec::with_capacity(page.len());
            for (id, item) in page {
                let item = match item {
                    Some(mut item) => {
                        self.tenants.refresh_item_constraints(&mut item).await;
                        Some(item)
                    }
                    None => None,
                };
                refreshed.push((id, item));
            }

            let (page_moved, page_kept) = self
                .run_script(scripts::NORMALIZE_PAGE, || {
                    self.normalize_page(backlog, sp, &refreshed)
                })
                .await?;
            moved += page_moved;
            kept += page_kept;
        }

        self.run_script(scripts::NORMALIZE_FINISH, || {
            self.finish_normalize(backlog, sp)
        })
        .await?;

        info!(shard = %self.name, backlog = %backlog.backlog_id, moved, "normalized backlog");
        if let Some(m) = &self.metrics {
            m.record_normalized(&self.name, moved as u64);
        }
        Ok(moved)
    }

    async fn normalize_page(
        &self,
        backlog: &QueueBacklog,
        sp: &ShadowPartition,
        page: &[(String, Option<QueueItem>)],
    ) -> Result<(usize, usize), QueueError> {
        let kg = &self.kg;
        let now_ms = self.now_ms();
        let s = Script::begin(&self.db).await?;
        let old_set = kg.backlog_set(&backlog.backlog_id);
        let current = load_shadow_partition(&s, kg, &sp.partition_id)
            .await?
            .unwrap_or_else(|| sp.clone());

        let mut targets: HashMap<String, QueueBacklog> = HashMap::new();
        let mut moved = 0usize;
        let mut kept = 0usize;
        for (id, item) in page {
            let Some(score) = s.zscore(&old_set, id).await? else {
                continue;
            };
            let Some(item) = item else {
                s.zrem(&old_set, id).await?;
                continue;
            };
            let target = QueueBacklog::for_item(item);
            if target.backlog_id == backlog.backlog_id {
                kept += 1;
                continue;
            }
            s.zrem(&old_set, id).await?;
            s.hset(&kg.queue_item(), id, item)?;
            s.zadd(&kg.backlog_set(&target.backlog_id), id, score).await?;
            targets.entry(target.backlog_id.clone()).or_insert(target);
            moved += 1;
        }

        for (backlog_id, target) in &targets {
            if !s.hexists(&kg.backlog_meta(), backlog_id).await? {
                s.hset(&kg.backlog_meta(), backlog_id, target)?;
            }
            update_backlog_pointer(&s, kg, &current, backlog_id, now_ms).await?;
        }

        s.commit().await?;
        Ok((moved, kept))
    }

    async fn finish_normalize(&self, backlog: &QueueBacklog, sp: &ShadowPartition) -> Result<(), QueueError> {
        let kg = &self.kg;
        let now_ms = self.now_ms();
        let s = Script::begin(&self.db).await?;

        if s.zcard(&kg.backlog_set(&backlog.backlog_id)).await? > 0 {
            // items that still match this backlog stay schedulable
            let current = load_shadow_partition(&s, kg, &sp.partition_id)
                .await?
                .unwrap_or_else(|| sp.clone());
            update_backlog_pointer(&s, kg, &current, &backlog.backlog_id, now_ms).await?;
        } else {
            s.hdel(&kg.backlog_meta(), &backlog.backlog_id)?;
            s.zrem(&kg.shadow_partition_set(&sp.partition_id), &backlog.backlog_id)
                .await?;
        }

        let account = normalize_account(sp);
        let partition_set = kg.partition_normalize_set(&sp.partition_id);
        s.zrem(&partition_set, &backlog.backlog_id).await?;
        if s.zcard(&partition_set).await? == 0 {
            let account_set = kg.account_normalize_set(&account);
            s.zrem(&account_set, &sp.partition_id).await?;
            if s.zcard(&account_set).await? == 0 {
                s.zrem(&kg.global_account_normalize_set(), &account.to_string())
                    .await?;
            }
        }
        s.del_string(&kg.backlog_normalization_lease(&backlog.backlog_id))?;

        if let Some(current) = load_shadow_partition(&s, kg, &sp.partition_id).await? {
            update_shadow_partition_pointers(&s, kg, &current, now_ms).await?;
        }
        s.commit().await
    }

    /// Accounts with backlogs waiting for normalization.
    pub async fn normalize_account_peek(&self, limit: usize) -> Result<Vec<Uuid>, QueueError> {
        let (members, _) = self
            .peek_members(
                &self.kg.global_account_normalize_set(),
                false,
                ScoreRange::all(),
                limit,
            )
            .await?;
        Ok(parse_accounts(members))
    }

    /// Shadow partitions of an account with backlogs waiting for normalization.
    pub async fn normalize_partition_peek(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let (members, _) = self
            .peek_members(
                &self.kg.account_normalize_set(&account_id),
                false,
                ScoreRange::all(),
                limit,
            )
            .await?;
        Ok(members.into_iter().map(|(id, _)| id).collect())
    }

    /// Backlogs of a shadow partition waiting for normalization.
    pub async fn normalize_backlog_peek(
        &self,
        partition_id: &str,
        limit: usize,
    ) -> Result<PeekResult<QueueBacklog>, QueueError> {
        Peeker::new(
            self,
            self.kg.partition_normalize_set(partition_id),
            self.kg.backlog_meta(),
            self.config.backlog_peek_max,
            "normalize_backlog",
        )
        .remove_missing_pointers()
        .peek_all(true, limit)
        .await
    }
}
