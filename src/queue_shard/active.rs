//! Active-set reconciliation.
//!
//! Active sets may hold ids that are neither ready nor in progress after a
//! crash or a manual delete. The checker pages through a set and removes such
//! ids. It never touches the ready or in-progress sets themselves.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::partition::{QueueBacklog, ShadowPartition};
use crate::queue_shard::helpers::{load_item, scripts};
use crate::queue_shard::script::{ScoreRange, Script};
use crate::queue_shard::{QueueError, QueueShard};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveCheckResult {
    /// Members inspected.
    pub checked: usize,
    /// Members removed (or that would be removed in read-only mode).
    pub removed: usize,
    pub leaked: Vec<String>,
}

impl ActiveCheckResult {
    pub fn merge(&mut self, other: ActiveCheckResult) {
        self.checked += other.checked;
        self.removed += other.removed;
        self.leaked.extend(other.leaked);
    }
}

impl QueueShard {
    /// Check the active set of one partition. Paging stops early once
    /// `cancel` fires; the partial result is returned.
    pub async fn partition_active_check(
        &self,
        partition_id: &str,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<ActiveCheckResult, QueueError> {
        self.check_active_set(
            &self.kg.active_partition(partition_id),
            Some(partition_id),
            "partition",
            read_only,
            cancel,
        )
        .await
    }

    /// Check an account's active set. Members may belong to any partition.
    pub async fn account_active_check(
        &self,
        account_id: Uuid,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<ActiveCheckResult, QueueError> {
        self.check_active_set(
            &self.kg.active_account(&account_id),
            None,
            "account",
            read_only,
            cancel,
        )
        .await
    }

    /// Check every active set a backlog is charged to.
    pub async fn backlog_active_check(
        &self,
        backlog: &QueueBacklog,
        sp: &ShadowPartition,
        check_account: bool,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<ActiveCheckResult, QueueError> {
        let mut result = self
            .partition_active_check(&sp.partition_id, read_only, cancel)
            .await?;
        if check_account {
            if let Some(account_id) = sp.account_id {
                result.merge(self.account_active_check(account_id, read_only, cancel).await?);
            }
        }
        for key in &backlog.concurrency_keys {
            result.merge(
                self.check_active_set(
                    &self.kg.active_custom(&key.canonical_key_id),
                    None,
                    "custom_key",
                    read_only,
                    cancel,
                )
                .await?,
            );
        }
        Ok(result)
    }

    async fn check_active_set(
        &self,
        set: &str,
        partition_id: Option<&str>,
        dimension: &'static str,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<ActiveCheckResult, QueueError> {
        let page_size = self.config.active_check_page_size.max(1);
        let page_sleep = Duration::from_millis(self.config.active_check_page_sleep_ms);
        let mut result = ActiveCheckResult::default();
        let mut offset = 0usize;

        loop {
            if cancel.is_cancelled() {
                debug!(shard = %self.name, %set, checked = result.checked, "active check cancelled");
                break;
            }
            let (members, leaked) = {
                let s = Script::snapshot(&self.db).await?;
                let members = s
                    .zrange_by_score(set, ScoreRange::all(), offset, page_size)
                    .await?;
                let mut leaked = Vec::new();
                for (id, _) in &members {
                    if !self.is_live(&s, id, partition_id).await? {
                        leaked.push(id.clone());
                    }
                }
                (members, leaked)
            };
            if members.is_empty() {
                break;
            }
            result.checked += members.len();

            let removed = if leaked.is_empty() || read_only {
                0
            } else {
                self.run_script(scripts::ACTIVE_CHECK, || async {
                    let s = Script::begin(&self.db).await?;
                    let mut removed = 0usize;
                    for id in &leaked {
                        // re-check under the transaction
                        if !self.is_live(&s, id, partition_id).await? && s.zrem(set, id).await? {
                            removed += 1;
                        }
                    }
                    s.commit().await?;
                    Ok(removed)
                })
                .await?
            };

            if !leaked.is_empty() {
                warn!(shard = %self.name, %set, count = leaked.len(), read_only, "found leaked active set entries");
            }
            result.removed += if read_only { leaked.len() } else { removed };
            offset += members.len() - removed;
            result.leaked.extend(leaked);

            if members.len() < page_size {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(page_sleep) => {}
            }
        }

        if result.removed > 0 {
            if let Some(m) = &self.metrics {
                m.record_active_set_removal(&self.name, dimension, result.removed as u64);
            }
        }
        debug!(shard = %self.name, %set, checked = result.checked, removed = result.removed, "checked active set");
        Ok(result)
    }

    /// An id is live if it is ready or in progress in its partition.
    async fn is_live(
        &self,
        s: &Script,
        id: &str,
        partition_id: Option<&str>,
    ) -> Result<bool, QueueError> {
        let kg = &self.kg;
        let partition_id = match partition_id {
            Some(p) => p.to_string(),
            None => match load_item(s, kg, id).await? {
                Some(item) => item.partition_id(),
                None => return Ok(false),
            },
        };
        Ok(s.zscore(&kg.in_progress(&partition_id), id).await?.is_some()
            || s.zscore(&kg.ready(&partition_id), id).await?.is_some())
    }

    /// Backlogs flagged for an active check by refill, oldest first.
    pub async fn peek_active_check_backlogs(&self, limit: usize) -> Result<Vec<String>, QueueError> {
        let (members, _) = self
            .peek_members(
                &self.kg.active_checker_backlogs(),
                true,
                ScoreRange::up_to(self.now_ms()),
                limit,
            )
            .await?;
        Ok(members.into_iter().map(|(id, _)| id).collect())
    }

    /// Unflag a checked backlog and skip it for the cooldown period.
    pub async fn finish_active_check(&self, backlog_id: &str) -> Result<(), QueueError> {
        self.run_script(scripts::ACTIVE_CHECK_FINISH, || async {
            let kg = &self.kg;
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            s.zrem(&kg.active_checker_backlogs(), backlog_id).await?;
            s.set_string(
                &kg.active_checker_cooldown(backlog_id),
                "1",
                Some(now_ms + self.config.active_check_cooldown_ms),
            )?;
            s.commit().await
        })
        .await
    }
}
