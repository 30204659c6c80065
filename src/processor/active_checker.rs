use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::keys::config_leases;
use crate::processor::{LeaderLease, tick};
use crate::queue_shard::{ActiveCheckResult, QueueError, QueueShard};

/// Prunes active-set entries of backlogs flagged by refill, while holding the
/// active checker config lease.
pub struct ActiveChecker {
    shard: Arc<QueueShard>,
}

impl ActiveChecker {
    pub fn new(shard: Arc<QueueShard>) -> Self {
        Self { shard }
    }

    /// Check every flagged backlog that is due, stopping between pages and
    /// backlogs once `cancel` fires.
    pub async fn check_once(&self, cancel: &CancellationToken) -> Result<ActiveCheckResult, QueueError> {
        let shard = &self.shard;
        let mode = &shard.config().run_mode;
        let mut total = ActiveCheckResult::default();

        for backlog_id in shard
            .peek_active_check_backlogs(shard.config().active_check_peek)
            .await?
        {
            if cancel.is_cancelled() {
                break;
            }
            let Some(backlog) = shard.backlog(&backlog_id).await? else {
                shard.finish_active_check(&backlog_id).await?;
                continue;
            };
            let Some(sp) = shard.shadow_partition(&backlog.shadow_partition_id).await? else {
                shard.finish_active_check(&backlog_id).await?;
                continue;
            };
            let check_account = rand::rng().random_bool(mode.active_check_account_probability.clamp(0.0, 1.0));
            let result = shard
                .backlog_active_check(&backlog, &sp, check_account, mode.active_check_read_only, cancel)
                .await?;
            if cancel.is_cancelled() {
                // partially checked; leave it flagged for the next leader
                break;
            }
            debug!(shard = %shard.name(), backlog = %backlog_id, checked = result.checked, removed = result.removed, "active check done");
            shard.finish_active_check(&backlog_id).await?;

            total.merge(result);
        }
        Ok(total)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let every = Duration::from_millis(self.shard.config().active_check_tick_ms);
        let mut leader = LeaderLease::new(Arc::clone(&self.shard), config_leases::ACTIVE_CHECKER);
        while tick(&cancel, every).await {
            if !leader.acquire().await {
                continue;
            }
            if let Err(e) = self.check_once(&cancel).await {
                error!(shard = %self.shard.name(), error = %e, "active check failed");
            }
        }
        leader.release().await;
    }
}
