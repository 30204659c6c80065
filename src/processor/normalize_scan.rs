//! Walks the normalize indexes and drains parked backlogs.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::partition::{QueueBacklog, ShadowPartition};
use crate::processor::{half, spawn_extender, tick};
use crate::queue_shard::{QueueError, QueueShard};

/// Accounts, shadow partitions and backlogs peeked per level per tick.
const NORMALIZE_PEEK: usize = 20;

pub struct Normalizer {
    shard: Arc<QueueShard>,
    cancel: CancellationToken,
}

impl Normalizer {
    pub fn new(shard: Arc<QueueShard>, cancel: CancellationToken) -> Self {
        Self { shard, cancel }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let cfg = self.shard.config();
        let workers = cfg.num_normalize_workers.max(1);
        let every = Duration::from_millis(cfg.normalize_poll_tick_ms);
        let (tx, rx) = mpsc::channel::<(QueueBacklog, ShadowPartition)>(workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let normalizer = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((backlog, sp)) = next else {
                        return;
                    };
                    if let Err(e) = normalizer.normalize_one(&backlog, &sp).await {
                        error!(shard = %normalizer.shard.name(), backlog = %backlog.backlog_id, error = %e, "normalizing backlog failed");
                    }
                }
            }));
        }

        'outer: while tick(&cancel, every).await {
            let batch = match self.scan_tick().await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(shard = %self.shard.name(), error = %e, "normalize scan failed");
                    continue;
                }
            };
            for entry in batch {
                tokio::select! {
                    _ = cancel.cancelled() => break 'outer,
                    sent = tx.send(entry) => {
                        if sent.is_err() {
                            break 'outer;
                        }
                    }
                }
            }
        }

        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Parked backlogs with their shadow partitions, walking
    /// accounts, then partitions, then backlogs.
    pub async fn scan_tick(&self) -> Result<Vec<(QueueBacklog, ShadowPartition)>, QueueError> {
        let shard = &self.shard;
        let mut batch = Vec::new();
        for account in shard.normalize_account_peek(NORMALIZE_PEEK).await? {
            for partition_id in shard.normalize_partition_peek(account, NORMALIZE_PEEK).await? {
                let Some(sp) = shard.shadow_partition(&partition_id).await? else {
                    debug!(shard = %shard.name(), partition = %partition_id, "parked backlogs without shadow partition");
                    continue;
                };
                let peek = shard
                    .normalize_backlog_peek(&partition_id, NORMALIZE_PEEK.min(shard.config().backlog_peek_max))
                    .await?;
                for backlog in peek.items {
                    batch.push((backlog, sp.clone()));
                }
            }
        }
        Ok(batch)
    }

    /// Drain one parked backlog under a normalization lease. Returns the
    /// number of items moved, or `None` if another worker holds the lease or
    /// shutdown interrupted the drain.
    pub async fn normalize_one(
        &self,
        backlog: &QueueBacklog,
        sp: &ShadowPartition,
    ) -> Result<Option<usize>, QueueError> {
        let shard = Arc::clone(&self.shard);
        let lease_ms = shard.config().normalize_lease_ms;
        let lease_id = match shard
            .lease_backlog_for_normalization(&backlog.backlog_id, lease_ms)
            .await
        {
            Ok(id) => id,
            Err(QueueError::BacklogAlreadyLeasedForNormalization(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let lease = Arc::new(Mutex::new(lease_id));
        let token = self.cancel.child_token();
        let _guard = token.clone().drop_guard();
        let extender = spawn_extender(token.clone(), half(lease_ms), {
            let shard = Arc::clone(&shard);
            let backlog_id = backlog.backlog_id.clone();
            let lease = Arc::clone(&lease);
            move || {
                let shard = Arc::clone(&shard);
                let backlog_id = backlog_id.clone();
                let lease = Arc::clone(&lease);
                async move {
                    let current = *lease.lock();
                    let next = shard
                        .extend_backlog_normalization_lease(&backlog_id, current, lease_ms)
                        .await?;
                    *lease.lock() = next;
                    Ok(())
                }
            }
        });

        let moved = shard.normalize_backlog(backlog, sp, &token).await;
        token.cancel();
        let _ = extender.await;
        match moved {
            Ok(moved) => Ok(Some(moved)),
            // shutting down: the lease lapses and another worker resumes
            Err(QueueError::BacklogNormalizationLeaseExpired(_)) if self.cancel.is_cancelled() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
