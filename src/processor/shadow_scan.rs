//! Shadow partition scanning and backlog refill.
//!
//! Each tick peeks shadow partitions whose pointer is due, either through
//! accounts or globally, and hands them to a pool of workers. A worker leases
//! the shadow partition, refills its backlogs into the ready queue and
//! requeues it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::partition::{OutdatedReason, QueueBacklog, ShadowPartition};
use crate::processor::continuations::{ContinueEvent, Continuations};
use crate::processor::{half, spawn_extender, tick};
use crate::queue_shard::{Constraint, QueueError, QueueShard};

/// Delay before a shadow partition blocked on account or function
/// concurrency is visited again.
pub const CONSTRAINT_REQUEUE_MS: i64 = 2_000;
/// Delay before a shadow partition with refill paused is visited again.
pub const PAUSED_REQUEUE_MS: i64 = 60_000;
/// Share of backlog peeks that start from the head instead of a random offset.
const SEQUENTIAL_BACKLOG_PEEK: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowOutcome {
    /// Lease held elsewhere.
    Contended,
    Missing,
    Paused,
    /// Account or function concurrency reached; requeued with a delay.
    Constrained,
    /// Processed with backlogs left over; a continuation was registered.
    Continued,
    Done,
}

impl ShadowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShadowOutcome::Contended => "contended",
            ShadowOutcome::Missing => "missing",
            ShadowOutcome::Paused => "paused",
            ShadowOutcome::Constrained => "constrained",
            ShadowOutcome::Continued => "continued",
            ShadowOutcome::Done => "done",
        }
    }
}

pub struct ShadowScanner {
    shard: Arc<QueueShard>,
    continuations: Continuations<ShadowPartition>,
    cancel: CancellationToken,
}

impl ShadowScanner {
    pub fn new(shard: Arc<QueueShard>, cancel: CancellationToken) -> Self {
        let cfg = shard.config();
        let continuations = Continuations::new(
            cfg.continuation_limit,
            cfg.continuation_max_count,
            cfg.continuation_cooldown_ms,
        );
        Self {
            shard,
            continuations,
            cancel,
        }
    }

    pub fn continuations(&self) -> &Continuations<ShadowPartition> {
        &self.continuations
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let cfg = self.shard.config();
        let workers = cfg.num_shadow_workers.max(1);
        let every = Duration::from_millis(cfg.shadow_poll_tick_ms);
        let (tx, rx) = mpsc::channel::<(ShadowPartition, u32)>(workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let scanner = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((sp, count)) = next else {
                        return;
                    };
                    if let Err(e) = scanner.process_shadow_partition(&sp, count).await {
                        error!(shard = %scanner.shard.name(), partition = %sp.partition_id, error = %e, "processing shadow partition failed");
                    }
                }
            }));
        }

        'outer: while tick(&cancel, every).await {
            let batch = match self.scan_tick().await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(shard = %self.shard.name(), error = %e, "shadow scan failed");
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

    /// Shadow partitions to process this tick with their continuation counts.
    /// Continuations come first.
    pub async fn scan_tick(&self) -> Result<Vec<(ShadowPartition, u32)>, QueueError> {
        let shard = &self.shard;
        let cfg = shard.config();
        let now_ms = shard.now_ms();
        self.continuations.prune(now_ms);

        let (run_continuations, account_path) = {
            let mut rng = rand::rng();
            (
                !rng.random_bool(cfg.run_mode.continuation_skip_probability.clamp(0.0, 1.0)),
                cfg.run_mode.account && rng.random_range(0..100) < cfg.run_mode.account_weight,
            )
        };

        let mut batch: Vec<(ShadowPartition, u32)> = Vec::new();
        if run_continuations {
            for (_, count, sp) in self.continuations.snapshot() {
                batch.push((sp, count));
            }
        }

        let peeked = if account_path {
            let accounts = shard
                .shadow_account_peek(false, now_ms, cfg.shadow_account_peek_max)
                .await?;
            if accounts.is_empty() {
                Vec::new()
            } else {
                let per_account = (cfg.shadow_partition_peek_max / accounts.len()).max(1);
                let results = join_all(accounts.iter().map(|account| {
                    shard.shadow_partition_peek(Some(*account), false, now_ms, per_account)
                }))
                .await;
                let mut out = Vec::new();
                for res in results {
                    out.extend(res?.items);
                }
                out
            }
        } else {
            shard
                .shadow_partition_peek(None, false, now_ms, cfg.shadow_partition_peek_max)
                .await?
                .items
        };

        for sp in peeked {
            if batch.iter().any(|(b, _)| b.partition_id == sp.partition_id) {
                continue;
            }
            batch.push((sp, 0));
        }
        Ok(batch)
    }

    /// Lease one shadow partition, refill its backlogs and requeue it.
    ///
    /// `continuation_count` is how many times in a row this partition has
    /// been continued.
    pub async fn process_shadow_partition(
        &self,
        sp: &ShadowPartition,
        continuation_count: u32,
    ) -> Result<ShadowOutcome, QueueError> {
        let shard = &self.shard;
        let outcome = self.process_inner(sp, continuation_count).await;
        if let Ok(outcome) = &outcome {
            if let Some(m) = shard.metrics() {
                m.record_shadow_partition_processed(shard.name(), outcome.as_str());
            }
        }
        outcome
    }

    async fn process_inner(
        &self,
        sp: &ShadowPartition,
        continuation_count: u32,
    ) -> Result<ShadowOutcome, QueueError> {
        let shard = Arc::clone(&self.shard);
        let partition_id = sp.partition_id.clone();
        let lease_ms = shard.config().shadow_lease_ms;

        let lease_id = match shard.shadow_partition_lease(&partition_id, lease_ms).await {
            Ok(id) => id,
            Err(QueueError::ShadowPartitionAlreadyLeased(_)) => {
                debug!(shard = %shard.name(), partition = %partition_id, "shadow partition leased elsewhere");
                self.continuations.remove(&partition_id);
                return Ok(ShadowOutcome::Contended);
            }
            Err(QueueError::ShadowPartitionNotFound(_)) => {
                self.continuations.remove(&partition_id);
                return Ok(ShadowOutcome::Missing);
            }
            Err(e) => return Err(e),
        };

        let lease = Arc::new(Mutex::new(lease_id));
        let token = self.cancel.child_token();
        let _guard = token.clone().drop_guard();
        let extender = spawn_extender(token.clone(), half(lease_ms), {
            let shard = Arc::clone(&shard);
            let partition_id = partition_id.clone();
            let lease = Arc::clone(&lease);
            move || {
                let shard = Arc::clone(&shard);
                let partition_id = partition_id.clone();
                let lease = Arc::clone(&lease);
                async move {
                    let current = *lease.lock();
                    let next = shard
                        .shadow_partition_extend_lease(&partition_id, current, lease_ms)
                        .await?;
                    *lease.lock() = next;
                    Ok(())
                }
            }
        });

        let result = self.refill_backlogs(sp).await;

        token.cancel();
        let _ = extender.await;
        let current = *lease.lock();
        let now_ms = shard.now_ms();

        let (outcome, force_until) = match result {
            Ok(RefillPass::Paused) => {
                self.continuations.remove(&partition_id);
                (ShadowOutcome::Paused, Some(now_ms + PAUSED_REQUEUE_MS))
            }
            Ok(RefillPass::Constrained(constraint)) => {
                debug!(shard = %shard.name(), partition = %partition_id, constraint = constraint.as_str(), "shadow partition at capacity");
                self.continuations.remove(&partition_id);
                (ShadowOutcome::Constrained, Some(now_ms + CONSTRAINT_REQUEUE_MS))
            }
            Ok(RefillPass::Drained { remaining }) => {
                if remaining {
                    let event = self.continuations.add(
                        &partition_id,
                        sp.clone(),
                        continuation_count + 1,
                        now_ms,
                    );
                    if let Some(m) = shard.metrics() {
                        m.record_continuation("shadow", event.as_str());
                    }
                    let outcome = if event == ContinueEvent::Added {
                        ShadowOutcome::Continued
                    } else {
                        ShadowOutcome::Done
                    };
                    (outcome, None)
                } else {
                    self.continuations.remove(&partition_id);
                    (ShadowOutcome::Done, None)
                }
            }
            Err(e) => {
                // release the lease before surfacing the failure
                if let Err(requeue_err) = shard
                    .shadow_partition_requeue(&partition_id, current, None)
                    .await
                {
                    warn!(shard = %shard.name(), partition = %partition_id, error = %requeue_err, "shadow partition requeue failed");
                }
                return Err(e);
            }
        };

        match shard
            .shadow_partition_requeue(&partition_id, current, force_until)
            .await
        {
            Ok(()) | Err(QueueError::ShadowPartitionNotFound(_)) => Ok(outcome),
            Err(e) => Err(e),
        }
    }

    async fn refill_backlogs(&self, sp: &ShadowPartition) -> Result<RefillPass, QueueError> {
        let shard = &self.shard;
        let cfg = shard.config();
        let partition_id = &sp.partition_id;

        let constraints = shard
            .tenants()
            .partition_constraints(sp.account_id, partition_id)
            .await;
        let sp = shard
            .refresh_shadow_partition_constraints(partition_id, &constraints)
            .await?;
        if sp.pause_refill {
            return Ok(RefillPass::Paused);
        }

        let now_ms = shard.now_ms();
        let sequential = rand::rng().random_bool(SEQUENTIAL_BACKLOG_PEEK);
        let peek = shard
            .backlog_peek(partition_id, sequential, now_ms, cfg.backlog_peek_max)
            .await?;
        let mut backlogs = peek.items;
        backlogs.shuffle(&mut rand::rng());

        for backlog in &backlogs {
            let reason = backlog.is_outdated(&sp);
            if reason != OutdatedReason::Unchanged {
                self.normalize_outdated(backlog, &sp, reason).await?;
                continue;
            }

            let result = shard.backlog_refill(backlog, &sp, now_ms).await?;
            debug!(
                shard = %shard.name(),
                backlog = %backlog.backlog_id,
                refilled = result.refilled,
                constraint = result.constraint.as_str(),
                "refilled backlog"
            );
            if matches!(result.constraint, Constraint::Account | Constraint::Function) {
                return Ok(RefillPass::Constrained(result.constraint));
            }
        }

        Ok(RefillPass::Drained {
            remaining: peek.total_count > backlogs.len(),
        })
    }

    /// Small outdated backlogs are drained right away, large ones parked for
    /// the normalizer.
    async fn normalize_outdated(
        &self,
        backlog: &QueueBacklog,
        sp: &ShadowPartition,
        reason: OutdatedReason,
    ) -> Result<(), QueueError> {
        let shard = &self.shard;
        let threshold = shard.config().backlog_normalize_threshold;
        let (count, parked) = shard.backlog_prepare_normalize(backlog, sp, threshold).await?;
        debug!(shard = %shard.name(), backlog = %backlog.backlog_id, reason = reason.as_str(), count, parked, "backlog outdated");
        if parked {
            return Ok(());
        }

        match shard
            .lease_backlog_for_normalization(&backlog.backlog_id, shard.config().normalize_lease_ms)
            .await
        {
            Ok(_) => match shard.normalize_backlog(backlog, sp, &self.cancel.child_token()).await {
                Ok(_) => Ok(()),
                Err(QueueError::BacklogNormalizationLeaseExpired(_)) if self.cancel.is_cancelled() => Ok(()),
                Err(e) => Err(e),
            },
            Err(QueueError::BacklogAlreadyLeasedForNormalization(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

enum RefillPass {
    Paused,
    Constrained(Constraint),
    Drained { remaining: bool },
}
