//! Ready-side scheduling: lease partitions, lease their due items and run
//! them through the handler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::item::QueueItem;
use crate::partition::QueuePartition;
use crate::processor::continuations::Continuations;
use crate::processor::{AccountLeases, RunError, RunFunc, RunInfo, half, spawn_extender, tick};
use crate::queue_shard::{
    Constraint, DequeueOptions, LeaseOptions, PartitionLeaseOptions, QueueError, QueueShard,
};
use crate::retry::{RetryPolicy, next_retry_time_ms};

/// Delay before a partition blocked on account or function concurrency is
/// visited again.
const CONSTRAINT_REQUEUE_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOutcome {
    Contended,
    Missing,
    Paused,
    /// Partition or account at its in-progress limit.
    Constrained,
    /// Empty partition deleted on requeue.
    Collected,
    /// `n` items leased and handed to the handler.
    Leased(usize),
}

pub struct Executor {
    shard: Arc<QueueShard>,
    handler: Arc<dyn RunFunc>,
    retry_policy: RetryPolicy,
    workers: Arc<Semaphore>,
    continuations: Continuations<QueuePartition>,
    account_leases: Option<Arc<AccountLeases>>,
    running: Mutex<JoinSet<()>>,
}

impl Executor {
    pub fn new(shard: Arc<QueueShard>, handler: Arc<dyn RunFunc>) -> Self {
        let cfg = shard.config();
        let workers = Arc::new(Semaphore::new(cfg.num_workers.max(1)));
        let continuations = Continuations::new(
            cfg.continuation_limit,
            cfg.continuation_max_count,
            cfg.continuation_cooldown_ms,
        );
        Self {
            shard,
            handler,
            retry_policy: RetryPolicy::default(),
            workers,
            continuations,
            account_leases: None,
            running: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_account_leases(mut self, leases: Arc<AccountLeases>) -> Self {
        self.account_leases = Some(leases);
        self
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let every = Duration::from_millis(self.shard.config().poll_tick_ms);
        while tick(&cancel, every).await {
            if let Err(e) = self.process_tick().await {
                error!(shard = %self.shard.name(), error = %e, "partition scan failed");
            }
            self.reap_finished();
        }
        self.wait_idle().await;
    }

    /// One scheduling pass. Returns the number of items handed to the handler.
    pub async fn process_tick(&self) -> Result<usize, QueueError> {
        let mut leased = 0usize;
        for (partition, count) in self.partitions_for_tick().await? {
            match self.process_partition(&partition).await {
                Ok(PartitionOutcome::Leased(n)) => {
                    leased += n;
                    // more due items than one peek covers
                    if n > 0 && n >= self.shard.config().queue_peek_min {
                        let event = self.continuations.add(
                            &partition.id,
                            partition.clone(),
                            count + 1,
                            self.shard.now_ms(),
                        );
                        if let Some(m) = self.shard.metrics() {
                            m.record_continuation("ready", event.as_str());
                        }
                    } else {
                        self.continuations.remove(&partition.id);
                    }
                }
                Ok(_) => {
                    self.continuations.remove(&partition.id);
                }
                Err(e) => {
                    self.continuations.remove(&partition.id);
                    warn!(shard = %self.shard.name(), partition = %partition.id, error = %e, "processing partition failed");
                }
            }
        }
        Ok(leased)
    }

    async fn partitions_for_tick(&self) -> Result<Vec<(QueuePartition, u32)>, QueueError> {
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

        let mut out: Vec<(QueuePartition, u32)> = Vec::new();
        if run_continuations {
            for (_, count, p) in self.continuations.snapshot() {
                out.push((p, count));
            }
        }

        let mut accounts = self
            .account_leases
            .as_ref()
            .map(|l| l.accounts())
            .unwrap_or_default();
        if account_path {
            for account in shard.account_peek(false, now_ms, cfg.account_peek_max).await? {
                if !accounts.contains(&account) {
                    accounts.push(account);
                }
            }
        }

        let mut peeked = Vec::new();
        if accounts.is_empty() {
            peeked.extend(
                shard
                    .partition_peek(None, false, now_ms, cfg.partition_peek_max)
                    .await?
                    .items,
            );
        } else {
            let per_account = (cfg.partition_peek_max / accounts.len()).max(1);
            for account in accounts {
                peeked.extend(
                    shard
                        .partition_peek(Some(account), false, now_ms, per_account)
                        .await?
                        .items,
                );
            }
        }

        for p in peeked {
            if !out.iter().any(|(o, _)| o.id == p.id) {
                out.push((p, 0));
            }
        }
        Ok(out)
    }

    /// Lease a partition, lease its due items and spawn the handler for each.
    pub async fn process_partition(&self, partition: &QueuePartition) -> Result<PartitionOutcome, QueueError> {
        let shard = &self.shard;
        let cfg = shard.config();
        let partition_id = &partition.id;

        match shard
            .partition_lease(partition_id, cfg.partition_lease_ms, PartitionLeaseOptions::default())
            .await
        {
            Ok(_) => {}
            Err(QueueError::PartitionAlreadyLeased(_)) => return Ok(PartitionOutcome::Contended),
            Err(QueueError::PartitionNotFound(_)) => return Ok(PartitionOutcome::Missing),
            Err(QueueError::PartitionPaused(_)) => return Ok(PartitionOutcome::Paused),
            Err(
                QueueError::PartitionConcurrencyLimit { .. } | QueueError::AccountConcurrencyLimit { .. },
            ) => return Ok(PartitionOutcome::Constrained),
            Err(e) => return Err(e),
        }

        let now_ms = shard.now_ms();
        let peek = match shard.item_peek(partition_id, now_ms, cfg.queue_peek_min).await {
            Ok(peek) => peek,
            Err(e) => {
                self.release_partition(partition_id, now_ms, false).await;
                return Err(e);
            }
        };

        let mut leased = 0usize;
        let mut blocked = false;
        for item in peek.items {
            if item.is_leased(now_ms) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                debug!(shard = %shard.name(), partition = %partition_id, "no free workers");
                break;
            };
            match shard.lease(&item, cfg.queue_lease_ms, LeaseOptions::default()).await {
                Ok(lease_id) => {
                    leased += 1;
                    let info = RunInfo {
                        lease_id,
                        partition_id: partition_id.clone(),
                        latency_ms: (now_ms - item.at_ms).max(0),
                    };
                    let job = self.execution(item, info);
                    self.running.lock().spawn(async move {
                        job.await;
                        drop(permit);
                    });
                }
                Err(e) if matches!(e.constraint(), Some(Constraint::Account | Constraint::Function)) => {
                    blocked = true;
                    break;
                }
                // custom keys and throttles only block this item
                Err(e) if e.constraint().is_some() => continue,
                Err(QueueError::ItemNotFound(_) | QueueError::ItemAlreadyLeased(_)) => continue,
                Err(e) => {
                    self.release_partition(partition_id, now_ms, false).await;
                    return Err(e);
                }
            }
        }

        let requeue = if blocked {
            shard
                .partition_requeue(partition_id, now_ms + CONSTRAINT_REQUEUE_MS, true)
                .await
        } else {
            shard
                .partition_requeue(partition_id, now_ms + cfg.partition_lease_ms, false)
                .await
        };
        match requeue {
            Ok(()) => {}
            Err(QueueError::PartitionGarbageCollected(_)) => return Ok(PartitionOutcome::Collected),
            Err(e) => return Err(e),
        }
        if blocked && leased == 0 {
            return Ok(PartitionOutcome::Constrained);
        }
        Ok(PartitionOutcome::Leased(leased))
    }

    async fn release_partition(&self, partition_id: &str, at_ms: i64, force: bool) {
        match self.shard.partition_requeue(partition_id, at_ms, force).await {
            Ok(()) | Err(QueueError::PartitionGarbageCollected(_)) => {}
            Err(e) => {
                warn!(shard = %self.shard.name(), partition = %partition_id, error = %e, "partition requeue failed")
            }
        }
    }

    /// Run one leased item to completion, extending its lease meanwhile.
    fn execution(&self, item: QueueItem, info: RunInfo) -> impl Future<Output = ()> + Send + 'static {
        let shard = Arc::clone(&self.shard);
        let handler = Arc::clone(&self.handler);
        let policy = self.retry_policy.clone();
        async move {
            let lease_ms = shard.config().queue_lease_ms;
            let lease = Arc::new(Mutex::new(info.lease_id));
            let token = CancellationToken::new();
            let _guard = token.clone().drop_guard();
            let extender = spawn_extender(token.clone(), half(lease_ms), {
                let shard = Arc::clone(&shard);
                let item = item.clone();
                let lease = Arc::clone(&lease);
                move || {
                    let shard = Arc::clone(&shard);
                    let item = item.clone();
                    let lease = Arc::clone(&lease);
                    async move {
                        let current: Ulid = *lease.lock();
                        let next = shard.extend_lease(&item, current, lease_ms).await?;
                        *lease.lock() = next;
                        Ok(())
                    }
                }
            });

            let result = handler.run(info, item.clone()).await;
            token.cancel();
            let _ = extender.await;

            if let Err(e) = finish(&shard, item, result, &policy).await {
                error!(shard = %shard.name(), error = %e, "finishing item failed");
            }
        }
    }

    fn reap_finished(&self) {
        let mut running = self.running.lock();
        while let Some(res) = running.try_join_next() {
            if let Err(e) = res {
                warn!(shard = %self.shard.name(), error = %e, "item task panicked");
            }
        }
    }

    /// Wait for every in-flight item.
    pub async fn wait_idle(&self) {
        let mut running = std::mem::take(&mut *self.running.lock());
        while running.join_next().await.is_some() {}
    }
}

/// Dequeue or requeue an item after its handler returned.
async fn finish(
    shard: &QueueShard,
    mut item: QueueItem,
    result: Result<(), RunError>,
    policy: &RetryPolicy,
) -> Result<(), QueueError> {
    let now_ms = shard.now_ms();
    let retry_at = match &result {
        Ok(()) => None,
        Err(RunError::NoRetry(message)) => {
            warn!(shard = %shard.name(), id = %item.id, %message, "item failed permanently");
            None
        }
        Err(RunError::RetryAt { at_ms, .. }) => Some(*at_ms),
        Err(RunError::Retry(message)) => {
            let next = next_retry_time_ms(now_ms, item.data.attempt, item.data.max_attempts(), policy);
            if next.is_none() {
                warn!(shard = %shard.name(), id = %item.id, %message, attempt = item.data.attempt, "item out of attempts");
            }
            next
        }
    };

    match retry_at {
        Some(at_ms) => {
            item.data.attempt += 1;
            shard.requeue(&item, at_ms).await
        }
        None => shard.dequeue(&item, DequeueOptions::default()).await,
    }
}
