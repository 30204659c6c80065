//! Background loops that drive a queue shard.
//!
//! `Processor::run` starts every subsystem enabled in `RunMode` and returns
//! once the cancellation token fires and every loop has drained:
//!
//! - `execution`: ready-side partition scheduling and item execution
//! - `shadow_scan`: backlog refill through shadow partitions
//! - `normalize_scan`: draining outdated backlogs
//! - `scavenger`: reclaiming expired item leases (leader only)
//! - `active_checker`: pruning leaked active-set entries (leader only)
//! - `capacity`: guaranteed-capacity account leases

mod active_checker;
mod capacity;
pub mod continuations;
mod execution;
mod leader;
mod normalize_scan;
mod scavenger;
mod shadow_scan;

pub use active_checker::ActiveChecker;
pub use capacity::AccountLeases;
pub use continuations::{ContinueEvent, Continuations};
pub use execution::{Executor, PartitionOutcome};
pub use leader::LeaderLease;
pub use normalize_scan::Normalizer;
pub use scavenger::Scavenger;
pub use shadow_scan::{ShadowOutcome, ShadowScanner};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::item::QueueItem;
use crate::queue_shard::{QueueError, QueueShard};
use crate::retry::RetryPolicy;

/// Context handed to the handler with each leased item.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub lease_id: Ulid,
    pub partition_id: String,
    /// Time between the item's scheduled time and its lease.
    pub latency_ms: i64,
}

/// Why a handler did not finish an item.
#[derive(Debug, Error)]
pub enum RunError {
    /// Retry with the processor's backoff while attempts remain.
    #[error("{0}")]
    Retry(String),
    /// Retry at a specific time regardless of backoff.
    #[error("retry at {at_ms}: {message}")]
    RetryAt { at_ms: i64, message: String },
    /// Give up on the item now.
    #[error("{0}")]
    NoRetry(String),
}

/// Executes one leased item.
#[async_trait]
pub trait RunFunc: Send + Sync {
    async fn run(&self, info: RunInfo, item: QueueItem) -> Result<(), RunError>;
}

#[async_trait]
impl<F, Fut> RunFunc for F
where
    F: Fn(RunInfo, QueueItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), RunError>> + Send,
{
    async fn run(&self, info: RunInfo, item: QueueItem) -> Result<(), RunError> {
        (self)(info, item).await
    }
}

pub struct Processor {
    shard: Arc<QueueShard>,
    retry_policy: RetryPolicy,
}

impl Processor {
    pub fn new(shard: Arc<QueueShard>) -> Self {
        Self {
            shard,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Run every enabled subsystem until `cancel` fires.
    pub async fn run(&self, handler: Arc<dyn RunFunc>, cancel: CancellationToken) -> Result<(), QueueError> {
        let shard = &self.shard;
        let mode = shard.config().run_mode.clone();
        let mut tasks = JoinSet::new();

        let account_leases = Arc::new(AccountLeases::new(Arc::clone(shard)));
        if mode.guaranteed_capacity {
            let leases = Arc::clone(&account_leases);
            let cancel = cancel.clone();
            tasks.spawn(async move { leases.run(cancel).await });
        }
        if mode.partition {
            let executor = Executor::new(Arc::clone(shard), Arc::clone(&handler))
                .with_retry_policy(self.retry_policy.clone())
                .with_account_leases(Arc::clone(&account_leases));
            let cancel = cancel.clone();
            tasks.spawn(async move { executor.run(cancel).await });
        }
        if mode.shadow_partition {
            let scanner = Arc::new(ShadowScanner::new(Arc::clone(shard), cancel.child_token()));
            let cancel = cancel.clone();
            tasks.spawn(async move { scanner.run(cancel).await });
        }
        if mode.normalize_partition {
            let normalizer = Arc::new(Normalizer::new(Arc::clone(shard), cancel.child_token()));
            let cancel = cancel.clone();
            tasks.spawn(async move { normalizer.run(cancel).await });
        }
        if mode.scavenger {
            let scavenger = Scavenger::new(Arc::clone(shard));
            let cancel = cancel.clone();
            tasks.spawn(async move { scavenger.run(cancel).await });
        }
        if mode.active_checker {
            let checker = ActiveChecker::new(Arc::clone(shard));
            let cancel = cancel.clone();
            tasks.spawn(async move { checker.run(cancel).await });
        }

        info!(shard = %shard.name(), subsystems = tasks.len(), "processor started");
        cancel.cancelled().await;

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(shard = %shard.name(), error = %e, "processor task panicked");
            }
        }
        info!(shard = %shard.name(), "processor stopped");
        Ok(())
    }
}

/// Renew a lease every `every` until `token` is cancelled. The first failed
/// renewal cancels `token`, so work watching it can stop.
///
/// Cancel the token and await the handle before releasing the lease so no
/// renewal lands after the release.
pub(crate) fn spawn_extender<F, Fut>(
    token: CancellationToken,
    every: Duration,
    mut renew: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), QueueError>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(every) => {}
            }
            if let Err(e) = renew().await {
                debug!(error = %e, "lease renewal failed");
                token.cancel();
                return;
            }
        }
    })
}

/// Sleep for `tick`, returning false if cancelled first.
pub(crate) async fn tick(cancel: &CancellationToken, tick: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(tick) => true,
    }
}

pub(crate) fn half(duration_ms: i64) -> Duration {
    Duration::from_millis((duration_ms / 2).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn failed_renewal_cancels_the_token() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = spawn_extender(token.clone(), Duration::from_millis(5), {
            let calls = Arc::clone(&calls);
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Ok(())
                    } else {
                        Err(QueueError::BacklogNormalizationLeaseExpired("b".to_string()))
                    }
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token cancelled");
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_extenders_stop_renewing() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = spawn_extender(token.clone(), Duration::from_secs(60), {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }
        });
        token.cancel();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
