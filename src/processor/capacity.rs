//! Guaranteed-capacity slots held by this process.
//!
//! Each tick renews the slots already held and tries to claim one more,
//! picking among accounts with free slots weighted by priority. Accounts
//! with a held slot are scheduled first by the executor.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use ulid::Ulid;
use uuid::Uuid;

use crate::keys::config_leases;
use crate::processor::{LeaderLease, tick};
use crate::queue_shard::{GuaranteedCapacity, QueueError, QueueShard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeldLease {
    account_id: Uuid,
    lease_id: Ulid,
}

pub struct AccountLeases {
    shard: Arc<QueueShard>,
    held: Mutex<Vec<HeldLease>>,
}

impl AccountLeases {
    pub fn new(shard: Arc<QueueShard>) -> Self {
        Self {
            shard,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Accounts this process holds a slot for.
    pub fn accounts(&self) -> Vec<Uuid> {
        let mut accounts: Vec<Uuid> = self.held.lock().iter().map(|l| l.account_id).collect();
        accounts.dedup();
        accounts
    }

    /// Renew held slots, dropping the ones that were lost.
    pub async fn renew(&self) -> Result<usize, QueueError> {
        let shard = &self.shard;
        let duration_ms = shard.config().account_lease_ms;
        let held: Vec<HeldLease> = self.held.lock().clone();
        let mut kept = Vec::with_capacity(held.len());
        for lease in held {
            match shard
                .renew_account_lease(lease.account_id, lease.lease_id, duration_ms)
                .await
            {
                Ok(next) => kept.push(HeldLease {
                    account_id: lease.account_id,
                    lease_id: next,
                }),
                Err(
                    QueueError::ShardLeaseNotFound(_)
                    | QueueError::ShardLeaseExpired(_)
                    | QueueError::GuaranteedCapacityNotFound(_),
                ) => {
                    info!(shard = %shard.name(), account = %lease.account_id, "lost account lease");
                }
                Err(e) => return Err(e),
            }
        }
        let count = kept.len();
        *self.held.lock() = kept;
        if let Some(m) = shard.metrics() {
            m.set_account_leases(shard.name(), count);
        }
        Ok(count)
    }

    /// Claim one free slot. Returns the account claimed for, if any.
    pub async fn claim(&self) -> Result<Option<Uuid>, QueueError> {
        let shard = &self.shard;
        let now_ms = shard.now_ms();
        let held = self.accounts();
        let candidates: Vec<(GuaranteedCapacity, usize)> = shard
            .guaranteed_capacities()
            .await?
            .into_iter()
            .filter(|gc| !held.contains(&gc.account_id))
            .filter_map(|gc| {
                let taken = gc.valid_leases(now_ms).len();
                (taken < gc.guaranteed_capacity as usize).then_some((gc, taken))
            })
            .collect();

        let Some((capacity, index)) = pick_weighted(&candidates) else {
            return Ok(None);
        };
        match shard
            .acquire_account_lease(capacity.account_id, index, shard.config().account_lease_ms)
            .await
        {
            Ok(lease_id) => {
                self.held.lock().push(HeldLease {
                    account_id: capacity.account_id,
                    lease_id,
                });
                Ok(Some(capacity.account_id))
            }
            Err(
                QueueError::AllShardsAlreadyLeased { .. }
                | QueueError::ShardLeaseIndexInvalid { .. }
                | QueueError::ShardLeaseExceedsLimits { .. },
            ) => {
                debug!(shard = %shard.name(), account = %capacity.account_id, index, "lost account lease race");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Release every held slot.
    pub async fn release_all(&self) {
        let held: Vec<HeldLease> = std::mem::take(&mut *self.held.lock());
        for lease in held {
            if let Err(e) = self
                .shard
                .renew_account_lease(lease.account_id, lease.lease_id, 0)
                .await
            {
                debug!(shard = %self.shard.name(), account = %lease.account_id, error = %e, "account lease release failed");
            }
        }
    }

    /// Bring stored capacities in line with tenant config. Leader only.
    pub async fn refresh_capacities(&self) -> Result<usize, QueueError> {
        let shard = &self.shard;
        let mut changed = 0usize;
        for stored in shard.guaranteed_capacities().await? {
            match shard.tenants().guaranteed_capacity(stored.account_id).await {
                None => {
                    shard.remove_guaranteed_capacity(stored.account_id).await?;
                    changed += 1;
                }
                Some((priority, workers))
                    if priority != stored.priority || workers != stored.guaranteed_capacity =>
                {
                    shard
                        .set_guaranteed_capacity(&GuaranteedCapacity::for_account(
                            stored.account_id,
                            priority,
                            workers,
                        ))
                        .await?;
                    changed += 1;
                }
                Some(_) => {}
            }
        }
        Ok(changed)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let every = Duration::from_millis(self.shard.config().guaranteed_capacity_tick_ms);
        let mut leader = LeaderLease::new(Arc::clone(&self.shard), config_leases::GUARANTEED_CAPACITY);
        loop {
            if let Err(e) = self.renew().await {
                error!(shard = %self.shard.name(), error = %e, "renewing account leases failed");
            }
            if let Err(e) = self.claim().await {
                error!(shard = %self.shard.name(), error = %e, "claiming account lease failed");
            }
            if leader.acquire().await {
                if let Err(e) = self.refresh_capacities().await {
                    error!(shard = %self.shard.name(), error = %e, "refreshing guaranteed capacity failed");
                }
            }
            if !tick(&cancel, every).await {
                break;
            }
        }
        leader.release().await;
        self.release_all().await;
    }
}

/// Random candidate weighted by priority. Returns the slot index to claim.
fn pick_weighted(candidates: &[(GuaranteedCapacity, usize)]) -> Option<(GuaranteedCapacity, usize)> {
    if candidates.is_empty() {
        return None;
    }
    let weights = candidates.iter().map(|(gc, _)| gc.priority as u64 + 1);
    let dist = WeightedIndex::new(weights).ok()?;
    let i = dist.sample(&mut rand::rng());
    candidates.get(i).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_only_from_candidates() {
        assert!(pick_weighted(&[]).is_none());
        let a = GuaranteedCapacity::for_account(Uuid::new_v4(), 0, 2);
        let (picked, index) = pick_weighted(&[(a.clone(), 1)]).unwrap();
        assert_eq!(picked.account_id, a.account_id);
        assert_eq!(index, 1);
    }
}
