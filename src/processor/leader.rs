use std::sync::Arc;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::queue_shard::{QueueError, QueueShard};

/// A config lease held across ticks by one replica.
pub struct LeaderLease {
    shard: Arc<QueueShard>,
    name: &'static str,
    held: Option<Ulid>,
}

impl LeaderLease {
    pub fn new(shard: Arc<QueueShard>, name: &'static str) -> Self {
        Self {
            shard,
            name,
            held: None,
        }
    }

    /// Claim or renew the lease. Returns whether this replica leads for the tick.
    pub async fn acquire(&mut self) -> bool {
        let duration_ms = self.shard.config().config_lease_ms;
        match self
            .shard
            .config_lease(self.name, duration_ms, self.held)
            .await
        {
            Ok(lease_id) => {
                if self.held.is_none() {
                    info!(shard = %self.shard.name(), lease = self.name, "became leader");
                }
                self.held = Some(lease_id);
                true
            }
            Err(QueueError::ConfigAlreadyLeased(_)) => {
                if self.held.take().is_some() {
                    info!(shard = %self.shard.name(), lease = self.name, "lost leadership");
                }
                false
            }
            Err(e) => {
                warn!(shard = %self.shard.name(), lease = self.name, error = %e, "config lease failed");
                false
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    pub async fn release(&mut self) {
        let Some(lease_id) = self.held.take() else {
            return;
        };
        if let Err(e) = self.shard.release_config_lease(self.name, lease_id).await {
            debug!(shard = %self.shard.name(), lease = self.name, error = %e, "config lease release failed");
        }
    }
}
