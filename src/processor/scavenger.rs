use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::keys::config_leases;
use crate::processor::{LeaderLease, tick};
use crate::queue_shard::{QueueError, QueueShard};

/// Reclaims expired item leases while holding the scavenger config lease.
pub struct Scavenger {
    shard: Arc<QueueShard>,
}

impl Scavenger {
    pub fn new(shard: Arc<QueueShard>) -> Self {
        Self { shard }
    }

    /// One pass. Returns the number of items requeued.
    pub async fn scavenge_once(&self) -> Result<usize, QueueError> {
        self.shard
            .scavenge(self.shard.config().scavenger_peek_size)
            .await
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let every = Duration::from_millis(self.shard.config().scavenger_tick_ms);
        let mut leader = LeaderLease::new(Arc::clone(&self.shard), config_leases::SCAVENGER);
        while tick(&cancel, every).await {
            if !leader.acquire().await {
                continue;
            }
            if let Err(e) = self.scavenge_once().await {
                error!(shard = %self.shard.name(), error = %e, "scavenge failed");
            }
        }
        leader.release().await;
    }
}
