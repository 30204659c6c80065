//! Reclaiming items whose lease expired without an extend or dequeue.

use tracing::{debug, info};

use crate::partition::PartitionConstraints;
use crate::queue_shard::helpers::{load_item, scripts, update_scavenger_index};
use crate::queue_shard::lease::RequeueRoute;
use crate::queue_shard::script::{ScoreRange, Script};
use crate::queue_shard::{QueueError, QueueShard};

impl QueueShard {
    /// Requeue up to `limit` items with expired leases. Returns how many were requeued.
    pub async fn scavenge(&self, limit: usize) -> Result<usize, QueueError> {
        let now_ms = self.now_ms();
        let (partitions, _) = self
            .peek_members(&self.kg.scavenger_index(), true, ScoreRange::up_to(now_ms), limit)
            .await?;

        let mut requeued = 0usize;
        for (partition_id, _) in partitions {
            if requeued >= limit {
                break;
            }
            let expired = {
                let s = Script::snapshot(&self.db).await?;
                s.zrange_by_score(
                    &self.kg.in_progress(&partition_id),
                    ScoreRange::up_to(now_ms),
                    0,
                    limit - requeued,
                )
                .await?
            };

            if expired.is_empty() {
                // pointer without expired leases: stale or left behind by an older layout
                self.run_script(scripts::SCAVENGE, || async {
                    let s = Script::begin(&self.db).await?;
                    update_scavenger_index(&s, &self.kg, &partition_id).await?;
                    s.commit().await
                })
                .await?;
                continue;
            }

            for (item_id, _) in expired {
                if self.scavenge_item(&partition_id, &item_id).await? {
                    requeued += 1;
                }
            }
        }

        if requeued > 0 {
            info!(shard = %self.name, requeued, "scavenged expired leases");
            if let Some(m) = &self.metrics {
                m.record_scavenged(&self.name, requeued as u64);
            }
        }
        Ok(requeued)
    }

    async fn scavenge_item(&self, partition_id: &str, item_id: &str) -> Result<bool, QueueError> {
        let constraints = PartitionConstraints::default();
        self.run_script(scripts::SCAVENGE, || async {
            let kg = &self.kg;
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;

            let Some(mut item) = load_item(&s, kg, item_id).await? else {
                s.zrem(&kg.in_progress(partition_id), item_id).await?;
                update_scavenger_index(&s, kg, partition_id).await?;
                s.commit().await?;
                debug!(partition = %partition_id, id = %item_id, "dropped in-progress pointer to missing item");
                return Ok(false);
            };
            match s.zscore(&kg.in_progress(partition_id), item_id).await? {
                Some(expiry) if expiry <= now_ms => {}
                // extended or finished since the peek
                _ => return Ok(false),
            }

            item.data.attempt += 1;
            let at_ms = item.at_ms.max(now_ms);
            self.requeue_in_script(&s, item, at_ms, RequeueRoute::Ready, &constraints, now_ms)
                .await?;
            s.commit().await?;
            debug!(partition = %partition_id, id = %item_id, "requeued expired lease");
            Ok(true)
        })
        .await
    }
}
