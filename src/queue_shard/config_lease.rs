//! Leader leases for shard-wide background loops.
//!
//! Exactly one worker runs the scavenger or the active checker at a time. A
//! worker claims the named lease and keeps renewing it with the id it holds.

use tracing::debug;
use ulid::Ulid;

use crate::queue_shard::helpers::scripts;
use crate::queue_shard::script::Script;
use crate::queue_shard::{QueueError, QueueShard};

impl QueueShard {
    /// Claim or renew the config lease `name`.
    ///
    /// `existing` is the lease id the caller currently holds, if any. The claim
    /// fails if someone else holds an unexpired lease.
    pub async fn config_lease(
        &self,
        name: &str,
        duration_ms: i64,
        existing: Option<Ulid>,
    ) -> Result<Ulid, QueueError> {
        self.run_script(scripts::CONFIG_LEASE, || async {
            let key = self.kg.config_lease(name);
            let now_ms = self.now_ms();
            let s = Script::begin(&self.db).await?;
            if let Some(current) = s.get_string(&key, now_ms).await? {
                let ours = existing.is_some_and(|e| e.to_string() == current);
                if !ours {
                    return Err(QueueError::ConfigAlreadyLeased(name.to_string()));
                }
            }
            let expires_at_ms = now_ms + duration_ms;
            let lease_id = self.lease_ids.next(expires_at_ms);
            s.set_string(&key, &lease_id.to_string(), Some(expires_at_ms))?;
            s.commit().await?;
            debug!(shard = %self.name, name, lease = %lease_id, renewed = existing.is_some(), "config lease held");
            Ok(lease_id)
        })
        .await
    }

    /// Give up a config lease. A lease held by someone else is left alone.
    pub async fn release_config_lease(&self, name: &str, lease_id: Ulid) -> Result<(), QueueError> {
        self.run_script(scripts::CONFIG_LEASE, || async {
            let key = self.kg.config_lease(name);
            let s = Script::begin(&self.db).await?;
            if s.get_string(&key, self.now_ms()).await?.as_deref() == Some(lease_id.to_string().as_str()) {
                s.del_string(&key)?;
            }
            s.commit().await
        })
        .await
    }
}
