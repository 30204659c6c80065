//! Step outputs of a run, keyed by step id.
//!
//! Saving is idempotent: the same data saved twice is a no-op, different data
//! for an existing step is rejected.

use std::collections::HashMap;

use serde_json::Value;
use ulid::Ulid;

use crate::queue_shard::helpers::scripts;
use crate::queue_shard::script::Script;
use crate::queue_shard::{QueueError, QueueShard};

impl QueueShard {
    /// Store a step output. Returns false if the identical output was already stored.
    pub async fn save_step(&self, run_id: Ulid, step_id: &str, data: &Value) -> Result<bool, QueueError> {
        self.run_script(scripts::SAVE_STEP, || async {
            let hash = self.kg.run_steps(&run_id.to_string());
            let s = Script::begin(&self.db).await?;
            if let Some(existing) = s.hget::<Value>(&hash, step_id).await? {
                if existing == *data {
                    return Ok(false);
                }
                return Err(QueueError::DuplicateResponse {
                    run_id: run_id.to_string(),
                    step_id: step_id.to_string(),
                });
            }
            s.hset(&hash, step_id, data)?;
            s.commit().await?;
            Ok(true)
        })
        .await
    }

    pub async fn load_steps(&self, run_id: Ulid) -> Result<HashMap<String, Value>, QueueError> {
        let s = Script::snapshot(&self.db).await?;
        let mut steps = HashMap::new();
        for (step_id, raw) in s.hgetall_raw(&self.kg.run_steps(&run_id.to_string())).await? {
            steps.insert(step_id, serde_json::from_slice(&raw)?);
        }
        Ok(steps)
    }

    /// Drop every stored step of a run.
    pub async fn delete_steps(&self, run_id: Ulid) -> Result<usize, QueueError> {
        self.run_script(scripts::SAVE_STEP, || async {
            let hash = self.kg.run_steps(&run_id.to_string());
            let s = Script::begin(&self.db).await?;
            let fields = s.hgetall_raw(&hash).await?;
            for (step_id, _) in &fields {
                s.hdel(&hash, step_id)?;
            }
            s.commit().await?;
            Ok(fields.len())
        })
        .await
    }
}
