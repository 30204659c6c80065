//! Logical key names for every queue structure.
//!
//! All names of one queue shard start with the same routing tag, so a script
//! never touches keys outside its shard. Names never contain `/`, which the
//! physical layout in `queue_shard::script` uses as its separator.

use uuid::Uuid;

/// Routing tag shared by every key of the default queue.
pub const DEFAULT_PREFIX: &str = "{q:v1}";

#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // items

    /// Hash of item id -> queue item.
    pub fn queue_item(&self) -> String {
        format!("{}:queue:item", self.prefix)
    }

    /// Marker kept after a successful dequeue for the idempotency period.
    pub fn idempotency(&self, item_id: &str) -> String {
        format!("{}:queue:seen:{}", self.prefix, item_id)
    }

    pub fn run_index(&self, run_id: &str) -> String {
        format!("{}:idx:run:{}", self.prefix, run_id)
    }

    pub fn status(&self, status: &str, function_id: &Uuid) -> String {
        format!("{}:queue:status:{}:{}", self.prefix, function_id, status)
    }

    pub fn fn_metadata(&self) -> String {
        format!("{}:fnMeta", self.prefix)
    }

    // ready side

    pub fn partition_item(&self) -> String {
        format!("{}:partition:item", self.prefix)
    }

    /// Ready queue of one partition.
    pub fn ready(&self, partition_id: &str) -> String {
        format!("{}:queue:sorted:{}", self.prefix, partition_id)
    }

    pub fn global_partition_index(&self) -> String {
        format!("{}:partition:sorted", self.prefix)
    }

    pub fn account_partition_index(&self, account_id: &Uuid) -> String {
        format!("{}:accounts:{}:partition:sorted", self.prefix, account_id)
    }

    pub fn global_account_index(&self) -> String {
        format!("{}:accounts:sorted", self.prefix)
    }

    /// Leased items of one partition, scored by lease expiry.
    pub fn in_progress(&self, partition_id: &str) -> String {
        format!("{}:concurrency:p:{}", self.prefix, partition_id)
    }

    /// Leased items of one account, scored by lease expiry.
    pub fn in_progress_account(&self, account_id: &Uuid) -> String {
        format!("{}:concurrency:account:{}", self.prefix, account_id)
    }

    /// Partitions with leased items, scored by their earliest lease expiry.
    pub fn scavenger_index(&self) -> String {
        format!("{}:concurrency:sorted", self.prefix)
    }

    pub fn active_partition(&self, partition_id: &str) -> String {
        format!("{}:v2:active:p:{}", self.prefix, partition_id)
    }

    pub fn active_account(&self, account_id: &Uuid) -> String {
        format!("{}:v2:active:a:{}", self.prefix, account_id)
    }

    /// Active set of a custom concurrency key, named by its canonical id.
    pub fn active_custom(&self, canonical_key: &str) -> String {
        format!("{}:v2:active:c:{}", self.prefix, canonical_key)
    }

    // shadow side

    pub fn shadow_partition_meta(&self) -> String {
        format!("{}:shadows", self.prefix)
    }

    pub fn backlog_meta(&self) -> String {
        format!("{}:backlogs", self.prefix)
    }

    pub fn backlog_set(&self, backlog_id: &str) -> String {
        format!("{}:backlog:sorted:{}", self.prefix, backlog_id)
    }

    /// Backlogs of one shadow partition, scored by their earliest item.
    pub fn shadow_partition_set(&self, partition_id: &str) -> String {
        format!("{}:shadow:sorted:{}", self.prefix, partition_id)
    }

    pub fn global_shadow_partition_set(&self) -> String {
        format!("{}:shadows:sorted", self.prefix)
    }

    pub fn account_shadow_partition_set(&self, account_id: &Uuid) -> String {
        format!("{}:accounts:{}:shadows:sorted", self.prefix, account_id)
    }

    pub fn global_account_shadow_partitions(&self) -> String {
        format!("{}:accounts:shadows:sorted", self.prefix)
    }

    pub fn throttle(&self, throttle_key: &str) -> String {
        format!("{}:throttle:{}", self.prefix, throttle_key)
    }

    // normalization

    pub fn partition_normalize_set(&self, partition_id: &str) -> String {
        format!("{}:normalize:shadow:{}", self.prefix, partition_id)
    }

    pub fn account_normalize_set(&self, account_id: &Uuid) -> String {
        format!("{}:normalize:accounts:{}:sorted", self.prefix, account_id)
    }

    pub fn global_account_normalize_set(&self) -> String {
        format!("{}:normalize:accounts:sorted", self.prefix)
    }

    pub fn backlog_normalization_lease(&self, backlog_id: &str) -> String {
        format!("{}:normalize:lease:{}", self.prefix, backlog_id)
    }

    // background loops

    pub fn config_lease(&self, name: &str) -> String {
        format!("{}:queue:config:{}", self.prefix, name)
    }

    pub fn active_checker_backlogs(&self) -> String {
        format!("{}:active-checker:sorted", self.prefix)
    }

    pub fn active_checker_cooldown(&self, backlog_id: &str) -> String {
        format!("{}:active-checker:cooldown:{}", self.prefix, backlog_id)
    }

    pub fn guaranteed_capacity_map(&self) -> String {
        format!("{}:queue:guaranteed-capacity", self.prefix)
    }

    // run state

    pub fn run_steps(&self, run_id: &str) -> String {
        format!("{}:run:{}:steps", self.prefix, run_id)
    }
}

/// Well-known config lease names.
pub mod config_leases {
    pub const SCAVENGER: &str = "scavenger";
    pub const ACTIVE_CHECKER: &str = "active-checker";
    pub const GUARANTEED_CAPACITY: &str = "guaranteed-capacity";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_routing_tag_and_avoid_separator() {
        let kg = KeyGenerator::default();
        let account = Uuid::new_v4();
        let names = [
            kg.queue_item(),
            kg.ready("fn"),
            kg.in_progress("fn"),
            kg.account_shadow_partition_set(&account),
            kg.active_custom("f:abc:123"),
            kg.backlog_set("fn:x:start"),
        ];
        for name in names {
            assert!(name.starts_with(DEFAULT_PREFIX), "{name}");
            assert!(!name.contains('/'), "{name}");
        }
    }
}
