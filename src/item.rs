//! Queue items and the payload they carry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;
use uuid::Uuid;

use crate::gcra::Gcra;

/// Attempts allowed when the payload does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Start-like items scheduled at most this far in the future are ordered by run age.
pub const PRIORITY_LOOKAHEAD_MS: i64 = 2_000;

/// Width of a hashed caller-supplied id.
pub const HASHED_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Start,
    Edge,
    EdgeError,
    Sleep,
    Pause,
    Debounce,
    ScheduleBatch,
    Cancel,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Start => "start",
            ItemKind::Edge => "edge",
            ItemKind::EdgeError => "edge_error",
            ItemKind::Sleep => "sleep",
            ItemKind::Pause => "pause",
            ItemKind::Debounce => "debounce",
            ItemKind::ScheduleBatch => "schedule_batch",
            ItemKind::Cancel => "cancel",
        }
    }

    /// Kinds that continue a run right away and are ordered by run age.
    fn is_promotable(&self) -> bool {
        matches!(self, ItemKind::Start | ItemKind::Edge | ItemKind::EdgeError)
    }
}

/// Which run and tenant an item belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "runID")]
    pub run_id: Ulid,
    #[serde(rename = "wID")]
    pub function_id: Uuid,
    #[serde(rename = "wv", default)]
    pub function_version: i32,
    #[serde(rename = "acctID")]
    pub account_id: Uuid,
    #[serde(rename = "wsID")]
    pub env_id: Uuid,
    #[serde(rename = "appID")]
    pub app_id: Uuid,
    #[serde(rename = "key", default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Rate limit an item is subject to, evaluated at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
    /// Hash of the evaluated throttle key.
    #[serde(rename = "k")]
    pub key: String,
    /// Hash of the throttle key expression.
    #[serde(rename = "kh", default)]
    pub key_expression_hash: String,
    #[serde(rename = "l")]
    pub limit: i64,
    #[serde(rename = "b", default)]
    pub burst: i64,
    #[serde(rename = "p")]
    pub period_secs: i64,
}

impl Throttle {
    pub fn gcra(&self) -> Gcra {
        Gcra::new(self.limit, self.burst, self.period_secs * 1_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyScope {
    Fn,
    Env,
    Account,
}

impl ConcurrencyScope {
    pub fn prefix(&self) -> char {
        match self {
            ConcurrencyScope::Fn => 'f',
            ConcurrencyScope::Env => 'e',
            ConcurrencyScope::Account => 'a',
        }
    }
}

/// A custom concurrency key evaluated for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrencyKey {
    #[serde(rename = "s")]
    pub scope: ConcurrencyScope,
    /// Function, env or account id depending on scope.
    #[serde(rename = "e")]
    pub entity_id: Uuid,
    #[serde(rename = "h")]
    pub key_expression_hash: String,
    #[serde(rename = "v")]
    pub value_hash: String,
    #[serde(rename = "uv", default)]
    pub unhashed_value: String,
    #[serde(rename = "l")]
    pub limit: i64,
}

impl CustomConcurrencyKey {
    /// Identity of the key across items: scope, entity and evaluated value.
    pub fn canonical_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.scope.prefix(),
            self.entity_id,
            self.value_hash
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: ItemKind,
    pub identifier: Identifier,
    #[serde(default)]
    pub attempt: u32,
    #[serde(rename = "maxAttempts", default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    #[serde(rename = "ck", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrencyKey>,
    /// Milliseconds subtracted from the score of promotable items.
    #[serde(rename = "pf", default, skip_serializing_if = "Option::is_none")]
    pub priority_factor: Option<i64>,
    #[serde(rename = "gid", default)]
    pub group_id: String,
}

impl Payload {
    pub fn new(kind: ItemKind, identifier: Identifier) -> Self {
        Self {
            kind,
            identifier,
            attempt: 0,
            max_attempts: None,
            payload: serde_json::Value::Null,
            throttle: None,
            custom_concurrency_keys: Vec::new(),
            priority_factor: None,
            group_id: String::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }
}

/// An item stored in the items hash. Every index refers to it by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    #[serde(default)]
    pub id: String,
    /// First time a scheduler saw the item, for latency reporting.
    #[serde(rename = "pt", default)]
    pub earliest_peek_time: i64,
    #[serde(rename = "at")]
    pub at_ms: i64,
    #[serde(rename = "wt", default)]
    pub wall_time_ms: i64,
    #[serde(rename = "wfID")]
    pub function_id: Uuid,
    #[serde(rename = "wsID")]
    pub workspace_id: Uuid,
    #[serde(rename = "leaseID", default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Ulid>,
    pub data: Payload,
    /// Set for items routed to a named system queue instead of a function.
    #[serde(rename = "queueID", default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(rename = "ip", default, skip_serializing_if = "Option::is_none")]
    pub idempotency_period_ms: Option<i64>,
    #[serde(rename = "eat", default)]
    pub enqueued_at: i64,
    /// Backlog the item was last refilled from.
    #[serde(rename = "rf", default, skip_serializing_if = "Option::is_none")]
    pub refilled_from: Option<String>,
    #[serde(rename = "rat", default)]
    pub refilled_at: i64,
}

impl QueueItem {
    /// Item for `data`, with an empty id so that enqueue assigns one.
    pub fn new(data: Payload) -> Self {
        Self {
            id: String::new(),
            earliest_peek_time: 0,
            at_ms: 0,
            wall_time_ms: 0,
            function_id: data.identifier.function_id,
            workspace_id: data.identifier.env_id,
            lease_id: None,
            data,
            queue_name: None,
            idempotency_period_ms: None,
            enqueued_at: 0,
            refilled_from: None,
            refilled_at: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn account_id(&self) -> Uuid {
        self.data.identifier.account_id
    }

    /// Partition (ready queue) the item belongs to.
    pub fn partition_id(&self) -> String {
        match &self.queue_name {
            Some(name) => name.clone(),
            None => self.function_id.to_string(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.queue_name.is_some()
    }

    /// Ordering score in the ready queue and backlogs.
    pub fn score(&self, now_ms: i64) -> i64 {
        let promotable = self.data.kind.is_promotable()
            && self.data.attempt == 0
            && self.at_ms <= now_ms + PRIORITY_LOOKAHEAD_MS;
        if !promotable {
            return self.at_ms;
        }
        let run_started = self.data.identifier.run_id.timestamp_ms() as i64;
        run_started - self.data.priority_factor.unwrap_or(0)
    }

    /// Whether an unexpired lease is held on the item.
    pub fn is_leased(&self, now_ms: i64) -> bool {
        self.lease_id
            .map(|l| l.timestamp_ms() as i64 > now_ms)
            .unwrap_or(false)
    }
}

/// Hash a caller-supplied id into a fixed-width store id.
pub fn hash_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let mut out = hex::encode(digest);
    out.truncate(HASHED_ID_LEN);
    out
}

/// Short stable hash used inside backlog ids and fingerprints.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}
