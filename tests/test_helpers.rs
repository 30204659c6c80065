#![allow(dead_code)]

use std::sync::Arc;

use shoal::clock::{Clock, ManualClock};
use shoal::item::{Identifier, ItemKind, Payload, QueueItem};
use shoal::queue_shard::{QueueShard, ShardOptions};
use shoal::settings::{Backend, DatabaseConfig, QueueConfig};
use shoal::tenant::StaticTenantConfig;
use ulid::Ulid;
use uuid::Uuid;

/// Fixed start time for shards under a manual clock.
pub const START_MS: i64 = 1_700_000_000_000;

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub struct TestShard {
    pub tmp: tempfile::TempDir,
    pub shard: Arc<QueueShard>,
    pub tenants: Arc<StaticTenantConfig>,
    pub clock: ManualClock,
}

impl TestShard {
    pub fn clock_now(&self) -> i64 {
        self.clock.now_ms()
    }
}

pub async fn open_temp_shard() -> TestShard {
    open_temp_shard_with(QueueConfig::default()).await
}

/// Open a temp shard on the local filesystem with a manual clock at `START_MS`.
pub async fn open_temp_shard_with(queue: QueueConfig) -> TestShard {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = DatabaseConfig {
        backend: Backend::Fs,
        path: tmp.path().to_string_lossy().to_string(),
        // Use fast flush interval for tests to speed them up
        flush_interval_ms: Some(10),
    };
    let tenants = Arc::new(StaticTenantConfig::new());
    let clock = ManualClock::new(START_MS);
    let mut options = ShardOptions::new(tenants.clone());
    options.name = "test".to_string();
    options.queue = queue;
    options.clock = Arc::new(clock.clone());
    let shard = QueueShard::open(&cfg, options).await.expect("open shard");
    TestShard {
        tmp,
        shard,
        tenants,
        clock,
    }
}

/// A function item whose run started at `run_started_ms`.
pub fn item_at(kind: ItemKind, function_id: Uuid, account_id: Uuid, run_started_ms: i64) -> QueueItem {
    let payload = Payload::new(
        kind,
        Identifier {
            run_id: Ulid::from_parts(run_started_ms as u64, rand::random::<u128>()),
            function_id,
            function_version: 1,
            account_id,
            env_id: Uuid::nil(),
            app_id: Uuid::nil(),
            idempotency_key: None,
        },
    );
    QueueItem::new(payload)
}

/// A start item whose run began at `START_MS`.
pub fn test_item(function_id: Uuid, account_id: Uuid) -> QueueItem {
    item_at(ItemKind::Start, function_id, account_id, START_MS)
}

/// A sleep item; ordered purely by its scheduled time.
pub fn sleep_item(function_id: Uuid, account_id: Uuid) -> QueueItem {
    item_at(ItemKind::Sleep, function_id, account_id, START_MS)
}

pub fn with_payload(mut item: QueueItem, payload: serde_json::Value) -> QueueItem {
    item.data.payload = payload;
    item
}

/// Members of a sorted set, up to 1000.
pub async fn members(shard: &QueueShard, set: &str) -> Vec<(String, i64)> {
    shard.index_members(set, 1_000).await.expect("index members")
}

pub async fn contains(shard: &QueueShard, set: &str, member: &str) -> bool {
    shard
        .index_score(set, member)
        .await
        .expect("index score")
        .is_some()
}

/// Which of the ready queue, its backlog and the in-progress set hold the item.
pub async fn locations(shard: &QueueShard, item: &QueueItem) -> Vec<&'static str> {
    let kg = shard.key_generator();
    let partition_id = item.partition_id();
    let backlog = shoal::partition::QueueBacklog::for_item(item);
    let mut out = Vec::new();
    if contains(shard, &kg.ready(&partition_id), &item.id).await {
        out.push("ready");
    }
    if contains(shard, &kg.backlog_set(&backlog.backlog_id), &item.id).await {
        out.push("backlog");
    }
    if contains(shard, &kg.in_progress(&partition_id), &item.id).await {
        out.push("in_progress");
    }
    out
}

/// Lowest score of a set.
pub async fn min_score(shard: &QueueShard, set: &str) -> Option<i64> {
    shard
        .index_members(set, 1)
        .await
        .expect("index members")
        .first()
        .map(|(_, score)| *score)
}
