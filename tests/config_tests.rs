use std::sync::Arc;

use shoal::queue_shard::{EnqueueOptions, QueueShard, ShardOptions};
use shoal::settings::{AppConfig, Backend, LogFormat};
use shoal::tenant::{StaticTenantConfig, TenantConfig};
use uuid::Uuid;

#[test]
fn missing_path_uses_defaults() {
    let cfg = AppConfig::load(None).expect("defaults");
    assert!(matches!(cfg.database.backend, Backend::Fs));
    assert_eq!(cfg.logging.format, LogFormat::Text);
    assert!(!cfg.metrics.enabled);
    assert_eq!(cfg.queue.partition_lease_ms, 4_000);
    assert_eq!(cfg.queue.run_mode.account_weight, 85);
    assert!(cfg.tenants.is_empty());
}

#[tokio::test]
async fn loads_overrides_and_opens_a_shard() {
    let tmp = tempfile::tempdir().unwrap();
    let account = Uuid::new_v4();
    let file = tmp.path().join("shoal.toml");
    std::fs::write(
        &file,
        format!(
            r#"
[database]
backend = "fs"
path = "{db}"
flush_interval_ms = 10

[logging]
format = "json"

[queue]
num_workers = 4
backlog_peek_max = 7

[queue.run_mode]
scavenger = false
account_weight = 50

[[tenants]]
account_id = "{account}"
key_queues = true
guaranteed_workers = 2
guaranteed_priority = 1
"#,
            db = tmp.path().join("db").to_string_lossy(),
        ),
    )
    .unwrap();

    let cfg = AppConfig::load(Some(&file)).expect("load");
    assert_eq!(cfg.logging.format, LogFormat::Json);
    assert_eq!(cfg.queue.num_workers, 4);
    assert_eq!(cfg.queue.backlog_peek_max, 7);
    // unset keys keep their defaults
    assert_eq!(cfg.queue.queue_lease_ms, 20_000);
    assert!(!cfg.queue.run_mode.scavenger);
    assert!(cfg.queue.run_mode.shadow_partition);
    assert_eq!(cfg.queue.run_mode.account_weight, 50);
    assert_eq!(cfg.tenants.len(), 1);

    let tenants = Arc::new(StaticTenantConfig::from_settings(&cfg.tenants));
    assert!(tenants.allow_key_queues(account).await);
    assert!(!tenants.allow_key_queues(Uuid::new_v4()).await);
    assert_eq!(tenants.guaranteed_capacity(account).await, Some((1, 2)));

    let mut options = ShardOptions::new(tenants);
    options.queue = cfg.queue.clone();
    let shard = QueueShard::open(&cfg.database, options).await.expect("open");
    assert_eq!(shard.config().backlog_peek_max, 7);

    let item = items::start_item(account);
    let now = shard.now_ms();
    let item = shard.enqueue(item, now, EnqueueOptions::default()).await.unwrap();
    assert!(shard.load_item(&item.id).await.unwrap().is_some());
    assert!(shard.guaranteed_capacity(account).await.unwrap().is_some());
    shard.close().await.unwrap();
}

#[test]
fn malformed_files_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("bad.toml");
    std::fs::write(&file, "[database]\nbackend = \"tape\"\npath = \"x\"\n").unwrap();
    assert!(AppConfig::load(Some(&file)).is_err());
    assert!(AppConfig::load(Some(&tmp.path().join("missing.toml"))).is_err());
}

mod items {
    use shoal::item::{Identifier, ItemKind, Payload, QueueItem};
    use ulid::Ulid;
    use uuid::Uuid;

    pub fn start_item(account_id: Uuid) -> QueueItem {
        QueueItem::new(Payload::new(
            ItemKind::Start,
            Identifier {
                run_id: Ulid::new(),
                function_id: Uuid::new_v4(),
                function_version: 1,
                account_id,
                env_id: Uuid::nil(),
                app_id: Uuid::nil(),
                idempotency_key: None,
            },
        ))
    }
}
