mod test_helpers;

use shoal::item::{ConcurrencyScope, QueueItem};
use shoal::queue_shard::{DequeueOptions, EnqueueOptions, LeaseOptions, QueueError, QueueShard};
use shoal::tenant::{AccountSettings, CustomKeySpec, FunctionSettings, ThrottleSpec};
use test_helpers::*;
use uuid::Uuid;

#[shoal::test]
async fn leased_items_cannot_be_leased_again() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let item = shard
            .enqueue(test_item(Uuid::new_v4(), Uuid::new_v4()), START_MS, EnqueueOptions::default())
            .await
            .unwrap();

        shard.lease(&item, 5_000, LeaseOptions::default()).await.unwrap();
        let err = shard
            .lease(&item, 5_000, LeaseOptions::default())
            .await
            .expect_err("already leased");
        assert!(matches!(err, QueueError::ItemAlreadyLeased(_)));

        let missing = test_item(Uuid::new_v4(), Uuid::new_v4()).with_id("nope");
        let err = shard
            .lease(&missing, 5_000, LeaseOptions::default())
            .await
            .expect_err("missing");
        assert!(matches!(err, QueueError::ItemNotFound(_)));
    });
}

#[shoal::test]
async fn extend_lease_rotates_the_lease_id() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let function = Uuid::new_v4();
        let pid = function.to_string();
        let item = shard
            .enqueue(test_item(function, Uuid::new_v4()), START_MS, EnqueueOptions::default())
            .await
            .unwrap();

        let err = shard
            .extend_lease(&item, ulid::Ulid::new(), 5_000)
            .await
            .expect_err("not leased");
        assert!(matches!(err, QueueError::LeaseNotFound(_)));

        let lease = shard.lease(&item, 5_000, LeaseOptions::default()).await.unwrap();
        t.clock.advance_ms(2_000);
        let next = shard.extend_lease(&item, lease, 10_000).await.expect("extend");
        assert_ne!(next, lease);
        assert_eq!(next.timestamp_ms() as i64, START_MS + 12_000);
        assert_eq!(
            shard.index_score(&kg.in_progress(&pid), &item.id).await.unwrap(),
            Some(START_MS + 12_000)
        );
        assert_eq!(
            shard.index_score(&kg.scavenger_index(), &pid).await.unwrap(),
            Some(START_MS + 12_000)
        );

        let err = shard
            .extend_lease(&item, lease, 10_000)
            .await
            .expect_err("stale lease");
        assert!(matches!(err, QueueError::LeaseMismatch(_)));
    });
}

#[shoal::test]
async fn function_and_account_limits_block_leases() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, other_function, account) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        t.tenants.set_function(
            function,
            FunctionSettings {
                version: 1,
                concurrency: 1,
                ..Default::default()
            },
        );
        t.tenants.set_account(
            account,
            AccountSettings {
                account_concurrency: 2,
                ..Default::default()
            },
        );

        let a = shard.enqueue(test_item(function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        let b = shard.enqueue(test_item(function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        shard.lease(&a, 5_000, LeaseOptions::default()).await.unwrap();

        let err = shard.lease(&b, 5_000, LeaseOptions::default()).await.expect_err("function full");
        assert!(matches!(err, QueueError::PartitionConcurrencyLimit { .. }));
        assert_eq!(err.constraint(), Some(shoal::queue_shard::Constraint::Function));

        let c = shard.enqueue(test_item(other_function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        let d = shard.enqueue(test_item(other_function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        shard.lease(&c, 5_000, LeaseOptions::default()).await.unwrap();
        let err = shard.lease(&d, 5_000, LeaseOptions::default()).await.expect_err("account full");
        assert!(matches!(err, QueueError::AccountConcurrencyLimit { .. }));

        shard
            .lease(
                &d,
                5_000,
                LeaseOptions {
                    disable_constraint_checks: true,
                },
            )
            .await
            .expect("checks disabled");

        shard.dequeue(&a, DequeueOptions::default()).await.unwrap();
        shard.dequeue(&c, DequeueOptions::default()).await.unwrap();
        shard.lease(&b, 5_000, LeaseOptions::default()).await.expect("room again");
    });
}

#[shoal::test]
async fn custom_keys_limit_per_value() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        t.tenants.set_function(
            function,
            FunctionSettings {
                version: 1,
                custom_keys: vec![CustomKeySpec {
                    scope: ConcurrencyScope::Fn,
                    expression: "/customer".to_string(),
                    limit: 1,
                }],
                ..Default::default()
            },
        );

        let a1 = enqueue_for_customer(shard, function, account, "a").await;
        let a2 = enqueue_for_customer(shard, function, account, "a").await;
        let b1 = enqueue_for_customer(shard, function, account, "b").await;
        assert_eq!(a1.data.custom_concurrency_keys.len(), 1);
        assert_eq!(a1.data.custom_concurrency_keys[0].unhashed_value, "a");

        shard.lease(&a1, 5_000, LeaseOptions::default()).await.unwrap();
        let err = shard.lease(&a2, 5_000, LeaseOptions::default()).await.expect_err("key full");
        assert!(matches!(err, QueueError::CustomConcurrencyLimit { index: 1, .. }));
        shard.lease(&b1, 5_000, LeaseOptions::default()).await.expect("other value");

        let kg = shard.key_generator();
        let key = a1.data.custom_concurrency_keys[0].canonical_id();
        assert_eq!(members(shard, &kg.active_custom(&key)).await.len(), 1);
    });
}

async fn enqueue_for_customer(
    shard: &QueueShard,
    function: Uuid,
    account: Uuid,
    customer: &str,
) -> QueueItem {
    let item = with_payload(
        test_item(function, account),
        serde_json::json!({ "customer": customer }),
    );
    shard
        .enqueue(item, START_MS, EnqueueOptions::default())
        .await
        .expect("enqueue")
}

#[shoal::test]
async fn throttled_items_wait_for_the_next_token() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        t.tenants.set_function(
            function,
            FunctionSettings {
                version: 1,
                throttle: Some(ThrottleSpec {
                    expression: None,
                    limit: 1,
                    burst: 0,
                    period_secs: 60,
                }),
                ..Default::default()
            },
        );

        let a = shard.enqueue(test_item(function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        let b = shard.enqueue(test_item(function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        assert!(a.data.throttle.is_some());

        shard.lease(&a, 5_000, LeaseOptions::default()).await.unwrap();
        let err = shard.lease(&b, 5_000, LeaseOptions::default()).await.expect_err("throttled");
        assert!(matches!(err, QueueError::QueueItemThrottled { .. }));

        t.clock.advance_ms(60_000);
        shard.lease(&b, 5_000, LeaseOptions::default()).await.expect("token available");
    });
}

#[shoal::test]
async fn requeue_returns_item_to_ready_queue() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();
        let item = shard.enqueue(test_item(function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        shard.lease(&item, 5_000, LeaseOptions::default()).await.unwrap();

        let mut retry = item.clone();
        retry.data.attempt = 1;
        shard.requeue(&retry, START_MS + 30_000).await.expect("requeue");

        assert_eq!(locations(shard, &item).await, vec!["ready"]);
        assert_eq!(
            shard.index_score(&kg.ready(&pid), &item.id).await.unwrap(),
            Some(START_MS + 30_000)
        );
        assert!(!contains(shard, &kg.scavenger_index(), &pid).await);
        assert_eq!(shard.index_len(&kg.active_partition(&pid)).await.unwrap(), 0);
        let stored = shard.load_item(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.data.attempt, 1);
        assert!(stored.lease_id.is_none());

        let err = shard
            .requeue(&test_item(function, account).with_id("gone"), START_MS)
            .await
            .expect_err("missing");
        assert!(matches!(err, QueueError::ItemNotFound(_)));
    });
}

#[shoal::test]
async fn scavenger_pointer_tracks_the_earliest_expiry() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();

        let mut items = Vec::new();
        for _ in 0..3 {
            items.push(shard.enqueue(test_item(function, account), START_MS, EnqueueOptions::default()).await.unwrap());
        }
        let l0 = shard.lease(&items[0], 30_000, LeaseOptions::default()).await.unwrap();
        shard.lease(&items[1], 10_000, LeaseOptions::default()).await.unwrap();
        shard.lease(&items[2], 20_000, LeaseOptions::default()).await.unwrap();
        let scavenger = kg.scavenger_index();
        assert_eq!(shard.index_score(&scavenger, &pid).await.unwrap(), Some(START_MS + 10_000));

        shard.dequeue(&items[1], DequeueOptions::default()).await.unwrap();
        assert_eq!(shard.index_score(&scavenger, &pid).await.unwrap(), Some(START_MS + 20_000));

        shard.dequeue(&items[2], DequeueOptions::default()).await.unwrap();
        assert_eq!(shard.index_score(&scavenger, &pid).await.unwrap(), Some(START_MS + 30_000));

        shard.extend_lease(&items[0], l0, 40_000).await.unwrap();
        assert_eq!(shard.index_score(&scavenger, &pid).await.unwrap(), Some(START_MS + 40_000));

        shard.dequeue(&items[0], DequeueOptions::default()).await.unwrap();
        assert_eq!(shard.index_score(&scavenger, &pid).await.unwrap(), None);
    });
}

#[shoal::test]
async fn scavenge_requeues_expired_leases() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();

        let expired = shard.enqueue(test_item(function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        let alive = shard.enqueue(test_item(function, account), START_MS, EnqueueOptions::default()).await.unwrap();
        shard.lease(&expired, 5_000, LeaseOptions::default()).await.unwrap();
        shard.lease(&alive, 60_000, LeaseOptions::default()).await.unwrap();

        t.clock.advance_ms(6_000);
        assert_eq!(shard.scavenge(100).await.expect("scavenge"), 1);

        assert_eq!(locations(shard, &expired).await, vec!["ready"]);
        assert_eq!(locations(shard, &alive).await, vec!["in_progress"]);
        assert_eq!(
            shard.index_score(&kg.scavenger_index(), &pid).await.unwrap(),
            Some(START_MS + 60_000)
        );
        let stored = shard.load_item(&expired.id).await.unwrap().unwrap();
        assert_eq!(stored.data.attempt, 1);
        assert!(stored.lease_id.is_none());
        assert!(!contains(shard, &kg.active_partition(&pid), &expired.id).await);

        // nothing else expired yet
        assert_eq!(shard.scavenge(100).await.unwrap(), 0);

        shard.dequeue(&alive, DequeueOptions::default()).await.unwrap();
        assert!(!contains(shard, &kg.scavenger_index(), &pid).await);
        assert_eq!(shard.index_len(&kg.in_progress(&pid)).await.unwrap(), 0);
    });
}

#[shoal::test]
async fn scavenge_drops_stale_pointers() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        shard
            .index_insert(&kg.scavenger_index(), "orphan", START_MS - 1)
            .await
            .unwrap();
        assert_eq!(shard.scavenge(10).await.unwrap(), 0);
        assert!(!contains(shard, &kg.scavenger_index(), "orphan").await);
    });
}
