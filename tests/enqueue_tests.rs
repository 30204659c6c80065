mod test_helpers;

use shoal::item::ItemKind;
use shoal::partition::QueueBacklog;
use shoal::queue_shard::{
    DequeueOptions, EnqueueOptions, LeaseOptions, PartitionLeaseOptions, QueueError,
    STATUS_IN_PROGRESS, STATUS_QUEUED,
};
use shoal::tenant::AccountSettings;
use test_helpers::*;
use uuid::Uuid;

#[shoal::test]
async fn enqueue_lease_dequeue_single_item() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();

        let item = shard
            .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
            .await
            .expect("enqueue");

        assert_eq!(
            shard.index_score(&kg.ready(&pid), &item.id).await.unwrap(),
            Some(START_MS)
        );
        assert_eq!(
            shard.index_score(&kg.global_partition_index(), &pid).await.unwrap(),
            Some(START_MS)
        );
        assert_eq!(
            shard
                .index_score(&kg.global_account_index(), &account.to_string())
                .await
                .unwrap(),
            Some(START_MS)
        );
        // key queues are off: nothing on the shadow side
        assert!(shard.shadow_partition(&pid).await.unwrap().is_none());
        assert_eq!(shard.index_len(&kg.global_shadow_partition_set()).await.unwrap(), 0);
        assert_eq!(shard.status_count(function, STATUS_QUEUED).await.unwrap(), 1);

        let lease = shard
            .lease(&item, 5_000, LeaseOptions::default())
            .await
            .expect("lease");
        assert_eq!(lease.timestamp_ms() as i64, START_MS + 5_000);
        assert_eq!(
            shard.index_score(&kg.in_progress(&pid), &item.id).await.unwrap(),
            Some(START_MS + 5_000)
        );
        assert_eq!(
            shard.index_score(&kg.scavenger_index(), &pid).await.unwrap(),
            Some(START_MS + 5_000)
        );
        assert_eq!(locations(shard, &item).await, vec!["in_progress"]);
        assert!(contains(shard, &kg.active_partition(&pid), &item.id).await);
        assert!(contains(shard, &kg.active_account(&account), &item.id).await);
        assert_eq!(shard.status_count(function, STATUS_IN_PROGRESS).await.unwrap(), 1);
        assert_eq!(shard.status_count(function, STATUS_QUEUED).await.unwrap(), 0);

        shard
            .dequeue(&item, DequeueOptions::default())
            .await
            .expect("dequeue");

        assert!(shard.load_item(&item.id).await.unwrap().is_none());
        assert!(locations(shard, &item).await.is_empty());
        for set in [
            kg.global_partition_index(),
            kg.account_partition_index(&account),
            kg.scavenger_index(),
            kg.active_partition(&pid),
            kg.active_account(&account),
            kg.in_progress_account(&account),
            kg.run_index(&item.data.identifier.run_id.to_string()),
        ] {
            assert_eq!(shard.index_len(&set).await.unwrap(), 0, "{set} not empty");
        }
        assert!(
            !contains(shard, &kg.global_account_index(), &account.to_string()).await
        );
        assert_eq!(shard.status_count(function, STATUS_QUEUED).await.unwrap(), 0);
        assert_eq!(shard.status_count(function, STATUS_IN_PROGRESS).await.unwrap(), 0);
    });
}

#[shoal::test]
async fn duplicate_enqueue_is_rejected_without_changes() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();

        let first = shard
            .enqueue(
                test_item(function, account).with_id("order-42"),
                START_MS,
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");
        assert_ne!(first.id, "order-42", "caller ids are hashed");

        let before = members(shard, &kg.ready(&pid)).await;
        let err = shard
            .enqueue(
                test_item(function, account).with_id("order-42"),
                START_MS + 10_000,
                EnqueueOptions::default(),
            )
            .await
            .expect_err("duplicate");
        assert!(matches!(err, QueueError::ItemAlreadyExists(ref id) if *id == first.id));

        assert_eq!(members(shard, &kg.ready(&pid)).await, before);
        let stored = shard.load_item(&first.id).await.unwrap().expect("stored");
        assert_eq!(stored.at_ms, START_MS);
    });
}

#[shoal::test]
async fn dequeued_ids_stay_reserved_for_the_idempotency_period() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());

        let item = shard
            .enqueue(test_item(function, account).with_id("a"), START_MS, EnqueueOptions::default())
            .await
            .unwrap();
        shard.dequeue(&item, DequeueOptions::default()).await.unwrap();

        let again = shard
            .enqueue(test_item(function, account).with_id("a"), START_MS, EnqueueOptions::default())
            .await;
        assert!(matches!(again, Err(QueueError::ItemAlreadyExists(_))));

        t.clock.advance_ms(shard.config().idempotency_ttl_ms + 1);
        shard
            .enqueue(test_item(function, account).with_id("a"), t.clock_now(), EnqueueOptions::default())
            .await
            .expect("id free again after the period");

        let other = shard
            .enqueue(test_item(function, account).with_id("b"), t.clock_now(), EnqueueOptions::default())
            .await
            .unwrap();
        shard
            .dequeue(
                &other,
                DequeueOptions {
                    disable_idempotency: true,
                },
            )
            .await
            .unwrap();
        shard
            .enqueue(test_item(function, account).with_id("b"), t.clock_now(), EnqueueOptions::default())
            .await
            .expect("no idempotency marker was written");
    });
}

#[shoal::test]
async fn ready_scores_order_runs_by_age_and_delayed_items_by_time() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();

        // started earlier, scheduled slightly in the future: ordered by run age
        let older = shard
            .enqueue(
                item_at(ItemKind::Edge, function, account, START_MS - 30_000),
                START_MS + 1_000,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        let sleeping = shard
            .enqueue(sleep_item(function, account), START_MS + 60_000, EnqueueOptions::default())
            .await
            .unwrap();
        // past times are clamped to now
        let past = shard
            .enqueue(sleep_item(function, account), START_MS - 5_000, EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(past.at_ms, START_MS);

        let ready = members(shard, &kg.ready(&pid)).await;
        assert_eq!(
            ready,
            vec![
                (older.id.clone(), START_MS - 30_000),
                (past.id.clone(), START_MS),
                (sleeping.id.clone(), START_MS + 60_000),
            ]
        );
        assert_eq!(
            shard.index_score(&kg.global_partition_index(), &pid).await.unwrap(),
            Some(START_MS - 30_000)
        );

        let due = shard.item_peek(&pid, START_MS, 10).await.unwrap();
        assert_eq!(due.items.len(), 2);
        assert_eq!(due.items[0].id, older.id);
    });
}

#[shoal::test]
async fn key_queue_accounts_enqueue_into_backlogs() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();
        t.tenants.set_account(
            account,
            AccountSettings {
                key_queues: true,
                ..Default::default()
            },
        );

        let item = shard
            .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
            .await
            .unwrap();
        let backlog = QueueBacklog::for_item(&item);
        assert!(backlog.is_default());
        assert!(backlog.start);

        assert_eq!(locations(shard, &item).await, vec!["backlog"]);
        assert_eq!(shard.index_len(&kg.ready(&pid)).await.unwrap(), 0);
        assert!(shard.backlog(&backlog.backlog_id).await.unwrap().is_some());
        let sp = shard.shadow_partition(&pid).await.unwrap().expect("shadow partition");
        assert_eq!(sp.account_id, Some(account));
        assert_eq!(
            shard
                .index_score(&kg.shadow_partition_set(&pid), &backlog.backlog_id)
                .await
                .unwrap(),
            Some(START_MS)
        );
        assert_eq!(
            shard.index_score(&kg.global_shadow_partition_set(), &pid).await.unwrap(),
            Some(START_MS)
        );
        assert_eq!(
            shard
                .index_score(&kg.global_account_shadow_partitions(), &account.to_string())
                .await
                .unwrap(),
            Some(START_MS)
        );
        assert_eq!(shard.outstanding_job_count(item.data.identifier.run_id).await.unwrap(), 1);

        let forced = shard
            .enqueue(
                test_item(function, account),
                START_MS,
                EnqueueOptions {
                    force_ready_queue: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(locations(shard, &forced).await, vec!["ready"]);
    });
}

#[shoal::test]
async fn cancelling_a_backlogged_item_updates_the_shadow_pointers() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();
        t.tenants.set_account(
            account,
            AccountSettings {
                key_queues: true,
                ..Default::default()
            },
        );

        let first = shard
            .enqueue(sleep_item(function, account), START_MS + 10_000, EnqueueOptions::default())
            .await
            .unwrap();
        let second = shard
            .enqueue(sleep_item(function, account), START_MS + 20_000, EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(
            shard.index_score(&kg.global_shadow_partition_set(), &pid).await.unwrap(),
            Some(START_MS + 10_000)
        );

        shard.dequeue(&first, DequeueOptions::default()).await.unwrap();
        assert_eq!(
            shard.index_score(&kg.global_shadow_partition_set(), &pid).await.unwrap(),
            Some(START_MS + 20_000)
        );

        shard.dequeue(&second, DequeueOptions::default()).await.unwrap();
        assert!(!contains(shard, &kg.global_shadow_partition_set(), &pid).await);
        assert!(
            !contains(shard, &kg.global_account_shadow_partitions(), &account.to_string()).await
        );
    });
}

#[shoal::test]
async fn paused_functions_cannot_be_leased() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();

        shard.set_function_paused(function, true).await.unwrap();
        assert!(shard.is_function_paused(function).await.unwrap());

        shard
            .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
            .await
            .unwrap();
        let partition = shard.partition(&pid).await.unwrap().expect("partition");
        assert!(partition.paused);
        let err = shard
            .partition_lease(&pid, 1_000, PartitionLeaseOptions::default())
            .await
            .expect_err("paused");
        assert!(matches!(err, QueueError::PartitionPaused(_)));

        shard.set_function_paused(function, false).await.unwrap();
        assert!(!shard.is_function_paused(function).await.unwrap());
        shard
            .partition_lease(&pid, 1_000, PartitionLeaseOptions::default())
            .await
            .expect("lease after resume");
    });
}
