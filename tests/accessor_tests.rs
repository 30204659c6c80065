mod test_helpers;

use futures::TryStreamExt;
use shoal::item::{ItemKind, QueueItem};
use shoal::queue_shard::{
    DequeueOptions, EnqueueOptions, LeaseOptions, STATUS_IN_PROGRESS, STATUS_QUEUED,
};
use test_helpers::*;
use uuid::Uuid;

/// A sleep item belonging to the same run as `item`.
fn same_run(item: &QueueItem) -> QueueItem {
    let mut next = sleep_item(item.function_id, item.account_id());
    next.data.identifier = item.data.identifier.clone();
    next
}

#[shoal::test]
async fn run_jobs_lists_outstanding_items_with_positions() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());

        // an older run sits ahead of everything in the queue
        shard
            .enqueue(
                item_at(ItemKind::Start, function, account, START_MS - 5_000),
                START_MS,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let start = shard
            .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
            .await
            .unwrap();
        let run_id = start.data.identifier.run_id;
        let first_sleep = shard
            .enqueue(same_run(&start), START_MS + 10_000, EnqueueOptions::default())
            .await
            .unwrap();
        let second_sleep = shard
            .enqueue(same_run(&start), START_MS + 20_000, EnqueueOptions::default())
            .await
            .unwrap();

        assert_eq!(shard.outstanding_job_count(run_id).await.unwrap(), 3);
        let jobs = shard.run_jobs(run_id, 10, 0).await.unwrap();
        let summary: Vec<(String, usize, bool)> = jobs
            .iter()
            .map(|j| (j.id.clone(), j.position, j.leased))
            .collect();
        assert_eq!(
            summary,
            vec![
                (start.id.clone(), 1, false),
                (first_sleep.id.clone(), 2, false),
                (second_sleep.id.clone(), 3, false),
            ]
        );
        assert_eq!(jobs[0].kind, ItemKind::Start);
        assert_eq!(jobs[1].at_ms, START_MS + 10_000);

        shard.lease(&start, 5_000, LeaseOptions::default()).await.unwrap();
        let jobs = shard.run_jobs(run_id, 1, 0).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].leased);
        assert_eq!(jobs[0].position, 0);

        let page = shard.run_jobs(run_id, 1, 1).await.unwrap();
        assert_eq!(page[0].id, first_sleep.id);

        shard.dequeue(&start, DequeueOptions::default()).await.unwrap();
        assert_eq!(shard.outstanding_job_count(run_id).await.unwrap(), 2);
    });
}

#[shoal::test]
async fn status_counts_follow_the_item_lifecycle() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());

        let mut items = Vec::new();
        for _ in 0..3 {
            items.push(
                shard
                    .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(shard.status_count(function, STATUS_QUEUED).await.unwrap(), 3);
        assert_eq!(shard.running_count(function).await.unwrap(), 0);

        shard.lease(&items[0], 5_000, LeaseOptions::default()).await.unwrap();
        shard.lease(&items[1], 5_000, LeaseOptions::default()).await.unwrap();
        assert_eq!(shard.status_count(function, STATUS_QUEUED).await.unwrap(), 1);
        assert_eq!(shard.status_count(function, STATUS_IN_PROGRESS).await.unwrap(), 2);
        assert_eq!(shard.running_count(function).await.unwrap(), 2);

        shard.requeue(&items[0], START_MS + 1_000).await.unwrap();
        shard.dequeue(&items[1], DequeueOptions::default()).await.unwrap();
        assert_eq!(shard.status_count(function, STATUS_QUEUED).await.unwrap(), 2);
        assert_eq!(shard.status_count(function, STATUS_IN_PROGRESS).await.unwrap(), 0);
        assert_eq!(shard.running_count(function).await.unwrap(), 0);
    });
}

#[shoal::test]
async fn items_by_partition_pages_through_a_score_window() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();

        let mut expected = Vec::new();
        for i in 0..7 {
            let item = shard
                .enqueue(
                    sleep_item(function, account),
                    START_MS + i * 1_000,
                    EnqueueOptions::default(),
                )
                .await
                .unwrap();
            if (1_000..=5_000).contains(&(i * 1_000)) {
                expected.push(item.id);
            }
        }

        let got: Vec<QueueItem> = shard
            .items_by_partition(&pid, START_MS + 1_000, START_MS + 5_000, 2)
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<String> = got.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, expected);

        let all: Vec<QueueItem> = shard
            .items_by_partition(&pid, i64::MIN, i64::MAX, 100)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 7);
        assert!(all.windows(2).all(|w| w[0].at_ms <= w[1].at_ms));
    });
}

#[shoal::test]
async fn index_repair_tools_edit_single_members() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let set = shard.key_generator().global_partition_index();

        shard.index_insert(&set, "p1", 10).await.unwrap();
        shard.index_insert(&set, "p2", 5).await.unwrap();
        shard.index_insert(&set, "p1", 1).await.unwrap();
        assert_eq!(
            members(shard, &set).await,
            vec![("p1".to_string(), 1), ("p2".to_string(), 5)]
        );
        assert_eq!(shard.index_len(&set).await.unwrap(), 2);

        assert!(shard.index_remove(&set, "p1").await.unwrap());
        assert!(!shard.index_remove(&set, "p1").await.unwrap());
        assert_eq!(min_score(shard, &set).await, Some(5));
    });
}

#[shoal::test]
async fn system_queue_items_use_the_queue_name_as_partition() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let mut item = test_item(Uuid::new_v4(), Uuid::new_v4());
        item.queue_name = Some("billing".to_string());

        let item = shard.enqueue(item, START_MS, EnqueueOptions::default()).await.unwrap();
        assert_eq!(item.partition_id(), "billing");
        assert!(contains(shard, &kg.ready("billing"), &item.id).await);
        let partition = shard.partition("billing").await.unwrap().expect("partition");
        assert!(partition.is_system());

        shard.lease(&item, 5_000, LeaseOptions::default()).await.unwrap();
        assert!(contains(shard, &kg.in_progress("billing"), &item.id).await);
        shard.dequeue(&item, DequeueOptions::default()).await.unwrap();
        assert!(shard.load_item(&item.id).await.unwrap().is_none());
    });
}
