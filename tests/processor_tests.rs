mod test_helpers;

use std::sync::Arc;

use parking_lot::Mutex;
use shoal::item::QueueItem;
use shoal::processor::{
    Executor, PartitionOutcome, Processor, RunError, RunFunc, RunInfo, Scavenger,
};
use shoal::queue_shard::{EnqueueOptions, LeaseOptions};
use shoal::settings::QueueConfig;
use shoal::tenant::{AccountSettings, FunctionSettings};
use test_helpers::*;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handler that records every item it sees and answers with `outcome`.
fn recording<F>(seen: Arc<Mutex<Vec<String>>>, outcome: F) -> Arc<dyn RunFunc>
where
    F: Fn(&QueueItem) -> Result<(), RunError> + Send + Sync + 'static,
{
    let outcome = Arc::new(outcome);
    Arc::new(move |_info: RunInfo, item: QueueItem| {
        let seen = Arc::clone(&seen);
        let outcome = Arc::clone(&outcome);
        async move {
            seen.lock().push(item.id.clone());
            (*outcome)(&item)
        }
    })
}

#[shoal::test]
async fn successful_items_are_dequeued() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let mut ids = Vec::new();
        for _ in 0..3 {
            let item = shard
                .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
                .await
                .unwrap();
            ids.push(item.id);
        }
        // due later; the partition is revisited after its lease period
        shard
            .enqueue(sleep_item(function, account), START_MS + 60_000, EnqueueOptions::default())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = Executor::new(Arc::clone(shard), recording(Arc::clone(&seen), |_| Ok(())));
        assert_eq!(executor.process_tick().await.unwrap(), 3);
        executor.wait_idle().await;

        let mut handled = seen.lock().clone();
        handled.sort();
        ids.sort();
        assert_eq!(handled, ids);
        for id in &ids {
            assert!(shard.load_item(id).await.unwrap().is_none());
        }
        assert_eq!(shard.running_count(function).await.unwrap(), 0);
        assert_eq!(
            shard
                .index_score(&shard.key_generator().global_partition_index(), &function.to_string())
                .await
                .unwrap(),
            Some(START_MS + shard.config().partition_lease_ms)
        );
    });
}

#[shoal::test]
async fn failed_items_are_requeued_or_dropped() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let kg = shard.key_generator();
        let account = Uuid::new_v4();
        let (retry_at, no_retry, backoff) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let at = shard
            .enqueue(test_item(retry_at, account), START_MS, EnqueueOptions::default())
            .await
            .unwrap();
        let dropped = shard
            .enqueue(test_item(no_retry, account), START_MS, EnqueueOptions::default())
            .await
            .unwrap();
        let backed_off = shard
            .enqueue(test_item(backoff, account), START_MS, EnqueueOptions::default())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = recording(Arc::clone(&seen), move |item| {
            if item.function_id == retry_at {
                Err(RunError::RetryAt {
                    at_ms: START_MS + 30_000,
                    message: "rate limited upstream".to_string(),
                })
            } else if item.function_id == no_retry {
                Err(RunError::NoRetry("bad input".to_string()))
            } else {
                Err(RunError::Retry("timeout".to_string()))
            }
        });
        let executor = Executor::new(Arc::clone(shard), handler);
        assert_eq!(executor.process_tick().await.unwrap(), 3);
        executor.wait_idle().await;
        assert_eq!(seen.lock().len(), 3);

        let requeued = shard.load_item(&at.id).await.unwrap().expect("requeued");
        assert_eq!(requeued.data.attempt, 1);
        assert!(requeued.lease_id.is_none());
        assert_eq!(
            shard
                .index_score(&kg.ready(&retry_at.to_string()), &at.id)
                .await
                .unwrap(),
            Some(START_MS + 30_000)
        );

        assert!(shard.load_item(&dropped.id).await.unwrap().is_none());

        let retried = shard.load_item(&backed_off.id).await.unwrap().expect("retried");
        assert_eq!(retried.data.attempt, 1);
        assert!(retried.at_ms >= START_MS + 10_000);
        assert_eq!(locations(shard, &retried).await, vec!["ready"]);

        // nothing due until the retry times
        assert_eq!(executor.process_tick().await.unwrap(), 0);
    });
}

#[shoal::test]
async fn blocked_partitions_are_pushed_back() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let pid = function.to_string();
        t.tenants.set_function(
            function,
            FunctionSettings {
                version: 1,
                concurrency: 1,
                ..Default::default()
            },
        );
        for _ in 0..2 {
            shard
                .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
                .await
                .unwrap();
        }

        let gate = Arc::new(Semaphore::new(0));
        let handler: Arc<dyn RunFunc> = {
            let gate = Arc::clone(&gate);
            Arc::new(move |_info: RunInfo, _item: QueueItem| {
                let gate = Arc::clone(&gate);
                async move {
                    let _permit = gate.acquire().await.map_err(|e| RunError::NoRetry(e.to_string()))?;
                    Ok::<(), RunError>(())
                }
            })
        };
        let executor = Executor::new(Arc::clone(shard), handler);
        let partition = shard.partition(&pid).await.unwrap().unwrap();
        assert_eq!(
            executor.process_partition(&partition).await.unwrap(),
            PartitionOutcome::Leased(1)
        );
        assert_eq!(
            shard
                .index_score(&shard.key_generator().global_partition_index(), &pid)
                .await
                .unwrap(),
            Some(START_MS + 2_000)
        );
        // one item is running: the partition itself is at its limit
        assert_eq!(
            executor.process_partition(&partition).await.unwrap(),
            PartitionOutcome::Constrained
        );

        gate.add_permits(1);
        executor.wait_idle().await;
        assert_eq!(shard.running_count(function).await.unwrap(), 0);
        assert_eq!(shard.index_len(&shard.key_generator().ready(&pid)).await.unwrap(), 1);
    });
}

#[shoal::test]
async fn scavenger_requeues_abandoned_items() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        let item = shard
            .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
            .await
            .unwrap();
        shard.lease(&item, 1_000, LeaseOptions::default()).await.unwrap();

        let scavenger = Scavenger::new(Arc::clone(shard));
        assert_eq!(scavenger.scavenge_once().await.unwrap(), 0);

        t.clock.advance_ms(1_001);
        assert_eq!(scavenger.scavenge_once().await.unwrap(), 1);
        let stored = shard.load_item(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.data.attempt, 1);
        assert_eq!(locations(shard, &stored).await, vec!["ready"]);
        assert_eq!(scavenger.scavenge_once().await.unwrap(), 0);
    });
}

#[shoal::test(flavor = "multi_thread")]
async fn processor_runs_backlogged_items_end_to_end() {
    with_timeout!(20000, {
        let mut cfg = QueueConfig::default();
        cfg.poll_tick_ms = 5;
        cfg.shadow_poll_tick_ms = 5;
        cfg.normalize_poll_tick_ms = 5;
        cfg.scavenger_tick_ms = 20;
        cfg.active_check_tick_ms = 20;
        let t = open_temp_shard_with(cfg).await;
        let shard = &t.shard;
        let (function, account) = (Uuid::new_v4(), Uuid::new_v4());
        t.tenants.set_account(
            account,
            AccountSettings {
                key_queues: true,
                ..Default::default()
            },
        );
        let mut ids = Vec::new();
        for _ in 0..5 {
            let item = shard
                .enqueue(test_item(function, account), START_MS, EnqueueOptions::default())
                .await
                .unwrap();
            assert_eq!(locations(shard, &item).await, vec!["backlog"]);
            ids.push(item.id);
        }

        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            let cancel = cancel.clone();
            Arc::new(move |_info: RunInfo, item: QueueItem| {
                let seen = Arc::clone(&seen);
                let cancel = cancel.clone();
                async move {
                    let mut seen = seen.lock();
                    seen.push(item.id);
                    if seen.len() == 5 {
                        cancel.cancel();
                    }
                    Ok::<(), RunError>(())
                }
            })
        };

        let processor = Processor::new(Arc::clone(shard));
        processor.run(handler, cancel).await.unwrap();

        let mut handled = seen.lock().clone();
        handled.sort();
        ids.sort();
        assert_eq!(handled, ids);
        // in-flight items finish before run returns
        for id in &ids {
            assert!(shard.load_item(id).await.unwrap().is_none());
        }
        assert_eq!(shard.status_count(function, shoal::queue_shard::STATUS_QUEUED).await.unwrap(), 0);
    });
}
