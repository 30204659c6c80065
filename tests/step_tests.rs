mod test_helpers;

use serde_json::json;
use shoal::queue_shard::QueueError;
use test_helpers::*;
use ulid::Ulid;

#[shoal::test]
async fn saved_steps_are_idempotent() {
    with_timeout!(20000, {
        let t = open_temp_shard().await;
        let shard = &t.shard;
        let run_id = Ulid::new();

        assert!(shard.save_step(run_id, "fetch", &json!({"status": 200})).await.unwrap());
        assert!(!shard.save_step(run_id, "fetch", &json!({"status": 200})).await.unwrap());
        let err = shard
            .save_step(run_id, "fetch", &json!({"status": 500}))
            .await
            .expect_err("different output");
        assert!(matches!(err, QueueError::DuplicateResponse { ref step_id, .. } if step_id == "fetch"));

        assert!(shard.save_step(run_id, "notify", &json!(null)).await.unwrap());
        let steps = shard.load_steps(run_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps["fetch"], json!({"status": 200}));
        assert_eq!(steps["notify"], json!(null));

        // other runs are untouched
        let other = Ulid::new();
        assert!(shard.save_step(other, "fetch", &json!(1)).await.unwrap());

        assert_eq!(shard.delete_steps(run_id).await.unwrap(), 2);
        assert!(shard.load_steps(run_id).await.unwrap().is_empty());
        assert_eq!(shard.load_steps(other).await.unwrap().len(), 1);
        assert!(shard.save_step(run_id, "fetch", &json!({"status": 500})).await.unwrap());
    });
}
