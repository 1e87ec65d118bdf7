use std::sync::Arc;

use artifact_jobs::config::AppConfig;
use artifact_jobs::db::{self, JobStore, PgJobStore, StoreError};
use artifact_jobs::models::job::{Job, JobDraft, JobStatus, Transition, TransitionError};
use artifact_jobs::models::params::MethodParams;
use artifact_jobs::services::queue::{RedisTaskQueue, TaskQueue, WorkItem};
use chrono::{Duration, Utc};
use uuid::Uuid;

fn draft(filename: &str) -> JobDraft {
    JobDraft {
        method: "strip_metadata".to_string(),
        original_filename: filename.to_string(),
        scale: 1,
        params: MethodParams::StripMetadata,
        denoise_first: false,
        face_enhance: false,
    }
}

/// Integration test: Postgres job store and Redis task queue
///
/// This test verifies:
/// 1. Database connection, schema and migrations
/// 2. Job insert / get / get_many ordering
/// 3. Locked transitions, including a worker losing the race to a cancel
/// 4. Stale and expiry queries, status counts and deletion
/// 5. Queue publish / revoke / dequeue / ack
///
/// Note: This requires a running PostgreSQL and Redis instance
/// configured via DATABASE_URL and REDIS_URL.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_full_integration() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let database_url = config.database_url.as_deref().expect("DATABASE_URL not set");
    let redis_url = config.redis_url.as_deref().expect("REDIS_URL not set");

    let pool = db::init_pool(database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    store.health_check().await.expect("Database health check failed");

    // 1. Insert and read back
    let now = Utc::now();
    let first = Job::queued(draft("first.png"), now, Duration::minutes(60));
    let second = Job::queued(draft("second.png"), now, Duration::minutes(60));
    store
        .insert(&[first.clone(), second.clone()])
        .await
        .expect("Failed to insert jobs");

    let fetched = store.get(first.id).await.unwrap().expect("Job not found");
    assert_eq!(fetched.status, JobStatus::Queued);
    assert_eq!(fetched.params, MethodParams::StripMetadata);
    assert_eq!(fetched.input_key, first.input_key);

    let many = store
        .get_many(&[second.id, Uuid::new_v4(), first.id])
        .await
        .unwrap();
    assert_eq!(
        many.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![second.id, first.id]
    );

    // 2. Transitions
    let started = store
        .transition(first.id, Transition::Start { at: Utc::now() })
        .await
        .expect("Failed to start job");
    assert_eq!(started.status, JobStatus::Processing);
    assert_eq!(started.progress, Some(5));

    store
        .transition(
            first.id,
            Transition::Progress {
                percent: 50,
                detail: Some("Halfway".to_string()),
            },
        )
        .await
        .unwrap();

    let cancelled = store
        .transition(first.id, Transition::Cancel { at: Utc::now() })
        .await
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let err = store
        .transition(
            first.id,
            Transition::Complete {
                result_key: "results/late".to_string(),
                at: Utc::now(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Transition(TransitionError::Illegal {
            from: JobStatus::Cancelled,
            ..
        })
    ));
    let reread = store.get(first.id).await.unwrap().unwrap();
    assert_eq!(reread.result_key, None);

    // 3. Stale and expiry queries
    store
        .transition(second.id, Transition::Start { at: Utc::now() })
        .await
        .unwrap();
    let stale = store
        .stale_processing(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    assert!(stale.iter().any(|j| j.id == second.id));

    let expired = store
        .expired(Utc::now() + Duration::minutes(61))
        .await
        .unwrap();
    assert!(expired.iter().any(|j| j.id == first.id));

    let counts = store.status_counts(None).await.unwrap();
    assert!(counts.get(&JobStatus::Cancelled).copied().unwrap_or(0) >= 1);

    // 4. Queue
    let queue = RedisTaskQueue::new(redis_url).expect("Failed to initialize queue");
    queue.health_check().await.expect("Redis health check failed");

    let revoked_id = queue
        .publish(&WorkItem { job_id: first.id })
        .await
        .expect("Failed to publish");
    let live_id = queue
        .publish(&WorkItem { job_id: second.id })
        .await
        .expect("Failed to publish");
    store.set_queue_message_id(second.id, &live_id).await.unwrap();
    queue.revoke(&revoked_id).await.expect("Failed to revoke");

    let delivery = queue
        .dequeue()
        .await
        .expect("Failed to dequeue")
        .expect("No work item in queue");
    assert_eq!(delivery.item.job_id, second.id);
    assert_eq!(delivery.message_id, live_id);
    queue.ack(&delivery).await.expect("Failed to ack");

    // 5. Cleanup
    let deleted = store.delete(&[first.id, second.id]).await.unwrap();
    assert_eq!(deleted, 2);
    assert!(store.get(first.id).await.unwrap().is_none());

    println!("✓ Full integration test passed");
}
