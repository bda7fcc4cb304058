//! End-to-end exercise of the Task Queue against a real Postgres instance
//! (spec §8 scenarios A/B, invariants 9/10). Skips cleanly when
//! `TEST_DATABASE_URL` isn't set, the same gating the donor's own
//! Postgres-backed integration tests use rather than failing CI without a
//! database available.

use blue_banded_bee::config::Config;
use blue_banded_bee::store::queue::{self, NewUrl, TaskResult};
use blue_banded_bee::store::schema::{CacheStatus, SourceType, TaskStatus};
use blue_banded_bee::store::Store;
use uuid::Uuid;

async fn connected_store() -> Option<Store> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let mut config = Config::default();
    config.database_url = database_url;
    Store::connect(&config).await.ok()
}

async fn seed_job(store: &Store) -> (Uuid, i32) {
    let host = format!("queue-test-{}.example", Uuid::new_v4());
    let domain_id: i32 = sqlx::query_scalar("INSERT INTO domain (host) VALUES ($1) RETURNING id")
        .bind(&host)
        .fetch_one(store.pool())
        .await
        .unwrap();

    let job_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job (id, domain_id, organisation_id, status, source_type)
        VALUES ($1, $2, $3, 'running', 'manual')
        "#,
    )
    .bind(job_id)
    .bind(domain_id)
    .bind(Uuid::new_v4())
    .execute(store.pool())
    .await
    .unwrap();

    (job_id, domain_id)
}

#[tokio::test]
async fn enqueue_claim_complete_round_trip() {
    let Some(store) = connected_store().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    let (job_id, domain_id) = seed_job(&store).await;

    let urls = vec![
        NewUrl {
            path: "/".to_string(),
            priority: 1.0,
            source_type: SourceType::Root,
            source_url: None,
        },
        NewUrl {
            path: "/about".to_string(),
            priority: 0.5,
            source_type: SourceType::Link,
            source_url: Some("/".to_string()),
        },
    ];

    let outcome = queue::enqueue_batch(&store, job_id, domain_id, &urls, 0)
        .await
        .unwrap();
    assert_eq!(outcome.accepted, 2);
    assert_eq!(outcome.new_total_tasks, 2);

    // Re-enqueueing the same URLs must be idempotent (§4.1 EnqueueBatch).
    let repeat = queue::enqueue_batch(&store, job_id, domain_id, &urls, 0)
        .await
        .unwrap();
    assert_eq!(repeat.accepted, 0);
    assert_eq!(repeat.skipped, 2);

    let first = queue::claim_next(&store, "test-worker", &[job_id])
        .await
        .unwrap()
        .expect("a pending task is claimable");
    assert_eq!(first.task.priority, 1.0);
    assert_eq!(first.url, format!("https://{}/", host_of(&store, domain_id).await));

    queue::complete_task(
        &store,
        first.task.id,
        &TaskResult {
            status: TaskStatus::Completed,
            status_code: Some(200),
            response_time_ms: Some(42),
            cache_status: Some(CacheStatus::Hit),
            content_type: Some("text/html".to_string()),
            second_response_time_ms: None,
            redirect_url: None,
            error: None,
        },
    )
    .await
    .unwrap();

    let second = queue::claim_next(&store, "test-worker", &[job_id])
        .await
        .unwrap()
        .expect("the second task is still claimable");

    queue::complete_task(
        &store,
        second.task.id,
        &TaskResult {
            status: TaskStatus::Failed,
            status_code: Some(503),
            response_time_ms: Some(900),
            cache_status: None,
            content_type: None,
            second_response_time_ms: None,
            redirect_url: None,
            error: Some("upstream_status_503".to_string()),
        },
    )
    .await
    .unwrap();

    let (completed, failed, status): (i64, i64, String) = sqlx::query_as(
        "SELECT completed_tasks, failed_tasks, status::text FROM job WHERE id = $1",
    )
    .bind(job_id)
    .fetch_one(store.pool())
    .await
    .unwrap();

    assert_eq!(completed, 1);
    assert_eq!(failed, 1);
    assert_eq!(status, "completed");

    assert!(queue::claim_next(&store, "test-worker", &[job_id])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn complete_batch_writes_all_results_in_one_transaction() {
    let Some(store) = connected_store().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    let (job_id, domain_id) = seed_job(&store).await;

    let urls: Vec<NewUrl> = (0..3)
        .map(|i| NewUrl {
            path: format!("/page-{i}"),
            priority: 1.0 - i as f64 * 0.1,
            source_type: SourceType::Sitemap,
            source_url: None,
        })
        .collect();
    queue::enqueue_batch(&store, job_id, domain_id, &urls, 0)
        .await
        .unwrap();

    let mut claimed = Vec::new();
    while let Some(task) = queue::claim_next(&store, "batch-worker", &[job_id])
        .await
        .unwrap()
    {
        claimed.push(task.task.id);
    }
    assert_eq!(claimed.len(), 3);

    let results: Vec<(Uuid, TaskResult)> = claimed
        .into_iter()
        .map(|task_id| {
            (
                task_id,
                TaskResult {
                    status: TaskStatus::Completed,
                    status_code: Some(200),
                    response_time_ms: Some(10),
                    cache_status: Some(CacheStatus::Miss),
                    content_type: Some("text/html".to_string()),
                    second_response_time_ms: None,
                    redirect_url: None,
                    error: None,
                },
            )
        })
        .collect();

    queue::complete_batch(&store, &results).await.unwrap();

    let (completed, status): (i64, String) =
        sqlx::query_as("SELECT completed_tasks, status::text FROM job WHERE id = $1")
            .bind(job_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(completed, 3);
    assert_eq!(status, "completed");
}

async fn host_of(store: &Store, domain_id: i32) -> String {
    sqlx::query_scalar("SELECT host FROM domain WHERE id = $1")
        .bind(domain_id)
        .fetch_one(store.pool())
        .await
        .unwrap()
}
