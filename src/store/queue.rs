//! Task Queue (spec §4.1): durable FIFO-with-priority multi-producer
//! multi-consumer queue of Tasks. Claim uses the `FOR UPDATE SKIP LOCKED`
//! CTE pattern grounded in the pack's Postgres job-queue reference
//! implementation, generalised from whole-job claiming to per-URL task
//! claiming scoped to a caller-supplied set of eligible jobs.

use chrono::Utc;
use uuid::Uuid;

use super::schema::{CacheStatus, JobStatus, SourceType, TaskRow, TaskStatus};
use super::Store;
use crate::error::QueueError;

/// One URL awaiting enqueue, as handed to [`enqueue_batch`] by the Job
/// Manager (initial discovery) or the Worker Pool (link discovery).
#[derive(Debug, Clone)]
pub struct NewUrl {
    pub path: String,
    pub priority: f64,
    pub source_type: SourceType,
    pub source_url: Option<String>,
}

/// Outcome of a batch enqueue, per §4.1 `EnqueueBatch`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnqueueOutcome {
    pub accepted: i64,
    pub skipped: i64,
    pub new_total_tasks: i64,
}

/// A task handed to a worker by [`claim_next`], carrying the URL it needs
/// to fetch (joined in from `page`/`domain` by the claim query).
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: TaskRow,
    pub url: String,
}

/// Fetch outcome written back by [`complete_task`], per §4.5's result
/// record and §4.1's `CompleteTask`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub status_code: Option<i32>,
    pub response_time_ms: Option<i32>,
    pub cache_status: Option<CacheStatus>,
    pub content_type: Option<String>,
    pub second_response_time_ms: Option<i32>,
    pub redirect_url: Option<String>,
    pub error: Option<String>,
}

/// §4.1 `EnqueueBatch`: normalise, filter, dedupe and insert a batch of
/// URLs for one job in a single transaction.
///
/// `urls` is assumed already normalised (§6) and path/robots-filtered by
/// the caller's discovery pipeline ([`crate::discovery`]) — this function's
/// own responsibility is the idempotent, counter-consistent database write,
/// including the advisory `max_pages` cap: once the running total would
/// exceed the cap, further URLs are counted as skipped without ever being
/// inserted, so `found_tasks` can exceed `total_tasks` but `total_tasks`
/// itself never does.
pub async fn enqueue_batch(
    store: &Store,
    job_id: Uuid,
    domain_id: i32,
    urls: &[NewUrl],
    max_pages: i64,
) -> Result<EnqueueOutcome, QueueError> {
    if store.is_saturated() {
        return Err(QueueError::PoolSaturated {
            ratio: store.pool_pressure(),
        });
    }

    let mut tx = store.pool().begin().await?;

    let current_total: i64 = sqlx::query_scalar(
        "SELECT total_tasks FROM job WHERE id = $1 FOR UPDATE",
    )
    .bind(job_id)
    .fetch_one(&mut *tx)
    .await?;

    let mut accepted: i64 = 0;
    let mut skipped: i64 = 0;
    let mut found_via_link: i64 = 0;

    for url in urls {
        if max_pages > 0 && current_total + accepted >= max_pages {
            skipped += 1;
            continue;
        }

        let page_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO page (domain_id, path, priority)
            VALUES ($1, $2, $3)
            ON CONFLICT (domain_id, path)
            DO UPDATE SET priority = GREATEST(page.priority, EXCLUDED.priority)
            RETURNING id
            "#,
        )
        .bind(domain_id)
        .bind(&url.path)
        .bind(url.priority)
        .fetch_one(&mut *tx)
        .await?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO task (id, job_id, page_id, status, source_type, source_url, priority)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            ON CONFLICT (job_id, page_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(page_id)
        .bind(url.source_type)
        .bind(&url.source_url)
        .bind(url.priority)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_some() {
            accepted += 1;
            if url.source_type == SourceType::Link {
                found_via_link += 1;
            }
        } else {
            skipped += 1;
        }
    }

    let new_total: i64 = sqlx::query_scalar(
        r#"
        UPDATE job
        SET total_tasks = total_tasks + $1,
            found_tasks = found_tasks + $2
        WHERE id = $3
        RETURNING total_tasks
        "#,
    )
    .bind(accepted)
    .bind(found_via_link)
    .bind(job_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(EnqueueOutcome {
        accepted,
        skipped,
        new_total_tasks: new_total,
    })
}

/// §4.1 `ClaimNext`: atomically claim the single highest-priority pending
/// task whose job is running (and, if `job_filter_set` is non-empty, in
/// that set), skipping rows already locked by a concurrent claimant rather
/// than blocking on them.
pub async fn claim_next(
    store: &Store,
    worker_id: &str,
    job_filter_set: &[Uuid],
) -> Result<Option<ClaimedTask>, QueueError> {
    if store.is_saturated() {
        return Err(QueueError::PoolSaturated {
            ratio: store.pool_pressure(),
        });
    }

    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        WITH next_task AS (
            SELECT t.id
            FROM task t
            JOIN job j ON j.id = t.job_id
            WHERE t.status = 'pending'
              AND j.status = 'running'
              AND ($2::uuid[] IS NULL OR cardinality($2::uuid[]) = 0 OR t.job_id = ANY($2::uuid[]))
            ORDER BY t.priority DESC, t.created_at ASC
            LIMIT 1
            FOR UPDATE OF t SKIP LOCKED
        )
        UPDATE task
        SET status = 'running',
            claimed_at = NOW(),
            attempt_count = attempt_count + 1
        WHERE id IN (SELECT id FROM next_task)
        RETURNING
            task.id, task.job_id, task.page_id, task.status, task.attempt_count,
            task.source_type, task.source_url, task.priority, task.created_at,
            task.claimed_at, task.started_at, task.completed_at, task.status_code,
            task.response_time_ms, task.cache_status, task.content_type,
            task.second_response_time_ms, task.redirect_url, task.error,
            NULL::text AS url
        "#,
    )
    .bind(worker_id)
    .bind(job_filter_set)
    .fetch_optional(store.pool())
    .await?;

    let Some(task) = row else {
        return Ok(None);
    };

    let url: String = sqlx::query_scalar(
        r#"
        SELECT 'https://' || d.host || p.path
        FROM page p
        JOIN domain d ON d.id = p.domain_id
        WHERE p.id = $1
        "#,
    )
    .bind(task.page_id)
    .fetch_one(store.pool())
    .await?;

    Ok(Some(ClaimedTask { task, url }))
}

/// §4.1 `CompleteTask`: set terminal status and result fields, increment
/// the job's matching counter, and transition the job to `completed` when
/// its counters now sum to `total_tasks`. Completing a task whose job has
/// since been cancelled still sets the task's terminal state but is a
/// no-op on the job's counters (the spec's cancellation no-op rule).
pub async fn complete_task(
    store: &Store,
    task_id: Uuid,
    result: &TaskResult,
) -> Result<(), QueueError> {
    let mut tx = store.pool().begin().await?;

    let job_id: Uuid = sqlx::query_scalar(
        r#"
        UPDATE task
        SET status = $1,
            status_code = $2,
            response_time_ms = $3,
            cache_status = $4,
            content_type = $5,
            second_response_time_ms = $6,
            redirect_url = $7,
            error = $8,
            started_at = COALESCE(started_at, NOW()),
            completed_at = NOW()
        WHERE id = $9
        RETURNING job_id
        "#,
    )
    .bind(result.status)
    .bind(result.status_code)
    .bind(result.response_time_ms)
    .bind(result.cache_status)
    .bind(&result.content_type)
    .bind(result.second_response_time_ms)
    .bind(&result.redirect_url)
    .bind(&result.error)
    .bind(task_id)
    .fetch_one(&mut *tx)
    .await?;

    let counter_column = match result.status {
        TaskStatus::Completed => "completed_tasks",
        TaskStatus::Failed => "failed_tasks",
        TaskStatus::Skipped => "skipped_tasks",
        TaskStatus::Pending | TaskStatus::Running => {
            tx.commit().await?;
            return Ok(());
        }
    };

    // Counter column is one of three hardcoded literals above, never
    // caller-controlled input, so interpolating it into the column list is
    // not an injection risk.
    let increment_sql =
        format!("UPDATE job SET {counter_column} = {counter_column} + 1 WHERE id = $1 AND status <> 'cancelled'");
    sqlx::query(&increment_sql)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    // A cancelled job never reaches this transition; its tasks were already
    // moved to skipped at cancellation time and CompleteTask's counter
    // write above was a no-op for it.
    sqlx::query(
        r#"
        UPDATE job
        SET status = 'completed', completed_at = NOW()
        WHERE id = $1
          AND status = 'running'
          AND completed_tasks + failed_tasks + skipped_tasks >= total_tasks
        "#,
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Batched form of [`complete_task`], used by the Worker Pool's per-worker
/// result buffer (§4.1 "Batch write path"): every buffered result is
/// written and counted in one transaction instead of one round trip per
/// task, flushed by count, by wall-clock, on shutdown, or on an explicit
/// quiescence signal.
pub async fn complete_batch(
    store: &Store,
    results: &[(Uuid, TaskResult)],
) -> Result<(), QueueError> {
    if results.is_empty() {
        return Ok(());
    }

    let mut tx = store.pool().begin().await?;
    let mut touched_jobs = std::collections::HashSet::new();

    for (task_id, result) in results {
        let job_id: Uuid = sqlx::query_scalar(
            r#"
            UPDATE task
            SET status = $1,
                status_code = $2,
                response_time_ms = $3,
                cache_status = $4,
                content_type = $5,
                second_response_time_ms = $6,
                redirect_url = $7,
                error = $8,
                started_at = COALESCE(started_at, NOW()),
                completed_at = NOW()
            WHERE id = $9
            RETURNING job_id
            "#,
        )
        .bind(result.status)
        .bind(result.status_code)
        .bind(result.response_time_ms)
        .bind(result.cache_status)
        .bind(&result.content_type)
        .bind(result.second_response_time_ms)
        .bind(&result.redirect_url)
        .bind(&result.error)
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;

        let counter_column = match result.status {
            TaskStatus::Completed => Some("completed_tasks"),
            TaskStatus::Failed => Some("failed_tasks"),
            TaskStatus::Skipped => Some("skipped_tasks"),
            TaskStatus::Pending | TaskStatus::Running => None,
        };

        if let Some(counter_column) = counter_column {
            // Counter column is one of three hardcoded literals above,
            // never caller-controlled input.
            let increment_sql = format!(
                "UPDATE job SET {counter_column} = {counter_column} + 1 WHERE id = $1 AND status <> 'cancelled'"
            );
            sqlx::query(&increment_sql).bind(job_id).execute(&mut *tx).await?;
            touched_jobs.insert(job_id);
        }
    }

    for job_id in touched_jobs {
        sqlx::query(
            r#"
            UPDATE job
            SET status = 'completed', completed_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND completed_tasks + failed_tasks + skipped_tasks >= total_tasks
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// §4.1 `Requeue`: used only by the Recovery Monitor to return an abandoned
/// `running` task to `pending`.
pub async fn requeue(store: &Store, task_id: Uuid) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        UPDATE task
        SET status = 'pending', claimed_at = NULL
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// §4.1 `PoolPressure`.
#[must_use]
pub fn pool_pressure(store: &Store) -> f64 {
    store.pool_pressure()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_outcome_fields_are_independent() {
        let outcome = EnqueueOutcome {
            accepted: 2,
            skipped: 1,
            new_total_tasks: 5,
        };
        assert_eq!(outcome.accepted + outcome.skipped, 3);
        assert_eq!(outcome.new_total_tasks, 5);
    }

    #[test]
    fn task_result_completed_carries_status_code() {
        let result = TaskResult {
            status: TaskStatus::Completed,
            status_code: Some(404),
            response_time_ms: Some(120),
            cache_status: Some(CacheStatus::Miss),
            content_type: Some("text/html".to_string()),
            second_response_time_ms: None,
            redirect_url: None,
            error: None,
        };
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.status_code, Some(404));
    }
}
