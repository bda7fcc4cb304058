//! Recovery Monitor (spec §4.6): on process start and periodically
//! thereafter, detect and repair inconsistent state left behind by crashed
//! or cancelled workers.
//!
//! Structurally similar to the donor's `SearchEngineCache::start_cleanup_task`
//! periodic-sweep pattern, generalised from cache-entry eviction to
//! task/job reconciliation.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::error::QueueError;
use crate::store::Store;

/// Outcome of one sweep pass, surfaced for logging/metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: u64,
    pub max_attempts_failed: u64,
    pub orphans_skipped: u64,
    pub jobs_closed: u64,
}

/// Periodic sweeper. One instance runs per process (§5: "one Recovery
/// Monitor activity (single)").
pub struct RecoveryMonitor {
    store: Store,
    config: RecoveryConfig,
}

impl RecoveryMonitor {
    #[must_use]
    pub fn new(store: Store, config: RecoveryConfig) -> Self {
        Self { store, config }
    }

    /// Run on process startup, before workers begin claiming: reset stale
    /// `running` tasks so that a prior process's abandoned work is
    /// immediately eligible again rather than waiting a full sweep
    /// interval (§4.6 "On startup").
    pub async fn run_startup_sweep(&self) -> Result<SweepReport, QueueError> {
        self.sweep_once().await
    }

    /// Run forever on the configured interval until `cancel` fires,
    /// performing the periodic sweep described in §4.6.
    pub async fn run(
        &self,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        ticker.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    log::info!("recovery monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report != SweepReport::default() => {
                            tracing::info!(
                                requeued = report.requeued,
                                max_attempts_failed = report.max_attempts_failed,
                                orphans_skipped = report.orphans_skipped,
                                jobs_closed = report.jobs_closed,
                                "recovery sweep repaired state"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => log::warn!("recovery sweep failed: {err}"),
                    }
                }
            }
        }
    }

    /// One full sweep: requeue abandoned tasks, fail tasks that have
    /// exhausted their attempt budget, skip orphaned pending tasks whose
    /// job was cancelled, and close out jobs whose counters already satisfy
    /// completion but whose status was never flipped. All steps are
    /// idempotent and safe under concurrent execution (§4.6).
    pub async fn sweep_once(&self) -> Result<SweepReport, QueueError> {
        let stale_threshold = self.config.stale_after_secs as i64;
        let max_attempts = i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX);

        let max_attempts_failed = sqlx::query_scalar::<_, i64>(
            r#"
            WITH exhausted AS (
                UPDATE task
                SET status = 'failed',
                    error = 'max_attempts',
                    completed_at = NOW()
                WHERE status = 'running'
                  AND claimed_at < NOW() - make_interval(secs => $1)
                  AND attempt_count >= $2
                RETURNING job_id
            )
            UPDATE job j
            SET failed_tasks = failed_tasks + sub.count
            FROM (SELECT job_id, COUNT(*) AS count FROM exhausted GROUP BY job_id) sub
            WHERE j.id = sub.job_id AND j.status <> 'cancelled'
            RETURNING sub.count
            "#,
        )
        .bind(stale_threshold)
        .bind(max_attempts)
        .fetch_all(self.store.pool())
        .await?
        .into_iter()
        .sum();

        let requeued = sqlx::query(
            r#"
            UPDATE task
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'running'
              AND claimed_at < NOW() - make_interval(secs => $1)
              AND attempt_count < $2
            "#,
        )
        .bind(stale_threshold)
        .bind(max_attempts)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        let orphans_skipped = sqlx::query(
            r#"
            WITH orphaned AS (
                UPDATE task t
                SET status = 'skipped'
                FROM job j
                WHERE t.job_id = j.id
                  AND j.status = 'cancelled'
                  AND t.status = 'pending'
                RETURNING t.job_id
            )
            UPDATE job j
            SET skipped_tasks = skipped_tasks + sub.count
            FROM (SELECT job_id, COUNT(*) AS count FROM orphaned GROUP BY job_id) sub
            WHERE j.id = sub.job_id
            RETURNING sub.count
            "#,
        )
        .fetch_all(self.store.pool())
        .await?
        .len() as u64;

        let jobs_closed = sqlx::query(
            r#"
            UPDATE job
            SET status = 'completed', completed_at = COALESCE(completed_at, NOW())
            WHERE status = 'running'
              AND total_tasks > 0
              AND completed_tasks + failed_tasks + skipped_tasks >= total_tasks
            "#,
        )
        .execute(self.store.pool())
        .await?
        .rows_affected();

        Ok(SweepReport {
            requeued,
            max_attempts_failed: max_attempts_failed as u64,
            orphans_skipped,
            jobs_closed,
        })
    }
}

/// Helper for the Worker Pool's crash-recovery test scenario (§8 Scenario
/// F): returns whether the given task is currently `running` and stale
/// enough to be swept, without performing the sweep. Exposed for test
/// assertions and operator tooling.
pub async fn is_stale_running(
    store: &Store,
    task_id: Uuid,
    stale_after: Duration,
) -> Result<bool, QueueError> {
    let claimed_at: Option<chrono::DateTime<chrono::Utc>> = sqlx::query_scalar(
        "SELECT claimed_at FROM task WHERE id = $1 AND status = 'running'",
    )
    .bind(task_id)
    .fetch_optional(store.pool())
    .await?
    .flatten();

    Ok(claimed_at.is_some_and(|claimed_at| {
        chrono::Utc::now() - claimed_at >= chrono::Duration::from_std(stale_after).unwrap_or_default()
    }))
}

/// Owning handle so the Worker Pool can spawn the monitor and cancel it on
/// `Stop`.
#[must_use]
pub fn spawn(
    store: Store,
    config: RecoveryConfig,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let monitor = Arc::new(RecoveryMonitor::new(store, config));
    tokio::spawn(async move {
        if let Err(err) = monitor.run_startup_sweep().await {
            log::warn!("startup recovery sweep failed: {err}");
        }
        monitor.run(cancel).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_report_default_is_all_zero() {
        let report = SweepReport::default();
        assert_eq!(report.requeued, 0);
        assert_eq!(report.jobs_closed, 0);
    }

    #[test]
    fn sweep_report_inequality_detects_activity() {
        let idle = SweepReport::default();
        let active = SweepReport {
            requeued: 3,
            ..SweepReport::default()
        };
        assert_ne!(idle, active);
    }
}
