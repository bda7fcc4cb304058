//! Job Manager (spec §4.3): create, cancel, restart, and finalise Jobs;
//! orchestrate URL discovery at job start; enforce a single non-terminal
//! Job per (domain, organisation).
//!
//! The single-active-session-per-key enforcement generalises the donor's
//! `CrawlRegistry` (keyed session map, one live session per key); here the
//! key is (domain, organisation) and "session" is a database row rather
//! than an in-memory struct, so enforcement happens inside one transaction
//! instead of behind a registry mutex.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::JobError;
use crate::events::{self, Event};
use crate::robots::{self, RobotsCache, RobotsRuleset};
use crate::sitemap;
use crate::store::queue::{self, NewUrl};
use crate::store::schema::SourceType;
use crate::store::Store;
use crate::worker_pool::WorkerPool;

/// Decaying priority applied to links discovered from link-crawling
/// (§4.3 "subsequent discovered links inherit a decayed priority"). The
/// exact constants are a policy knob per §9's open question, not a
/// correctness requirement; recorded in `DESIGN.md`.
pub const LINK_PRIORITY_START: f64 = 1.0;
pub const LINK_PRIORITY_DECAY: f64 = 0.01;
pub const LINK_PRIORITY_FLOOR: f64 = 0.1;

/// Priority assigned to the root-page seed task when a job falls back to
/// link crawling (§4.3 step 4).
pub const ROOT_PRIORITY: f64 = 1.0;

/// Options accepted by [`JobManager::create_job`], generalising the
/// donor's `CrawlConfig` builder (concrete defaults, no panicking
/// `Option`-typed knobs the caller forgot to fill in).
#[derive(Debug, Clone)]
pub struct CreateJobOptions {
    pub host: String,
    pub organisation_id: Uuid,
    pub source_type: SourceType,
    pub concurrency_target: i32,
    pub find_links_enabled: bool,
    pub max_pages: i64,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub required_workers: usize,
}

impl Default for CreateJobOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            organisation_id: Uuid::nil(),
            source_type: SourceType::Manual,
            concurrency_target: 5,
            find_links_enabled: true,
            max_pages: 0,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            required_workers: 2,
        }
    }
}

pub struct JobManager {
    store: Store,
    pool: Arc<WorkerPool>,
    http_client: reqwest::Client,
    robots_cache: Arc<RobotsCache>,
    robots_timeout: std::time::Duration,
    sitemap_timeout: std::time::Duration,
    user_agent: String,
}

impl JobManager {
    #[must_use]
    pub fn new(
        store: Store,
        pool: Arc<WorkerPool>,
        http_client: reqwest::Client,
        robots_cache: Arc<RobotsCache>,
        user_agent: String,
    ) -> Self {
        Self {
            store,
            pool,
            http_client,
            robots_cache,
            robots_timeout: std::time::Duration::from_secs(10),
            sitemap_timeout: std::time::Duration::from_secs(20),
            user_agent,
        }
    }

    /// §4.3 `CreateJob`.
    pub async fn create_job(&self, options: CreateJobOptions) -> Result<Uuid, JobError> {
        let host = canonical_host(&options.host)
            .ok_or_else(|| JobError::InvalidDomain(options.host.clone()))?;

        let robots_body = match robots::fetch(&self.http_client, "https", &host, self.robots_timeout).await {
            Ok(body) => body,
            Err(err) => {
                if options.source_type == SourceType::Manual {
                    return Err(JobError::RobotsUnreachable(err.to_string()));
                }
                String::new()
            }
        };
        let ruleset = RobotsRuleset::parse(robots_body.clone(), &self.user_agent);

        let domain_id = self.resolve_domain(&host).await?;

        let job_id = Uuid::new_v4();
        let mut tx = self.store.pool().begin().await?;

        let prior: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM job
            WHERE domain_id = $1 AND organisation_id = $2
              AND status NOT IN ('completed', 'failed', 'cancelled')
            FOR UPDATE
            "#,
        )
        .bind(domain_id)
        .bind(options.organisation_id)
        .fetch_all(&mut *tx)
        .await?;

        for prior_job_id in &prior {
            cancel_job_tx(&mut tx, *prior_job_id).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO job (
                id, domain_id, organisation_id, status, source_type,
                concurrency_target, find_links_enabled, max_pages,
                include_paths, exclude_paths, required_workers, robots_ruleset
            ) VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job_id)
        .bind(domain_id)
        .bind(options.organisation_id)
        .bind(options.source_type)
        .bind(options.concurrency_target)
        .bind(options.find_links_enabled)
        .bind(options.max_pages)
        .bind(&options.include_paths)
        .bind(&options.exclude_paths)
        .bind(i32::try_from(options.required_workers).unwrap_or(i32::MAX))
        .bind(serde_json::json!({"body": robots_body}))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        for prior_job_id in &prior {
            events::notify(&self.store, Event::JobCancelled { job_id: *prior_job_id })
                .await
                .ok();
            self.pool.remove_job(*prior_job_id).await;
        }

        self.robots_cache.insert(job_id, ruleset);

        self.start_discovery(job_id, domain_id, &host, &robots_body, &options).await?;

        Ok(job_id)
    }

    /// §4.3 step 3/4: run Sitemap Discoverer, enqueue what it finds, fall
    /// back to a single root-page seed task on an empty result, then flip
    /// the job to `running` and register it with the Worker Pool.
    async fn start_discovery(
        &self,
        job_id: Uuid,
        domain_id: i32,
        host: &str,
        robots_body: &str,
        options: &CreateJobOptions,
    ) -> Result<(), JobError> {
        let ruleset = self.robots_cache.get(job_id).unwrap_or_else(|| {
            Arc::new(RobotsRuleset::permissive(&self.user_agent))
        });

        let sitemap_urls = sitemap::discover(&self.http_client, "https", host, robots_body, self.sitemap_timeout)
            .await
            .unwrap_or_default();

        let urls: Vec<NewUrl> = if sitemap_urls.is_empty() {
            vec![NewUrl {
                path: "/".to_string(),
                priority: ROOT_PRIORITY,
                source_type: SourceType::Root,
                source_url: None,
            }]
        } else {
            sitemap_urls
                .into_iter()
                .filter(|entry| ruleset.is_allowed(entry.url.as_str()))
                .filter(|entry| path_permitted(entry.url.path(), &options.include_paths, &options.exclude_paths))
                .map(|entry| NewUrl {
                    path: entry.url.path().to_string(),
                    priority: sitemap_priority(entry.position),
                    source_type: SourceType::Sitemap,
                    source_url: None,
                })
                .collect()
        };

        queue::enqueue_batch(&self.store, job_id, domain_id, &urls, options.max_pages).await?;

        sqlx::query("UPDATE job SET status = 'running', started_at = NOW() WHERE id = $1 AND status = 'pending'")
            .bind(job_id)
            .execute(self.store.pool())
            .await?;

        events::notify(&self.store, Event::TasksAvailable { job_id }).await.ok();
        events::notify(&self.store, Event::JobStarted { job_id }).await.ok();

        self.pool.add_job(job_id, options.required_workers).await;
        self.pool.configure_job(
            job_id,
            host.to_string(),
            options.max_pages,
            options.find_links_enabled,
            options.include_paths.clone(),
            options.exclude_paths.clone(),
        );

        Ok(())
    }

    /// §4.3 `CancelJob`: idempotent.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), JobError> {
        let mut tx = self.store.pool().begin().await?;
        cancel_job_tx(&mut tx, job_id).await?;
        tx.commit().await?;

        events::notify(&self.store, Event::JobCancelled { job_id }).await.ok();
        self.pool.remove_job(job_id).await;
        Ok(())
    }

    /// §4.3 `RestartJob`: valid only when status is terminal. Re-runs
    /// discovery with the job's original options rather than fresh
    /// defaults, so a restarted job keeps its organisation, concurrency
    /// target, and path filters.
    #[allow(clippy::type_complexity)]
    pub async fn restart_job(&self, job_id: Uuid) -> Result<(), JobError> {
        let row: (
            i32,
            String,
            String,
            Uuid,
            SourceType,
            i32,
            bool,
            i64,
            Vec<String>,
            Vec<String>,
            i32,
        ) = sqlx::query_as(
            r#"
            SELECT j.domain_id, j.status::text, d.host, j.organisation_id, j.source_type,
                   j.concurrency_target, j.find_links_enabled, j.max_pages,
                   j.include_paths, j.exclude_paths, j.required_workers
            FROM job j JOIN domain d ON d.id = j.domain_id
            WHERE j.id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(self.store.pool())
        .await
        .map_err(JobError::Store)?;

        let (
            domain_id,
            status,
            host,
            organisation_id,
            source_type,
            concurrency_target,
            find_links_enabled,
            max_pages,
            include_paths,
            exclude_paths,
            required_workers,
        ) = row;
        if !matches!(status.as_str(), "completed" | "failed" | "cancelled") {
            return Err(JobError::NotRestartable(job_id));
        }

        sqlx::query(
            r#"
            UPDATE job
            SET status = 'pending', total_tasks = 0, completed_tasks = 0,
                failed_tasks = 0, skipped_tasks = 0, found_tasks = 0,
                started_at = NULL, completed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(self.store.pool())
        .await?;

        let options = CreateJobOptions {
            host: host.clone(),
            organisation_id,
            source_type,
            concurrency_target,
            find_links_enabled,
            max_pages,
            include_paths,
            exclude_paths,
            required_workers: usize::try_from(required_workers).unwrap_or(1),
        };

        let robots_body = robots::fetch(&self.http_client, "https", &host, self.robots_timeout)
            .await
            .unwrap_or_default();
        self.robots_cache
            .insert(job_id, RobotsRuleset::parse(robots_body.clone(), &self.user_agent));

        self.start_discovery(job_id, domain_id, &host, &robots_body, &options).await?;
        Ok(())
    }

    async fn resolve_domain(&self, host: &str) -> Result<i32, JobError> {
        let id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO domain (host) VALUES ($1)
            ON CONFLICT (host) DO UPDATE SET host = EXCLUDED.host
            RETURNING id
            "#,
        )
        .bind(host)
        .fetch_one(self.store.pool())
        .await?;
        Ok(id)
    }
}

/// Shared by `create_job` (cancelling a prior job on the same domain/org)
/// and `cancel_job` itself: mark the job cancelled and every still-pending
/// task skipped, in the caller's transaction.
async fn cancel_job_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_id: Uuid,
) -> Result<(), JobError> {
    let skipped = sqlx::query(
        r#"
        UPDATE task SET status = 'skipped' WHERE job_id = $1 AND status = 'pending'
        "#,
    )
    .bind(job_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    sqlx::query(
        r#"
        UPDATE job
        SET status = 'cancelled', skipped_tasks = skipped_tasks + $2
        WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
        "#,
    )
    .bind(job_id)
    .bind(skipped as i64)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Decaying priority band for sitemap-discovered URLs (§4.3: "priority
/// derived from position in sitemap order, monotonically decreasing
/// within a band"), floored so very long sitemaps don't reach zero.
#[must_use]
pub fn sitemap_priority(position: usize) -> f64 {
    (0.9 - position as f64 * 0.001).max(0.5)
}

/// Decaying priority for successively discovered links on one page
/// (§4.3 / §9 open question: exact constants are a policy knob).
#[must_use]
pub fn link_priority(position_on_page: usize) -> f64 {
    (LINK_PRIORITY_START - position_on_page as f64 * LINK_PRIORITY_DECAY).max(LINK_PRIORITY_FLOOR)
}

fn path_permitted(path: &str, include: &[String], exclude: &[String]) -> bool {
    if !exclude.is_empty() && exclude.iter().any(|p| path.starts_with(p.as_str())) {
        return false;
    }
    if !include.is_empty() && !include.iter().any(|p| path.starts_with(p.as_str())) {
        return false;
    }
    true
}

/// Canonicalise a user-supplied host per §6 (lowercase, punycode, no
/// port), delegating to `ImUrl` by wrapping the bare host in a scheme.
fn canonical_host(input: &str) -> Option<String> {
    let candidate = if input.contains("://") {
        input.to_string()
    } else {
        format!("https://{input}")
    };
    crate::imurl::ImUrl::canonicalize(&candidate)
        .ok()
        .and_then(|url| url.host().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sitemap_priority_decreases_monotonically() {
        assert!(sitemap_priority(0) > sitemap_priority(1));
        assert!(sitemap_priority(1000) >= 0.5);
    }

    #[test]
    fn link_priority_decays_and_floors() {
        assert_eq!(link_priority(0), 1.0);
        assert!(link_priority(10) < link_priority(0));
        assert!(link_priority(10_000) >= LINK_PRIORITY_FLOOR);
    }

    #[test]
    fn path_permitted_respects_exclude_before_include() {
        assert!(!path_permitted("/private/x", &[], &["/private/".to_string()]));
        assert!(path_permitted("/public/x", &["/public/".to_string()], &[]));
        assert!(!path_permitted("/other/x", &["/public/".to_string()], &[]));
    }

    #[test]
    fn canonical_host_lowercases_and_strips_port() {
        assert_eq!(canonical_host("Example.com:443").as_deref(), Some("example.com"));
        assert_eq!(canonical_host("https://Example.COM/").as_deref(), Some("example.com"));
    }

    #[test]
    fn canonical_host_rejects_garbage() {
        assert_eq!(canonical_host(""), None);
    }
}
