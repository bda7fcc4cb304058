//! Row types and enum encodings for the four persisted tables the core
//! depends on (`domain`, `page`, `job`, `task`). Raw DDL and migration
//! mechanics are an external collaborator's concern; this module documents
//! the columns each query binds against as comments alongside the types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `domain` table: canonical host identity shared across jobs.
///
/// ```sql
/// -- domain(id serial primary key, host text unique not null,
/// --        manual_crawl_delay_secs real, adaptive_delay_floor_secs real not null default 0,
/// --        adaptive_delay_secs real not null default 0, created_at timestamptz not null default now())
/// ```
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DomainRow {
    pub id: i32,
    pub host: String,
    pub manual_crawl_delay_secs: Option<f64>,
    pub adaptive_delay_floor_secs: f64,
    pub adaptive_delay_secs: f64,
    pub created_at: DateTime<Utc>,
}

/// `page` table: (domain_id, path) unique, outlives any one job.
///
/// ```sql
/// -- page(id serial primary key, domain_id int not null references domain(id),
/// --      path text not null, priority real not null default 0,
/// --      unique(domain_id, path))
/// ```
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PageRow {
    pub id: i64,
    pub domain_id: i32,
    pub path: String,
    pub priority: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SourceType {
    Manual,
    Scheduler,
    Webhook,
    Sitemap,
    Link,
    Root,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
    Dynamic,
    Unknown,
}

/// `job` table: a single user-scoped request to warm one domain's cache.
///
/// ```sql
/// -- job(id uuid primary key, domain_id int not null references domain(id),
/// --     organisation_id uuid not null, status text not null, source_type text not null,
/// --     total_tasks bigint not null default 0, completed_tasks bigint not null default 0,
/// --     failed_tasks bigint not null default 0, skipped_tasks bigint not null default 0,
/// --     found_tasks bigint not null default 0,
/// --     concurrency_target int not null default 1, find_links_enabled bool not null default true,
/// --     max_pages bigint not null default 0, include_paths text[], exclude_paths text[],
/// --     required_workers int not null default 1, robots_ruleset jsonb,
/// --     source_id text, created_at timestamptz not null default now(),
/// --     started_at timestamptz, completed_at timestamptz)
/// ```
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub domain_id: i32,
    pub organisation_id: Uuid,
    pub status: JobStatus,
    pub source_type: SourceType,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub found_tasks: i64,
    pub concurrency_target: i32,
    pub find_links_enabled: bool,
    pub max_pages: i64,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub required_workers: i32,
    pub robots_ruleset: Option<serde_json::Value>,
    pub source_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    /// Derived progress percent, per the data model invariant.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        let done = self.completed_tasks + self.failed_tasks + self.skipped_tasks;
        (done as f64 / self.total_tasks as f64) * 100.0
    }

    #[must_use]
    pub fn counters_sum_to_total(&self) -> bool {
        self.completed_tasks + self.failed_tasks + self.skipped_tasks <= self.total_tasks
    }
}

/// `task` table: a single URL fetch unit belonging to a job.
///
/// ```sql
/// -- task(id uuid primary key, job_id uuid not null references job(id) on delete cascade,
/// --      page_id bigint not null references page(id), status text not null,
/// --      attempt_count int not null default 0, source_type text not null,
/// --      source_url text, priority real not null default 0,
/// --      created_at timestamptz not null default now(), claimed_at timestamptz,
/// --      started_at timestamptz, completed_at timestamptz,
/// --      status_code int, response_time_ms int, cache_status text, content_type text,
/// --      second_response_time_ms int, redirect_url text, error text,
/// --      unique(job_id, page_id))
/// ```
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub page_id: i64,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub priority: f64,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status_code: Option<i32>,
    pub response_time_ms: Option<i32>,
    pub cache_status: Option<CacheStatus>,
    pub content_type: Option<String>,
    pub second_response_time_ms: Option<i32>,
    pub redirect_url: Option<String>,
    pub error: Option<String>,
    /// Carried along so `ClaimNext` can return the fetchable URL without a
    /// second round trip; not a persisted column, filled in by the claim
    /// query's join against `page`/`domain`.
    #[sqlx(default)]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(total: i64, completed: i64, failed: i64, skipped: i64) -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            domain_id: 1,
            organisation_id: Uuid::new_v4(),
            status: JobStatus::Running,
            source_type: SourceType::Manual,
            total_tasks: total,
            completed_tasks: completed,
            failed_tasks: failed,
            skipped_tasks: skipped,
            found_tasks: 0,
            concurrency_target: 1,
            find_links_enabled: true,
            max_pages: 0,
            include_paths: vec![],
            exclude_paths: vec![],
            required_workers: 1,
            robots_ruleset: None,
            source_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn progress_percent_zero_total_is_zero() {
        assert_eq!(job(0, 0, 0, 0).progress_percent(), 0.0);
    }

    #[test]
    fn progress_percent_reflects_done_fraction() {
        let j = job(4, 2, 1, 0);
        assert_eq!(j.progress_percent(), 75.0);
    }

    #[test]
    fn counters_sum_invariant_holds() {
        assert!(job(3, 1, 1, 1).counters_sum_to_total());
        assert!(!job(3, 2, 2, 2).counters_sum_to_total());
    }
}
