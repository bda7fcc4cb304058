//! Property-based tests for the quantified invariants in spec §8: progress
//! percentage bounds, priority ordering, and URL canonicalisation
//! idempotence, exercised with `proptest` the way the donor exercises its
//! own redos/normalisation invariants.

use proptest::prelude::*;

use blue_banded_bee::imurl::ImUrl;
use blue_banded_bee::job_manager::{link_priority, sitemap_priority, LINK_PRIORITY_FLOOR};
use blue_banded_bee::store::schema::{JobRow, JobStatus, SourceType};

fn job_with_counters(total: i64, completed: i64, failed: i64, skipped: i64) -> JobRow {
    JobRow {
        id: uuid::Uuid::new_v4(),
        domain_id: 1,
        organisation_id: uuid::Uuid::new_v4(),
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
        created_at: chrono::Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

proptest! {
    /// Invariant: `0 <= progress_percent() <= 100` for any non-negative,
    /// internally consistent counter combination (spec §8 invariant 1).
    #[test]
    fn progress_percent_stays_in_bounds(
        total in 0i64..10_000,
        completed in 0i64..10_000,
        failed in 0i64..10_000,
        skipped in 0i64..10_000,
    ) {
        let job = job_with_counters(total, completed, failed, skipped);
        let pct = job.progress_percent();
        prop_assert!(pct >= 0.0);
        prop_assert!(pct <= 100.0 || total == 0 && pct == 0.0);
    }

    /// Invariant: counters never exceed `total_tasks` once consistent
    /// (spec §8 invariant 2, checked as the predicate the caller enforces).
    #[test]
    fn counters_sum_detects_overrun(
        total in 0i64..1_000,
        completed in 0i64..1_000,
        failed in 0i64..1_000,
        skipped in 0i64..1_000,
    ) {
        let job = job_with_counters(total, completed, failed, skipped);
        let sum = completed + failed + skipped;
        prop_assert_eq!(job.counters_sum_to_total(), sum <= total);
    }

    /// Invariant: link priority never decreases as the decay position
    /// moves backwards, and never drops below the documented floor
    /// (spec §4.3 decaying priority policy).
    #[test]
    fn link_priority_monotonic_and_floored(a in 0usize..50_000, b in 0usize..50_000) {
        let pa = link_priority(a);
        let pb = link_priority(b);
        prop_assert!(pa >= LINK_PRIORITY_FLOOR);
        prop_assert!(pb >= LINK_PRIORITY_FLOOR);
        if a <= b {
            prop_assert!(pa >= pb);
        }
    }

    /// Invariant: sitemap position priority is monotonically non-increasing
    /// with position and bounded below by its documented floor.
    #[test]
    fn sitemap_priority_monotonic_and_floored(a in 0usize..50_000, b in 0usize..50_000) {
        let pa = sitemap_priority(a);
        let pb = sitemap_priority(b);
        prop_assert!(pa >= 0.5);
        prop_assert!(pb >= 0.5);
        if a <= b {
            prop_assert!(pa >= pb);
        }
    }

    /// Invariant: canonicalising an already-canonical URL is idempotent
    /// (spec §6 URL canonicalisation), restricted to a safe ASCII alphabet
    /// so the generated host/path are always parseable.
    #[test]
    fn canonicalize_is_idempotent(
        host in "[a-z]{3,10}\\.test",
        path in "[a-z/]{0,10}",
    ) {
        let raw = format!("https://{host}/{path}");
        if let Ok(once) = ImUrl::canonicalize(&raw) {
            let twice = ImUrl::canonicalize(once.as_str()).unwrap();
            prop_assert_eq!(once.as_str(), twice.as_str());
        }
    }
}
