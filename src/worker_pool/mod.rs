//! Worker Pool (spec §4.2): a long-running, process-wide pool of worker
//! activities that continuously drain the Task Queue, execute fetches,
//! and feed back results and newly discovered URLs.
//!
//! Generalises the donor's `crawl_engine::orchestrator` `FuturesUnordered`-
//! driven task loop into a set of persistent `tokio` tasks, since this
//! pool must survive across many jobs rather than drive one crawl to
//! completion and exit; [`CircuitBreaker`] and [`DomainLimiter`] are
//! carried over directly, and [`crate::adaptive`]/[`crate::recovery`] are
//! spawned and owned alongside the workers themselves.

pub mod circuit_breaker;
pub mod domain_limiter;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use domain_limiter::DomainLimiter;

use crate::adaptive::{AdaptiveController, Sample, ScaleSignal};
use crate::config::{Config, WorkerPoolConfig};
use crate::discovery::DiscoveryFilter;
use crate::events::{self, Event, EventBus};
use crate::fetcher::Fetcher;
use crate::imurl::ImUrl;
use crate::robots::RobotsCache;
use crate::store::queue::{self, NewUrl, TaskResult};
use crate::store::schema::{SourceType, TaskStatus};
use crate::store::Store;

/// §4.2 "State machine for the pool".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// Bookkeeping kept per job while it's registered with the pool
/// ([`WorkerPool::add_job`]/[`WorkerPool::remove_job`]).
struct JobEntry {
    required_workers: usize,
    max_pages: i64,
    find_links_enabled: bool,
    include_paths: Vec<String>,
    exclude_paths: Vec<String>,
    host: String,
}

/// Per-worker result buffer, flushed by count, wall-clock, or on an
/// explicit quiescence/shutdown signal (§4.1 "Batch write path").
struct BatchBuffer {
    pending: Vec<(Uuid, TaskResult)>,
    last_flush: std::time::Instant,
}

impl BatchBuffer {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            last_flush: std::time::Instant::now(),
        }
    }

    fn push(&mut self, task_id: Uuid, result: TaskResult) {
        self.pending.push((task_id, result));
    }

    fn should_flush(&self, max_len: usize, max_age: Duration) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= max_len || self.last_flush.elapsed() >= max_age)
    }

    fn take(&mut self) -> Vec<(Uuid, TaskResult)> {
        self.last_flush = std::time::Instant::now();
        std::mem::take(&mut self.pending)
    }
}

const BATCH_MAX_LEN: usize = 20;
const BATCH_MAX_AGE: Duration = Duration::from_secs(2);
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CLAIM_RETRIES: u32 = 5;

pub struct WorkerPool {
    store: Store,
    fetcher: Fetcher,
    robots_cache: Arc<RobotsCache>,
    event_bus: Arc<EventBus>,
    circuit_breaker: Arc<CircuitBreaker>,
    domain_limiter: Arc<DomainLimiter>,
    adaptive: Arc<AdaptiveController>,
    adaptive_tick_interval: Duration,
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    active_jobs: DashMap<Uuid, JobEntry>,
    target: watch::Sender<usize>,
    cancel: Mutex<CancellationToken>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Monotonic counter used only to label worker ids for logging; never
    /// decremented, so it must not be read back as "how many workers are
    /// currently live" (see `live_workers`).
    next_worker_id: AtomicUsize,
    /// Actual count of currently running worker loops. Incremented when a
    /// worker is spawned, decremented when one claims a scale-down exit
    /// (see `try_claim_scale_down`). `spawn_workers_up_to_target` reads
    /// this, not `next_worker_id`, so upscaling after any prior downscale
    /// still spawns the right number of new workers.
    live_workers: AtomicUsize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        store: Store,
        fetcher: Fetcher,
        robots_cache: Arc<RobotsCache>,
        config: &Config,
    ) -> Arc<Self> {
        let (target, _) = watch::channel(0);
        Arc::new(Self {
            store,
            fetcher,
            robots_cache,
            event_bus: Arc::new(EventBus::new(1024)),
            circuit_breaker: Arc::new(CircuitBreaker::new(5, 2, Duration::from_secs(60))),
            domain_limiter: Arc::new(DomainLimiter::new(4)),
            adaptive: Arc::new(AdaptiveController::new(config.adaptive.clone())),
            adaptive_tick_interval: Duration::from_secs(config.adaptive.tick_interval_secs),
            config: config.worker_pool.clone(),
            state: Mutex::new(PoolState::Stopped),
            active_jobs: DashMap::new(),
            target,
            cancel: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    #[must_use]
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// §4.2 `Start(ctx)`: launches the initial workers, Recovery Monitor,
    /// Adaptive Controller, and a notification listener. Returns
    /// immediately.
    pub fn start(self: &Arc<Self>, recovery_config: crate::config::RecoveryConfig) {
        {
            let mut state = self.state.lock();
            if *state != PoolState::Stopped {
                return;
            }
            *state = PoolState::Starting;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let mut handles = self.handles.lock();

        handles.push(crate::recovery::spawn(
            self.store.clone(),
            recovery_config.clone(),
            cancel.clone(),
        ));

        let bus = self.event_bus.clone();
        let listener_store = self.store.clone();
        handles.push(tokio::spawn(async move {
            bus.run_listener(listener_store, Duration::from_secs(3)).await;
        }));

        let adaptive = self.adaptive.clone();
        let active_jobs_pool = self.clone();
        let per_job_cap = self.config.per_job_cap;
        let signal_pool = self.clone();
        let persist_pool = self.clone();
        let adaptive_cancel = cancel.clone();
        handles.push(crate::adaptive::spawn(
            adaptive,
            move || {
                active_jobs_pool
                    .active_jobs
                    .iter()
                    .map(|e| (*e.key(), per_job_cap, 0.0))
                    .collect()
            },
            move |job_id, signal| apply_scale_signal(&signal_pool, job_id, signal),
            move |job_id, delay_secs| {
                let pool = persist_pool.clone();
                tokio::spawn(async move { persist_adaptive_delay(&pool, job_id, delay_secs).await });
            },
            self.adaptive_tick_interval,
            adaptive_cancel,
        ));

        drop(handles);

        let _ = self.target.send(self.config.initial);
        self.spawn_workers_up_to_target();

        *self.state.lock() = PoolState::Running;
    }

    /// §4.2 `Stop(ctx)`: signals all workers to finish, flushes pending
    /// batches (each worker flushes its own buffer on exit), and releases
    /// resources.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != PoolState::Running {
                return;
            }
            *state = PoolState::Draining;
        }

        self.cancel.lock().cancel();

        for job_id in self.active_job_ids() {
            let delay_secs = self.adaptive.current_delay_secs(job_id);
            persist_adaptive_delay(self, job_id, delay_secs).await;
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }

        *self.state.lock() = PoolState::Stopped;
    }

    /// §4.2 `AddJob`: registers a job as active so workers will consider
    /// it when claiming, and triggers upscaling by `required_workers`
    /// units bounded by the pool's hard cap.
    pub async fn add_job(self: &Arc<Self>, job_id: Uuid, required_workers: usize) {
        self.active_jobs.insert(
            job_id,
            JobEntry {
                required_workers,
                max_pages: 0,
                find_links_enabled: true,
                include_paths: Vec::new(),
                exclude_paths: Vec::new(),
                host: String::new(),
            },
        );
        self.adaptive.register_job(job_id, required_workers, 0.0);

        let requested = self.target.borrow().saturating_add(required_workers);
        let capped = requested.min(self.config.max);
        let _ = self.target.send(capped);
        self.spawn_workers_up_to_target();
    }

    /// Attach discovery-relevant job configuration, set separately from
    /// `add_job` so the Job Manager can call `add_job` as soon as the job
    /// exists and refine the filter once configuration is known.
    pub fn configure_job(
        &self,
        job_id: Uuid,
        host: String,
        max_pages: i64,
        find_links_enabled: bool,
        include_paths: Vec<String>,
        exclude_paths: Vec<String>,
    ) {
        if let Some(mut entry) = self.active_jobs.get_mut(&job_id) {
            entry.host = host;
            entry.max_pages = max_pages;
            entry.find_links_enabled = find_links_enabled;
            entry.include_paths = include_paths;
            entry.exclude_paths = exclude_paths;
        }
    }

    /// §4.2 `RemoveJob`: deregisters the job and downscales proportional
    /// to its share of current demand.
    pub async fn remove_job(&self, job_id: Uuid) {
        if let Some((_, entry)) = self.active_jobs.remove(&job_id) {
            self.adaptive.deregister_job(job_id);
            let current = *self.target.borrow();
            let reduced = current.saturating_sub(entry.required_workers).max(self.config.initial);
            let _ = self.target.send(reduced);
        }
    }

    fn active_job_ids(&self) -> Vec<Uuid> {
        self.active_jobs.iter().map(|e| *e.key()).collect()
    }

    fn spawn_workers_up_to_target(self: &Arc<Self>) {
        let target = *self.target.borrow();
        let mut handles = self.handles.lock();
        let current_workers = self.live_workers.load(Ordering::SeqCst);
        for _ in current_workers..target {
            self.live_workers.fetch_add(1, Ordering::SeqCst);
            let ordinal = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let pool = self.clone();
            let cancel = self.cancel.lock().clone();
            let target_rx = self.target.subscribe();
            handles.push(tokio::spawn(worker_loop(pool, ordinal, target_rx, cancel)));
        }
    }

    /// Atomically claim one scale-down exit if the pool currently has more
    /// live workers than its target. Only the worker whose CAS succeeds
    /// exits, so a target drop doesn't cause every worker to exit at once;
    /// the rest re-observe the (now-lower) live count and stop trying.
    fn try_claim_scale_down(&self, target: usize) -> bool {
        loop {
            let current = self.live_workers.load(Ordering::SeqCst);
            if current <= target {
                return false;
            }
            if self
                .live_workers
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}

async fn worker_loop(
    pool: Arc<WorkerPool>,
    ordinal: usize,
    mut target_rx: watch::Receiver<usize>,
    cancel: CancellationToken,
) {
    let worker_id = format!("worker-{ordinal}");
    let mut buffer = BatchBuffer::new();
    let mut wake_rx = pool.event_bus.subscribe();
    let mut claim_failures: u32 = 0;
    let mut exited_via_scale_down = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if pool.try_claim_scale_down(*target_rx.borrow()) {
            // Scale-down signal: the pool has more live workers than its
            // target, and this worker won the claim to exit (§4.2). The
            // claim already decremented `live_workers`, so skip the
            // fallback decrement below.
            exited_via_scale_down = true;
            break;
        }

        if buffer.should_flush(BATCH_MAX_LEN, BATCH_MAX_AGE) {
            flush(&pool, &mut buffer).await;
        }

        let job_ids = pool.active_job_ids();
        if job_ids.is_empty() {
            if wait_for_wake_or_idle(&mut wake_rx, &mut target_rx, &cancel).await {
                break;
            }
            continue;
        }

        match queue::claim_next(&pool.store, &worker_id, &job_ids).await {
            Ok(Some(claimed)) => {
                claim_failures = 0;
                process_claimed(&pool, &worker_id, claimed, &mut buffer).await;
            }
            Ok(None) => {
                if wait_for_wake_or_idle(&mut wake_rx, &mut target_rx, &cancel).await {
                    break;
                }
            }
            Err(err) => {
                claim_failures += 1;
                log::warn!("claim_next failed for {worker_id} (attempt {claim_failures}): {err}");
                if claim_failures >= MAX_CLAIM_RETRIES {
                    claim_failures = 0;
                }
                let backoff = Duration::from_millis(200 * u64::from(claim_failures.min(5)));
                tokio::time::sleep(backoff + jitter()).await;
            }
        }
    }

    if !exited_via_scale_down {
        pool.live_workers.fetch_sub(1, Ordering::SeqCst);
    }

    flush(&pool, &mut buffer).await;
}

/// Wait for a wake event or the bounded idle timeout (§4.2 step 1).
/// Returns `true` if the caller should stop (cancelled or scaled down).
async fn wait_for_wake_or_idle(
    wake_rx: &mut broadcast::Receiver<Event>,
    target_rx: &mut watch::Receiver<usize>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        _ = target_rx.changed() => false,
        _ = tokio::time::sleep(IDLE_TIMEOUT + jitter()) => false,
        recv = wake_rx.recv() => {
            matches!(recv, Err(broadcast::error::RecvError::Closed))
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..250))
}

async fn process_claimed(
    pool: &Arc<WorkerPool>,
    worker_id: &str,
    claimed: queue::ClaimedTask,
    buffer: &mut BatchBuffer,
) {
    let task_id = claimed.task.id;
    let job_id = claimed.task.job_id;

    let Ok(url) = ImUrl::canonicalize(&claimed.url) else {
        buffer.push(
            task_id,
            TaskResult {
                status: TaskStatus::Failed,
                status_code: None,
                response_time_ms: None,
                cache_status: None,
                content_type: None,
                second_response_time_ms: None,
                redirect_url: None,
                error: Some("invalid_url".to_string()),
            },
        );
        return;
    };

    let host = url.host().unwrap_or_default().to_string();

    if !pool.circuit_breaker.should_attempt(&host) {
        // Requeue only: this task was never attempted, so it must not also
        // carry a terminal result through the batch buffer. Buffering a
        // `Failed` result here *and* requeuing would let a worker that
        // later re-claims the pending task increment the job's counters a
        // second time when it completes (§3's single-increment invariant).
        let _ = queue::requeue(&pool.store, task_id).await;
        return;
    }

    let ruleset = pool
        .robots_cache
        .get(job_id)
        .unwrap_or_else(|| Arc::new(crate::robots::RobotsRuleset::permissive(&pool.fetcher_user_agent())));

    let robots_delay = ruleset.crawl_delay().unwrap_or(0.0);
    let adaptive_delay = pool.adaptive.current_delay_secs(job_id);
    let delay = robots_delay.max(adaptive_delay);
    if delay > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }

    let _domain_permit = pool.domain_limiter.acquire(&host).await;

    let (find_links_enabled, include_paths, exclude_paths, max_pages) = pool
        .active_jobs
        .get(&job_id)
        .map(|e| {
            (
                e.find_links_enabled,
                e.include_paths.clone(),
                e.exclude_paths.clone(),
                e.max_pages,
            )
        })
        .unwrap_or((true, Vec::new(), Vec::new(), 0));

    let filter = DiscoveryFilter {
        job_host: &host,
        include_paths: &include_paths,
        exclude_paths: &exclude_paths,
        robots: &ruleset,
    };

    let outcome = pool.fetcher.warm(&url, find_links_enabled, Some(&filter)).await;

    match outcome {
        Ok(outcome) => {
            pool.circuit_breaker.record_success(&host);
            pool.adaptive.observe(
                job_id,
                Sample {
                    response_time_ms: outcome.response_time_ms,
                    is_error: outcome.status_code >= 500,
                },
            );

            if !outcome.discovered_links.is_empty() {
                let urls: Vec<NewUrl> = outcome
                    .discovered_links
                    .iter()
                    .enumerate()
                    .map(|(i, link)| NewUrl {
                        path: link.path().to_string(),
                        priority: crate::job_manager::link_priority(i),
                        source_type: SourceType::Link,
                        source_url: Some(claimed.url.clone()),
                    })
                    .collect();

                if let Some(domain_id) = pool.lookup_domain_id(job_id).await {
                    if let Ok(enqueued) = queue::enqueue_batch(&pool.store, job_id, domain_id, &urls, max_pages).await
                    {
                        if enqueued.accepted > 0 {
                            events::notify(&pool.store, Event::TasksAvailable { job_id }).await.ok();
                            pool.event_bus.publish_local(Event::TasksAvailable { job_id });
                        }
                    }
                }
            }

            let status = classify_status(outcome.status_code);
            if status == TaskStatus::Failed {
                pool.circuit_breaker.record_failure(&host, "upstream_5xx");
            }
            buffer.push(
                task_id,
                TaskResult {
                    status,
                    status_code: Some(i32::from(outcome.status_code)),
                    response_time_ms: Some(i32::try_from(outcome.response_time_ms).unwrap_or(i32::MAX)),
                    cache_status: Some(outcome.cache_status),
                    content_type: outcome.content_type,
                    second_response_time_ms: outcome
                        .second_response_time_ms
                        .map(|ms| i32::try_from(ms).unwrap_or(i32::MAX)),
                    redirect_url: outcome.redirect_url,
                    error: if status == TaskStatus::Failed {
                        Some(format!("upstream_status_{}", outcome.status_code))
                    } else {
                        None
                    },
                },
            );
        }
        Err(err) => {
            pool.circuit_breaker.record_failure(&host, &err.to_string());
            pool.adaptive.observe(job_id, Sample { response_time_ms: 0, is_error: true });
            log::warn!("{worker_id} fetch failed for {url}: {err}");
            buffer.push(
                task_id,
                TaskResult {
                    status: TaskStatus::Failed,
                    status_code: None,
                    response_time_ms: None,
                    cache_status: None,
                    content_type: None,
                    second_response_time_ms: None,
                    redirect_url: None,
                    error: Some(err.to_string()),
                },
            );
        }
    }
}

/// §4.5 failure classification applied to a successful HTTP round trip:
/// 4xx is a completed task (cache-warming an error page is still a valid
/// outcome), 5xx is handled by the Fetcher returning an error instead.
fn classify_status(status_code: u16) -> TaskStatus {
    if (500..600).contains(&status_code) {
        TaskStatus::Failed
    } else {
        TaskStatus::Completed
    }
}

async fn flush(pool: &Arc<WorkerPool>, buffer: &mut BatchBuffer) {
    if buffer.pending.is_empty() {
        return;
    }
    let batch = buffer.take();
    if let Err(err) = queue::complete_batch(&pool.store, &batch).await {
        log::error!("batch flush failed, {} results dropped: {err}", batch.len());
    }
}

impl WorkerPool {
    fn fetcher_user_agent(&self) -> String {
        self.fetcher.user_agent().to_string()
    }

    async fn lookup_domain_id(&self, job_id: Uuid) -> Option<i32> {
        sqlx::query_scalar("SELECT domain_id FROM job WHERE id = $1")
            .bind(job_id)
            .fetch_optional(self.store.pool())
            .await
            .ok()
            .flatten()
    }
}

/// Write the Adaptive Controller's current delay back onto the job's
/// domain row (§4.7). Called on every controller tick and once more per
/// active job during `Stop`, so the value is never lost across a restart.
async fn persist_adaptive_delay(pool: &WorkerPool, job_id: Uuid, delay_secs: f64) {
    let Some(domain_id) = pool.lookup_domain_id(job_id).await else {
        return;
    };
    if let Err(err) = pool.store.update_domain_adaptive_delay(domain_id, delay_secs).await {
        log::warn!("failed to persist adaptive delay for job {job_id}: {err}");
    }
}

/// Hook the pool wires into [`crate::adaptive::spawn`] so controller
/// signals resize the pool without the controller depending on
/// [`WorkerPool`] directly.
pub fn apply_scale_signal(pool: &Arc<WorkerPool>, job_id: Uuid, signal: ScaleSignal) {
    match signal {
        ScaleSignal::Upscale(by) => {
            let current = *pool.target.borrow();
            let capped = current.saturating_add(by).min(pool.config.max);
            let _ = pool.target.send(capped);
            pool.spawn_workers_up_to_target();
        }
        ScaleSignal::Downscale(by) => {
            let current = *pool.target.borrow();
            let reduced = current.saturating_sub(by).max(pool.config.initial);
            let _ = pool.target.send(reduced);
        }
        ScaleSignal::Hold => {
            let _ = job_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_buffer_flushes_on_length() {
        let mut buffer = BatchBuffer::new();
        for _ in 0..5 {
            buffer.push(
                Uuid::new_v4(),
                TaskResult {
                    status: TaskStatus::Completed,
                    status_code: Some(200),
                    response_time_ms: Some(10),
                    cache_status: None,
                    content_type: None,
                    second_response_time_ms: None,
                    redirect_url: None,
                    error: None,
                },
            );
        }
        assert!(buffer.should_flush(5, Duration::from_secs(60)));
        assert!(!buffer.should_flush(10, Duration::from_secs(60)));
    }

    #[test]
    fn batch_buffer_flushes_on_age() {
        let mut buffer = BatchBuffer::new();
        buffer.push(
            Uuid::new_v4(),
            TaskResult {
                status: TaskStatus::Completed,
                status_code: Some(200),
                response_time_ms: Some(10),
                cache_status: None,
                content_type: None,
                second_response_time_ms: None,
                redirect_url: None,
                error: None,
            },
        );
        assert!(buffer.should_flush(100, Duration::from_secs(0)));
    }

    #[test]
    fn classify_status_warms_4xx_as_completed() {
        assert_eq!(classify_status(404), TaskStatus::Completed);
        assert_eq!(classify_status(200), TaskStatus::Completed);
    }
}
