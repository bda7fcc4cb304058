//! Adaptive Controller (spec §4.7): per-job observer that raises or lowers
//! target worker count based on observed throughput and error-rate
//! signals, and tunes the domain's adaptive inter-request delay.
//!
//! The rolling window is held behind a `parking_lot` lock per job,
//! generalising the donor's lock-free atomic rate-limiter
//! (`crawl_engine::rate_limiter`) design intent down to a simpler lock
//! since this state is written at a low frequency (interval ticks, not
//! per-request) rather than on every fetch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::AdaptiveConfig;

/// One observed task outcome, fed in by the Worker Pool after every
/// `CompleteTask` (§4.2 step 7 "Record timing samples").
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub response_time_ms: u64,
    pub is_error: bool,
}

/// A signal the controller wants the Worker Pool to act on. The controller
/// never touches tasks directly (§4.7); it only emits these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleSignal {
    Upscale(usize),
    Downscale(usize),
    Hold,
}

struct JobWindow {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl JobWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let errors = self.samples.iter().filter(|s| s.is_error).count();
        errors as f64 / self.samples.len() as f64
    }

    fn avg_response_time_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|s| s.response_time_ms).sum();
        total as f64 / self.samples.len() as f64
    }

    fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }
}

/// Per-job rolling window plus the last observed average, used to detect
/// an upward drift in response time between ticks.
struct JobState {
    window: JobWindow,
    last_avg_response_time_ms: Option<f64>,
    current_delay_secs: f64,
    current_target: usize,
}

/// Process-wide controller: one [`JobState`] per active job, consulted on
/// a fixed tick interval (§4.7 "at regular intervals").
pub struct AdaptiveController {
    jobs: DashMap<Uuid, Arc<Mutex<JobState>>>,
    config: AdaptiveConfig,
}

impl AdaptiveController {
    #[must_use]
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            jobs: DashMap::new(),
            config,
        }
    }

    /// Register a job with its starting worker target and domain crawl
    /// delay floor (the domain's manual `Crawl-delay`, if any, never goes
    /// below it per §4.7's clamp rule).
    pub fn register_job(&self, job_id: Uuid, initial_target: usize, delay_floor_secs: f64) {
        self.jobs.insert(
            job_id,
            Arc::new(Mutex::new(JobState {
                window: JobWindow::new(self.config.window),
                last_avg_response_time_ms: None,
                current_delay_secs: delay_floor_secs.max(self.config.delay_floor_secs),
                current_target: initial_target,
            })),
        );
    }

    pub fn deregister_job(&self, job_id: Uuid) {
        self.jobs.remove(&job_id);
    }

    /// Record one completed task's timing/outcome (§4.2 step 7).
    pub fn observe(&self, job_id: Uuid, sample: Sample) {
        if let Some(state) = self.jobs.get(&job_id) {
            state.lock().window.push(sample);
        }
    }

    #[must_use]
    pub fn current_delay_secs(&self, job_id: Uuid) -> f64 {
        self.jobs
            .get(&job_id)
            .map(|state| state.lock().current_delay_secs)
            .unwrap_or(self.config.delay_floor_secs)
    }

    /// Evaluate the rolling window and decide whether to adjust the job's
    /// adaptive delay and worker target. Returns `Hold` (and leaves state
    /// untouched) until the window has accumulated a full sample set, so
    /// early, noisy observations never trigger a scaling decision.
    pub fn tick(&self, job_id: Uuid, max_target: usize, delay_floor_secs: f64) -> ScaleSignal {
        let Some(state) = self.jobs.get(&job_id) else {
            return ScaleSignal::Hold;
        };
        let mut state = state.lock();

        if !state.window.is_full() {
            return ScaleSignal::Hold;
        }

        let error_rate = state.window.error_rate();
        let avg_response_time_ms = state.window.avg_response_time_ms();
        let drifting_up = state
            .last_avg_response_time_ms
            .is_some_and(|previous| avg_response_time_ms > previous * 1.2);
        state.last_avg_response_time_ms = Some(avg_response_time_ms);

        let floor = delay_floor_secs.max(self.config.delay_floor_secs);

        if error_rate > self.config.error_rate_high || drifting_up {
            state.current_delay_secs =
                (state.current_delay_secs * 1.5 + 0.5).min(self.config.delay_cap_secs).max(floor);
            let downscale_by = (state.current_target / 5).max(1);
            state.current_target = state.current_target.saturating_sub(downscale_by);
            return ScaleSignal::Downscale(downscale_by);
        }

        if error_rate < self.config.error_rate_low {
            state.current_delay_secs = (state.current_delay_secs * 0.9).max(floor);
            if state.current_target < max_target {
                let upscale_by = 1.max(max_target / 10).min(max_target - state.current_target);
                state.current_target += upscale_by;
                return ScaleSignal::Upscale(upscale_by);
            }
        }

        ScaleSignal::Hold
    }
}

/// Owning handle so the Worker Pool can spawn the controller loop and
/// cancel it on `Stop`. `on_signal` is invoked with the job id and signal
/// for every job whose tick produces something other than `Hold`, and is
/// the Worker Pool's hook for resizing (§4.2) without the controller
/// depending on the pool's own types. `on_tick` is invoked after every
/// job's tick regardless of signal, with the job id and the delay the
/// controller is now holding for it — `tick` can lower `current_delay_secs`
/// on a `Hold` outcome (once the target is already at `max_target`), so a
/// callback gated on `on_signal` alone would miss those writes; this is the
/// Worker Pool's hook for persisting `domain.adaptive_delay_secs` (§4.7).
pub fn spawn<F, G>(
    controller: Arc<AdaptiveController>,
    active_jobs: impl Fn() -> Vec<(Uuid, usize, f64)> + Send + 'static,
    on_signal: F,
    on_tick: G,
    tick_interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Uuid, ScaleSignal) + Send + 'static,
    G: Fn(Uuid, f64) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for (job_id, max_target, delay_floor_secs) in active_jobs() {
                        let signal = controller.tick(job_id, max_target, delay_floor_secs);
                        if signal != ScaleSignal::Hold {
                            on_signal(job_id, signal);
                        }
                        on_tick(job_id, controller.current_delay_secs(job_id));
                    }
                }
            }
        }
    })
}
