//! Circuit breaker pattern for domain-level failure detection.
//!
//! Generalises the crawl engine's `CircuitBreaker`, tracking domain health
//! across three states:
//! - Closed: normal operation, requests proceed.
//! - Open: too many failures, requests are blocked.
//! - `HalfOpen`: testing after cooldown period.
//!
//! This is ambient worker-pool plumbing, not part of the queue's own
//! retry semantics (§4.1): a domain tripped open here simply isn't offered
//! new claims for that domain until it cools down, independent of how any
//! one task's own failure is recorded.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug, Clone)]
pub struct DomainHealth {
    pub consecutive_failures: u32,
    pub total_attempts: u32,
    pub total_successes: u32,
    pub last_success: Option<Instant>,
    pub last_opened: Option<Instant>,
    pub consecutive_successes_in_halfopen: u32,
    pub state: CircuitState,
}

impl DomainHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            total_attempts: 0,
            total_successes: 0,
            last_success: None,
            last_opened: None,
            consecutive_successes_in_halfopen: 0,
            state: CircuitState::Closed,
        }
    }
}

pub struct CircuitBreaker {
    domains: DashMap<String, DomainHealth>,
    failure_threshold: u32,
    success_threshold: u32,
    half_open_timeout: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, success_threshold: u32, half_open_timeout: Duration) -> Self {
        Self {
            domains: DashMap::new(),
            failure_threshold,
            success_threshold,
            half_open_timeout,
        }
    }

    pub fn should_attempt(&self, domain: &str) -> bool {
        let mut health = self.domains.entry(domain.to_string()).or_insert_with(DomainHealth::new);

        match health.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(opened) = health.last_opened {
                    if opened.elapsed() >= self.half_open_timeout {
                        health.state = CircuitState::HalfOpen;
                        health.consecutive_successes_in_halfopen = 0;
                        info!(
                            "circuit breaker transitioning to half-open for domain {domain} after {:?}",
                            opened.elapsed()
                        );
                        return true;
                    }
                } else {
                    debug!("circuit breaker open with no timestamp for domain {domain}, staying open");
                }
                false
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self, domain: &str) {
        if let Some(mut health) = self.domains.get_mut(domain) {
            health.consecutive_failures = 0;
            health.total_successes += 1;
            health.total_attempts += 1;
            health.last_success = Some(Instant::now());

            if health.state == CircuitState::HalfOpen {
                health.consecutive_successes_in_halfopen += 1;
                if health.consecutive_successes_in_halfopen >= self.success_threshold {
                    health.state = CircuitState::Closed;
                    info!("circuit breaker closed for domain {domain}");
                }
            }
        }
    }

    pub fn record_failure(&self, domain: &str, error: &str) {
        let mut health = self.domains.entry(domain.to_string()).or_insert_with(DomainHealth::new);
        health.consecutive_failures += 1;
        health.total_attempts += 1;

        if health.consecutive_failures >= self.failure_threshold && health.state != CircuitState::Open {
            health.state = CircuitState::Open;
            health.last_opened = Some(Instant::now());
            health.consecutive_successes_in_halfopen = 0;
            warn!(
                "circuit breaker open for domain {domain} after {} consecutive failures: {error}",
                health.consecutive_failures
            );
        } else if health.state != CircuitState::Open {
            debug!(
                "circuit breaker failure for domain {domain} ({}/{}): {error}",
                health.consecutive_failures, self.failure_threshold
            );
        }
    }

    #[must_use]
    pub fn get_health(&self, domain: &str) -> Option<DomainHealth> {
        self.domains.get(domain).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn get_open_domains(&self) -> Vec<String> {
        self.domains
            .iter()
            .filter(|entry| entry.value().state == CircuitState::Open)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_state_allows_and_records_success() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_secs(60));
        assert!(cb.should_attempt("example.com"));
        cb.record_success("example.com");
        let health = cb.get_health("example.com").unwrap();
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(health.total_successes, 1);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_secs(60));
        cb.record_failure("example.com", "err");
        cb.record_failure("example.com", "err");
        cb.record_failure("example.com", "err");
        assert_eq!(cb.get_health("example.com").unwrap().state, CircuitState::Open);
        assert!(!cb.should_attempt("example.com"));
    }

    #[test]
    fn half_opens_after_timeout() {
        let cb = CircuitBreaker::new(2, 1, Duration::from_millis(50));
        cb.record_failure("example.com", "err");
        cb.record_failure("example.com", "err");
        std::thread::sleep(Duration::from_millis(80));
        assert!(cb.should_attempt("example.com"));
        assert_eq!(cb.get_health("example.com").unwrap().state, CircuitState::HalfOpen);
    }
}
