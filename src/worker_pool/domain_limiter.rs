//! Per-domain concurrency limiter (ambient worker-pool plumbing).
//!
//! Generalises the crawl engine's `DomainLimiter`: each domain gets its own
//! semaphore so the pool never hammers one host regardless of how many
//! workers are globally available. Holding a permit is separate from the
//! per-domain politeness sleep in §4.2 step 3 — this bounds concurrency,
//! [`crate::adaptive`] bounds rate.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct DomainLimiter {
    domain_semaphores: DashMap<String, Arc<Semaphore>>,
    max_per_domain: usize,
}

impl DomainLimiter {
    #[must_use]
    pub fn new(max_per_domain: usize) -> Self {
        Self {
            domain_semaphores: DashMap::new(),
            max_per_domain,
        }
    }

    pub async fn acquire(&self, domain: &str) -> OwnedSemaphorePermit {
        loop {
            let semaphore = self
                .domain_semaphores
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_domain)))
                .clone();

            match semaphore.acquire_owned().await {
                Ok(permit) => return permit,
                Err(_closed) => {
                    log::error!("semaphore for domain '{domain}' closed unexpectedly; replacing");
                    self.domain_semaphores
                        .insert(domain.to_string(), Arc::new(Semaphore::new(self.max_per_domain)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limits_concurrent_permits_per_domain() {
        let limiter = DomainLimiter::new(1);
        let _first = limiter.acquire("example.com").await;
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            limiter.acquire("example.com"),
        )
        .await;
        assert!(second.is_err(), "second permit should not be available yet");
    }

    #[tokio::test]
    async fn different_domains_do_not_contend() {
        let limiter = DomainLimiter::new(1);
        let _a = limiter.acquire("a.test").await;
        let b = tokio::time::timeout(std::time::Duration::from_millis(50), limiter.acquire("b.test")).await;
        assert!(b.is_ok());
    }
}
