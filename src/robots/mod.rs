//! Robots Cache (spec §4.1 component 2, §6 Robots.txt): per-job, per-host
//! parsed robots.txt rules with crawl-delay, consulted before every enqueue
//! and fetch.
//!
//! Allow/disallow matching is delegated to the `robotstxt` crate (a Rust
//! port of Google's reference robots.txt parser); `Crawl-delay` is a
//! non-standard directive that reference parser deliberately ignores, so
//! this module extracts it itself with a small per-group scan, the way a
//! hand-rolled politeness layer would on top of a spec-strict matcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use robotstxt::DefaultMatcher;
use uuid::Uuid;

use crate::error::RobotsError;

const MAX_ROBOTS_BYTES: usize = 512 * 1024;

/// Immutable, parsed robots.txt policy for one host, scoped to the life of
/// a job per §3's `RobotsRuleset` entity.
#[derive(Debug, Clone)]
pub struct RobotsRuleset {
    body: Arc<String>,
    user_agent: String,
    crawl_delay: Option<f64>,
}

impl RobotsRuleset {
    /// A permissive ruleset used when no robots.txt could be fetched for a
    /// link-discovery follow-up (§6: "failure is treated as no rules").
    #[must_use]
    pub fn permissive(user_agent: &str) -> Self {
        Self {
            body: Arc::new(String::new()),
            user_agent: user_agent.to_string(),
            crawl_delay: None,
        }
    }

    #[must_use]
    pub fn parse(body: String, user_agent: &str) -> Self {
        let crawl_delay = extract_crawl_delay(&body, user_agent);
        Self {
            body: Arc::new(body),
            user_agent: user_agent.to_string(),
            crawl_delay,
        }
    }

    /// Whether `path` may be fetched under this ruleset.
    #[must_use]
    pub fn is_allowed(&self, url: &str) -> bool {
        if self.body.is_empty() {
            return true;
        }
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.body, &self.user_agent, url)
    }

    /// `Crawl-delay` declared for this user-agent's group, if any. The
    /// Adaptive Controller takes the maximum of this and its own computed
    /// delay (§6).
    #[must_use]
    pub fn crawl_delay(&self) -> Option<f64> {
        self.crawl_delay
    }
}

/// Extract the `Crawl-delay` directive scoped to the matching user-agent
/// group (falls back to a wildcard `*` group), matching the convention
/// that crawl-delay applies to the first group whose `User-agent` matches.
fn extract_crawl_delay(body: &str, user_agent: &str) -> Option<f64> {
    let mut delay_by_agent: HashMap<String, f64> = HashMap::new();
    let mut current_agents: Vec<String> = Vec::new();
    let mut group_has_directive = false;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((directive, value)) = line.split_once(':') else {
            continue;
        };
        let directive = directive.trim().to_ascii_lowercase();
        let value = value.trim();

        match directive.as_str() {
            "user-agent" => {
                if group_has_directive {
                    current_agents.clear();
                    group_has_directive = false;
                }
                current_agents.push(value.to_ascii_lowercase());
            }
            "crawl-delay" => {
                group_has_directive = true;
                if let Ok(secs) = value.parse::<f64>() {
                    for agent in &current_agents {
                        delay_by_agent.entry(agent.clone()).or_insert(secs);
                    }
                }
            }
            _ => {
                group_has_directive = true;
            }
        }
    }

    let ua_lower = user_agent.to_ascii_lowercase();
    delay_by_agent
        .iter()
        .find(|(agent, _)| agent.as_str() != "*" && ua_lower.contains(agent.as_str()))
        .or_else(|| delay_by_agent.iter().find(|(agent, _)| agent.as_str() == "*"))
        .map(|(_, secs)| *secs)
}

/// Fetch `scheme://host/robots.txt` with a short timeout (§6).
pub async fn fetch(
    client: &reqwest::Client,
    scheme: &str,
    host: &str,
    timeout: Duration,
) -> Result<String, RobotsError> {
    let url = format!("{scheme}://{host}/robots.txt");
    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(RobotsError::Fetch)?;

    if !response.status().is_success() {
        return Ok(String::new());
    }

    let bytes = response.bytes().await.map_err(RobotsError::Fetch)?;
    if bytes.len() > MAX_ROBOTS_BYTES {
        return Err(RobotsError::TooLarge);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Per-job cache of resolved rulesets, keyed by job id: the ruleset is
/// fetched once at job start and read without synchronisation afterwards
/// (§5: "read-mostly, written once at job start").
#[derive(Debug, Default)]
pub struct RobotsCache {
    per_job: DashMap<Uuid, Arc<RobotsRuleset>>,
}

impl RobotsCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_id: Uuid, ruleset: RobotsRuleset) -> Arc<RobotsRuleset> {
        let ruleset = Arc::new(ruleset);
        self.per_job.insert(job_id, ruleset.clone());
        ruleset
    }

    #[must_use]
    pub fn get(&self, job_id: Uuid) -> Option<Arc<RobotsRuleset>> {
        self.per_job.get(&job_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, job_id: Uuid) {
        self.per_job.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "User-agent: *\nDisallow: /private/\nCrawl-delay: 2\n\nUser-agent: BlueBandedBee\nDisallow: /no-bbbee/\nCrawl-delay: 5\n";

    #[test]
    fn disallowed_path_is_rejected() {
        let rules = RobotsRuleset::parse(SAMPLE.to_string(), "BlueBandedBee/1.0");
        assert!(!rules.is_allowed("https://example.com/private/x"));
        assert!(rules.is_allowed("https://example.com/public"));
    }

    #[test]
    fn permissive_ruleset_allows_everything() {
        let rules = RobotsRuleset::permissive("BlueBandedBee/1.0");
        assert!(rules.is_allowed("https://example.com/anything"));
        assert_eq!(rules.crawl_delay(), None);
    }

    #[test]
    fn crawl_delay_prefers_matching_group() {
        let rules = RobotsRuleset::parse(SAMPLE.to_string(), "BlueBandedBee/1.0");
        assert_eq!(rules.crawl_delay(), Some(5.0));
    }

    #[test]
    fn crawl_delay_falls_back_to_wildcard() {
        let rules = RobotsRuleset::parse(SAMPLE.to_string(), "SomeOtherBot/2.0");
        assert_eq!(rules.crawl_delay(), Some(2.0));
    }

    #[test]
    fn cache_round_trips_by_job_id() {
        let cache = RobotsCache::new();
        let job_id = Uuid::new_v4();
        assert!(cache.get(job_id).is_none());
        cache.insert(job_id, RobotsRuleset::permissive("BlueBandedBee/1.0"));
        assert!(cache.get(job_id).is_some());
        cache.remove(job_id);
        assert!(cache.get(job_id).is_none());
    }
}
