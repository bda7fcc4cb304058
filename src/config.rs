//! Crate-wide configuration.
//!
//! Generalises the crawl engine's `CrawlConfig` (concrete defaults, builder
//! methods, no panicking `Option`-typed knobs) to the environment-variable
//! list in the specification's external interfaces section.

use serde::{Deserialize, Serialize};

/// All tunables recognised by the core, with concrete defaults for every
/// knob so the crate never needs to guess at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store connection DSN. Statement and idle-in-transaction timeouts are
    /// appended if the caller didn't already specify them.
    pub database_url: String,

    pub worker_pool: WorkerPoolConfig,
    pub pool: PoolConfig,
    pub fetcher: FetcherConfig,
    pub recovery: RecoveryConfig,
    pub adaptive: AdaptiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub initial: usize,
    pub max: usize,
    pub per_job_cap: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            initial: 5,
            max: 50,
            per_job_cap: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_open: u32,
    pub max_idle: u32,
    pub conn_max_lifetime_secs: u64,
    pub conn_max_idle_time_secs: u64,
    /// Fraction of `max_open` in use at which `PoolPressure` reports
    /// saturation and callers should start backing off.
    pub pressure_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 25,
            max_idle: 10,
            conn_max_lifetime_secs: 30 * 60,
            conn_max_idle_time_secs: 5 * 60,
            pressure_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub max_links_per_page: usize,
    pub max_body_bytes: usize,
    pub second_fetch_enabled: bool,
    /// Delay before the post-warm measurement GET, in milliseconds.
    pub second_fetch_delay_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "BlueBandedBee/1.0 (+https://github.com/Harvey-AU/blue-banded-bee)"
                .to_string(),
            request_timeout_secs: 30,
            max_links_per_page: 500,
            max_body_bytes: 10 * 1024 * 1024,
            second_fetch_enabled: true,
            second_fetch_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 5 * 60,
            sweep_interval_secs: 60,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub window: usize,
    pub error_rate_high: f64,
    pub error_rate_low: f64,
    pub delay_floor_secs: f64,
    pub delay_cap_secs: f64,
    pub tick_interval_secs: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window: 50,
            error_rate_high: 0.2,
            error_rate_low: 0.02,
            delay_floor_secs: 0.0,
            delay_cap_secs: 30.0,
            tick_interval_secs: 15,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/blue_banded_bee".to_string(),
            worker_pool: WorkerPoolConfig::default(),
            pool: PoolConfig::default(),
            fetcher: FetcherConfig::default(),
            recovery: RecoveryConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// documented default for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        macro_rules! env_num {
            ($var:expr, $target:expr) => {
                if let Ok(raw) = std::env::var($var) {
                    if let Ok(parsed) = raw.parse() {
                        $target = parsed;
                    } else {
                        log::warn!("ignoring unparsable {}={raw:?}", $var);
                    }
                }
            };
        }

        env_num!("WORKER_POOL_INITIAL", config.worker_pool.initial);
        env_num!("WORKER_POOL_MAX", config.worker_pool.max);
        env_num!("WORKER_POOL_PER_JOB_CAP", config.worker_pool.per_job_cap);

        env_num!("POOL_MAX_OPEN", config.pool.max_open);
        env_num!("POOL_MAX_IDLE", config.pool.max_idle);
        env_num!("POOL_CONN_MAX_LIFETIME_SECS", config.pool.conn_max_lifetime_secs);
        env_num!("POOL_CONN_MAX_IDLE_TIME_SECS", config.pool.conn_max_idle_time_secs);

        if let Ok(ua) = std::env::var("FETCHER_USER_AGENT") {
            config.fetcher.user_agent = ua;
        }
        env_num!("FETCHER_REQUEST_TIMEOUT_SECS", config.fetcher.request_timeout_secs);
        env_num!("FETCHER_MAX_LINKS_PER_PAGE", config.fetcher.max_links_per_page);
        if let Ok(raw) = std::env::var("FETCHER_SECOND_FETCH_ENABLED") {
            config.fetcher.second_fetch_enabled = raw == "1" || raw.eq_ignore_ascii_case("true");
        }

        env_num!("RECOVERY_STALE_AFTER_SECS", config.recovery.stale_after_secs);
        env_num!("RECOVERY_SWEEP_INTERVAL_SECS", config.recovery.sweep_interval_secs);

        env_num!("ADAPTIVE_WINDOW", config.adaptive.window);
        env_num!("ADAPTIVE_ERROR_RATE_HIGH", config.adaptive.error_rate_high);
        env_num!("ADAPTIVE_ERROR_RATE_LOW", config.adaptive.error_rate_low);
        env_num!("ADAPTIVE_DELAY_FLOOR_SECS", config.adaptive.delay_floor_secs);
        env_num!("ADAPTIVE_DELAY_CAP_SECS", config.adaptive.delay_cap_secs);

        config
    }

    /// `database_url` with `statement_timeout`/`idle_in_transaction_session_timeout`
    /// appended as connection options if the caller didn't set them.
    #[must_use]
    pub fn database_url_with_timeouts(&self) -> String {
        let mut url = self.database_url.clone();
        let separator = if url.contains('?') { '&' } else { '?' };
        let mut appended = String::new();
        if !url.contains("statement_timeout") {
            appended.push_str("options=-c%20statement_timeout%3D30000");
        }
        if !url.contains("idle_in_transaction_session_timeout") {
            if !appended.is_empty() {
                appended.push(' ');
            }
            appended.push_str("-c%20idle_in_transaction_session_timeout%3D60000");
        }
        if !appended.is_empty() {
            url.push(separator);
            url.push_str(&appended);
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.worker_pool.max, 50);
        assert_eq!(config.pool.max_open, 25);
        assert!(config.fetcher.second_fetch_enabled);
    }

    #[test]
    fn database_url_gains_timeout_options_once() {
        let mut config = Config::default();
        config.database_url = "postgres://localhost/test".to_string();
        let url = config.database_url_with_timeouts();
        assert!(url.contains("statement_timeout"));
        assert!(url.contains("idle_in_transaction_session_timeout"));
    }
}
