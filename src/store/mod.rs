//! Durable storage gateway: a single connection-pool owner shared by every
//! component that needs transactional access, generalising the donor
//! `link_index` module's single-manager-over-one-connection pattern up to a
//! bounded pool, as the concurrency model (§5) requires.

pub mod queue;
pub mod schema;

use sqlx::postgres::{PgPoolOptions, PgListener};
use std::time::Duration;

use crate::config::Config;

/// Gateway over the Postgres connection pool. All components acquire
/// connections through this single type so that `pool_pressure()` reflects
/// true contention across the whole process.
#[derive(Clone)]
pub struct Store {
    pool: sqlx::PgPool,
    max_open: u32,
    pressure_threshold: f64,
}

impl Store {
    /// Connect using the crate [`Config`], applying the pool sizing and
    /// statement/idle-in-transaction timeouts it documents.
    pub async fn connect(config: &Config) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool.max_open)
            .min_connections(config.pool.max_idle)
            .max_lifetime(Duration::from_secs(config.pool.conn_max_lifetime_secs))
            .idle_timeout(Duration::from_secs(config.pool.conn_max_idle_time_secs))
            .connect(&config.database_url_with_timeouts())
            .await?;

        Ok(Self {
            pool,
            max_open: config.pool.max_open,
            pressure_threshold: config.pool.pressure_threshold,
        })
    }

    #[must_use]
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    /// Approximate usage ratio of the underlying connection pool, used by
    /// the Task Queue and upstream HTTP-layer code to decide whether to
    /// reject work (§4.1 `PoolPressure`, §5 shared resources).
    #[must_use]
    pub fn pool_pressure(&self) -> f64 {
        let in_use = self.pool.size().saturating_sub(self.pool.num_idle() as u32);
        f64::from(in_use) / f64::from(self.max_open.max(1))
    }

    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.pool_pressure() >= self.pressure_threshold
    }

    /// Open a fresh `LISTEN`/`NOTIFY` subscription on the given channels,
    /// used by the notification-listener activity (§5). Reconnection and
    /// backoff are the caller's responsibility (see [`crate::events`]).
    pub async fn listener(&self, channels: &[&str]) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        for channel in channels {
            listener.listen(channel).await?;
        }
        Ok(listener)
    }

    /// §4.7: persist the Adaptive Controller's current per-domain delay so
    /// it survives a restart and is visible to any other process sharing
    /// this domain row.
    pub async fn update_domain_adaptive_delay(
        &self,
        domain_id: i32,
        delay_secs: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE domain SET adaptive_delay_secs = $1 WHERE id = $2")
            .bind(delay_secs)
            .bind(domain_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
