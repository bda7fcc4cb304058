//! Crate-wide error taxonomy.
//!
//! Every component-facing error enum implements [`Classify`] so that callers
//! at a transaction or worker boundary can bucket a failure into a small,
//! stable set of kinds without parsing message text. This mirrors the
//! `FailureKind` classification used by the crawl engine's retry logic,
//! generalised across all components instead of just HTTP fetches.

use std::fmt;

/// Low-cardinality classification of any failure observed at a component
/// boundary. Counted and displayed without ever parsing free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad input caught before it reaches a worker (URL, config, options).
    Validation,
    /// Connection lost, serialisation conflict, statement timeout. Retried
    /// in place with bounded backoff.
    TransientStore,
    /// Store connection pool usage crossed the high-water threshold.
    PoolSaturation,
    /// Robots-denied or path-filtered; not an error, just a skip reason.
    Filtered,
    /// DNS failure, connection refused, TLS handshake failure.
    Transport,
    /// 5xx status or client timeout from the target site.
    UpstreamServerError,
    /// Cancellation observed mid-operation; state left for recovery.
    Cancelled,
    /// Programming error or unrecoverable store condition.
    Fatal,
}

impl FailureKind {
    /// Whether an operation that failed with this kind should be retried
    /// in place rather than surfaced as terminal.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::TransientStore | FailureKind::PoolSaturation
        )
    }

    /// Stable, low-cardinality reason string for histograms and dashboards.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::TransientStore => "transient_store",
            FailureKind::PoolSaturation => "pool_saturation",
            FailureKind::Filtered => "filtered",
            FailureKind::Transport => "transport",
            FailureKind::UpstreamServerError => "upstream_server_error",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Implemented by every component error enum to expose its [`FailureKind`].
pub trait Classify {
    fn kind(&self) -> FailureKind;

    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Errors from the durable [`crate::store`] / [`crate::queue`] layer.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("store connection error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("pool pressure at or above threshold ({ratio:.2})")]
    PoolSaturated { ratio: f64 },
    #[error("invalid enqueue input: {0}")]
    Validation(String),
}

impl Classify for QueueError {
    fn kind(&self) -> FailureKind {
        match self {
            QueueError::Store(_) => FailureKind::TransientStore,
            QueueError::PoolSaturated { .. } => FailureKind::PoolSaturation,
            QueueError::Validation(_) => FailureKind::Validation,
        }
    }
}

/// Errors from [`crate::fetcher`].
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("upstream returned server error or timed out: {0}")]
    UpstreamServer(#[source] reqwest::Error),
    #[error("request cancelled")]
    Cancelled,
}

impl Classify for FetchError {
    fn kind(&self) -> FailureKind {
        match self {
            FetchError::InvalidUrl(_) => FailureKind::Validation,
            FetchError::Transport(_) => FailureKind::Transport,
            FetchError::UpstreamServer(_) => FailureKind::UpstreamServerError,
            FetchError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Errors from [`crate::job_manager`].
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("robots.txt unreachable for manually started job: {0}")]
    RobotsUnreachable(String),
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error("job {0} is not in a restartable state")]
    NotRestartable(uuid::Uuid),
}

impl Classify for JobError {
    fn kind(&self) -> FailureKind {
        match self {
            JobError::Store(_) => FailureKind::TransientStore,
            JobError::RobotsUnreachable(_) | JobError::InvalidDomain(_) => {
                FailureKind::Validation
            }
            JobError::NotRestartable(_) => FailureKind::Validation,
        }
    }
}

/// Errors from [`crate::robots`].
#[derive(Debug, thiserror::Error)]
pub enum RobotsError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] reqwest::Error),
    #[error("robots.txt body exceeded the parse size limit")]
    TooLarge,
}

impl Classify for RobotsError {
    fn kind(&self) -> FailureKind {
        match self {
            RobotsError::Fetch(_) => FailureKind::Transport,
            RobotsError::TooLarge => FailureKind::Validation,
        }
    }
}

/// Errors from [`crate::sitemap`].
#[derive(Debug, thiserror::Error)]
pub enum SitemapError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] reqwest::Error),
    #[error("failed to parse sitemap XML: {0}")]
    Parse(String),
    #[error("sitemap index recursion exceeded the depth bound")]
    TooDeep,
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

impl Classify for SitemapError {
    fn kind(&self) -> FailureKind {
        match self {
            SitemapError::Fetch(_) => FailureKind::Transport,
            SitemapError::Parse(_) | SitemapError::Decompress(_) => FailureKind::Validation,
            SitemapError::TooDeep => FailureKind::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec_taxonomy() {
        assert!(FailureKind::TransientStore.is_retryable());
        assert!(FailureKind::PoolSaturation.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
        assert!(!FailureKind::Fatal.is_retryable());
    }

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(FailureKind::UpstreamServerError.reason(), "upstream_server_error");
        assert_eq!(FailureKind::Filtered.reason(), "filtered");
    }
}
