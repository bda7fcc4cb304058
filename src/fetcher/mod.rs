//! Fetcher (spec §4.5): executes a single URL warming GET and classifies
//! the outcome. Built on `reqwest` (already the donor's HTTP client),
//! generalising its `rustls-tls` feature selection; link extraction is
//! delegated to [`crate::discovery`] instead of the donor's
//! `chromiumoxide` JS-evaluation path, since this Fetcher never renders
//! JavaScript.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::redirect::Policy;

use crate::config::FetcherConfig;
use crate::discovery::{self, DiscoveryFilter};
use crate::error::FetchError;
use crate::imurl::ImUrl;
use crate::store::schema::CacheStatus;

const REDIRECT_LIMIT: usize = 30;

/// Result record for one `Warm` call, per §4.5 step 6.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status_code: u16,
    pub response_time_ms: u64,
    pub cache_status: CacheStatus,
    pub content_type: Option<String>,
    pub second_response_time_ms: Option<u64>,
    pub redirect_url: Option<String>,
    pub discovered_links: Vec<ImUrl>,
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(Policy::limit(REDIRECT_LIMIT))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(FetchError::Transport)?;
        Ok(Self { client, config })
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.config.user_agent
    }

    /// §4.5 `Warm(ctx, url) -> result`.
    ///
    /// `find_links_enabled` and `discovery_filter` are `None` together when
    /// the job has link discovery turned off; when both are `Some`, the
    /// page body is parsed for outbound links on an HTML response.
    pub async fn warm(
        &self,
        url: &ImUrl,
        find_links_enabled: bool,
        discovery_filter: Option<&DiscoveryFilter<'_>>,
    ) -> Result<FetchOutcome, FetchError> {
        let hops = Arc::new(Mutex::new(Vec::new()));
        let outcome = self.get_once(url, &hops).await?;

        let redirect_url = {
            let hops = hops.lock().expect("hops mutex is not poisoned");
            hops.last().cloned()
        };

        let mut second_response_time_ms = None;
        if self.config.second_fetch_enabled
            && matches!(outcome.cache_status, CacheStatus::Miss | CacheStatus::Unknown)
        {
            tokio::time::sleep(Duration::from_millis(self.config.second_fetch_delay_ms)).await;
            let hops = Arc::new(Mutex::new(Vec::new()));
            if let Ok(second) = self.get_once(url, &hops).await {
                second_response_time_ms = Some(second.response_time_ms);
            }
        }

        let discovered_links = if find_links_enabled && outcome.is_html {
            match discovery_filter {
                Some(filter) => discovery::extract_links(&outcome.body, url, filter)
                    .into_iter()
                    .take(self.config.max_links_per_page)
                    .collect(),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        Ok(FetchOutcome {
            status_code: outcome.status_code,
            response_time_ms: outcome.response_time_ms,
            cache_status: outcome.cache_status,
            content_type: outcome.content_type,
            second_response_time_ms,
            redirect_url,
            discovered_links,
        })
    }

    async fn get_once(
        &self,
        url: &ImUrl,
        hops: &Arc<Mutex<Vec<String>>>,
    ) -> Result<RawFetch, FetchError> {
        let started = Instant::now();

        let response = self
            .client
            .get(url.as_str())
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml,*/*;q=0.8")
            .send()
            .await
            .map_err(classify_transport_error)?;

        if response.url().as_str() != url.as_str() {
            hops.lock()
                .expect("hops mutex is not poisoned")
                .push(response.url().as_str().to_string());
        }

        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let cache_status = classify_cache_status(response.headers());
        let is_html = content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("text/html"));

        if (500..600).contains(&status_code) {
            let response_time_ms = started.elapsed().as_millis() as u64;
            return Ok(RawFetch {
                status_code,
                response_time_ms,
                cache_status,
                content_type,
                body: String::new(),
                is_html: false,
            });
        }

        let max_bytes = self.config.max_body_bytes;
        let body = if is_html {
            read_bounded(response, max_bytes).await?
        } else {
            String::new()
        };

        let response_time_ms = started.elapsed().as_millis() as u64;

        Ok(RawFetch {
            status_code,
            response_time_ms,
            cache_status,
            content_type,
            body,
            is_html,
        })
    }
}

struct RawFetch {
    status_code: u16,
    response_time_ms: u64,
    cache_status: CacheStatus,
    content_type: Option<String>,
    body: String,
    is_html: bool,
}

async fn read_bounded(response: reqwest::Response, max_bytes: usize) -> Result<String, FetchError> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Transport)?;
        if buf.len() + chunk.len() > max_bytes {
            buf.extend_from_slice(&chunk[..max_bytes.saturating_sub(buf.len())]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn classify_transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() {
        FetchError::Transport(err)
    } else if err.is_status() {
        FetchError::UpstreamServer(err)
    } else {
        FetchError::Transport(err)
    }
}

/// Normalise a CDN cache-status header into the §4.5 classification.
/// `cf-cache-status` (Cloudflare) is checked first as the canonical
/// example the spec names; a generic `x-cache`/`age` fallback covers other
/// CDNs that don't emit Cloudflare's header.
fn classify_cache_status(headers: &reqwest::header::HeaderMap) -> CacheStatus {
    if let Some(value) = headers
        .get("cf-cache-status")
        .and_then(|v| v.to_str().ok())
    {
        return match value.to_ascii_uppercase().as_str() {
            "HIT" => CacheStatus::Hit,
            "MISS" | "EXPIRED" | "STALE" | "REVALIDATED" => CacheStatus::Miss,
            "BYPASS" => CacheStatus::Bypass,
            "DYNAMIC" => CacheStatus::Dynamic,
            _ => CacheStatus::Unknown,
        };
    }

    if let Some(value) = headers.get("x-cache").and_then(|v| v.to_str().ok()) {
        let upper = value.to_ascii_uppercase();
        if upper.contains("HIT") {
            return CacheStatus::Hit;
        }
        if upper.contains("MISS") {
            return CacheStatus::Miss;
        }
    }

    CacheStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            reqwest::header::HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn classifies_cloudflare_hit() {
        let headers = headers_with("cf-cache-status", "HIT");
        assert_eq!(classify_cache_status(&headers), CacheStatus::Hit);
    }

    #[test]
    fn classifies_cloudflare_expired_as_miss() {
        let headers = headers_with("cf-cache-status", "EXPIRED");
        assert_eq!(classify_cache_status(&headers), CacheStatus::Miss);
    }

    #[test]
    fn falls_back_to_x_cache() {
        let headers = headers_with("x-cache", "HIT from cache");
        assert_eq!(classify_cache_status(&headers), CacheStatus::Hit);
    }

    #[test]
    fn unknown_when_no_cache_headers_present() {
        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(classify_cache_status(&headers), CacheStatus::Unknown);
    }
}
