//! URL Discovery and Link Extraction (spec §4.4): transform a freshly
//! fetched HTML page into a set of normalised, permitted URLs to enqueue.
//!
//! Link extraction is server-side (`scraper`/`html5ever`) rather than the
//! donor's `chromiumoxide` JS-evaluation scripts, since this Fetcher issues
//! a plain HTTP GET and never renders JavaScript (an explicit Non-goal).
//! The CSS-hidden-anchor filter generalises the donor's markdown
//! preprocessor's `HIDDEN_VISIBILITY` regex. Domain scoping generalises the
//! donor crawler's `should_visit_url` exact-host-match policy.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use crate::imurl::ImUrl;
use crate::robots::RobotsRuleset;

static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("'a[href]' is a valid CSS selector"));

/// Matches inline `style` attributes that hide the element via
/// `display:none` or `visibility:hidden`, the same two properties the
/// donor's content-saver hidden-element filter strips.
static HIDDEN_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:display\s*:\s*none|visibility\s*:\s*hidden)")
        .expect("HIDDEN_STYLE: hardcoded regex is valid")
});

/// Policy inputs that gate which discovered URLs get enqueued.
pub struct DiscoveryFilter<'a> {
    pub job_host: &'a str,
    pub include_paths: &'a [String],
    pub exclude_paths: &'a [String],
    pub robots: &'a RobotsRuleset,
}

/// Parse anchor hrefs out of an HTML document, apply every §4.4 filter, and
/// return the deduplicated, normalised, permitted URLs discovered on this
/// page, in document order. The hard per-page cap on extracted links is
/// applied by the Fetcher (§4.5) before this function ever sees the page;
/// this function itself is also safe to call directly in tests against an
/// already-capped link list.
#[must_use]
pub fn extract_links(html: &str, base: &ImUrl, filter: &DiscoveryFilter<'_>) -> Vec<ImUrl> {
    let document = Html::parse_document(html);
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for element in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();

        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let lower = href.to_ascii_lowercase();
        if lower.starts_with("mailto:") || lower.starts_with("tel:") || lower.starts_with("javascript:") {
            continue;
        }

        if let Some(style) = element.value().attr("style") {
            if HIDDEN_STYLE.is_match(style) {
                continue;
            }
        }

        let Some(resolved) = resolve(base, href) else {
            continue;
        };

        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }

        let Ok(normalised) = ImUrl::canonicalize(resolved.as_str()) else {
            continue;
        };

        if !is_in_scope(&normalised, filter) {
            continue;
        }

        if seen.insert(normalised.as_str().to_string()) {
            out.push(normalised);
        }
    }

    out
}

fn resolve(base: &ImUrl, href: &str) -> Option<url::Url> {
    let base_url: &url::Url = base.as_ref();
    base_url.join(href).ok()
}

fn is_in_scope(url: &ImUrl, filter: &DiscoveryFilter<'_>) -> bool {
    if url.host_for_scoping() != Some(filter.job_host) {
        return false;
    }

    if !filter.robots.is_allowed(url.as_str()) {
        return false;
    }

    let path = url.path();

    if !filter.exclude_paths.is_empty()
        && filter.exclude_paths.iter().any(|p| path.starts_with(p.as_str()))
    {
        return false;
    }

    if !filter.include_paths.is_empty()
        && !filter.include_paths.iter().any(|p| path.starts_with(p.as_str()))
    {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter<'a>(host: &'a str, robots: &'a RobotsRuleset) -> DiscoveryFilter<'a> {
        DiscoveryFilter {
            job_host: host,
            include_paths: &[],
            exclude_paths: &[],
            robots,
        }
    }

    #[test]
    fn extracts_and_dedupes_same_host_links() {
        let html = r#"
            <html><body>
                <a href="/a">A</a>
                <a href="/a">A again</a>
                <a href="/b">B</a>
                <a href="mailto:x@y.test">mail</a>
                <a href="#anchor">anchor</a>
                <a href="https://other.test/">external</a>
            </body></html>
        "#;
        let base = ImUrl::canonicalize("https://example.com/").unwrap();
        let robots = RobotsRuleset::permissive("bbbee");
        let filter = filter("example.com", &robots);
        let links = extract_links(html, &base, &filter);
        let paths: Vec<&str> = links.iter().map(|u| u.path()).collect();
        assert_eq!(paths, vec!["/a", "/b"]);
    }

    #[test]
    fn drops_hidden_anchors() {
        let html = r#"<a href="/visible">v</a><a href="/hidden" style="display:none">h</a>"#;
        let base = ImUrl::canonicalize("https://example.com/").unwrap();
        let robots = RobotsRuleset::permissive("bbbee");
        let filter = filter("example.com", &robots);
        let links = extract_links(html, &base, &filter);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].path(), "/visible");
    }

    #[test]
    fn respects_exclude_paths_and_robots() {
        let html = r#"<a href="/private/x">p</a><a href="/ok">ok</a>"#;
        let base = ImUrl::canonicalize("https://example.com/").unwrap();
        let robots = RobotsRuleset::parse(
            "User-agent: *\nDisallow: /private/\n".to_string(),
            "bbbee",
        );
        let filter = filter("example.com", &robots);
        let links = extract_links(html, &base, &filter);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].path(), "/ok");
    }
}
