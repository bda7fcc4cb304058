//! Sitemap Discoverer (spec §4.1 component 3, §6 Sitemaps): finds, parses
//! (including gzip and sitemap indexes), normalises, and filters URLs from
//! a site's sitemap set; falls back to root-page crawl when no sitemap
//! exists. XML parsing via `quick-xml`, the parser used for sitemap/feed
//! work across the retrieval pack.

use std::io::Read;
use std::time::Duration;

use quick_xml::events::Event as XmlEvent;
use quick_xml::reader::Reader;

use crate::error::SitemapError;
use crate::imurl::ImUrl;

const MAX_INDEX_DEPTH: u32 = 5;
const DEFAULT_LOCATIONS: [&str; 2] = ["/sitemap.xml", "/sitemap_index.xml"];

/// One entry discovered from a sitemap, in document order (position
/// determines the decaying priority band per §4.3).
#[derive(Debug, Clone)]
pub struct SitemapUrl {
    pub url: ImUrl,
    pub position: usize,
}

/// Discover and flatten every URL reachable from a host's sitemap set.
///
/// Tries, in order: `/sitemap.xml`, `/sitemap_index.xml`, then any
/// `Sitemap:` locations found in `robots_body`. Returns an empty vec (never
/// an error) when nothing is found, so callers fall back to a root-page
/// link crawl per §4.3's `CreateJob` step 4.
pub async fn discover(
    client: &reqwest::Client,
    scheme: &str,
    host: &str,
    robots_body: &str,
    timeout: Duration,
) -> Result<Vec<SitemapUrl>, SitemapError> {
    let mut locations: Vec<String> = DEFAULT_LOCATIONS
        .iter()
        .map(|path| format!("{scheme}://{host}{path}"))
        .collect();
    locations.extend(sitemap_locations_from_robots(robots_body));

    let mut out = Vec::new();
    for location in locations {
        match fetch_and_parse(client, &location, timeout, 0).await {
            Ok(mut urls) => {
                out.append(&mut urls);
                if !out.is_empty() {
                    break;
                }
            }
            Err(err) => {
                log::debug!("sitemap location {location} unavailable: {err}");
            }
        }
    }

    for (position, entry) in out.iter_mut().enumerate() {
        entry.position = position;
    }

    Ok(out)
}

fn sitemap_locations_from_robots(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let (directive, value) = line.split_once(':')?;
            if directive.trim().eq_ignore_ascii_case("sitemap") {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .collect()
}

fn fetch_and_parse<'a>(
    client: &'a reqwest::Client,
    url: &'a str,
    timeout: Duration,
    depth: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<SitemapUrl>, SitemapError>> + 'a>> {
    Box::pin(async move {
        if depth > MAX_INDEX_DEPTH {
            return Err(SitemapError::TooDeep);
        }

        let response = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(SitemapError::Fetch)?;

        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        let is_gzip = url.ends_with(".gz")
            || response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.contains("gzip"));

        let bytes = response.bytes().await.map_err(SitemapError::Fetch)?;
        let xml = if is_gzip {
            decompress_gzip(&bytes)?
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };

        let parsed = parse_sitemap_xml(&xml)?;
        match parsed {
            ParsedSitemap::UrlSet(urls) => Ok(urls
                .into_iter()
                .enumerate()
                .filter_map(|(position, loc)| ImUrl::canonicalize(&loc).ok().map(|url| SitemapUrl { url, position }))
                .collect()),
            ParsedSitemap::Index(locations) => {
                let mut out = Vec::new();
                for location in locations {
                    out.extend(fetch_and_parse(client, &location, timeout, depth + 1).await?);
                }
                Ok(out)
            }
        }
    })
}

fn decompress_gzip(bytes: &[u8]) -> Result<String, SitemapError> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(SitemapError::Decompress)?;
    Ok(out)
}

enum ParsedSitemap {
    UrlSet(Vec<String>),
    Index(Vec<String>),
}

/// Parse either a `<urlset>` (leaf sitemap) or a `<sitemapindex>` (pointer
/// to further sitemaps) document.
fn parse_sitemap_xml(xml: &str) -> Result<ParsedSitemap, SitemapError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut locs = Vec::new();
    let mut is_index = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(tag)) => {
                let name = tag.local_name();
                let name = name.as_ref();
                if name == b"sitemapindex" {
                    is_index = true;
                } else if name == b"loc" {
                    in_loc = true;
                }
            }
            Ok(XmlEvent::End(tag)) => {
                if tag.local_name().as_ref() == b"loc" {
                    in_loc = false;
                }
            }
            Ok(XmlEvent::Text(text)) => {
                if in_loc {
                    let decoded = text
                        .decode()
                        .map_err(|e| SitemapError::Parse(e.to_string()))?;
                    locs.push(decoded.trim().to_string());
                }
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(SitemapError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(if is_index {
        ParsedSitemap::Index(locs)
    } else {
        ParsedSitemap::UrlSet(locs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_urlset() {
        let xml = r#"<?xml version="1.0"?>
        <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
          <url><loc>https://example.com/</loc></url>
          <url><loc>https://example.com/a</loc></url>
        </urlset>"#;
        match parse_sitemap_xml(xml).unwrap() {
            ParsedSitemap::UrlSet(urls) => {
                assert_eq!(urls, vec!["https://example.com/", "https://example.com/a"]);
            }
            ParsedSitemap::Index(_) => panic!("expected urlset"),
        }
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"<?xml version="1.0"?>
        <sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
          <sitemap><loc>https://example.com/sitemap-a.xml</loc></sitemap>
          <sitemap><loc>https://example.com/sitemap-b.xml</loc></sitemap>
        </sitemapindex>"#;
        match parse_sitemap_xml(xml).unwrap() {
            ParsedSitemap::Index(locs) => assert_eq!(locs.len(), 2),
            ParsedSitemap::UrlSet(_) => panic!("expected index"),
        }
    }

    #[test]
    fn extracts_sitemap_directive_from_robots() {
        let robots = "User-agent: *\nDisallow: /private\nSitemap: https://example.com/sitemap.xml\n";
        let locations = sitemap_locations_from_robots(robots);
        assert_eq!(locations, vec!["https://example.com/sitemap.xml"]);
    }
}
