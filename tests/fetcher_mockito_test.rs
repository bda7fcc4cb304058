//! HTTP-level Fetcher tests against a local mock server, in the donor's
//! `mockito`-backed integration-test style rather than hitting the network.

use blue_banded_bee::config::FetcherConfig;
use blue_banded_bee::fetcher::Fetcher;
use blue_banded_bee::imurl::ImUrl;
use blue_banded_bee::store::schema::CacheStatus;

fn fetcher() -> Fetcher {
    let mut config = FetcherConfig::default();
    config.second_fetch_enabled = false;
    Fetcher::new(config).expect("fetcher builds with a valid user agent")
}

#[tokio::test]
async fn warm_records_status_and_cache_hit() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("cf-cache-status", "HIT")
        .with_body("<html><body>ok</body></html>")
        .create_async()
        .await;

    let url = ImUrl::canonicalize(&server.url()).unwrap();
    let outcome = fetcher().warm(&url, false, None).await.unwrap();

    mock.assert_async().await;
    assert_eq!(outcome.status_code, 200);
    assert_eq!(outcome.cache_status, CacheStatus::Hit);
    assert!(outcome.discovered_links.is_empty());
}

#[tokio::test]
async fn warm_treats_5xx_as_empty_body_no_panic() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/broken")
        .with_status(503)
        .with_header("content-type", "text/html")
        .with_body("<html>should not be read</html>")
        .create_async()
        .await;

    let url = ImUrl::canonicalize(&format!("{}/broken", server.url())).unwrap();
    let outcome = fetcher().warm(&url, true, None).await.unwrap();

    mock.assert_async().await;
    assert_eq!(outcome.status_code, 503);
    assert!(outcome.discovered_links.is_empty());
}

#[tokio::test]
async fn warm_extracts_links_on_html_response() {
    use blue_banded_bee::discovery::DiscoveryFilter;
    use blue_banded_bee::robots::RobotsRuleset;

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/page")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><a href="/next">next</a></body></html>"#)
        .create_async()
        .await;

    let url = ImUrl::canonicalize(&format!("{}/page", server.url())).unwrap();
    let host = url.host_for_scoping().unwrap().to_string();
    let robots = RobotsRuleset::permissive("bbbee");
    let filter = DiscoveryFilter {
        job_host: &host,
        include_paths: &[],
        exclude_paths: &[],
        robots: &robots,
    };

    let outcome = fetcher().warm(&url, true, Some(&filter)).await.unwrap();

    mock.assert_async().await;
    assert_eq!(outcome.discovered_links.len(), 1);
    assert_eq!(outcome.discovered_links[0].path(), "/next");
}
