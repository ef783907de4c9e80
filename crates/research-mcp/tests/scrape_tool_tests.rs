//! scrape_page dispatch tests: SSRF policy, content extraction, caching.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use research_mcp::cache::{CacheConfig, PersistentCache};
use research_mcp::clients::HttpScraper;
use research_mcp::resilience::CircuitBreakerRegistry;
use research_mcp::security::UrlPolicy;
use research_mcp::tools::scrape::ScrapePageTool;
use research_mcp::tools::{Caller, Dispatcher, ResearchTracker, ToolContext};

async fn dispatcher(allow_private: bool, extra_port: Option<u16>) -> Dispatcher {
    let dir = tempfile::tempdir().unwrap();
    let cache = PersistentCache::open(CacheConfig {
        storage_path: dir.path().join("cache"),
        default_ttl: Duration::from_secs(60),
        max_entries: 100,
        max_bytes: 10 * 1024 * 1024,
        namespace_quota: None,
    })
    .await;
    std::mem::forget(dir);

    let mut ports = vec![80, 443];
    ports.extend(extra_port);
    let ctx = Arc::new(ToolContext {
        search: None,
        scraper: Arc::new(HttpScraper::new().unwrap()),
        documents: None,
        transcripts: None,
        url_policy: Arc::new(
            UrlPolicy::new(allow_private, Vec::new()).with_allowed_ports(ports),
        ),
        cache,
        breakers: Arc::new(CircuitBreakerRegistry::default()),
        research: Arc::new(ResearchTracker::new()),
        http: reqwest::Client::new(),
    });

    Dispatcher::new(vec![Arc::new(ScrapePageTool)], ctx)
}

fn port_of(server: &MockServer) -> u16 {
    url::Url::parse(&server.uri()).unwrap().port().unwrap()
}

fn call_params(url: &str) -> serde_json::Value {
    serde_json::json!({"name": "scrape_page", "arguments": {"url": url}})
}

#[tokio::test]
async fn test_metadata_endpoint_rejected_with_rule() {
    let dispatcher = dispatcher(false, None).await;
    let response = dispatcher
        .call_tool(
            Some(serde_json::json!(1)),
            &call_params("http://169.254.169.254/latest/meta-data/"),
            &Caller::default(),
        )
        .await;

    let error = response.error.unwrap();
    let data = error.data.unwrap();
    assert_eq!(data["kind"], "UrlRejected");
    assert_eq!(data["rule"], "metadata-endpoint");
    assert_eq!(data["retryable"], false);
}

#[tokio::test]
async fn test_overlong_url_rejected() {
    let dispatcher = dispatcher(true, None).await;
    let base = "http://example.com/";
    let url = format!("{base}{}", "a".repeat(2049 - base.len()));
    assert_eq!(url.len(), 2049);

    let response = dispatcher
        .call_tool(Some(serde_json::json!(1)), &call_params(&url), &Caller::default())
        .await;

    let error = response.error.unwrap();
    let data = error.data.unwrap();
    assert_eq!(data["kind"], "UrlRejected");
    assert_eq!(data["rule"], "url-too-long");
}

#[tokio::test]
async fn test_scrape_extracts_content_and_citation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"<html><head><title>Widget Benchmarks</title>
               <meta name="description" content="Benchmarks of widgets">
               <script>ignore();</script></head>
               <body><p>Widgets compared in depth. Results follow.</p></body></html>"#,
            "text/html",
        ))
        .mount(&server)
        .await;

    let dispatcher = dispatcher(true, Some(port_of(&server))).await;
    let response = dispatcher
        .call_tool(
            Some(serde_json::json!(1)),
            &call_params(&format!("{}/article", server.uri())),
            &Caller::default(),
        )
        .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    let structured = &response.result.unwrap()["structuredContent"];
    assert_eq!(structured["metadata"]["title"], "Widget Benchmarks");
    assert_eq!(structured["truncated"], false);
    assert!(structured["content"].as_str().unwrap().contains("Widgets compared in depth."));
    assert!(!structured["content"].as_str().unwrap().contains("ignore()"));
    assert_eq!(structured["citation"]["title"], "Widget Benchmarks");
}

#[tokio::test]
async fn test_truncation_at_sentence_boundary() {
    let server = MockServer::start().await;
    let body = format!(
        "<html><body><p>{}</p></body></html>",
        "This is a full sentence. ".repeat(100)
    );
    Mock::given(method("GET"))
        .and(path("/long"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html"))
        .mount(&server)
        .await;

    let dispatcher = dispatcher(true, Some(port_of(&server))).await;
    let params = serde_json::json!({
        "name": "scrape_page",
        "arguments": {"url": format!("{}/long", server.uri()), "max_length": 200}
    });
    let response =
        dispatcher.call_tool(Some(serde_json::json!(1)), &params, &Caller::default()).await;

    let structured = &response.result.unwrap()["structuredContent"];
    assert_eq!(structured["truncated"], true);
    let content = structured["content"].as_str().unwrap();
    assert!(content.len() <= 200);
    assert!(content.ends_with('.'), "cut at a sentence boundary: {content:?}");
    assert!(structured["originalLength"].as_u64().unwrap() > 200);
}

#[tokio::test]
async fn test_repeat_scrape_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cached"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<html><body><p>Cache me once.</p></body></html>", "text/html"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = dispatcher(true, Some(port_of(&server))).await;
    let params = call_params(&format!("{}/cached", server.uri()));

    for id in 1..=2 {
        let response = dispatcher
            .call_tool(Some(serde_json::json!(id)), &params, &Caller::default())
            .await;
        assert!(response.error.is_none());
    }
    // wiremock verifies the expect(1) on drop.
}

#[tokio::test]
async fn test_upstream_500_is_typed_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend exploded"))
        .mount(&server)
        .await;

    let dispatcher = dispatcher(true, Some(port_of(&server))).await;
    let response = dispatcher
        .call_tool(
            Some(serde_json::json!(1)),
            &call_params(&format!("{}/boom", server.uri())),
            &Caller::default(),
        )
        .await;

    let error = response.error.unwrap();
    let data = error.data.unwrap();
    assert_eq!(data["kind"], "UpstreamFailure");
    assert_eq!(data["retryable"], true);
}
