//! Router-level tests: envelope shape, input validation, and the
//! progress/result surface.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt as _;
use novelforge::adapter::AdapterSet;
use novelforge::aggregate::Aggregator;
use novelforge::app::http::{AppState, router};
use novelforge::app::registry::TaskRegistry;
use novelforge::cache::Cache;
use novelforge::config::Config;
use novelforge::http::HttpClient;
use novelforge::rules::{Rule, RuleSet};
use serde_json::{Value, json};
use tower::ServiceExt as _;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(dir: &Path) -> Config {
    Config {
        rules_dir: dir.join("rules"),
        download_dir: dir.join("downloads"),
        cache_dir: dir.join("cache"),
        search_timeout: Duration::from_millis(800),
        search_deadline: Duration::from_secs(3),
        chapter_retry_times: 2,
        chapter_retry_base: Duration::from_millis(10),
        batch_sleep_min: Duration::from_millis(1),
        batch_sleep_max: Duration::from_millis(2),
        min_chapter_len: 10,
        ..Config::default()
    }
}

fn build_state(base: &str) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(dir.path()));

    let rule = Rule::normalize(json!({
        "id": 1,
        "name": "测试源",
        "url": base,
        "search": {
            "url": format!("{base}/search?q={{keyword}}"),
            "list": ".results .result",
            "name": "h3 a",
            "author": ".author"
        },
        "book": {
            "name": "#book-title",
            "author": "#book-author"
        },
        "toc": {
            "list": "#list dd a"
        },
        "chapter": {
            "content": "#content"
        }
    }))
    .expect("rule");
    let rules = Arc::new(RuleSet::new(vec![rule]));

    let http = Arc::new(HttpClient::new(config.max_concurrent_requests).expect("http client"));
    let cache = Arc::new(Cache::new(dir.path().join("cache"), 64));
    let adapters = Arc::new(AdapterSet::new(
        &rules,
        http,
        Arc::clone(&cache),
        Arc::clone(&config),
    ));
    let aggregator = Arc::new(Aggregator::new(
        adapters.enabled(),
        config.search_timeout,
        config.search_deadline,
    ));
    let registry = Arc::new(TaskRegistry::new(
        Arc::clone(&adapters),
        Arc::clone(&config),
        2,
    ));

    (
        AppState {
            rules,
            adapters,
            aggregator,
            registry,
            cache,
            config,
        },
        dir,
    )
}

async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let value: Value = serde_json::from_slice(&bytes).expect("json body");
    (status, value)
}

#[tokio::test]
async fn empty_keyword_is_a_400_envelope() {
    let server = MockServer::start().await;
    let (state, _dir) = build_state(&server.uri());

    let (status, body) = get_json(state, "/search?keyword=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
    assert!(!body["message"].as_str().unwrap_or("").is_empty());
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn max_results_below_one_is_rejected() {
    let server = MockServer::start().await;
    let (state, _dir) = build_state(&server.uri());

    let (status, body) = get_json(state, "/search?keyword=abc&maxResults=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn search_envelope_carries_meta() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><div class="results">
<div class="result"><h3><a href="/book/1.html">测试小说</a></h3><span class="author">作者甲</span></div>
</div></body></html>"#,
        ))
        .mount(&server)
        .await;
    let (state, _dir) = build_state(&server.uri());

    let (status, body) = get_json(state, "/search?keyword=%E6%B5%8B%E8%AF%95%E5%B0%8F%E8%AF%B4").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
    assert!(body["meta"]["durationMs"].is_number());
    assert_eq!(body["meta"]["totalResults"], 1);
    assert_eq!(body["meta"]["cached"], false);
    assert_eq!(body["data"][0]["title"], "测试小说");
    assert_eq!(body["data"][0]["sourceId"], 1);
}

#[tokio::test]
async fn toc_endpoint_normalizes_and_reports_count() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/book/1.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<html><body>
<h1 id="book-title">测试小说</h1><span id="book-author">作者甲</span>
<div id="list">
<dd><a href="{base}/c/1.html">第一章 开端</a></dd>
<dd><a href="{base}/c/2.html">第二章 发展</a></dd>
<dd><a href="{base}/c/1.html">第一章 开端</a></dd>
<dd><a href="{base}/c/next.html">下一页</a></dd>
</div>
</body></html>"#
        )))
        .mount(&server)
        .await;
    let (state, _dir) = build_state(&server.uri());

    let encoded_url = format!("{}/book/1.html", server.uri()).replace(':', "%3A").replace('/', "%2F");
    let (status, body) = get_json(state, &format!("/toc?url={encoded_url}&sourceId=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["totalChapters"], 2);
    assert_eq!(body["data"][0]["order"], 1);
    assert_eq!(body["data"][1]["order"], 2);
    assert_eq!(body["data"][0]["title"], "第一章 开端");
}

#[tokio::test]
async fn unknown_source_is_404() {
    let server = MockServer::start().await;
    let (state, _dir) = build_state(&server.uri());

    let (status, body) = get_json(state, "/detail?url=http%3A%2F%2Fx%2Fy&sourceId=42").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn progress_of_unknown_task_is_404() {
    let server = MockServer::start().await;
    let (state, _dir) = build_state(&server.uri());

    let (status, body) = get_json(
        state,
        "/download/progress?task_id=00000000-0000-4000-8000-000000000000",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn malformed_task_id_is_400() {
    let server = MockServer::start().await;
    let (state, _dir) = build_state(&server.uri());

    let (status, body) = get_json(state, "/download/result?task_id=not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn result_while_running_reports_progress_percentage() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/book/1.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<html><body>
<h1 id="book-title">慢书</h1><span id="book-author">作者乙</span>
<div id="list"><dd><a href="{base}/c/1.html">第一章</a></dd></div>
</body></html>"#
        )))
        .mount(&server)
        .await;
    // The chapter hangs long enough for us to observe the running state.
    Mock::given(method("GET"))
        .and(path("/c/1.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(20))
                .set_body_string("<div id=\"content\"><p>内容内容内容内容</p></div>"),
        )
        .mount(&server)
        .await;

    let (state, _dir) = build_state(&server.uri());
    let registry = Arc::clone(&state.registry);
    let task_id = registry
        .submit(
            &format!("{}/book/1.html", server.uri()),
            1,
            novelforge::assemble::OutputFormat::Txt,
        )
        .unwrap();

    // Give the worker a moment to leave Pending.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, body) = get_json(state, &format!("/download/result?task_id={task_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);
    assert_eq!(body["data"]["status"], "running");
    let pct = body["data"]["progress_percentage"].as_u64().unwrap_or(100);
    assert!(pct < 100);

    registry.cancel(task_id);
}

#[tokio::test]
async fn download_start_returns_202_with_task_id() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/book/1.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<html><body>
<h1 id="book-title">小书</h1><span id="book-author">作者丙</span>
<div id="list"><dd><a href="{base}/c/1.html">第一章</a></dd></div>
</body></html>"#
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/c/1.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<div id=\"content\"><p>正文正文正文正文正文</p></div>"),
        )
        .mount(&server)
        .await;

    let (state, _dir) = build_state(&server.uri());
    let request = Request::builder()
        .method("POST")
        .uri("/download/start")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "url": format!("{}/book/1.html", server.uri()),
                "sourceId": 1,
                "format": "txt"
            })
            .to_string(),
        ))
        .expect("request");

    let response = router(state).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["code"], 202);
    assert!(body["data"]["task_id"].is_string());
}

#[tokio::test]
async fn invalid_format_is_rejected() {
    let server = MockServer::start().await;
    let (state, _dir) = build_state(&server.uri());

    let request = Request::builder()
        .method("POST")
        .uri("/download/start")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"url": "http://x/y", "sourceId": 1, "format": "pdf"}).to_string(),
        ))
        .expect("request");
    let response = router(state).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_sources_and_cache_clear() {
    let server = MockServer::start().await;
    let (state, _dir) = build_state(&server.uri());

    let (status, body) = get_json(state.clone(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["metrics"]["sources_enabled"], 1);
    assert!(body["data"]["health_score"].as_u64().unwrap_or(0) > 0);

    let (status, body) = get_json(state.clone(), "/sources").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["data"][0]["id"], 1);
    assert_eq!(body["data"][0]["name"], "测试源");

    let request = Request::builder()
        .method("POST")
        .uri("/cache/clear")
        .body(Body::empty())
        .expect("request");
    let response = router(state).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}
