//! The REST façade: axum handlers over the engine, all wrapped in one
//! `{code, message, data, meta}` envelope. Handlers validate input, map
//! error kinds to envelope codes, and never leak stack traces.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::adapter::AdapterSet;
use crate::aggregate::Aggregator;
use crate::app::registry::{ArtifactHandle, TaskPoll, TaskRegistry};
use crate::assemble::OutputFormat;
use crate::cache::Cache;
use crate::config::Config;
use crate::error::Error;
use crate::rules::RuleSet;
use crate::toc;

#[derive(Clone)]
pub struct AppState {
    pub rules: Arc<RuleSet>,
    pub adapters: Arc<AdapterSet>,
    pub aggregator: Arc<Aggregator>,
    pub registry: Arc<TaskRegistry>,
    pub cache: Arc<Cache>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/search", get(search))
        .route("/detail", get(detail))
        .route("/toc", get(toc_list))
        .route("/download", get(download_sync))
        .route("/download/start", post(download_start))
        .route("/download/progress", get(download_progress))
        .route("/download/result", get(download_result))
        .route("/sources", get(sources))
        .route("/health", get(health))
        .route("/cache/clear", post(cache_clear))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Envelope {
    code: u16,
    message: String,
    data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<serde_json::Value>,
}

fn ok(data: serde_json::Value, meta: Option<serde_json::Value>) -> Response {
    (
        StatusCode::OK,
        Json(Envelope {
            code: 200,
            message: "success".to_string(),
            data,
            meta,
        }),
    )
        .into_response()
}

fn fail(err: &Error) -> Response {
    let code = err.http_code();
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(Envelope {
            code,
            message: err.to_string(),
            data: serde_json::Value::Null,
            meta: None,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    keyword: Option<String>,
    #[serde(rename = "maxResults")]
    max_results: Option<i64>,
}

async fn search(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> Response {
    let started = Instant::now();

    let keyword = match query.keyword.as_deref().map(str::trim) {
        Some(keyword) if !keyword.is_empty() => keyword.to_string(),
        _ => return fail(&Error::input("keyword is required")),
    };
    let max_results = match query.max_results {
        None => state.config.default_max_results,
        Some(n) if n < 1 => {
            return fail(&Error::input("maxResults must be at least 1"));
        }
        // Above the limit we clamp instead of rejecting.
        Some(n) => (n as usize).min(state.config.max_results_limit),
    };

    let outcome = state.aggregator.search_all(&keyword, max_results).await;
    let meta = json!({
        "durationMs": started.elapsed().as_millis() as u64,
        "cached": outcome.cached,
        "totalResults": outcome.hits.len(),
        "failedSources": outcome.failures,
    });
    ok(json!(outcome.hits), Some(meta))
}

#[derive(Debug, Deserialize)]
struct SourcedUrlQuery {
    url: Option<String>,
    #[serde(rename = "sourceId")]
    source_id: Option<u32>,
}

impl SourcedUrlQuery {
    fn parse(self) -> Result<(String, u32), Error> {
        let url = match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return Err(Error::input("url is required")),
        };
        let source_id = self
            .source_id
            .ok_or_else(|| Error::input("sourceId is required"))?;
        Ok((url, source_id))
    }
}

async fn detail(State(state): State<AppState>, Query(query): Query<SourcedUrlQuery>) -> Response {
    let started = Instant::now();
    let (url, source_id) = match query.parse() {
        Ok(parsed) => parsed,
        Err(err) => return fail(&err),
    };
    let adapter = match state.adapters.get(source_id) {
        Ok(adapter) => adapter,
        Err(err) => return fail(&err),
    };
    match adapter.detail(&url).await {
        Ok(detail) => ok(
            json!(detail),
            Some(json!({
                "durationMs": started.elapsed().as_millis() as u64,
                "sourceId": source_id,
            })),
        ),
        Err(err) => fail(&err),
    }
}

async fn toc_list(State(state): State<AppState>, Query(query): Query<SourcedUrlQuery>) -> Response {
    let started = Instant::now();
    let (url, source_id) = match query.parse() {
        Ok(parsed) => parsed,
        Err(err) => return fail(&err),
    };
    let adapter = match state.adapters.get(source_id) {
        Ok(adapter) => adapter,
        Err(err) => return fail(&err),
    };
    let raw = match adapter.toc(&url).await {
        Ok(raw) => raw,
        Err(err) => return fail(&err),
    };
    let chapters = toc::normalize(raw);
    if chapters.is_empty() {
        return fail(&Error::parse("toc has no valid chapters"));
    }
    let meta = json!({
        "durationMs": started.elapsed().as_millis() as u64,
        "totalChapters": chapters.len(),
    });
    ok(json!(chapters), Some(meta))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    #[serde(rename = "sourceId")]
    source_id: Option<u32>,
    format: Option<String>,
}

/// Synchronous download: submit, wait for the worker, stream the artifact.
async fn download_sync(State(state): State<AppState>, Query(query): Query<DownloadQuery>) -> Response {
    let started = Instant::now();
    let (url, source_id) = match (SourcedUrlQuery {
        url: query.url,
        source_id: query.source_id,
    })
    .parse()
    {
        Ok(parsed) => parsed,
        Err(err) => return fail(&err),
    };
    let format = match OutputFormat::parse(query.format.as_deref().unwrap_or("txt")) {
        Ok(format) => format,
        Err(err) => return fail(&err),
    };

    let task_id = match state.registry.submit(&url, source_id, format) {
        Ok(task_id) => task_id,
        Err(err) => return fail(&err),
    };
    if let Err(err) = state.registry.wait_terminal(task_id).await {
        return fail(&err);
    }
    match state.registry.result(task_id).await {
        TaskPoll::Ready(handle) => artifact_response(handle, started, task_id).await,
        TaskPoll::Failed { reason } => fail(&Error::internal(reason)),
        TaskPoll::NotFound => fail(&Error::not_found(format!("task {task_id}"))),
        TaskPoll::Running(_) => fail(&Error::internal("task not terminal after wait")),
    }
}

#[derive(Debug, Deserialize)]
struct StartDownloadBody {
    url: String,
    #[serde(rename = "sourceId", alias = "source_id")]
    source_id: u32,
    format: String,
}

async fn download_start(
    State(state): State<AppState>,
    Json(body): Json<StartDownloadBody>,
) -> Response {
    if body.url.trim().is_empty() {
        return fail(&Error::input("url is required"));
    }
    let format = match OutputFormat::parse(&body.format) {
        Ok(format) => format,
        Err(err) => return fail(&err),
    };
    match state.registry.submit(body.url.trim(), body.source_id, format) {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(Envelope {
                code: 202,
                message: "accepted".to_string(),
                data: json!({ "task_id": task_id }),
                meta: None,
            }),
        )
            .into_response(),
        Err(err) => fail(&err),
    }
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    task_id: Option<String>,
}

fn parse_task_id(query: &TaskQuery) -> Result<Uuid, Error> {
    let raw = query
        .task_id
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| Error::input("task_id is required"))?;
    Uuid::parse_str(raw).map_err(|_| Error::input(format!("invalid task_id: {raw}")))
}

async fn download_progress(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Response {
    let task_id = match parse_task_id(&query) {
        Ok(task_id) => task_id,
        Err(err) => return fail(&err),
    };
    match state.registry.progress(task_id) {
        Some(snapshot) => {
            let percentage = snapshot.progress_percentage();
            let mut data = json!(snapshot);
            data["progress_percentage"] = json!(percentage);
            ok(data, None)
        }
        None => fail(&Error::not_found(format!("task {task_id}"))),
    }
}

async fn download_result(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Response {
    let started = Instant::now();
    let task_id = match parse_task_id(&query) {
        Ok(task_id) => task_id,
        Err(err) => return fail(&err),
    };
    match state.registry.result(task_id).await {
        TaskPoll::Ready(handle) => artifact_response(handle, started, task_id).await,
        TaskPoll::Running(snapshot) => ok(
            json!({
                "status": "running",
                "state": snapshot.state,
                "progress_percentage": snapshot.progress_percentage(),
            }),
            None,
        ),
        TaskPoll::Failed { reason } => fail(&Error::internal(reason)),
        TaskPoll::NotFound => fail(&Error::not_found(format!("task {task_id}"))),
    }
}

async fn artifact_response(handle: ArtifactHandle, started: Instant, task_id: Uuid) -> Response {
    let file = match tokio::fs::File::open(&handle.path).await {
        Ok(file) => file,
        Err(err) => {
            tracing::error!(path = %handle.path.display(), %err, "artifact vanished before streaming");
            return fail(&Error::internal("artifact is not readable"));
        }
    };
    let body = axum::body::Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    insert_header(headers, header::CONTENT_TYPE, handle.content_type);
    insert_header(
        headers,
        header::CONTENT_DISPOSITION,
        &format!(
            "attachment; filename*=UTF-8''{}",
            crate::adapter::percent_encode(&handle.filename)
        ),
    );
    insert_header_name(headers, "x-task-id", &task_id.to_string());
    insert_header_name(headers, "x-file-size", &handle.file_size.to_string());
    insert_header_name(
        headers,
        "x-download-duration-ms",
        &(started.elapsed().as_millis() as u64).to_string(),
    );
    response
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn insert_header_name(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

async fn sources(State(state): State<AppState>) -> Response {
    let summaries: Vec<serde_json::Value> = state
        .rules
        .enabled()
        .map(|rule| {
            json!({
                "id": rule.id,
                "name": rule.name,
                "baseUrl": rule.base_url.as_str(),
                "encoding": rule.encoding,
                "searchMethod": rule.search.method,
                "tocHasPages": rule.toc.has_pages,
            })
        })
        .collect();
    ok(json!(summaries), None)
}

async fn health(State(state): State<AppState>) -> Response {
    let cache_stats = state.cache.stats().await;
    let enabled = state.rules.enabled_count();

    let mut requests = 0u64;
    let mut failures = 0u64;
    let per_source: Vec<serde_json::Value> = state
        .adapters
        .enabled()
        .iter()
        .map(|adapter| {
            let stats = adapter.stats();
            requests += stats.requests;
            failures += stats.failures;
            json!({
                "id": adapter.id(),
                "name": adapter.name(),
                "requests": stats.requests,
                "failures": stats.failures,
            })
        })
        .collect();

    let health_score = if enabled == 0 {
        0
    } else if requests == 0 {
        100
    } else {
        let failure_ratio = failures as f64 / requests as f64;
        (100.0 - failure_ratio * 90.0).round().max(10.0) as u32
    };
    let status = if health_score >= 50 { "ok" } else { "degraded" };

    ok(
        json!({
            "status": status,
            "health_score": health_score,
            "metrics": {
                "sources_enabled": enabled,
                "tasks": state.registry.task_count(),
                "active_workers": state.registry.active_worker_count(),
                "cache": cache_stats,
                "sources": per_source,
            },
        }),
        None,
    )
}

async fn cache_clear(State(state): State<AppState>) -> Response {
    let cleared = state.cache.clear().await;
    ok(json!({ "cleared": cleared }), None)
}
