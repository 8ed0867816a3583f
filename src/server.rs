//! HTTP server.
//!
//! Exposes the crawl operations as a JSON HTTP API for the dashboard and
//! for scripts. Submissions return once the task is admitted; callers poll
//! `/api/keywords/task` for progress.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/keywords/search` | Submit a keyword crawl |
//! | `POST` | `/api/keywords/recrawl` | Re-run an existing keyword |
//! | `GET`  | `/api/keywords/task?keyword=K` | Latest task for a keyword |
//! | `POST` | `/api/keywords/cleanup?cleanup=true&keyword=K` | Scan (and repair) drift |
//! | `POST` | `/api/crawl/retry` | Retry a failed task |
//! | `GET`  | `/api/crawl/list?page=&limit=&status=` | Page through tasks |
//! | `GET`  | `/api/crawl/stats` | Task counts and recent tasks |
//! | `DELETE` | `/api/crawl/delete?id=N` | Delete a finished task |
//! | `GET`  | `/api/analysis?keyword=K` | Analysis artifact for a keyword |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "keyword must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::error::CrawlError;
use crate::models::CrawlTask;
use crate::reconcile::CleanupReport;
use crate::service::{CrawlService, ListQuery, SubmitRequest, SubmitResponse, TaskPage};
use crate::stats::TaskStats;

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = CrawlService::open(config).await?;
    let app = build_router(service);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "crawl server listening");
    println!("Crawl server listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the application router around a service.
pub fn build_router(service: CrawlService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/keywords/search", post(handle_submit))
        .route("/api/keywords/recrawl", post(handle_recrawl))
        .route("/api/keywords/task", get(handle_status))
        .route("/api/keywords/cleanup", post(handle_cleanup))
        .route("/api/crawl/retry", post(handle_retry))
        .route("/api/crawl/list", get(handle_list))
        .route("/api/crawl/stats", get(handle_stats))
        .route("/api/crawl/delete", delete(handle_delete))
        .route("/api/analysis", get(handle_analysis))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<CrawlError> for AppError {
    fn from(err: CrawlError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, AppError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| bad_request(format!("{} is required", name)))
}

// ============ Request shapes ============

#[derive(Deserialize)]
struct KeywordQuery {
    keyword: Option<String>,
}

#[derive(Deserialize)]
struct CleanupQuery {
    cleanup: Option<String>,
    keyword: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryRequest {
    task_id: Option<i64>,
}

#[derive(Deserialize)]
struct DeleteQuery {
    id: Option<i64>,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    message: String,
}

// ============ Handlers ============

async fn handle_submit(
    State(service): State<CrawlService>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, AppError> {
    let Json(req) = body?;
    Ok(Json(service.submit(req).await?))
}

async fn handle_recrawl(
    State(service): State<CrawlService>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, AppError> {
    let Json(req) = body?;
    Ok(Json(service.recrawl(req).await?))
}

async fn handle_status(
    State(service): State<CrawlService>,
    query: Result<Query<KeywordQuery>, QueryRejection>,
) -> Result<Json<CrawlTask>, AppError> {
    let Query(q) = query?;
    let keyword = required(q.keyword, "keyword")?;
    Ok(Json(service.status(&keyword).await?))
}

/// Scans always; repairs only with `cleanup=true`.
async fn handle_cleanup(
    State(service): State<CrawlService>,
    query: Result<Query<CleanupQuery>, QueryRejection>,
) -> Result<Json<CleanupReport>, AppError> {
    let Query(q) = query?;
    let apply = q.cleanup.as_deref() == Some("true");
    Ok(Json(service.cleanup(apply, q.keyword.as_deref()).await?))
}

async fn handle_retry(
    State(service): State<CrawlService>,
    body: Result<Json<RetryRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, AppError> {
    let Json(req) = body?;
    let task_id = req
        .task_id
        .ok_or_else(|| bad_request("taskId is required"))?;
    Ok(Json(service.retry(task_id).await?))
}

async fn handle_list(
    State(service): State<CrawlService>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<TaskPage>, AppError> {
    let Query(q) = query?;
    Ok(Json(service.list_tasks(&q).await?))
}

async fn handle_stats(State(service): State<CrawlService>) -> Result<Json<TaskStats>, AppError> {
    Ok(Json(service.stats().await?))
}

async fn handle_delete(
    State(service): State<CrawlService>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> Result<Json<DeleteResponse>, AppError> {
    let Query(q) = query?;
    let id = q.id.ok_or_else(|| bad_request("id is required"))?;
    service.delete_task(id).await?;
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("task {} deleted", id),
    }))
}

async fn handle_analysis(
    State(service): State<CrawlService>,
    query: Result<Query<KeywordQuery>, QueryRejection>,
) -> Result<Json<Value>, AppError> {
    let Query(q) = query?;
    let keyword = required(q.keyword, "keyword")?;
    Ok(Json(service.get_analysis(&keyword).await?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
