use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;
use tower::ServiceExt;

use crawl_harness::error::{CrawlError, Result};
use crawl_harness::ledger::Ledger;
use crawl_harness::models::{CrawlParams, Stage};
use crawl_harness::results::ResultStore;
use crawl_harness::runner::{StageInvocation, StageProgress, StageRunner};
use crawl_harness::server::build_router;
use crawl_harness::service::CrawlService;

/// Succeeds unless the keyword starts with "fail".
#[derive(Default)]
struct StubRunner {
    analyze_calls: AtomicUsize,
}

#[async_trait]
impl StageRunner for StubRunner {
    async fn run(
        &self,
        invocation: &StageInvocation,
        _progress: UnboundedSender<StageProgress>,
    ) -> Result<()> {
        if invocation.stage == Stage::Analyze {
            self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        }
        if invocation.keyword.starts_with("fail") {
            return Err(CrawlError::ExternalProcess {
                stage: invocation.stage,
                message: "exit code 1".to_string(),
            });
        }
        Ok(())
    }
}

async fn setup() -> (TempDir, CrawlService, Router, Arc<StubRunner>) {
    let tmp = TempDir::new().unwrap();
    let pool = crawl_harness::db::connect_path(&tmp.path().join("crawl.sqlite"))
        .await
        .unwrap();
    crawl_harness::migrate::migrate_pool(&pool).await.unwrap();

    let store = ResultStore::new(
        tmp.path().join("analytics"),
        tmp.path().join("result").join("all_keywords_analysis.json"),
    );
    let runner = Arc::new(StubRunner::default());
    let defaults = CrawlParams {
        languages: vec!["python".to_string()],
        limits: BTreeMap::from([("python".to_string(), 10)]),
    };
    let service = CrawlService::new(Ledger::new(pool), store, runner.clone(), defaults);
    let router = build_router(service.clone());
    (tmp, service, router, runner)
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_version() {
    let (_tmp, _svc, router, _) = setup().await;
    let (status, body) = call(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn submit_then_poll_to_completion() {
    let (_tmp, svc, router, _) = setup().await;

    let (status, body) = call(
        &router,
        "POST",
        "/api/keywords/search",
        Some(json!({"keyword": "rust-async", "languages": ["python"], "limits": {"python": 5}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["created"], true);
    let task_id = body["taskId"].clone();

    svc.wait_idle().await;

    let (status, task) = call(&router, "GET", "/api/keywords/task?keyword=rust-async", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["id"], task_id);
    assert_eq!(task["status"], "completed");
    assert_eq!(task["progress"], 100);
}

#[tokio::test]
async fn repeated_submit_reattaches() {
    let (_tmp, svc, router, _) = setup().await;
    // hold the pipeline off by admitting directly through the ledger
    let kw = svc.ledger().get_or_create_keyword("busy").await.unwrap();
    let existing = svc
        .ledger()
        .insert_pending_task(kw.id, "queued")
        .await
        .unwrap()
        .unwrap();

    let (status, body) = call(
        &router,
        "POST",
        "/api/keywords/search",
        Some(json!({"keyword": "busy"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], false);
    assert_eq!(body["taskId"], existing);
}

#[tokio::test]
async fn empty_keyword_is_bad_request() {
    let (_tmp, _svc, router, _) = setup().await;
    let (status, body) = call(
        &router,
        "POST",
        "/api/keywords/search",
        Some(json!({"keyword": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = call(&router, "POST", "/api/keywords/search", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_keyword_status_is_not_found() {
    let (_tmp, _svc, router, _) = setup().await;
    let (status, body) = call(&router, "GET", "/api/keywords/task?keyword=nothing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = call(&router, "GET", "/api/keywords/task", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn failed_task_can_be_retried_once() {
    let (_tmp, svc, router, runner) = setup().await;

    let (_, body) = call(
        &router,
        "POST",
        "/api/keywords/search",
        Some(json!({"keyword": "failing"})),
    )
    .await;
    svc.wait_idle().await;
    let failed_id = body["taskId"].clone();

    let (_, task) = call(&router, "GET", "/api/keywords/task?keyword=failing", None).await;
    assert_eq!(task["status"], "failed");
    assert!(task["message"].as_str().unwrap().contains("collection"));
    assert_eq!(runner.analyze_calls.load(Ordering::SeqCst), 0);

    let (status, retried) = call(
        &router,
        "POST",
        "/api/crawl/retry",
        Some(json!({"taskId": failed_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(retried["taskId"], failed_id);
    svc.wait_idle().await;

    let (status, _) = call(&router, "POST", "/api/crawl/retry", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &router,
        "POST",
        "/api/crawl/retry",
        Some(json!({"taskId": 999})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_of_completed_task_conflicts() {
    let (_tmp, svc, router, _) = setup().await;
    let (_, body) = call(
        &router,
        "POST",
        "/api/keywords/search",
        Some(json!({"keyword": "fine"})),
    )
    .await;
    svc.wait_idle().await;

    let (status, err) = call(
        &router,
        "POST",
        "/api/crawl/retry",
        Some(json!({"taskId": body["taskId"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["code"], "conflict");
}

#[tokio::test]
async fn cleanup_dry_run_uses_snake_case_summary() {
    let (tmp, _svc, router, _) = setup().await;
    std::fs::create_dir_all(tmp.path().join("analytics")).unwrap();
    std::fs::write(tmp.path().join("analytics").join("analysis_orphan.json"), "{}").unwrap();

    let (status, body) = call(&router, "POST", "/api/keywords/cleanup", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["cleaned"], false);
    assert_eq!(body["summary"]["total_files"], 1);
    assert_eq!(body["summary"]["inconsistencies_found"], 1);
    assert_eq!(body["inconsistencies"][0]["type"], "orphan_file");
    assert_eq!(body["inconsistencies"][0]["action"], "delete_file");
    assert!(tmp.path().join("analytics/analysis_orphan.json").exists());

    let (_, body) = call(&router, "POST", "/api/keywords/cleanup?cleanup=true", None).await;
    assert_eq!(body["cleaned"], true);
    assert_eq!(body["summary"]["files_cleaned"], 1);
    assert!(!tmp.path().join("analytics/analysis_orphan.json").exists());
}

#[tokio::test]
async fn list_stats_and_delete() {
    let (_tmp, svc, router, _) = setup().await;
    for kw in ["a", "b", "fail-c"] {
        call(
            &router,
            "POST",
            "/api/keywords/search",
            Some(json!({"keyword": kw})),
        )
        .await;
    }
    svc.wait_idle().await;

    let (status, page) = call(&router, "GET", "/api/crawl/list?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["totalPages"], 2);
    assert_eq!(page["tasks"].as_array().unwrap().len(), 2);

    let (status, _) = call(&router, "GET", "/api/crawl/list?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, stats) = call(&router, "GET", "/api/crawl/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["completedTasks"], 2);
    assert_eq!(stats["failedTasks"], 1);
    assert_eq!(stats["pendingTasks"], 0);

    let id = page["tasks"][0]["id"].as_i64().unwrap();
    let (status, _) = call(&router, "DELETE", &format!("/api/crawl/delete?id={}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&router, "DELETE", &format!("/api/crawl/delete?id={}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&router, "DELETE", "/api/crawl/delete", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn analysis_is_served_from_the_store() {
    let (tmp, _svc, router, _) = setup().await;
    let (status, _) = call(&router, "GET", "/api/analysis?keyword=rust%20async", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    std::fs::create_dir_all(tmp.path().join("analytics")).unwrap();
    std::fs::write(
        tmp.path().join("analytics").join("analysis_rust_async.json"),
        r#"{"keyword": "rust async", "charts": {"languages": []}}"#,
    )
    .unwrap();
    let (status, body) = call(&router, "GET", "/api/analysis?keyword=rust%20async", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keyword"], "rust async");
}
