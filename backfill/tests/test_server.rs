use std::sync::Arc;

use async_trait::async_trait;
use comet_backfill::{
    metrics::NoopMetrics,
    orchestrator::HistoricalIndexer,
    server::{routes, HealthReport, HealthSource, ServerState, StaticHealth},
    store::{Database, IndexingStatus, ProgressStore},
};
use serde_json::Value;
use warp::http::StatusCode;

mod common;

use common::{test_options, FakeChain};

struct Unhealthy;

#[async_trait]
impl HealthSource for Unhealthy {
    async fn check(&self) -> HealthReport {
        HealthReport {
            healthy: false,
            latest_height: None,
            catching_up: None,
            message: Some("connection refused".to_string()),
        }
    }
}

/// Keeps the indexer alive so that its command queue stays open.
struct TestServer {
    state: ServerState,
    _indexer: HistoricalIndexer<FakeChain>,
}

fn new_server(health: Arc<dyn HealthSource>) -> TestServer {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone());

    progress.save_progress(100, IndexingStatus::Indexing).unwrap();
    progress.record_failed_block(57, "invalid block time", 3).unwrap();
    progress.record_failed_block(58, "server error", 3).unwrap();
    progress.resolve_failed_block(58).unwrap();

    let indexer = HistoricalIndexer::new(
        FakeChain::new(100),
        db,
        test_options(),
        Arc::new(NoopMetrics),
    );

    let state = ServerState {
        progress,
        indexer: indexer.handle(),
        health,
    };

    TestServer {
        state,
        _indexer: indexer,
    }
}

async fn request(server: &TestServer, method: &str, path: &str) -> (StatusCode, Value) {
    let response = warp::test::request()
        .method(method)
        .path(path)
        .reply(&routes(server.state.clone()))
        .await;

    let body = serde_json::from_slice(response.body()).unwrap();
    (response.status(), body)
}

#[tokio::test]
async fn test_get_status() {
    let server = new_server(Arc::new(StaticHealth));
    let (status, body) = request(&server, "GET", "/api/v1/indexing/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "idle");
    assert_eq!(body["is_active"], false);
    assert_eq!(body["last_indexed_height"], 100);
    assert_eq!(body["failed_blocks_count"], 2);
    assert_eq!(body["unresolved_failed_blocks"], 1);
}

#[tokio::test]
async fn test_get_progress() {
    let server = new_server(Arc::new(StaticHealth));
    let (status, body) = request(&server, "GET", "/api/v1/indexing/progress").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["progress"]["last_indexed_height"], 100);
    assert_eq!(body["progress"]["status"], "indexing");
    assert!(body["latest_checkpoint"].is_null());
}

#[tokio::test]
async fn test_list_failed_blocks() {
    let server = new_server(Arc::new(StaticHealth));

    let (status, body) = request(&server, "GET", "/api/v1/indexing/failed-blocks").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["failed_blocks"][0]["height"], 57);
    assert_eq!(body["failed_blocks"][0]["retry_count"], 3);

    let (_, body) = request(&server, "GET", "/api/v1/indexing/failed-blocks?all=true").await;
    assert_eq!(body["count"], 2);

    let (_, body) = request(
        &server,
        "GET",
        "/api/v1/indexing/failed-blocks?all=true&limit=1",
    )
    .await;
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn test_get_statistics() {
    let server = new_server(Arc::new(StaticHealth));
    let (status, body) = request(&server, "GET", "/api/v1/indexing/statistics").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failed_blocks_count"], 2);
    assert_eq!(body["unresolved_failed_blocks"], 1);
}

#[tokio::test]
async fn test_resolve_failed_block() {
    let server = new_server(Arc::new(StaticHealth));

    let (status, body) =
        request(&server, "POST", "/api/v1/indexing/failed-blocks/57/resolve").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["height"], 57);

    let failed = server.state.progress.get_failed_block(57).unwrap().unwrap();
    assert!(failed.resolved);
    assert!(failed.resolved_at.is_some());

    let (status, body) =
        request(&server, "POST", "/api/v1/indexing/failed-blocks/99/resolve").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_retry_failed_block() {
    let server = new_server(Arc::new(StaticHealth));

    let (status, body) = request(&server, "POST", "/api/v1/indexing/failed-blocks/57/retry").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["height"], 57);

    let (status, _) = request(&server, "POST", "/api/v1/indexing/failed-blocks/99/retry").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health() {
    let server = new_server(Arc::new(StaticHealth));
    let (status, body) = request(&server, "GET", "/api/v1/indexing/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);

    let server = new_server(Arc::new(Unhealthy));
    let (status, body) = request(&server, "GET", "/api/v1/indexing/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["healthy"], false);
    assert_eq!(body["message"], "connection refused");
}
