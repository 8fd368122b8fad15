use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use comet_backfill::{
    chain::{ChainClient, FetchErrorKind},
    fetcher::{FetcherOptions, RetryPolicy},
    metrics::NoopMetrics,
    orchestrator::{HistoricalIndexer, IndexerOptions, IndexerState},
    provider::{CometRpcProvider, CometRpcProviderOptions},
    server::{ChainHealth, HealthSource},
    store::{ContentStore, Database, ProgressStore},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{body_partial_json, method},
    Mock, MockServer, ResponseTemplate,
};

mod common;

use common::{block_json, block_results_json, jsonrpc_result, status_json, test_options};

fn new_client(server: &MockServer) -> ChainClient {
    new_rate_limited_client(server, 1_000, Duration::from_secs(1))
}

fn new_rate_limited_client(
    server: &MockServer,
    requests_per_second: u32,
    health_timeout: Duration,
) -> ChainClient {
    let provider = CometRpcProvider::new(
        server.uri(),
        CometRpcProviderOptions {
            timeout: Duration::from_secs(5),
            health_timeout,
            max_idle_connections: 4,
        },
    )
    .unwrap();

    let options = FetcherOptions {
        requests_per_second,
        parallel_fetches: 4,
        deadline: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        },
    };

    ChainClient::new(provider, &options)
}

async fn mount_status(server: &MockServer, height: u64) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "status" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonrpc_result(status_json(height))))
        .mount(server)
        .await;
}

async fn mount_block(server: &MockServer, height: u64) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "block",
            "params": { "height": height.to_string() }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonrpc_result(block_json(height))))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "block_results",
            "params": { "height": height.to_string() }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(jsonrpc_result(block_results_json(height))),
        )
        .mount(server)
        .await;
}

/// The first `failures` block requests at `height` fail with a 500.
async fn mount_flaky_block(server: &MockServer, height: u64, failures: u64) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "block",
            "params": { "height": height.to_string() }
        })))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(failures)
        .expect(failures)
        .with_priority(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_get_chain_height() {
    let server = MockServer::start().await;
    mount_status(&server, 44).await;

    let client = new_client(&server);
    assert_eq!(client.get_chain_height().await.unwrap(), 44);

    let health = client.probe().await.unwrap();
    assert_eq!(health.latest_height, 44);
    assert!(!health.catching_up);
}

#[tokio::test]
async fn test_health_checks_share_the_rate_limit() {
    let server = MockServer::start().await;
    mount_status(&server, 44).await;

    let client = new_rate_limited_client(&server, 1, Duration::from_millis(300));
    assert_eq!(client.get_chain_height().await.unwrap(), 44);

    // The indexer took the only slot of this second.
    let health = ChainHealth::new(client);
    let reports = futures::future::join_all((0..20).map(|_| health.check())).await;
    assert!(reports.iter().all(|report| !report.healthy));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let report = health.check().await;
    assert!(report.healthy);
    assert_eq!(report.latest_height, Some(44));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let server = MockServer::start().await;
    mount_flaky_block(&server, 42, 2).await;
    mount_block(&server, 42).await;

    let client = new_client(&server);
    let block = client.get_block_with_results(42).await.unwrap();

    assert_eq!(block.height, 42);
    assert_eq!(block.block.block.header.height, "42");
}

#[tokio::test]
async fn test_height_above_tip_is_not_found() {
    let server = MockServer::start().await;

    let error = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {
            "code": -32603,
            "message": "Internal error",
            "data": "height 1000 must be less than or equal to the current blockchain height 44"
        }
    });

    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "params": { "height": "1000" } })))
        .respond_with(ResponseTemplate::new(500).set_body_json(error))
        .mount(&server)
        .await;

    let client = new_client(&server);
    let err = client.get_block(1000).await.unwrap_err();

    assert_eq!(err.height, 1000);
    assert_eq!(err.kind, FetchErrorKind::NotFound);
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn test_persistent_server_errors_exhaust_retries() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = new_client(&server);
    let err = client.get_block(7).await.unwrap_err();

    assert_matches!(err.kind, FetchErrorKind::Exhausted);
    assert_eq!(err.attempts, 3);
    assert!(err.cause.contains("server error"));
}

#[tokio::test]
async fn test_indexer_recovers_from_flaky_node() {
    let server = MockServer::start().await;
    mount_status(&server, 44).await;
    mount_flaky_block(&server, 42, 2).await;
    for height in 40..=44 {
        mount_block(&server, height).await;
    }

    let db = Database::open_in_memory().unwrap();
    let options = IndexerOptions {
        start_height: 40,
        batch_size: 10,
        ..test_options()
    };

    let indexer = HistoricalIndexer::new(
        new_client(&server),
        db.clone(),
        options,
        Arc::new(NoopMetrics),
    );
    let handle = indexer.handle();
    let ct = CancellationToken::new();
    let task = tokio::spawn(indexer.run(ct.clone()));

    let mut rx = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|status| {
            status.state == IndexerState::Completed && status.last_indexed_height == Some(44)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    ct.cancel();
    task.await.unwrap().unwrap();

    let progress = ProgressStore::new(db.clone());
    assert!(progress.list_unresolved_failed_blocks(100).unwrap().is_empty());

    let content = ContentStore::new(db);
    assert_eq!(content.counts().unwrap().blocks, 5);
    assert_eq!(content.get_block(42).unwrap().unwrap().hash, "HASH42");
}
