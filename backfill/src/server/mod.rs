//! Status and control endpoints for operators.

mod health;

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use warp::{
    http::StatusCode,
    reply::{self, Response},
    Filter, Rejection, Reply,
};

use crate::{
    error::{report_message, IndexerError},
    orchestrator::{IndexerHandle, IndexerState},
    store::{FailedBlock, IndexingCheckpoint, IndexingProgress, ProgressStore, StoreError},
};

pub use self::health::{ChainHealth, HealthReport, HealthSource, StaticHealth};

const DEFAULT_FAILED_BLOCKS_LIMIT: usize = 100;

/// Everything the handlers need.
#[derive(Clone)]
pub struct ServerState {
    pub progress: ProgressStore,
    pub indexer: IndexerHandle,
    pub health: Arc<dyn HealthSource>,
}

pub struct StatusServer {
    address: SocketAddr,
    state: ServerState,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: IndexerState,
    pub is_active: bool,
    pub last_indexed_height: Option<u64>,
    pub current_chain_height: Option<u64>,
    pub progress_percent: f64,
    pub total_blocks_indexed: u64,
    pub failed_blocks_count: u64,
    pub unresolved_failed_blocks: u64,
    pub avg_blocks_per_second: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub progress: IndexingProgress,
    pub latest_checkpoint: Option<IndexingCheckpoint>,
    pub blocks_per_second: f64,
    pub eta_seconds: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct FailedBlocksResponse {
    pub failed_blocks: Vec<FailedBlock>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
struct FailedBlocksQuery {
    limit: Option<usize>,
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Serialize)]
struct FailedBlockAction {
    height: u64,
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl StatusServer {
    pub fn new(address: SocketAddr, state: ServerState) -> Self {
        Self { address, state }
    }

    /// Serve until `ct` is cancelled.
    pub async fn start(self, ct: CancellationToken) -> error_stack::Result<(), IndexerError> {
        let (address, server) = warp::serve(routes(self.state))
            .try_bind_with_graceful_shutdown(self.address, async move { ct.cancelled().await })
            .change_context(IndexerError::Configuration)
            .attach_printable("failed to bind status server")
            .attach_printable_lazy(|| format!("address: {}", self.address))?;

        info!(address = %address, "starting status server");
        server.await;
        info!("status server stopped");

        Ok(())
    }
}

pub fn routes(
    state: ServerState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let status = warp::path!("api" / "v1" / "indexing" / "status")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_status);

    let progress = warp::path!("api" / "v1" / "indexing" / "progress")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_progress);

    let failed_blocks = warp::path!("api" / "v1" / "indexing" / "failed-blocks")
        .and(warp::get())
        .and(warp::query::<FailedBlocksQuery>())
        .and(with_state(state.clone()))
        .and_then(get_failed_blocks);

    let statistics = warp::path!("api" / "v1" / "indexing" / "statistics")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_statistics);

    let health = warp::path!("api" / "v1" / "indexing" / "health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_health);

    let resolve = warp::path!("api" / "v1" / "indexing" / "failed-blocks" / u64 / "resolve")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(resolve_failed_block);

    let retry = warp::path!("api" / "v1" / "indexing" / "failed-blocks" / u64 / "retry")
        .and(warp::post())
        .and(with_state(state))
        .and_then(retry_failed_block);

    status
        .or(progress)
        .or(failed_blocks)
        .or(statistics)
        .or(health)
        .or(resolve)
        .or(retry)
        .with(warp::trace::request())
}

fn with_state(
    state: ServerState,
) -> impl Filter<Extract = (ServerState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

async fn get_status(state: ServerState) -> Result<Response, Infallible> {
    let progress = state.progress.clone();
    let statistics = match blocking(move || progress.get_statistics()).await {
        Ok(statistics) => statistics,
        Err(err) => return Ok(internal_error(err)),
    };

    let live = state.indexer.status();
    let response = StatusResponse {
        status: live.state,
        is_active: live.is_active,
        last_indexed_height: statistics.last_indexed_height,
        current_chain_height: live.chain_height,
        progress_percent: live.progress_percent,
        total_blocks_indexed: statistics.total_blocks_indexed,
        failed_blocks_count: statistics.failed_blocks_count,
        unresolved_failed_blocks: statistics.unresolved_failed_blocks,
        avg_blocks_per_second: statistics.avg_blocks_per_second,
        estimated_completion: statistics.estimated_completion,
    };

    Ok(reply::json(&response).into_response())
}

async fn get_progress(state: ServerState) -> Result<Response, Infallible> {
    let progress = state.progress.clone();
    let stored = blocking(move || {
        let record = progress.get_progress()?;
        let checkpoint = progress.latest_checkpoint()?;
        Ok((record, checkpoint))
    })
    .await;

    let (record, latest_checkpoint) = match stored {
        Ok(stored) => stored,
        Err(err) => return Ok(internal_error(err)),
    };

    let live = state.indexer.status();
    let response = ProgressResponse {
        progress: record,
        latest_checkpoint,
        blocks_per_second: live.blocks_per_second,
        eta_seconds: live.eta_seconds,
    };

    Ok(reply::json(&response).into_response())
}

async fn get_failed_blocks(
    query: FailedBlocksQuery,
    state: ServerState,
) -> Result<Response, Infallible> {
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_BLOCKS_LIMIT);
    let progress = state.progress.clone();
    let failed_blocks = match blocking(move || progress.list_failed_blocks(query.all, limit)).await
    {
        Ok(failed_blocks) => failed_blocks,
        Err(err) => return Ok(internal_error(err)),
    };

    let response = FailedBlocksResponse {
        count: failed_blocks.len(),
        failed_blocks,
    };

    Ok(reply::json(&response).into_response())
}

async fn get_statistics(state: ServerState) -> Result<Response, Infallible> {
    let progress = state.progress.clone();
    match blocking(move || progress.get_statistics()).await {
        Ok(statistics) => Ok(reply::json(&statistics).into_response()),
        Err(err) => Ok(internal_error(err)),
    }
}

async fn get_health(state: ServerState) -> Result<Response, Infallible> {
    let report = state.health.check().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok(reply::with_status(reply::json(&report), status).into_response())
}

async fn resolve_failed_block(height: u64, state: ServerState) -> Result<Response, Infallible> {
    let progress = state.progress.clone();
    match blocking(move || progress.resolve_failed_block(height)).await {
        Ok(true) => {
            info!(height, "failed block resolved by operator");
            Ok(reply::json(&FailedBlockAction {
                height,
                action: "resolved",
            })
            .into_response())
        }
        Ok(false) => Ok(not_found(height)),
        Err(err) => Ok(internal_error(err)),
    }
}

async fn retry_failed_block(height: u64, state: ServerState) -> Result<Response, Infallible> {
    let progress = state.progress.clone();
    let failed = match blocking(move || progress.get_failed_block(height)).await {
        Ok(failed) => failed,
        Err(err) => return Ok(internal_error(err)),
    };

    if failed.is_none() {
        return Ok(not_found(height));
    }

    if let Err(err) = state.indexer.retry_failed_block(height).await {
        let body = ErrorResponse {
            error: report_message(&err),
        };
        return Ok(
            reply::with_status(reply::json(&body), StatusCode::SERVICE_UNAVAILABLE)
                .into_response(),
        );
    }

    info!(height, "failed block retry queued by operator");
    let body = FailedBlockAction {
        height,
        action: "retry_queued",
    };
    Ok(reply::with_status(reply::json(&body), StatusCode::ACCEPTED).into_response())
}

/// Run a store query off the async workers, the connection may be busy
/// committing a batch.
async fn blocking<T, F>(query: F) -> error_stack::Result<T, StoreError>
where
    F: FnOnce() -> error_stack::Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(query).await {
        Ok(result) => result,
        Err(err) => Err(Report::new(err).change_context(StoreError::Database)),
    }
}

fn internal_error(err: Report<StoreError>) -> Response {
    error!(error = ?err, "status server query failed");
    let body = ErrorResponse {
        error: report_message(&err),
    };
    reply::with_status(reply::json(&body), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

fn not_found(height: u64) -> Response {
    let body = ErrorResponse {
        error: format!("no failed block at height {height}"),
    };
    reply::with_status(reply::json(&body), StatusCode::NOT_FOUND).into_response()
}
