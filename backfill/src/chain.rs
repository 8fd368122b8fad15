//! Typed access to the chain, built on top of the fetcher.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use error_stack::{Report, Result, ResultExt};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{
    error::report_message,
    fetcher::{Fetcher, FetcherOptions, RetryError},
    provider::{
        models::{BlockResponse, BlockResultsResponse},
        BlockWithResults, CometRpcError, CometRpcErrorExt, CometRpcProvider,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainClientError {
    Rpc,
    Timeout,
    InvalidResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The height is not available yet. Never retried.
    NotFound,
    /// All attempts failed.
    Exhausted,
}

/// A height that could not be fetched.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub height: u64,
    pub kind: FetchErrorKind,
    pub attempts: u32,
    pub cause: String,
}

/// Result of fetching a set of heights. Failures don't abort the batch.
#[derive(Debug, Default)]
pub struct BatchFetch {
    pub blocks: BTreeMap<u64, BlockWithResults>,
    pub failures: Vec<FetchError>,
}

#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub latest_height: u64,
    pub catching_up: bool,
}

/// Source of blocks for the indexer.
pub trait ChainSource: Send + Sync + 'static {
    /// Current finalized height of the chain.
    fn get_chain_height(&self) -> impl Future<Output = Result<u64, ChainClientError>> + Send;

    /// Fetch all `heights`, reporting failed heights individually.
    fn get_block_batch(&self, heights: Vec<u64>) -> impl Future<Output = BatchFetch> + Send;
}

/// Chain client backed by a CometBFT node.
#[derive(Clone)]
pub struct ChainClient {
    provider: CometRpcProvider,
    fetcher: Arc<Fetcher>,
    semaphore: Arc<Semaphore>,
}

impl ChainClient {
    pub fn new(provider: CometRpcProvider, options: &FetcherOptions) -> Self {
        let permits = usize::max(options.parallel_fetches, 1);
        Self {
            provider,
            fetcher: Arc::new(Fetcher::new(options)),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub async fn get_chain_height(&self) -> Result<u64, ChainClientError> {
        let status = self
            .fetcher
            .fetch(|| self.provider.status())
            .await
            .map_err(|err| {
                let context = if err.report.current_context() == &CometRpcError::Timeout {
                    ChainClientError::Timeout
                } else {
                    ChainClientError::Rpc
                };
                err.report
                    .change_context(context)
                    .attach_printable("failed to get chain height")
            })?;

        status
            .sync_info
            .latest_block_height
            .parse::<u64>()
            .change_context(ChainClientError::InvalidResponse)
            .attach_printable_lazy(|| {
                format!("latest height: {}", status.sync_info.latest_block_height)
            })
    }

    pub async fn get_block(&self, height: u64) -> std::result::Result<BlockResponse, FetchError> {
        self.fetcher
            .fetch(|| self.provider.block(height))
            .await
            .map_err(|err| FetchError::from_retry(height, err))
    }

    pub async fn get_block_results(
        &self,
        height: u64,
    ) -> std::result::Result<BlockResultsResponse, FetchError> {
        self.fetcher
            .fetch(|| self.provider.block_results(height))
            .await
            .map_err(|err| FetchError::from_retry(height, err))
    }

    /// Fetch the block and its results concurrently.
    pub async fn get_block_with_results(
        &self,
        height: u64,
    ) -> std::result::Result<BlockWithResults, FetchError> {
        let (block, results) =
            tokio::try_join!(self.get_block(height), self.get_block_results(height))?;

        Ok(BlockWithResults {
            height,
            block,
            results,
        })
    }

    /// Fetch heights with at most `parallel_fetches` in flight.
    pub async fn get_block_batch(&self, heights: Vec<u64>) -> BatchFetch {
        let fetches = heights.into_iter().map(|height| async move {
            let Ok(_permit) = self.semaphore.acquire().await else {
                return Err(FetchError {
                    height,
                    kind: FetchErrorKind::Exhausted,
                    attempts: 0,
                    cause: "fetch semaphore closed".to_string(),
                });
            };

            self.get_block_with_results(height).await
        });

        let results = futures::future::join_all(fetches).await;

        let batch = BatchFetch::from_results(results);
        debug!(
            blocks = batch.blocks.len(),
            failures = batch.failures.len(),
            "fetched batch"
        );
        batch
    }

    /// Query the node status once, with the short health timeout.
    ///
    /// Not retried, but still takes a slot from the rate limiter. Waiting for
    /// the slot counts against the health timeout.
    pub async fn probe(&self) -> Result<NodeHealth, ChainClientError> {
        let health_timeout = self.provider.health_timeout();
        let request = async {
            self.fetcher.acquire().await;
            self.provider.probe_status().await
        };

        let status = match tokio::time::timeout(health_timeout, request).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                let context = if err.current_context() == &CometRpcError::Timeout {
                    ChainClientError::Timeout
                } else {
                    ChainClientError::Rpc
                };
                return Err(err.change_context(context));
            }
            Err(_) => {
                return Err(Report::new(ChainClientError::Timeout).attach_printable(format!(
                    "health probe did not complete within {health_timeout:?}"
                )));
            }
        };

        let latest_height = status
            .sync_info
            .latest_block_height
            .parse::<u64>()
            .change_context(ChainClientError::InvalidResponse)?;

        Ok(NodeHealth {
            latest_height,
            catching_up: status.sync_info.catching_up,
        })
    }
}

impl ChainSource for ChainClient {
    async fn get_chain_height(&self) -> Result<u64, ChainClientError> {
        ChainClient::get_chain_height(self).await
    }

    async fn get_block_batch(&self, heights: Vec<u64>) -> BatchFetch {
        ChainClient::get_block_batch(self, heights).await
    }
}

impl BatchFetch {
    pub fn from_results(
        results: impl IntoIterator<Item = std::result::Result<BlockWithResults, FetchError>>,
    ) -> Self {
        let mut batch = BatchFetch::default();
        for result in results {
            match result {
                Ok(block) => {
                    batch.blocks.insert(block.height, block);
                }
                Err(err) => batch.failures.push(err),
            }
        }
        batch.failures.sort_by_key(|err| err.height);
        batch
    }

    /// Lowest height that the node reported as not available.
    pub fn first_not_found(&self) -> Option<u64> {
        self.failures
            .iter()
            .filter(|err| err.kind == FetchErrorKind::NotFound)
            .map(|err| err.height)
            .min()
    }
}

impl FetchError {
    pub fn from_retry(height: u64, err: RetryError<CometRpcError>) -> Self {
        let kind = if err.report.is_not_found() {
            FetchErrorKind::NotFound
        } else {
            FetchErrorKind::Exhausted
        };

        Self {
            height,
            kind,
            attempts: err.attempts,
            cause: report_message(&err.report),
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FetchErrorKind::NotFound => write!(f, "block {} not found", self.height),
            FetchErrorKind::Exhausted => write!(
                f,
                "failed to fetch block {} after {} attempts",
                self.height, self.attempts
            ),
        }
    }
}

impl error_stack::Context for ChainClientError {}

impl std::fmt::Display for ChainClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainClientError::Rpc => write!(f, "chain rpc error"),
            ChainClientError::Timeout => write!(f, "chain rpc timed out"),
            ChainClientError::InvalidResponse => write!(f, "invalid chain rpc response"),
        }
    }
}
