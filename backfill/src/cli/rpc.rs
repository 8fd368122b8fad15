use std::time::Duration;

use clap::Args;
use error_stack::{Report, Result, ResultExt};

use crate::{
    chain::ChainClient,
    error::IndexerError,
    fetcher::{FetcherOptions, RetryPolicy},
    provider::{CometRpcProvider, CometRpcProviderOptions},
};

#[derive(Args, Clone, Debug)]
pub struct RpcArgs {
    /// CometBFT RPC URL.
    #[arg(long = "rpc.url", env = "BACKFILL_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Maximum number of requests per second sent to the node.
    #[arg(
        long = "rpc.requests-per-sec",
        env = "BACKFILL_RPC_REQUESTS_PER_SEC",
        default_value = "10"
    )]
    pub rpc_requests_per_sec: u32,

    /// How many heights to fetch concurrently.
    #[arg(
        long = "rpc.parallel-fetches",
        env = "BACKFILL_RPC_PARALLEL_FETCHES",
        default_value = "10"
    )]
    pub parallel_fetches: usize,

    /// Total attempts per request.
    #[arg(long = "rpc.max-retries", env = "BACKFILL_RPC_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled on every retry.
    #[arg(
        long = "rpc.retry-delay-ms",
        env = "BACKFILL_RPC_RETRY_DELAY_MS",
        default_value = "2000"
    )]
    pub retry_delay_ms: u64,

    /// Upper bound for the delay between retries.
    #[arg(
        long = "rpc.max-retry-delay-sec",
        env = "BACKFILL_RPC_MAX_RETRY_DELAY_SEC",
        default_value = "30"
    )]
    pub max_retry_delay_sec: u64,

    /// Deadline for a request, retries included.
    #[arg(
        long = "rpc.timeout-sec",
        env = "BACKFILL_RPC_TIMEOUT_SEC",
        default_value = "30"
    )]
    pub rpc_timeout_sec: u64,

    /// Timeout for the health probe.
    #[arg(
        long = "rpc.health-timeout-sec",
        env = "BACKFILL_RPC_HEALTH_TIMEOUT_SEC",
        default_value = "5"
    )]
    pub health_timeout_sec: u64,
}

impl RpcArgs {
    pub fn to_fetcher_options(&self) -> Result<FetcherOptions, IndexerError> {
        if self.rpc_requests_per_sec == 0 {
            return Err(Report::new(IndexerError::Configuration))
                .attach_printable("rpc requests per second must be greater than zero");
        }

        if self.parallel_fetches == 0 {
            return Err(Report::new(IndexerError::Configuration))
                .attach_printable("parallel fetches must be greater than zero");
        }

        if self.max_retries == 0 {
            return Err(Report::new(IndexerError::Configuration))
                .attach_printable("max retries must be at least one");
        }

        Ok(FetcherOptions {
            requests_per_second: self.rpc_requests_per_sec,
            parallel_fetches: self.parallel_fetches,
            deadline: Duration::from_secs(self.rpc_timeout_sec),
            retry: RetryPolicy {
                max_attempts: self.max_retries,
                base_delay: Duration::from_millis(self.retry_delay_ms),
                max_delay: Duration::from_secs(self.max_retry_delay_sec),
                jitter: true,
            },
        })
    }

    pub fn to_comet_rpc_provider(&self) -> Result<CometRpcProvider, IndexerError> {
        let url = self
            .rpc_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(IndexerError::Configuration)
            .attach_printable("missing rpc url")
            .attach_printable("hint: set --rpc.url or BACKFILL_RPC_URL")?;

        let parsed = reqwest::Url::parse(url)
            .change_context(IndexerError::Configuration)
            .attach_printable("failed to parse rpc url")
            .attach_printable_lazy(|| format!("url: {url}"))?;

        let options = CometRpcProviderOptions {
            timeout: Duration::from_secs(self.rpc_timeout_sec),
            health_timeout: Duration::from_secs(self.health_timeout_sec),
            max_idle_connections: self.parallel_fetches.max(1) * 2,
        };

        CometRpcProvider::new(parsed.as_str(), options)
            .change_context(IndexerError::Configuration)
            .attach_printable("failed to create rpc provider")
    }

    pub fn to_chain_client(&self) -> Result<ChainClient, IndexerError> {
        let options = self.to_fetcher_options()?;
        let provider = self.to_comet_rpc_provider()?;
        Ok(ChainClient::new(provider, &options))
    }
}
