use std::time::Duration;

use clap::Args;
use error_stack::{Report, Result, ResultExt};

use crate::{cli::rpc::RpcArgs, error::IndexerError, orchestrator::IndexerOptions};

const MAX_BATCH_SIZE: u64 = 10_000;

#[derive(Args, Clone, Debug)]
pub struct IndexerArgs {
    /// Run the historical indexer.
    #[arg(
        long = "indexer.enabled",
        env = "BACKFILL_ENABLE_HISTORICAL_INDEXING",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub enable_historical_indexing: bool,

    /// First height to index when there is no stored progress.
    #[arg(
        long = "indexer.start-height",
        env = "BACKFILL_START_HEIGHT",
        default_value = "1"
    )]
    pub start_height: u64,

    /// Number of heights per batch.
    #[arg(
        long = "indexer.batch-size",
        env = "BACKFILL_HISTORICAL_BATCH_SIZE",
        default_value = "100"
    )]
    pub historical_batch_size: u64,

    /// How often to check the chain height once caught up.
    #[arg(
        long = "indexer.poll-interval-sec",
        env = "BACKFILL_POLL_INTERVAL_SEC",
        default_value = "5"
    )]
    pub poll_interval_sec: u64,

    /// Failed heights retried per sweep once caught up.
    #[arg(
        long = "indexer.backfill-batch-size",
        env = "BACKFILL_BACKFILL_BATCH_SIZE",
        default_value = "20"
    )]
    pub backfill_batch_size: usize,

    /// Stop retrying a failed height automatically after this many attempts.
    #[arg(
        long = "indexer.max-failed-block-retries",
        env = "BACKFILL_MAX_FAILED_BLOCK_RETRIES",
        default_value = "10"
    )]
    pub max_failed_block_retries: u32,
}

impl IndexerArgs {
    pub fn to_indexer_options(&self, rpc: &RpcArgs) -> Result<IndexerOptions, IndexerError> {
        if self.historical_batch_size == 0 {
            return Err(Report::new(IndexerError::Configuration))
                .attach_printable("batch size must be greater than zero");
        }

        if self.historical_batch_size > MAX_BATCH_SIZE {
            return Err(Report::new(IndexerError::Configuration)).attach_printable_lazy(|| {
                format!("batch size must be at most {MAX_BATCH_SIZE}")
            });
        }

        if self.start_height == 0 {
            return Err(Report::new(IndexerError::Configuration))
                .attach_printable("start height must be at least one");
        }

        Ok(IndexerOptions {
            enabled: self.enable_historical_indexing,
            start_height: self.start_height,
            batch_size: self.historical_batch_size,
            max_retries: rpc.max_retries.max(1),
            poll_interval: Duration::from_secs(self.poll_interval_sec),
            backfill_batch_size: self.backfill_batch_size,
            max_failed_block_retries: self.max_failed_block_retries,
        })
    }
}
