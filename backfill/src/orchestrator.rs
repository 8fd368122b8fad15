//! The historical indexing loop.
//!
//! Batches are sequential: a batch is fetched, persisted and checkpointed
//! before the next one starts. Only the fetch stage runs concurrently.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use error_stack::{Report, ResultExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    chain::{BatchFetch, ChainSource, FetchError},
    error::{report_message, IndexerError, Result},
    metrics::MetricsSink,
    processor::{BatchProcessor, FailedHeight},
    store::{BatchCommit, Database, IndexingStatus, NewFailedBlock, ProgressStore},
};

/// Weight of the newest sample in the smoothed rate.
const RATE_SMOOTHING: f64 = 0.3;
/// Number of stored samples used to restore the rate on restart.
const RATE_SEED_SAMPLES: usize = 10;
const COMMAND_QUEUE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    Idle,
    Initializing,
    Indexing,
    Completed,
    Paused,
    Error,
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, Serialize)]
pub struct IndexerStatus {
    pub state: IndexerState,
    pub is_active: bool,
    pub last_indexed_height: Option<u64>,
    pub chain_height: Option<u64>,
    pub blocks_per_second: f64,
    pub eta_seconds: Option<f64>,
    pub progress_percent: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub enabled: bool,
    /// First height indexed when there is no stored progress.
    pub start_height: u64,
    pub batch_size: u64,
    /// Attempts per batch before writing heights one by one. Also the
    /// number of times a missing height is polled before it is recorded as
    /// failed.
    pub max_retries: u32,
    /// Delay between tip checks once caught up.
    pub poll_interval: Duration,
    /// Failed heights retried per sweep.
    pub backfill_batch_size: usize,
    /// Failed heights are not retried automatically past this count.
    pub max_failed_block_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerCommand {
    RetryFailedBlock(u64),
}

/// Read the status of a running indexer and send it commands.
#[derive(Clone)]
pub struct IndexerHandle {
    status: watch::Receiver<IndexerStatus>,
    commands: mpsc::Sender<IndexerCommand>,
}

/// Exponential moving average of the indexing rate.
#[derive(Debug, Clone, Copy)]
pub struct RateEstimator {
    alpha: f64,
    value: Option<f64>,
}

pub struct HistoricalIndexer<S: ChainSource> {
    chain: Arc<S>,
    progress: ProgressStore,
    processor: BatchProcessor,
    metrics: Arc<dyn MetricsSink>,
    options: IndexerOptions,
    status_tx: watch::Sender<IndexerStatus>,
    commands_tx: mpsc::Sender<IndexerCommand>,
    commands_rx: mpsc::Receiver<IndexerCommand>,
    pending_retries: Vec<u64>,
    rate: RateEstimator,
    /// Height the chain keeps reporting as missing and how many times.
    stalled: Option<(u64, u32)>,
}

impl<S: ChainSource> HistoricalIndexer<S> {
    pub fn new(
        chain: S,
        db: Database,
        options: IndexerOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (status_tx, _) = watch::channel(IndexerStatus::default());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);

        Self {
            chain: Arc::new(chain),
            progress: ProgressStore::new(db.clone()),
            processor: BatchProcessor::new(db, options.max_retries),
            metrics,
            options,
            status_tx,
            commands_tx,
            commands_rx,
            pending_retries: Vec::new(),
            rate: RateEstimator::new(RATE_SMOOTHING),
            stalled: None,
        }
    }

    pub fn handle(&self) -> IndexerHandle {
        IndexerHandle {
            status: self.status_tx.subscribe(),
            commands: self.commands_tx.clone(),
        }
    }

    /// Index until cancelled or until a batch can't be persisted.
    pub async fn run(mut self, ct: CancellationToken) -> Result<()> {
        if !self.options.enabled {
            info!("historical indexing is disabled");
            self.publish_state(IndexerState::Idle);
            return Ok(());
        }

        self.publish_state(IndexerState::Initializing);

        let progress = self
            .progress
            .get_progress()
            .change_context(IndexerError::Storage)
            .attach_printable("failed to read indexing progress")?;

        let samples = self
            .progress
            .recent_metrics(RATE_SEED_SAMPLES)
            .change_context(IndexerError::Storage)?;
        self.rate = RateEstimator::seeded(
            RATE_SMOOTHING,
            samples.iter().map(|metric| metric.blocks_per_second),
        );

        let resume_height = progress.resume_height(self.options.start_height);
        info!(
            resume_height,
            last_indexed_height = ?progress.last_indexed_height,
            "starting historical indexing"
        );

        self.progress
            .start_run(resume_height)
            .change_context(IndexerError::Storage)?;

        self.status_tx.send_modify(|status| {
            status.last_indexed_height = progress.last_indexed_height;
            status.blocks_per_second = self.rate.value().unwrap_or_default();
        });
        self.publish_state(IndexerState::Indexing);

        loop {
            if ct.is_cancelled() {
                self.pause();
                return Ok(());
            }

            self.drain_commands();

            if let Err(err) = self.tick(&ct).await {
                warn!(error = ?err, "historical indexing stopped");
                if let Err(store_err) = self.progress.set_status(IndexingStatus::Error) {
                    warn!(error = ?store_err, "failed to store error status");
                }
                let message = report_message(&err);
                self.status_tx.send_modify(|status| {
                    status.state = IndexerState::Error;
                    status.is_active = false;
                    status.error = Some(message);
                });
                return Err(err);
            }
        }
    }

    async fn tick(&mut self, ct: &CancellationToken) -> Result<()> {
        let progress = self
            .progress
            .get_progress()
            .change_context(IndexerError::Storage)?;
        let resume_height = progress.resume_height(self.options.start_height);

        let tip = match self.chain.get_chain_height().await {
            Ok(tip) => tip,
            Err(err) => {
                warn!(error = ?err, "failed to get chain height");
                self.wait(ct, self.options.poll_interval).await;
                return Ok(());
            }
        };

        self.metrics.set_chain_height(tip);
        self.status_tx.send_modify(|status| status.chain_height = Some(tip));

        if resume_height > tip {
            if self.state() != IndexerState::Completed {
                info!(tip, "caught up with the chain");
                self.progress
                    .set_status(IndexingStatus::Completed)
                    .change_context(IndexerError::Storage)?;
                self.status_tx.send_modify(|status| {
                    status.eta_seconds = Some(0.0);
                    status.progress_percent = 100.0;
                });
                self.metrics.set_progress_percent(100.0);
                self.publish_state(IndexerState::Completed);
            }

            self.backfill_failed_blocks().await?;
            self.wait(ct, self.options.poll_interval).await;
            return Ok(());
        }

        if self.state() != IndexerState::Indexing {
            info!(resume_height, tip, "chain advanced, resuming indexing");
            self.publish_state(IndexerState::Indexing);
        }

        if !self.pending_retries.is_empty() {
            let heights = std::mem::take(&mut self.pending_retries);
            self.retry_failed_blocks(heights).await?;
        }

        self.index_batch(resume_height, tip, ct).await
    }

    async fn index_batch(
        &mut self,
        batch_start: u64,
        tip: u64,
        ct: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let batch_size = self.options.batch_size.max(1);
        let mut batch_end = u64::min(batch_start.saturating_add(batch_size - 1), tip);

        debug!(batch_start, batch_end, tip, "fetching batch");
        let heights = (batch_start..=batch_end).collect::<Vec<_>>();
        let fetched = self.chain.get_block_batch(heights).await;
        let first_not_found = fetched.first_not_found();
        let BatchFetch {
            mut blocks,
            mut failures,
        } = fetched;

        match first_not_found {
            Some(height) if height > batch_start => {
                // Stop before the first missing height, it's picked up again
                // by the next batch.
                batch_end = height - 1;
                blocks.retain(|height, _| *height <= batch_end);
                failures.retain(|err| err.height <= batch_end);
                self.stalled = None;
            }
            Some(height) => {
                let count = match self.stalled {
                    Some((stalled_height, count)) if stalled_height == height => count + 1,
                    _ => 1,
                };

                if count < self.options.max_retries {
                    debug!(height, count, "height not available yet");
                    self.stalled = Some((height, count));
                    self.wait(ct, self.options.poll_interval).await;
                    return Ok(());
                }

                warn!(height, "height still missing, recording it as failed");
                self.stalled = None;
            }
            None => {
                self.stalled = None;
            }
        }

        let fetch_failed = failures.iter().map(new_failed_block).collect::<Vec<_>>();
        let items = blocks.into_values().collect::<Vec<_>>();
        let rate = self.rate;

        let processor = self.processor.clone();
        let processed = tokio::task::spawn_blocking(move || {
            processor.process_batch_with(&items, |connection, outcome| {
                let duration = started.elapsed();
                let blocks_per_second =
                    (batch_end + 1 - batch_start) as f64 / duration.as_secs_f64().max(1e-3);
                let mut rate = rate;
                let smoothed_blocks_per_second = rate.update(blocks_per_second);

                let mut failed = fetch_failed.clone();
                failed.extend(outcome.failed.iter().map(failed_height));

                let commit = BatchCommit {
                    start_height: batch_start,
                    end_height: batch_end,
                    target_height: tip,
                    committed: outcome.committed.clone(),
                    failed,
                    duration,
                    blocks_per_second,
                    smoothed_blocks_per_second,
                    eta: eta(tip - batch_end, smoothed_blocks_per_second),
                };

                ProgressStore::commit_batch(connection, &commit)?;

                Ok((commit, rate))
            })
        })
        .await
        .change_context(IndexerError::Fatal)
        .attach_printable("batch processing task panicked")?;

        let (_, (commit, rate)) = processed
            .change_context(IndexerError::Storage)
            .attach_printable_lazy(|| format!("batch: {batch_start}-{batch_end}"))?;

        self.rate = rate;

        let progress_percent = self.progress_percent(batch_end, tip);
        self.metrics.record_batch(commit.blocks_committed(), commit.duration);
        self.metrics.record_failed_blocks(commit.failed.len() as u64);
        self.metrics.set_last_indexed_height(batch_end);
        self.metrics
            .set_blocks_per_second(commit.smoothed_blocks_per_second);
        self.metrics.set_progress_percent(progress_percent);

        self.status_tx.send_modify(|status| {
            status.last_indexed_height = Some(batch_end);
            status.blocks_per_second = commit.smoothed_blocks_per_second;
            status.eta_seconds = commit.eta.map(|eta| eta.as_secs_f64());
            status.progress_percent = progress_percent;
        });

        for failed in &commit.failed {
            warn!(height = failed.height, error = %failed.error_message, "failed to index block");
        }

        info!(
            batch_start,
            batch_end,
            blocks = commit.blocks_committed(),
            failed = commit.failed.len(),
            blocks_per_second = commit.smoothed_blocks_per_second,
            "indexed batch"
        );

        Ok(())
    }

    /// Retry failed heights once caught up, together with queued manual retries.
    async fn backfill_failed_blocks(&mut self) -> Result<()> {
        let mut heights = std::mem::take(&mut self.pending_retries);

        let candidates = self
            .progress
            .failed_blocks_to_retry(
                self.options.backfill_batch_size,
                self.options.max_failed_block_retries,
            )
            .change_context(IndexerError::Storage)?;
        heights.extend(candidates.into_iter().map(|failed| failed.height));

        heights.sort_unstable();
        heights.dedup();

        self.retry_failed_blocks(heights).await
    }

    async fn retry_failed_blocks(&mut self, heights: Vec<u64>) -> Result<()> {
        if heights.is_empty() {
            return Ok(());
        }

        debug!(heights = ?heights, "retrying failed blocks");
        let BatchFetch { blocks, failures } = self.chain.get_block_batch(heights).await;

        let fetch_failed = failures.iter().map(new_failed_block).collect::<Vec<_>>();
        let items = blocks.into_values().collect::<Vec<_>>();

        let processor = self.processor.clone();
        let processed = tokio::task::spawn_blocking(move || {
            processor.process_batch_with(&items, |connection, outcome| {
                let mut failed = fetch_failed.clone();
                failed.extend(outcome.failed.iter().map(failed_height));
                ProgressStore::commit_retry(connection, &outcome.committed, &failed)?;
                Ok(failed)
            })
        })
        .await
        .change_context(IndexerError::Fatal)
        .attach_printable("retry task panicked")?;

        let (outcome, failed) = processed
            .change_context(IndexerError::Storage)
            .attach_printable("failed to persist retried blocks")?;

        self.metrics.record_failed_blocks(failed.len() as u64);

        info!(
            resolved = outcome.committed.len(),
            failed = failed.len(),
            "retried failed blocks"
        );

        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            self.queue_command(command);
        }
    }

    fn queue_command(&mut self, command: IndexerCommand) {
        match command {
            IndexerCommand::RetryFailedBlock(height) => {
                debug!(height, "manual retry queued");
                self.pending_retries.push(height);
            }
        }
    }

    /// Sleep, waking up early on cancellation or on a new command.
    async fn wait(&mut self, ct: &CancellationToken, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = ct.cancelled() => {}
            Some(command) = self.commands_rx.recv() => self.queue_command(command),
        }
    }

    fn pause(&mut self) {
        info!("historical indexing paused");
        if let Err(err) = self.progress.set_status(IndexingStatus::Paused) {
            warn!(error = ?err, "failed to store paused status");
        }
        self.publish_state(IndexerState::Paused);
    }

    fn state(&self) -> IndexerState {
        self.status_tx.borrow().state
    }

    fn publish_state(&self, state: IndexerState) {
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.is_active = state.is_active();
        });
    }

    fn progress_percent(&self, height: u64, tip: u64) -> f64 {
        let start = self.options.start_height;
        if tip < start {
            return 100.0;
        }
        let total = (tip + 1 - start) as f64;
        let done = (height + 1).saturating_sub(start) as f64;
        (done / total * 100.0).min(100.0)
    }
}

impl IndexerHandle {
    pub fn status(&self) -> IndexerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IndexerStatus> {
        self.status.clone()
    }

    /// Queue a failed height for retry at the next batch boundary.
    pub async fn retry_failed_block(&self, height: u64) -> Result<()> {
        self.commands
            .send(IndexerCommand::RetryFailedBlock(height))
            .await
            .map_err(|_| Report::new(IndexerError::Fatal))
            .attach_printable("indexer is not running")
    }
}

impl IndexerState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            IndexerState::Initializing | IndexerState::Indexing | IndexerState::Completed
        )
    }
}

impl Default for IndexerStatus {
    fn default() -> Self {
        Self {
            state: IndexerState::Idle,
            is_active: false,
            last_indexed_height: None,
            chain_height: None,
            blocks_per_second: 0.0,
            eta_seconds: None,
            progress_percent: 0.0,
            error: None,
        }
    }
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            start_height: 1,
            batch_size: 100,
            max_retries: 3,
            poll_interval: Duration::from_secs(5),
            backfill_batch_size: 20,
            max_failed_block_retries: 10,
        }
    }
}

impl RateEstimator {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Estimator primed with historical samples, oldest first.
    pub fn seeded(alpha: f64, samples: impl IntoIterator<Item = f64>) -> Self {
        let mut estimator = Self::new(alpha);
        for sample in samples {
            estimator.update(sample);
        }
        estimator
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let value = match self.value {
            None => sample,
            Some(previous) => self.alpha * sample + (1.0 - self.alpha) * previous,
        };
        self.value = Some(value);
        value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Time left to index `remaining` blocks at `blocks_per_second`.
pub fn eta(remaining: u64, blocks_per_second: f64) -> Option<Duration> {
    if remaining == 0 {
        return Some(Duration::ZERO);
    }
    if !blocks_per_second.is_finite() || blocks_per_second <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(remaining as f64 / blocks_per_second))
}

fn new_failed_block(err: &FetchError) -> NewFailedBlock {
    NewFailedBlock {
        height: err.height,
        error_message: format!("{err}: {}", err.cause),
        attempts: err.attempts.max(1),
    }
}

fn failed_height(failed: &FailedHeight) -> NewFailedBlock {
    NewFailedBlock {
        height: failed.height,
        error_message: failed.error.clone(),
        attempts: failed.attempts,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{eta, IndexerState, RateEstimator};

    #[test]
    fn test_rate_estimator_smooths_samples() {
        let mut rate = RateEstimator::new(0.3);
        assert_eq!(rate.value(), None);

        assert_eq!(rate.update(10.0), 10.0);
        let smoothed = rate.update(20.0);
        assert!((smoothed - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_estimator_seeded() {
        let rate = RateEstimator::seeded(0.3, [10.0, 20.0]);
        assert!((rate.value().unwrap() - 13.0).abs() < 1e-9);

        let empty = RateEstimator::seeded(0.3, std::iter::empty());
        assert_eq!(empty.value(), None);
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta(0, 0.0), Some(Duration::ZERO));
        assert_eq!(eta(100, 0.0), None);
        assert_eq!(eta(100, 50.0), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_active_states() {
        assert!(IndexerState::Indexing.is_active());
        assert!(IndexerState::Completed.is_active());
        assert!(!IndexerState::Paused.is_active());
        assert!(!IndexerState::Error.is_active());
    }
}
