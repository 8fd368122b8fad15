//! Indexer metrics.
//!
//! The orchestrator reports through a [MetricsSink] it owns, so tests and
//! embedders can swap the OpenTelemetry instruments out.

use std::time::Duration;

use comet_backfill_observability::{Counter, Gauge, Histogram};

pub trait MetricsSink: Send + Sync + 'static {
    fn record_batch(&self, blocks: u64, duration: Duration);
    fn record_failed_blocks(&self, count: u64);
    fn set_last_indexed_height(&self, height: u64);
    fn set_chain_height(&self, height: u64);
    fn set_blocks_per_second(&self, rate: f64);
    fn set_progress_percent(&self, percent: f64);
}

/// Discards all measurements.
#[derive(Debug, Clone, Default)]
pub struct NoopMetrics;

#[derive(Debug, Clone)]
pub struct OpenTelemetryMetrics {
    pub blocks_indexed: Counter<u64>,
    pub batch_duration: Histogram<f64>,
    pub failed_blocks: Counter<u64>,
    pub last_indexed_height: Gauge<u64>,
    pub chain_height: Gauge<u64>,
    pub blocks_per_second: Gauge<f64>,
    pub progress_percent: Gauge<f64>,
}

impl MetricsSink for NoopMetrics {
    fn record_batch(&self, _blocks: u64, _duration: Duration) {}
    fn record_failed_blocks(&self, _count: u64) {}
    fn set_last_indexed_height(&self, _height: u64) {}
    fn set_chain_height(&self, _height: u64) {}
    fn set_blocks_per_second(&self, _rate: f64) {}
    fn set_progress_percent(&self, _percent: f64) {}
}

impl Default for OpenTelemetryMetrics {
    fn default() -> Self {
        let meter = comet_backfill_observability::meter("comet_backfill");

        Self {
            blocks_indexed: meter
                .u64_counter("backfill.blocks_indexed")
                .with_description("blocks committed by the historical indexer")
                .with_unit("{block}")
                .build(),
            batch_duration: meter
                .f64_histogram("backfill.batch.duration")
                .with_description("time to fetch and commit one batch")
                .with_unit("s")
                .with_boundaries(vec![
                    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0,
                ])
                .build(),
            failed_blocks: meter
                .u64_counter("backfill.failed_blocks")
                .with_description("heights recorded as failed")
                .with_unit("{block}")
                .build(),
            last_indexed_height: meter
                .u64_gauge("backfill.last_indexed_height")
                .with_description("highest height fully committed")
                .with_unit("{block}")
                .build(),
            chain_height: meter
                .u64_gauge("backfill.chain_height")
                .with_description("chain's latest height")
                .with_unit("{block}")
                .build(),
            blocks_per_second: meter
                .f64_gauge("backfill.blocks_per_second")
                .with_description("smoothed indexing rate")
                .build(),
            progress_percent: meter
                .f64_gauge("backfill.progress")
                .with_description("indexed share of the chain, in percent")
                .with_unit("%")
                .build(),
        }
    }
}

impl MetricsSink for OpenTelemetryMetrics {
    fn record_batch(&self, blocks: u64, duration: Duration) {
        self.blocks_indexed.add(blocks, &[]);
        self.batch_duration.record(duration.as_secs_f64(), &[]);
    }

    fn record_failed_blocks(&self, count: u64) {
        self.failed_blocks.add(count, &[]);
    }

    fn set_last_indexed_height(&self, height: u64) {
        self.last_indexed_height.record(height, &[]);
    }

    fn set_chain_height(&self, height: u64) {
        self.chain_height.record(height, &[]);
    }

    fn set_blocks_per_second(&self, rate: f64) {
        self.blocks_per_second.record(rate, &[]);
    }

    fn set_progress_percent(&self, percent: f64) {
        self.progress_percent.record(percent, &[]);
    }
}
