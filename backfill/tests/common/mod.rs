#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use comet_backfill::{
    chain::{BatchFetch, ChainClientError, ChainSource, FetchError, FetchErrorKind},
    orchestrator::IndexerOptions,
    provider::BlockWithResults,
};
use error_stack::Result;
use serde_json::{json, Value};

pub const TXS_PER_BLOCK: usize = 2;

pub fn block_json(height: u64) -> Value {
    block_json_with_time(height, "2024-01-01T00:00:00Z")
}

pub fn block_json_with_time(height: u64, time: &str) -> Value {
    let txs = (0..TXS_PER_BLOCK)
        .map(|index| BASE64.encode(format!("tx-{height}-{index}")))
        .collect::<Vec<_>>();

    json!({
        "block_id": { "hash": format!("HASH{height}") },
        "block": {
            "header": {
                "chain_id": "test-1",
                "height": height.to_string(),
                "time": time,
                "proposer_address": "PROPOSER"
            },
            "data": { "txs": txs },
            "evidence": { "evidence": [] }
        }
    })
}

pub fn block_results_json(height: u64) -> Value {
    let txs_results = (0..TXS_PER_BLOCK)
        .map(|index| {
            json!({
                "code": 0,
                "gas_wanted": "200",
                "gas_used": "100",
                "events": [{
                    "type": "message",
                    "attributes": [
                        { "key": "sender", "value": format!("addr-{height}-{index}") },
                        { "key": "module", "value": "bank" }
                    ]
                }]
            })
        })
        .collect::<Vec<_>>();

    json!({
        "height": height.to_string(),
        "txs_results": txs_results,
        "finalize_block_events": [{
            "type": "commission",
            "attributes": [{ "key": "amount", "value": "1stake" }]
        }]
    })
}

pub fn block_with_results(height: u64) -> BlockWithResults {
    BlockWithResults {
        height,
        block: serde_json::from_value(block_json(height)).unwrap(),
        results: serde_json::from_value(block_results_json(height)).unwrap(),
    }
}

/// A block the node returns but the processor rejects.
pub fn invalid_block(height: u64) -> BlockWithResults {
    BlockWithResults {
        height,
        block: serde_json::from_value(block_json_with_time(height, "not a time")).unwrap(),
        results: serde_json::from_value(block_results_json(height)).unwrap(),
    }
}

pub fn jsonrpc_result(result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": 1, "result": result })
}

pub fn status_json(height: u64) -> Value {
    json!({
        "sync_info": {
            "latest_block_height": height.to_string(),
            "latest_block_hash": format!("HASH{height}"),
            "catching_up": false
        }
    })
}

/// Options with short intervals so that tests don't sleep for long.
pub fn test_options() -> IndexerOptions {
    IndexerOptions {
        enabled: true,
        start_height: 1,
        batch_size: 100,
        max_retries: 3,
        poll_interval: Duration::from_millis(10),
        backfill_batch_size: 20,
        max_failed_block_retries: 10,
    }
}

#[derive(Default)]
struct FakeChainState {
    tip: u64,
    /// Heights above this are reported as not found, even below the tip.
    available: Option<u64>,
    unreachable: BTreeSet<u64>,
    invalid: BTreeSet<u64>,
    batches: Vec<Vec<u64>>,
}

/// In-memory chain. Clones share the same state.
#[derive(Clone, Default)]
pub struct FakeChain {
    state: Arc<Mutex<FakeChainState>>,
}

impl FakeChain {
    pub fn new(tip: u64) -> Self {
        let chain = Self::default();
        chain.set_tip(tip);
        chain
    }

    pub fn set_tip(&self, tip: u64) {
        self.state.lock().unwrap().tip = tip;
    }

    pub fn set_available(&self, height: u64) {
        self.state.lock().unwrap().available = Some(height);
    }

    /// Every fetch of `height` runs out of retries.
    pub fn set_unreachable(&self, height: u64) {
        self.state.lock().unwrap().unreachable.insert(height);
    }

    pub fn set_invalid(&self, height: u64) {
        self.state.lock().unwrap().invalid.insert(height);
    }

    pub fn fix(&self, height: u64) {
        let mut state = self.state.lock().unwrap();
        state.unreachable.remove(&height);
        state.invalid.remove(&height);
    }

    /// Heights requested by each batch, in order.
    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.state.lock().unwrap().batches.clone()
    }

    fn fetch(&self, height: u64) -> std::result::Result<BlockWithResults, FetchError> {
        let state = self.state.lock().unwrap();
        let available = state.available.unwrap_or(state.tip).min(state.tip);

        if height > available {
            return Err(FetchError {
                height,
                kind: FetchErrorKind::NotFound,
                attempts: 1,
                cause: "not found".to_string(),
            });
        }

        if state.unreachable.contains(&height) {
            return Err(FetchError {
                height,
                kind: FetchErrorKind::Exhausted,
                attempts: 3,
                cause: "server error".to_string(),
            });
        }

        if state.invalid.contains(&height) {
            return Ok(invalid_block(height));
        }

        Ok(block_with_results(height))
    }
}

impl ChainSource for FakeChain {
    async fn get_chain_height(&self) -> Result<u64, ChainClientError> {
        Ok(self.state.lock().unwrap().tip)
    }

    async fn get_block_batch(&self, heights: Vec<u64>) -> BatchFetch {
        self.state.lock().unwrap().batches.push(heights.clone());
        BatchFetch::from_results(heights.into_iter().map(|height| self.fetch(height)))
    }
}
