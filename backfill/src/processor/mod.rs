//! Persist fetched blocks, one transaction per batch.
//!
//! A batch is written as a whole and retried as a whole. If it keeps failing,
//! the processor falls back to writing each height in its own savepoint so
//! that a malformed block only loses its own height.

mod parse;

use std::fmt;

use error_stack::{Result, ResultExt};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::{
    error::report_message,
    provider::BlockWithResults,
    store::{ContentStore, Database, StoreError},
};

pub use self::parse::{event_module, index_block, tx_hash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// The block can't be turned into rows.
    InvalidBlock,
    Storage,
}

/// A height that could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedHeight {
    pub height: u64,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub committed: Vec<u64>,
    pub failed: Vec<FailedHeight>,
}

#[derive(Clone)]
pub struct BatchProcessor {
    db: Database,
    max_retries: u32,
}

impl BatchProcessor {
    pub fn new(db: Database, max_retries: u32) -> Self {
        Self {
            db,
            max_retries: max_retries.max(1),
        }
    }

    pub fn process_batch(&self, items: &[BlockWithResults]) -> Result<BatchOutcome, ProcessorError> {
        let (outcome, _) = self.process_batch_with(items, |_, _| Ok(()))?;
        Ok(outcome)
    }

    /// Persist `items` and run `hook` inside the same transaction.
    ///
    /// The hook sees the final outcome and is used to write bookkeeping that
    /// must become visible together with the rows. If the hook fails, nothing
    /// is committed.
    pub fn process_batch_with<T, F>(
        &self,
        items: &[BlockWithResults],
        mut hook: F,
    ) -> Result<(BatchOutcome, T), ProcessorError>
    where
        F: FnMut(&Connection, &BatchOutcome) -> Result<T, StoreError>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            match self.write_batch(items, &mut hook) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    debug!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %err.current_context(),
                        "batch write failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        if let Some(err) = last_error {
            warn!(
                blocks = items.len(),
                error = ?err,
                "batch keeps failing, writing heights one by one"
            );
        }

        self.write_isolated(items, &mut hook)
    }

    fn write_batch<T, F>(
        &self,
        items: &[BlockWithResults],
        hook: &mut F,
    ) -> Result<(BatchOutcome, T), ProcessorError>
    where
        F: FnMut(&Connection, &BatchOutcome) -> Result<T, StoreError>,
    {
        let mut connection = self.db.lock().change_context(ProcessorError::Storage)?;
        let tx = connection
            .transaction()
            .change_context(ProcessorError::Storage)
            .attach_printable("failed to begin batch transaction")?;

        for item in items {
            write_item(&tx, item)?;
        }

        let outcome = BatchOutcome {
            committed: items.iter().map(|item| item.height).collect(),
            failed: Vec::new(),
        };

        let value = hook(&tx, &outcome).change_context(ProcessorError::Storage)?;

        tx.commit()
            .change_context(ProcessorError::Storage)
            .attach_printable("failed to commit batch")?;

        Ok((outcome, value))
    }

    /// Write every height in its own savepoint of one transaction.
    ///
    /// Invalid blocks are reported as failed heights. Storage errors abort
    /// the whole batch.
    fn write_isolated<T, F>(
        &self,
        items: &[BlockWithResults],
        hook: &mut F,
    ) -> Result<(BatchOutcome, T), ProcessorError>
    where
        F: FnMut(&Connection, &BatchOutcome) -> Result<T, StoreError>,
    {
        let mut connection = self.db.lock().change_context(ProcessorError::Storage)?;
        let mut tx = connection
            .transaction()
            .change_context(ProcessorError::Storage)
            .attach_printable("failed to begin batch transaction")?;

        let mut outcome = BatchOutcome::default();

        for item in items {
            let mut savepoint = tx
                .savepoint()
                .change_context(ProcessorError::Storage)
                .attach_printable("failed to create savepoint")?;

            match write_item(&savepoint, item) {
                Ok(()) => {
                    savepoint
                        .commit()
                        .change_context(ProcessorError::Storage)
                        .attach_printable("failed to release savepoint")?;
                    outcome.committed.push(item.height);
                }
                Err(err) if err.current_context() == &ProcessorError::InvalidBlock => {
                    warn!(height = item.height, error = ?err, "invalid block");
                    savepoint
                        .rollback()
                        .change_context(ProcessorError::Storage)
                        .attach_printable("failed to roll back savepoint")?;
                    outcome.failed.push(FailedHeight {
                        height: item.height,
                        attempts: self.max_retries,
                        error: report_message(&err),
                    });
                }
                Err(err) => {
                    return Err(err).attach_printable_lazy(|| format!("height: {}", item.height));
                }
            }
        }

        let value = hook(&tx, &outcome).change_context(ProcessorError::Storage)?;

        tx.commit()
            .change_context(ProcessorError::Storage)
            .attach_printable("failed to commit batch")?;

        Ok((outcome, value))
    }
}

fn write_item(connection: &Connection, item: &BlockWithResults) -> Result<(), ProcessorError> {
    let indexed = index_block(item)?;
    ContentStore::write_block(connection, &indexed).map_err(|err| {
        let context = if err.current_context() == &StoreError::Constraint {
            ProcessorError::InvalidBlock
        } else {
            ProcessorError::Storage
        };
        err.change_context(context)
            .attach_printable(format!("height: {}", item.height))
    })
}

impl error_stack::Context for ProcessorError {}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::InvalidBlock => write!(f, "invalid block"),
            ProcessorError::Storage => write!(f, "failed to persist batch"),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::json;

    use crate::provider::BlockWithResults;

    /// A block with `tx_count` transactions, each sent by `addr-{height}-{index}`.
    pub fn block_with_results(height: u64, tx_count: usize) -> BlockWithResults {
        let txs = (0..tx_count)
            .map(|index| BASE64.encode(format!("tx-{height}-{index}")))
            .collect::<Vec<_>>();

        let txs_results = (0..tx_count)
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

        let block = json!({
            "block_id": { "hash": format!("HASH{height}") },
            "block": {
                "header": {
                    "chain_id": "test-1",
                    "height": height.to_string(),
                    "time": "2024-01-01T00:00:00Z",
                    "proposer_address": "PROPOSER"
                },
                "data": { "txs": txs },
                "evidence": { "evidence": [] }
            }
        });

        let results = json!({
            "height": height.to_string(),
            "txs_results": txs_results,
            "finalize_block_events": [{
                "type": "commission",
                "attributes": [{ "key": "amount", "value": "1stake" }]
            }]
        });

        BlockWithResults {
            height,
            block: serde_json::from_value(block).unwrap(),
            results: serde_json::from_value(results).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use error_stack::Report;

    use crate::store::{ContentStore, Database, StoreError};

    use super::{fixtures::block_with_results, BatchProcessor, ProcessorError};

    #[test]
    fn test_process_batch_commits_all_heights() {
        let db = Database::open_in_memory().unwrap();
        let processor = BatchProcessor::new(db.clone(), 3);

        let items = (1..=5).map(|h| block_with_results(h, 2)).collect::<Vec<_>>();
        let outcome = processor.process_batch(&items).unwrap();

        assert_eq!(outcome.committed, vec![1, 2, 3, 4, 5]);
        assert!(outcome.failed.is_empty());

        let counts = ContentStore::new(db).counts().unwrap();
        assert_eq!(counts.blocks, 5);
        assert_eq!(counts.transactions, 10);
        assert_eq!(counts.events, 15);
        assert_eq!(counts.accounts, 10);
    }

    #[test]
    fn test_process_batch_twice_does_not_duplicate_rows() {
        let db = Database::open_in_memory().unwrap();
        let processor = BatchProcessor::new(db.clone(), 3);

        let items = (1..=3).map(|h| block_with_results(h, 1)).collect::<Vec<_>>();
        processor.process_batch(&items).unwrap();
        processor.process_batch(&items).unwrap();

        let counts = ContentStore::new(db).counts().unwrap();
        assert_eq!(counts.blocks, 3);
        assert_eq!(counts.transactions, 3);
        assert_eq!(counts.accounts, 3);
    }

    #[test]
    fn test_invalid_block_is_isolated() {
        let db = Database::open_in_memory().unwrap();
        let processor = BatchProcessor::new(db.clone(), 3);

        let mut items = (1..=4).map(|h| block_with_results(h, 1)).collect::<Vec<_>>();
        items[2].block.block.header.time = "yesterday".to_string();

        let outcome = processor.process_batch(&items).unwrap();

        assert_eq!(outcome.committed, vec![1, 2, 4]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].height, 3);
        assert_eq!(outcome.failed[0].attempts, 3);

        let content = ContentStore::new(db);
        assert!(content.get_block(3).unwrap().is_none());
        assert!(content.get_block(4).unwrap().is_some());
    }

    #[test]
    fn test_constraint_violation_is_invalid_block() {
        let db = Database::open_in_memory().unwrap();
        let processor = BatchProcessor::new(db.clone(), 2);

        // The same raw transaction twice in one block has the same hash.
        let mut item = block_with_results(9, 1);
        let tx = item.block.block.data.txs[0].clone();
        let result = item.results.txs_results[0].clone();
        item.block.block.data.txs.push(tx);
        item.results.txs_results.push(result);

        let outcome = processor.process_batch(&[item]).unwrap();
        assert!(outcome.committed.is_empty());
        assert_eq!(outcome.failed[0].height, 9);

        let counts = ContentStore::new(db).counts().unwrap();
        assert_eq!(counts.transactions, 0);
    }

    #[test]
    fn test_hook_failure_rolls_back_rows() {
        let db = Database::open_in_memory().unwrap();
        let processor = BatchProcessor::new(db.clone(), 2);

        let items = (1..=3).map(|h| block_with_results(h, 1)).collect::<Vec<_>>();
        let mut calls = 0;
        let err = processor
            .process_batch_with(&items, |_, _| -> error_stack::Result<(), StoreError> {
                calls += 1;
                Err(Report::new(StoreError::Database))
            })
            .unwrap_err();

        assert_eq!(err.current_context(), &ProcessorError::Storage);
        // two batch attempts plus the isolated write
        assert_eq!(calls, 3);

        let counts = ContentStore::new(db).counts().unwrap();
        assert_eq!(counts.blocks, 0);
    }

    #[test]
    fn test_hook_sees_outcome() {
        let db = Database::open_in_memory().unwrap();
        let processor = BatchProcessor::new(db, 1);

        let items = vec![block_with_results(1, 0), block_with_results(2, 0)];
        let (_, heights) = processor
            .process_batch_with(&items, |connection, outcome| {
                let blocks: u64 = connection
                    .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
                    .unwrap();
                assert_eq!(blocks, 2);
                Ok(outcome.committed.clone())
            })
            .unwrap();

        assert_eq!(heights, vec![1, 2]);
    }
}
