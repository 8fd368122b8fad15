use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use error_stack::{Report, Result, ResultExt};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;

use super::{Database, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockRow {
    pub height: u64,
    pub hash: String,
    pub chain_id: String,
    pub proposer_address: String,
    pub time: DateTime<Utc>,
    pub tx_count: u32,
    pub gas_used: i64,
    pub gas_wanted: i64,
    pub evidence_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRow {
    pub hash: String,
    pub block_height: u64,
    pub tx_index: u32,
    pub status: String,
    pub code: u32,
    pub codespace: String,
    pub gas_used: i64,
    pub gas_wanted: i64,
    pub raw_log: String,
    pub time: DateTime<Utc>,
    /// Events as emitted by the node, json encoded.
    pub events: String,
    /// Addresses found in `message.sender`.
    #[serde(skip)]
    pub senders: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Tx,
    BeginBlock,
    EndBlock,
    FinalizeBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRow {
    pub block_height: u64,
    pub tx_hash: Option<String>,
    pub source: EventSource,
    /// Zero for block level events.
    pub tx_index: u32,
    pub event_index: u32,
    pub event_type: String,
    pub module: String,
    pub attributes: String,
}

/// All rows derived from one block.
#[derive(Debug, Clone)]
pub struct IndexedBlock {
    pub block: BlockRow,
    pub transactions: Vec<TransactionRow>,
    pub events: Vec<EventRow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentCounts {
    pub blocks: u64,
    pub transactions: u64,
    pub events: u64,
    pub accounts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountRow {
    pub address: String,
    pub tx_count: u64,
    pub first_seen_height: u64,
    pub last_seen_height: u64,
}

/// Indexed blocks, transactions, events and accounts.
#[derive(Clone)]
pub struct ContentStore {
    db: Database,
}

impl ContentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Replace all rows of `block.height` with `block`.
    ///
    /// Writing the same block twice leaves the tables unchanged.
    pub fn write_block(connection: &Connection, indexed: &IndexedBlock) -> Result<(), StoreError> {
        let height = indexed.block.height;
        let mut touched = delete_height(connection, height)?;

        let block = &indexed.block;
        connection
            .execute(
                r#"
                INSERT INTO blocks
                    (height, hash, chain_id, proposer_address, time, tx_count, gas_used, gas_wanted, evidence_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                params![
                    block.height,
                    block.hash,
                    block.chain_id,
                    block.proposer_address,
                    block.time,
                    block.tx_count,
                    block.gas_used,
                    block.gas_wanted,
                    block.evidence_count
                ],
            )
            .map_err(classify)
            .attach_printable("failed to insert block")
            .attach_printable_lazy(|| format!("height: {height}"))?;

        for tx in &indexed.transactions {
            connection
                .execute(
                    r#"
                    INSERT INTO transactions
                        (hash, block_height, tx_index, status, code, codespace, gas_used, gas_wanted, raw_log, time, events)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                    params![
                        tx.hash,
                        tx.block_height,
                        tx.tx_index,
                        tx.status,
                        tx.code,
                        tx.codespace,
                        tx.gas_used,
                        tx.gas_wanted,
                        tx.raw_log,
                        tx.time,
                        tx.events
                    ],
                )
                .map_err(classify)
                .attach_printable("failed to insert transaction")
                .attach_printable_lazy(|| format!("hash: {}", tx.hash))?;

            for sender in &tx.senders {
                connection
                    .execute(
                        r#"
                        INSERT OR IGNORE INTO account_transactions (address, tx_hash, block_height)
                        VALUES (?1, ?2, ?3)"#,
                        params![sender, tx.hash, height],
                    )
                    .map_err(classify)
                    .attach_printable("failed to insert account transaction")?;
                touched.insert(sender.clone());
            }
        }

        for event in &indexed.events {
            connection
                .execute(
                    r#"
                    INSERT INTO events
                        (block_height, tx_hash, source, tx_index, event_index, event_type, module, attributes)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
                    params![
                        event.block_height,
                        event.tx_hash,
                        event.source.as_str(),
                        event.tx_index,
                        event.event_index,
                        event.event_type,
                        event.module,
                        event.attributes
                    ],
                )
                .map_err(classify)
                .attach_printable("failed to insert event")
                .attach_printable_lazy(|| format!("event type: {}", event.event_type))?;
        }

        for address in &touched {
            refresh_account(connection, address)?;
        }

        Ok(())
    }

    pub fn get_block(&self, height: u64) -> Result<Option<BlockRow>, StoreError> {
        let connection = self.db.lock()?;
        connection
            .query_row(
                r#"
                SELECT height, hash, chain_id, proposer_address, time, tx_count,
                       gas_used, gas_wanted, evidence_count
                FROM blocks
                WHERE height = ?1"#,
                params![height],
                |row| {
                    Ok(BlockRow {
                        height: row.get(0)?,
                        hash: row.get(1)?,
                        chain_id: row.get(2)?,
                        proposer_address: row.get(3)?,
                        time: row.get(4)?,
                        tx_count: row.get(5)?,
                        gas_used: row.get(6)?,
                        gas_wanted: row.get(7)?,
                        evidence_count: row.get(8)?,
                    })
                },
            )
            .optional()
            .change_context(StoreError::Database)
            .attach_printable("failed to read block")
    }

    pub fn get_account(&self, address: &str) -> Result<Option<AccountRow>, StoreError> {
        let connection = self.db.lock()?;
        connection
            .query_row(
                r#"
                SELECT address, tx_count, first_seen_height, last_seen_height
                FROM accounts
                WHERE address = ?1"#,
                params![address],
                |row| {
                    Ok(AccountRow {
                        address: row.get(0)?,
                        tx_count: row.get(1)?,
                        first_seen_height: row.get(2)?,
                        last_seen_height: row.get(3)?,
                    })
                },
            )
            .optional()
            .change_context(StoreError::Database)
            .attach_printable("failed to read account")
    }

    pub fn counts(&self) -> Result<ContentCounts, StoreError> {
        let connection = self.db.lock()?;
        connection
            .query_row(
                r#"
                SELECT (SELECT COUNT(*) FROM blocks),
                       (SELECT COUNT(*) FROM transactions),
                       (SELECT COUNT(*) FROM events),
                       (SELECT COUNT(*) FROM accounts)"#,
                [],
                |row| {
                    Ok(ContentCounts {
                        blocks: row.get(0)?,
                        transactions: row.get(1)?,
                        events: row.get(2)?,
                        accounts: row.get(3)?,
                    })
                },
            )
            .change_context(StoreError::Database)
            .attach_printable("failed to count rows")
    }
}

/// Deletes the rows of `height`, returning the accounts it referenced.
fn delete_height(connection: &Connection, height: u64) -> Result<BTreeSet<String>, StoreError> {
    let mut statement = connection
        .prepare("SELECT address FROM account_transactions WHERE block_height = ?1")
        .change_context(StoreError::Database)?;
    let touched = statement
        .query_map(params![height], |row| row.get::<_, String>(0))
        .change_context(StoreError::Database)?
        .collect::<rusqlite::Result<BTreeSet<_>>>()
        .change_context(StoreError::Database)?;

    for table in ["events", "account_transactions", "transactions"] {
        connection
            .execute(
                &format!("DELETE FROM {table} WHERE block_height = ?1"),
                params![height],
            )
            .change_context(StoreError::Database)
            .attach_printable_lazy(|| format!("failed to delete from {table}"))?;
    }

    connection
        .execute("DELETE FROM blocks WHERE height = ?1", params![height])
        .change_context(StoreError::Database)
        .attach_printable("failed to delete block")?;

    Ok(touched)
}

fn refresh_account(connection: &Connection, address: &str) -> Result<(), StoreError> {
    connection
        .execute(
            r#"
            INSERT INTO accounts (address, tx_count, first_seen_height, last_seen_height)
            SELECT address, COUNT(*), MIN(block_height), MAX(block_height)
            FROM account_transactions
            WHERE address = ?1
            GROUP BY address
            ON CONFLICT (address) DO UPDATE SET
                tx_count = excluded.tx_count,
                first_seen_height = excluded.first_seen_height,
                last_seen_height = excluded.last_seen_height"#,
            params![address],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to update account")?;

    connection
        .execute(
            r#"
            DELETE FROM accounts
            WHERE address = ?1
              AND NOT EXISTS (SELECT 1 FROM account_transactions WHERE address = ?1)"#,
            params![address],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to remove account")?;

    Ok(())
}

/// Constraint violations are caused by the data, everything else by the database.
fn classify(err: rusqlite::Error) -> Report<StoreError> {
    let context = match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Constraint,
        _ => StoreError::Database,
    };
    Report::new(err).change_context(context)
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Tx => "tx",
            EventSource::BeginBlock => "begin_block",
            EventSource::EndBlock => "end_block",
            EventSource::FinalizeBlock => "finalize_block",
        }
    }
}
