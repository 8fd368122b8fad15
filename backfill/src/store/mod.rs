//! SQLite persistence for indexing progress and indexed content.
//!
//! A single connection is shared behind a mutex. The indexer is the only
//! writer; the status server only reads.

mod content;
mod progress;

use std::{
    fmt,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use error_stack::{Report, Result, ResultExt};
use rusqlite::Connection;

pub use self::content::{
    AccountRow, BlockRow, ContentCounts, ContentStore, EventRow, EventSource, IndexedBlock,
    TransactionRow,
};
pub use self::progress::{
    BatchCommit, FailedBlock, FailedBlockResetPolicy, IndexingCheckpoint, IndexingMetric,
    IndexingProgress, IndexingStatistics, IndexingStatus, NewFailedBlock, ProgressStore,
};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS indexing_progress (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_indexed_height INTEGER,
        total_blocks_indexed INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        start_height INTEGER,
        target_height INTEGER,
        started_at TEXT,
        completed_at TEXT,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS failed_blocks (
        height INTEGER PRIMARY KEY,
        error_message TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        last_retry_at TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS failed_blocks_unresolved ON failed_blocks(resolved, height);
    CREATE TABLE IF NOT EXISTS indexing_checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        height INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        blocks_per_second REAL NOT NULL,
        eta_seconds REAL,
        UNIQUE(height, created_at)
    );
    CREATE TABLE IF NOT EXISTS indexing_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        blocks_per_second REAL NOT NULL,
        blocks_indexed_window INTEGER NOT NULL,
        start_height INTEGER NOT NULL,
        end_height INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blocks (
        height INTEGER PRIMARY KEY,
        hash TEXT NOT NULL,
        chain_id TEXT NOT NULL,
        proposer_address TEXT NOT NULL,
        time TEXT NOT NULL,
        tx_count INTEGER NOT NULL,
        gas_used INTEGER NOT NULL,
        gas_wanted INTEGER NOT NULL,
        evidence_count INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS transactions (
        hash TEXT PRIMARY KEY,
        block_height INTEGER NOT NULL,
        tx_index INTEGER NOT NULL,
        status TEXT NOT NULL,
        code INTEGER NOT NULL,
        codespace TEXT NOT NULL,
        gas_used INTEGER NOT NULL,
        gas_wanted INTEGER NOT NULL,
        raw_log TEXT NOT NULL,
        time TEXT NOT NULL,
        events TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS transactions_block_height ON transactions(block_height);
    CREATE TABLE IF NOT EXISTS events (
        block_height INTEGER NOT NULL,
        tx_hash TEXT,
        source TEXT NOT NULL,
        tx_index INTEGER NOT NULL,
        event_index INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        module TEXT NOT NULL,
        attributes TEXT NOT NULL,
        UNIQUE(block_height, source, tx_index, event_index)
    );
    CREATE TABLE IF NOT EXISTS account_transactions (
        address TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        PRIMARY KEY(address, tx_hash)
    );
    CREATE INDEX IF NOT EXISTS account_transactions_height ON account_transactions(block_height);
    CREATE TABLE IF NOT EXISTS accounts (
        address TEXT PRIMARY KEY,
        tx_count INTEGER NOT NULL,
        first_seen_height INTEGER NOT NULL,
        last_seen_height INTEGER NOT NULL
    );
    "#,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Database,
    /// A row was rejected by a table constraint.
    Constraint,
    Serialization,
    /// The connection mutex was poisoned by a panicking writer.
    Poisoned,
}

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let connection = Connection::open(path)
            .change_context(StoreError::Database)
            .attach_printable("failed to open database")
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;

        connection
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .change_context(StoreError::Database)
            .attach_printable("failed to enable write-ahead log")?;

        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory()
            .change_context(StoreError::Database)
            .attach_printable("failed to open in-memory database")?;
        Self::with_connection(connection)
    }

    pub fn with_connection(connection: Connection) -> Result<Self, StoreError> {
        let db = Self {
            connection: Arc::new(Mutex::new(connection)),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection
            .lock()
            .map_err(|_| Report::new(StoreError::Poisoned))
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.lock()?;
        for migration in MIGRATIONS {
            connection
                .execute_batch(migration)
                .change_context(StoreError::Database)
                .attach_printable("failed to apply migration to database")?;
        }

        progress::ensure_progress_row(&connection)?;

        Ok(())
    }
}

impl error_stack::Context for StoreError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database => write!(f, "database error"),
            StoreError::Constraint => write!(f, "row violates a table constraint"),
            StoreError::Serialization => write!(f, "failed to serialize row"),
            StoreError::Poisoned => write!(f, "database connection poisoned"),
        }
    }
}
