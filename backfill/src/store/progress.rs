use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use error_stack::{Report, Result, ResultExt};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    Connection, OptionalExtension, Row, ToSql,
};
use serde::{Deserialize, Serialize};

use super::{Database, StoreError};

/// Persisted run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    Idle,
    Indexing,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingProgress {
    pub last_indexed_height: Option<u64>,
    pub status: IndexingStatus,
    pub total_blocks_indexed: u64,
    pub start_height: Option<u64>,
    pub target_height: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedBlock {
    pub height: u64,
    pub error_message: String,
    pub retry_count: u32,
    pub last_retry_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A height that failed permanently in the current attempt.
#[derive(Debug, Clone)]
pub struct NewFailedBlock {
    pub height: u64,
    pub error_message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingCheckpoint {
    pub height: u64,
    pub created_at: DateTime<Utc>,
    pub blocks_per_second: f64,
    #[serde(rename = "eta_seconds", with = "duration_secs")]
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingMetric {
    pub timestamp: DateTime<Utc>,
    pub blocks_per_second: f64,
    pub blocks_indexed_window: u64,
    pub start_height: u64,
    pub end_height: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingStatistics {
    pub total_blocks_indexed: u64,
    pub last_indexed_height: Option<u64>,
    pub status: IndexingStatus,
    pub failed_blocks_count: u64,
    pub unresolved_failed_blocks: u64,
    pub avg_blocks_per_second: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// What happens to failed blocks above the new height on reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedBlockResetPolicy {
    /// Delete them. Those heights are indexed again from scratch.
    Clear,
    /// Keep them for audit.
    Retain,
}

/// Everything written next to the rows of a committed batch.
#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub start_height: u64,
    pub end_height: u64,
    pub target_height: u64,
    /// Heights whose rows are part of the batch.
    pub committed: Vec<u64>,
    pub failed: Vec<NewFailedBlock>,
    pub duration: Duration,
    /// Rate measured on this batch alone.
    pub blocks_per_second: f64,
    /// Smoothed rate used for the eta.
    pub smoothed_blocks_per_second: f64,
    pub eta: Option<Duration>,
}

/// Durable bookkeeping of the indexing run.
///
/// The store has no ordering logic: callers must only save a height once all
/// rows up to it are committed.
#[derive(Clone)]
pub struct ProgressStore {
    db: Database,
}

impl ProgressStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_progress(&self) -> Result<IndexingProgress, StoreError> {
        let connection = self.db.lock()?;
        get_progress(&connection)
    }

    /// Never lowers the last indexed height. Use `reset_progress` for that.
    pub fn save_progress(&self, height: u64, status: IndexingStatus) -> Result<(), StoreError> {
        let connection = self.db.lock()?;
        save_progress(&connection, height, status, None)
    }

    pub fn set_status(&self, status: IndexingStatus) -> Result<(), StoreError> {
        let connection = self.db.lock()?;
        set_status(&connection, status)
    }

    /// Mark the run as started. Keeps the original start if already set.
    pub fn start_run(&self, start_height: u64) -> Result<(), StoreError> {
        let connection = self.db.lock()?;
        connection
            .execute(
                r#"
                UPDATE indexing_progress
                SET status = ?1,
                    start_height = COALESCE(start_height, ?2),
                    started_at = COALESCE(started_at, ?3),
                    completed_at = NULL,
                    updated_at = ?3
                WHERE id = 1"#,
                params![IndexingStatus::Indexing, start_height, Utc::now()],
            )
            .change_context(StoreError::Database)
            .attach_printable("failed to start indexing run")?;
        Ok(())
    }

    pub fn record_failed_block(
        &self,
        height: u64,
        error_message: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let connection = self.db.lock()?;
        record_failed_block(&connection, height, error_message, attempts)
    }

    /// Returns false if no failed block exists at `height`.
    pub fn resolve_failed_block(&self, height: u64) -> Result<bool, StoreError> {
        let connection = self.db.lock()?;
        resolve_failed_block(&connection, height)
    }

    /// Returns false if no failed block exists at `height`.
    pub fn reopen_failed_block(&self, height: u64) -> Result<bool, StoreError> {
        let connection = self.db.lock()?;
        let updated = connection
            .execute(
                "UPDATE failed_blocks SET resolved = 0, resolved_at = NULL WHERE height = ?1",
                params![height],
            )
            .change_context(StoreError::Database)
            .attach_printable("failed to reopen failed block")
            .attach_printable_lazy(|| format!("height: {height}"))?;
        Ok(updated > 0)
    }

    pub fn get_failed_block(&self, height: u64) -> Result<Option<FailedBlock>, StoreError> {
        let connection = self.db.lock()?;
        connection
            .query_row(
                &format!("{FAILED_BLOCK_SELECT} WHERE height = ?1"),
                params![height],
                failed_block_from_row,
            )
            .optional()
            .change_context(StoreError::Database)
            .attach_printable("failed to read failed block")
    }

    /// Unresolved failed blocks, lowest height first.
    pub fn list_unresolved_failed_blocks(
        &self,
        limit: usize,
    ) -> Result<Vec<FailedBlock>, StoreError> {
        self.list_failed_blocks(false, limit)
    }

    pub fn list_failed_blocks(
        &self,
        include_resolved: bool,
        limit: usize,
    ) -> Result<Vec<FailedBlock>, StoreError> {
        let connection = self.db.lock()?;
        let query = if include_resolved {
            format!("{FAILED_BLOCK_SELECT} ORDER BY height LIMIT ?1")
        } else {
            format!("{FAILED_BLOCK_SELECT} WHERE resolved = 0 ORDER BY height LIMIT ?1")
        };

        query_failed_blocks(&connection, &query, params![limit as i64])
    }

    /// Unresolved failed blocks that have been tried fewer than `max_retry_count` times.
    pub fn failed_blocks_to_retry(
        &self,
        limit: usize,
        max_retry_count: u32,
    ) -> Result<Vec<FailedBlock>, StoreError> {
        let connection = self.db.lock()?;
        let query = format!(
            "{FAILED_BLOCK_SELECT} WHERE resolved = 0 AND retry_count < ?1 ORDER BY height LIMIT ?2"
        );

        query_failed_blocks(&connection, &query, params![max_retry_count, limit as i64])
    }

    pub fn create_checkpoint(
        &self,
        height: u64,
        blocks_per_second: f64,
        eta: Option<Duration>,
    ) -> Result<(), StoreError> {
        let connection = self.db.lock()?;
        create_checkpoint(&connection, height, blocks_per_second, eta)
    }

    pub fn latest_checkpoint(&self) -> Result<Option<IndexingCheckpoint>, StoreError> {
        let connection = self.db.lock()?;
        latest_checkpoint(&connection)
    }

    pub fn record_metric(&self, metric: &IndexingMetric) -> Result<(), StoreError> {
        let connection = self.db.lock()?;
        record_metric(&connection, metric)
    }

    /// Most recent metrics, oldest first.
    pub fn recent_metrics(&self, limit: usize) -> Result<Vec<IndexingMetric>, StoreError> {
        let connection = self.db.lock()?;
        let mut statement = connection
            .prepare(
                r#"
                SELECT timestamp, blocks_per_second, blocks_indexed_window,
                       start_height, end_height, duration_ms
                FROM indexing_metrics
                ORDER BY id DESC
                LIMIT ?1"#,
            )
            .change_context(StoreError::Database)?;

        let mut metrics = statement
            .query_map(params![limit as i64], |row| {
                Ok(IndexingMetric {
                    timestamp: row.get(0)?,
                    blocks_per_second: row.get(1)?,
                    blocks_indexed_window: row.get(2)?,
                    start_height: row.get(3)?,
                    end_height: row.get(4)?,
                    duration_ms: row.get(5)?,
                })
            })
            .change_context(StoreError::Database)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .change_context(StoreError::Database)
            .attach_printable("failed to read indexing metrics")?;

        metrics.reverse();
        Ok(metrics)
    }

    pub fn get_statistics(&self) -> Result<IndexingStatistics, StoreError> {
        let connection = self.db.lock()?;
        let progress = get_progress(&connection)?;

        let (failed_blocks_count, unresolved_failed_blocks) = connection
            .query_row(
                r#"
                SELECT COUNT(*), COALESCE(SUM(CASE WHEN resolved = 0 THEN 1 ELSE 0 END), 0)
                FROM failed_blocks"#,
                [],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?)),
            )
            .change_context(StoreError::Database)
            .attach_printable("failed to count failed blocks")?;

        let avg_blocks_per_second = connection
            .query_row(
                "SELECT AVG(blocks_per_second) FROM indexing_metrics",
                [],
                |row| row.get::<_, Option<f64>>(0),
            )
            .change_context(StoreError::Database)
            .attach_printable("failed to average indexing rate")?
            .unwrap_or(0.0);

        let estimated_completion = latest_checkpoint(&connection)?.and_then(|checkpoint| {
            let eta = chrono::Duration::from_std(checkpoint.eta?).ok()?;
            checkpoint.created_at.checked_add_signed(eta)
        });

        Ok(IndexingStatistics {
            total_blocks_indexed: progress.total_blocks_indexed,
            last_indexed_height: progress.last_indexed_height,
            status: progress.status,
            failed_blocks_count,
            unresolved_failed_blocks,
            avg_blocks_per_second,
            estimated_completion,
        })
    }

    /// Move the last indexed height, in either direction.
    ///
    /// `None` restarts from the configured start height.
    pub fn reset_progress(
        &self,
        height: Option<u64>,
        policy: FailedBlockResetPolicy,
    ) -> Result<(), StoreError> {
        let mut connection = self.db.lock()?;
        let tx = connection
            .transaction()
            .change_context(StoreError::Database)
            .attach_printable("failed to create transaction")?;

        tx.execute(
            r#"
            UPDATE indexing_progress
            SET last_indexed_height = ?1, status = ?2, completed_at = NULL, updated_at = ?3
            WHERE id = 1"#,
            params![height, IndexingStatus::Idle, Utc::now()],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to reset progress")?;

        refresh_total_blocks_indexed(&tx)?;

        if policy == FailedBlockResetPolicy::Clear {
            let cleared = match height {
                Some(height) => {
                    tx.execute("DELETE FROM failed_blocks WHERE height > ?1", params![height])
                }
                None => tx.execute("DELETE FROM failed_blocks", []),
            };

            cleared
                .change_context(StoreError::Database)
                .attach_printable("failed to clear failed blocks")?;
        }

        tx.commit()
            .change_context(StoreError::Database)
            .attach_printable("failed to commit changes")?;

        Ok(())
    }

    /// Write progress, checkpoint, metric and failed heights of a batch.
    ///
    /// Takes the connection of the transaction that holds the batch rows, so
    /// that both become visible together. Committed heights that were
    /// recorded as failed before are resolved.
    pub fn commit_batch(connection: &Connection, commit: &BatchCommit) -> Result<(), StoreError> {
        for failed in &commit.failed {
            record_failed_block(
                connection,
                failed.height,
                &failed.error_message,
                failed.attempts,
            )?;
        }

        for height in &commit.committed {
            resolve_failed_block(connection, *height)?;
        }

        save_progress(
            connection,
            commit.end_height,
            IndexingStatus::Indexing,
            Some(commit.target_height),
        )?;
        refresh_total_blocks_indexed(connection)?;

        create_checkpoint(
            connection,
            commit.end_height,
            commit.smoothed_blocks_per_second,
            commit.eta,
        )?;

        record_metric(
            connection,
            &IndexingMetric {
                timestamp: Utc::now(),
                blocks_per_second: commit.blocks_per_second,
                blocks_indexed_window: commit.end_height + 1 - commit.start_height,
                start_height: commit.start_height,
                end_height: commit.end_height,
                duration_ms: commit.duration.as_millis() as u64,
            },
        )
    }

    /// Outcome of retrying failed heights, written with the retried rows.
    pub fn commit_retry(
        connection: &Connection,
        resolved: &[u64],
        failed: &[NewFailedBlock],
    ) -> Result<(), StoreError> {
        for height in resolved {
            resolve_failed_block(connection, *height)?;
        }

        for failed in failed {
            record_failed_block(
                connection,
                failed.height,
                &failed.error_message,
                failed.attempts,
            )?;
        }

        refresh_total_blocks_indexed(connection)
    }
}

impl BatchCommit {
    pub fn blocks_committed(&self) -> u64 {
        self.committed.len() as u64
    }
}

const FAILED_BLOCK_SELECT: &str = r#"
    SELECT height, error_message, retry_count, last_retry_at, resolved, resolved_at, created_at
    FROM failed_blocks"#;

pub(super) fn ensure_progress_row(connection: &Connection) -> Result<(), StoreError> {
    connection
        .execute(
            "INSERT OR IGNORE INTO indexing_progress (id, status, updated_at) VALUES (1, ?1, ?2)",
            params![IndexingStatus::Idle, Utc::now()],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to create progress row")?;
    Ok(())
}

fn get_progress(connection: &Connection) -> Result<IndexingProgress, StoreError> {
    connection
        .query_row(
            r#"
            SELECT last_indexed_height, status, total_blocks_indexed, start_height,
                   target_height, started_at, completed_at, updated_at
            FROM indexing_progress
            WHERE id = 1"#,
            [],
            |row| {
                Ok(IndexingProgress {
                    last_indexed_height: row.get(0)?,
                    status: row.get(1)?,
                    total_blocks_indexed: row.get(2)?,
                    start_height: row.get(3)?,
                    target_height: row.get(4)?,
                    started_at: row.get(5)?,
                    completed_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            },
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to read indexing progress")
}

fn save_progress(
    connection: &Connection,
    height: u64,
    status: IndexingStatus,
    target_height: Option<u64>,
) -> Result<(), StoreError> {
    let now = Utc::now();
    let completed_at = (status == IndexingStatus::Completed).then_some(now);

    connection
        .execute(
            r#"
            UPDATE indexing_progress
            SET last_indexed_height = MAX(COALESCE(last_indexed_height, ?1), ?1),
                status = ?2,
                target_height = COALESCE(?3, target_height),
                completed_at = ?4,
                updated_at = ?5
            WHERE id = 1"#,
            params![height, status, target_height, completed_at, now],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to save progress")
        .attach_printable_lazy(|| format!("height: {height}"))?;

    Ok(())
}

/// Heights indexed more than once count once.
fn refresh_total_blocks_indexed(connection: &Connection) -> Result<(), StoreError> {
    connection
        .execute(
            r#"
            UPDATE indexing_progress
            SET total_blocks_indexed = (SELECT COUNT(*) FROM blocks)
            WHERE id = 1"#,
            [],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to count indexed blocks")?;

    Ok(())
}

fn set_status(connection: &Connection, status: IndexingStatus) -> Result<(), StoreError> {
    let now = Utc::now();
    let completed_at = (status == IndexingStatus::Completed).then_some(now);

    connection
        .execute(
            r#"
            UPDATE indexing_progress
            SET status = ?1, completed_at = COALESCE(?2, completed_at), updated_at = ?3
            WHERE id = 1"#,
            params![status, completed_at, now],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to update status")?;

    Ok(())
}

fn record_failed_block(
    connection: &Connection,
    height: u64,
    error_message: &str,
    attempts: u32,
) -> Result<(), StoreError> {
    // Resolved rows are left untouched until reopened.
    connection
        .execute(
            r#"
            INSERT INTO failed_blocks (height, error_message, retry_count, last_retry_at, resolved, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?4)
            ON CONFLICT (height) DO UPDATE SET
                error_message = excluded.error_message,
                retry_count = failed_blocks.retry_count + excluded.retry_count,
                last_retry_at = excluded.last_retry_at
            WHERE failed_blocks.resolved = 0"#,
            params![height, error_message, attempts.max(1), Utc::now()],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to record failed block")
        .attach_printable_lazy(|| format!("height: {height}"))?;

    Ok(())
}

fn resolve_failed_block(connection: &Connection, height: u64) -> Result<bool, StoreError> {
    let updated = connection
        .execute(
            r#"
            UPDATE failed_blocks
            SET resolved = 1, resolved_at = COALESCE(resolved_at, ?2)
            WHERE height = ?1"#,
            params![height, Utc::now()],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to resolve failed block")
        .attach_printable_lazy(|| format!("height: {height}"))?;

    Ok(updated > 0)
}

fn create_checkpoint(
    connection: &Connection,
    height: u64,
    blocks_per_second: f64,
    eta: Option<Duration>,
) -> Result<(), StoreError> {
    connection
        .execute(
            r#"
            INSERT INTO indexing_checkpoints (height, created_at, blocks_per_second, eta_seconds)
            VALUES (?1, ?2, ?3, ?4)"#,
            params![
                height,
                Utc::now(),
                blocks_per_second,
                eta.map(|eta| eta.as_secs_f64())
            ],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to create checkpoint")
        .attach_printable_lazy(|| format!("height: {height}"))?;

    Ok(())
}

fn latest_checkpoint(connection: &Connection) -> Result<Option<IndexingCheckpoint>, StoreError> {
    connection
        .query_row(
            r#"
            SELECT height, created_at, blocks_per_second, eta_seconds
            FROM indexing_checkpoints
            ORDER BY id DESC
            LIMIT 1"#,
            [],
            |row| {
                let eta: Option<f64> = row.get(3)?;
                Ok(IndexingCheckpoint {
                    height: row.get(0)?,
                    created_at: row.get(1)?,
                    blocks_per_second: row.get(2)?,
                    eta: eta.and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
                })
            },
        )
        .optional()
        .change_context(StoreError::Database)
        .attach_printable("failed to read latest checkpoint")
}

fn record_metric(connection: &Connection, metric: &IndexingMetric) -> Result<(), StoreError> {
    connection
        .execute(
            r#"
            INSERT INTO indexing_metrics
                (timestamp, blocks_per_second, blocks_indexed_window, start_height, end_height, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                metric.timestamp,
                metric.blocks_per_second,
                metric.blocks_indexed_window,
                metric.start_height,
                metric.end_height,
                metric.duration_ms
            ],
        )
        .change_context(StoreError::Database)
        .attach_printable("failed to record indexing metric")?;

    Ok(())
}

fn query_failed_blocks(
    connection: &Connection,
    query: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<FailedBlock>, StoreError> {
    let mut statement = connection
        .prepare(query)
        .change_context(StoreError::Database)?;

    let rows = statement
        .query_map(params, failed_block_from_row)
        .change_context(StoreError::Database)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .change_context(StoreError::Database)
        .attach_printable("failed to read failed blocks")?;

    Ok(rows)
}

fn failed_block_from_row(row: &Row<'_>) -> rusqlite::Result<FailedBlock> {
    Ok(FailedBlock {
        height: row.get(0)?,
        error_message: row.get(1)?,
        retry_count: row.get(2)?,
        last_retry_at: row.get(3)?,
        resolved: row.get(4)?,
        resolved_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl IndexingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingStatus::Idle => "idle",
            IndexingStatus::Indexing => "indexing",
            IndexingStatus::Paused => "paused",
            IndexingStatus::Completed => "completed",
            IndexingStatus::Error => "error",
        }
    }
}

impl FromStr for IndexingStatus {
    type Err = Report<StoreError>;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(IndexingStatus::Idle),
            "indexing" => Ok(IndexingStatus::Indexing),
            "paused" => Ok(IndexingStatus::Paused),
            "completed" => Ok(IndexingStatus::Completed),
            "error" => Ok(IndexingStatus::Error),
            _ => Err(Report::new(StoreError::Serialization))
                .attach_printable_lazy(|| format!("unknown status: {s}")),
        }
    }
}

impl std::fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for IndexingStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for IndexingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|_| FromSqlError::InvalidType)
    }
}

impl IndexingProgress {
    /// First height the next batch should index.
    pub fn resume_height(&self, start_height: u64) -> u64 {
        self.last_indexed_height
            .map(|height| height + 1)
            .unwrap_or(start_height)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}
