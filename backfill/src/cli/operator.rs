//! Operator commands that work on the database directly.
//!
//! Don't reset progress while an indexer is running against the same
//! database.

use clap::Subcommand;
use error_stack::{Report, Result, ResultExt};
use serde::Serialize;
use tracing::info;

use crate::{
    cli::common::DatabaseArgs,
    error::IndexerError,
    store::{FailedBlockResetPolicy, ProgressStore},
};

#[derive(Subcommand, Debug)]
pub enum ProgressCommand {
    /// Print the indexing progress and statistics.
    Show {
        #[clap(flatten)]
        database: DatabaseArgs,
    },
    /// Move the last indexed height.
    Reset {
        #[clap(flatten)]
        database: DatabaseArgs,
        /// New last indexed height. Indexing resumes at the next height.
        #[arg(long)]
        height: u64,
        /// Delete failed blocks above the new height.
        #[arg(long, default_value = "false")]
        clear_failed: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum FailedBlocksCommand {
    /// List failed blocks.
    List {
        #[clap(flatten)]
        database: DatabaseArgs,
        /// Include resolved blocks.
        #[arg(long, default_value = "false")]
        all: bool,
        /// Maximum number of blocks to list.
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Mark a failed block as resolved.
    Resolve {
        #[clap(flatten)]
        database: DatabaseArgs,
        height: u64,
    },
    /// Mark a resolved block as failed again, so that it's retried.
    Reopen {
        #[clap(flatten)]
        database: DatabaseArgs,
        height: u64,
    },
}

impl ProgressCommand {
    pub async fn run(self) -> Result<(), IndexerError> {
        match self {
            ProgressCommand::Show { database } => {
                let store = ProgressStore::new(database.to_database()?);
                let progress = store.get_progress().change_context(IndexerError::Storage)?;
                let statistics = store
                    .get_statistics()
                    .change_context(IndexerError::Storage)?;
                let latest_checkpoint = store
                    .latest_checkpoint()
                    .change_context(IndexerError::Storage)?;

                #[derive(Serialize)]
                struct Output<P, S, C> {
                    progress: P,
                    statistics: S,
                    latest_checkpoint: C,
                }

                print_json(&Output {
                    progress,
                    statistics,
                    latest_checkpoint,
                })
            }
            ProgressCommand::Reset {
                database,
                height,
                clear_failed,
            } => {
                let store = ProgressStore::new(database.to_database()?);
                let policy = if clear_failed {
                    FailedBlockResetPolicy::Clear
                } else {
                    FailedBlockResetPolicy::Retain
                };

                store
                    .reset_progress(Some(height), policy)
                    .change_context(IndexerError::Storage)
                    .attach_printable("failed to reset progress")?;

                info!(height, policy = ?policy, "progress reset");
                Ok(())
            }
        }
    }
}

impl FailedBlocksCommand {
    pub async fn run(self) -> Result<(), IndexerError> {
        match self {
            FailedBlocksCommand::List {
                database,
                all,
                limit,
            } => {
                let store = ProgressStore::new(database.to_database()?);
                let failed_blocks = store
                    .list_failed_blocks(all, limit)
                    .change_context(IndexerError::Storage)?;
                print_json(&failed_blocks)
            }
            FailedBlocksCommand::Resolve { database, height } => {
                let store = ProgressStore::new(database.to_database()?);
                let updated = store
                    .resolve_failed_block(height)
                    .change_context(IndexerError::Storage)?;
                if !updated {
                    return Err(no_failed_block(height));
                }
                info!(height, "failed block resolved");
                Ok(())
            }
            FailedBlocksCommand::Reopen { database, height } => {
                let store = ProgressStore::new(database.to_database()?);
                let updated = store
                    .reopen_failed_block(height)
                    .change_context(IndexerError::Storage)?;
                if !updated {
                    return Err(no_failed_block(height));
                }
                info!(height, "failed block reopened");
                Ok(())
            }
        }
    }
}

fn no_failed_block(height: u64) -> Report<IndexerError> {
    Report::new(IndexerError::Configuration)
        .attach_printable(format!("no failed block at height {height}"))
}

fn print_json(value: &impl Serialize) -> Result<(), IndexerError> {
    let output = serde_json::to_string_pretty(value)
        .change_context(IndexerError::Fatal)
        .attach_printable("failed to serialize output")?;
    println!("{output}");
    Ok(())
}
