use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use clap::Subcommand;
use error_stack::{Report, Result, ResultExt};
use serde::Serialize;
use tracing::info;

use crate::{cli::rpc::RpcArgs, error::IndexerError, processor::index_block};

#[derive(Subcommand, Debug)]
pub enum DebugRpcCommand {
    /// Get the chain height.
    Height {
        #[clap(flatten)]
        rpc: RpcArgs,
    },
    /// Get a block and its results.
    Block {
        #[clap(flatten)]
        rpc: RpcArgs,
        /// The block height.
        height: u64,
        /// Write the response to a JSON file.
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

impl DebugRpcCommand {
    pub async fn run(self) -> Result<(), IndexerError> {
        let client = self.rpc().to_chain_client()?;

        let start = Instant::now();
        match self {
            DebugRpcCommand::Height { .. } => {
                info!("getting chain height");
                let height = client
                    .get_chain_height()
                    .await
                    .change_context(IndexerError::Rpc)?;
                info!(height, "received chain height");
            }
            DebugRpcCommand::Block { height, json, .. } => {
                info!(height, "getting block");
                let block = client
                    .get_block_with_results(height)
                    .await
                    .map_err(|err| Report::new(IndexerError::Rpc).attach_printable(err.to_string()))
                    .attach_printable_lazy(|| format!("height: {height}"))?;

                match index_block(&block) {
                    Ok(indexed) => info!(
                        hash = %indexed.block.hash,
                        transactions = indexed.transactions.len(),
                        events = indexed.events.len(),
                        "block parsed"
                    ),
                    Err(err) => info!(error = ?err, "block is not valid"),
                }

                if let Some(json_path) = json {
                    write_json(json_path, &block)?;
                }
            }
        }

        info!(elapsed = ?start.elapsed(), "debug rpc command completed");

        Ok(())
    }

    fn rpc(&self) -> &RpcArgs {
        match self {
            DebugRpcCommand::Height { rpc } => rpc,
            DebugRpcCommand::Block { rpc, .. } => rpc,
        }
    }
}

fn write_json(path: impl AsRef<Path>, data: &impl Serialize) -> Result<(), IndexerError> {
    let path = path.as_ref();
    let file = File::create(path)
        .change_context(IndexerError::Fatal)
        .attach_printable_lazy(|| format!("path: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, data)
        .change_context(IndexerError::Fatal)
        .attach_printable("failed to write JSON")
        .attach_printable_lazy(|| format!("path: {}", path.display()))?;
    writer.flush().change_context(IndexerError::Fatal)?;

    Ok(())
}
