mod common;
mod dbg;
mod indexer;
mod operator;
mod rpc;
mod start;

use clap::{Parser, Subcommand};
use error_stack::Result;
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;

pub use self::common::{DatabaseArgs, StatusServerArgs};
pub use self::dbg::DebugRpcCommand;
pub use self::indexer::IndexerArgs;
pub use self::operator::{FailedBlocksCommand, ProgressCommand};
pub use self::rpc::RpcArgs;
pub use self::start::StartCommand;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the historical indexer and the status server.
    Start(Box<StartCommand>),
    /// Inspect or reset the indexing progress.
    Progress {
        #[clap(subcommand)]
        command: ProgressCommand,
    },
    /// Inspect and manage failed blocks.
    #[command(name = "failed-blocks")]
    FailedBlocks {
        #[clap(subcommand)]
        command: FailedBlocksCommand,
    },
    /// Debug commands for the chain RPC.
    #[command(name = "dbg-rpc")]
    DebugRpc {
        #[clap(subcommand)]
        command: DebugRpcCommand,
    },
}

impl Cli {
    pub async fn run(self, ct: CancellationToken) -> Result<(), IndexerError> {
        match self.command {
            Command::Start(command) => command.run(ct).await,
            Command::Progress { command } => command.run().await,
            Command::FailedBlocks { command } => command.run().await,
            Command::DebugRpc { command } => command.run().await,
        }
    }
}
