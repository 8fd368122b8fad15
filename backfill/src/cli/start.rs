use std::sync::Arc;

use clap::Args;
use error_stack::{Result, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cli::{
        common::{DatabaseArgs, StatusServerArgs},
        indexer::IndexerArgs,
        rpc::RpcArgs,
    },
    error::IndexerError,
    metrics::OpenTelemetryMetrics,
    orchestrator::HistoricalIndexer,
    server::{ChainHealth, ServerState, StatusServer},
    store::ProgressStore,
};

#[derive(Args, Debug)]
pub struct StartCommand {
    #[clap(flatten)]
    rpc: RpcArgs,
    #[clap(flatten)]
    indexer: IndexerArgs,
    #[clap(flatten)]
    database: DatabaseArgs,
    #[clap(flatten)]
    server: StatusServerArgs,
}

impl StartCommand {
    pub async fn run(self, ct: CancellationToken) -> Result<(), IndexerError> {
        // Validate everything before touching the database or the node.
        let options = self.indexer.to_indexer_options(&self.rpc)?;
        let address = self.server.to_socket_addr()?;
        let client = self.rpc.to_chain_client()?;
        let db = self.database.to_database()?;

        info!(
            rpc_url = self.rpc.rpc_url.as_deref().unwrap_or_default(),
            database = %self.database.database_path.display(),
            batch_size = options.batch_size,
            "starting historical indexer"
        );

        let indexer = HistoricalIndexer::new(
            client.clone(),
            db.clone(),
            options,
            Arc::new(OpenTelemetryMetrics::default()),
        );

        let state = ServerState {
            progress: ProgressStore::new(db),
            indexer: indexer.handle(),
            health: Arc::new(ChainHealth::new(client)),
        };

        let server_handle = tokio::spawn(StatusServer::new(address, state).start(ct.clone()));
        let indexer_handle = tokio::spawn(indexer.run(ct.clone()));

        tokio::select! {
            indexer = indexer_handle => {
                info!("historical indexer terminated");
                let result = indexer
                    .change_context(IndexerError::Fatal)
                    .attach_printable("indexer task panicked")?;
                // The status server stays up until shutdown, also when
                // indexing is disabled or stopped on error.
                if !ct.is_cancelled() {
                    info!("waiting for shutdown");
                    ct.cancelled().await;
                }
                result
            }
            server = server_handle => {
                info!("status server terminated");
                ct.cancel();
                server
                    .change_context(IndexerError::Fatal)
                    .attach_printable("status server task panicked")?
            }
        }
    }
}
