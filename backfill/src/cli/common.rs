use std::{net::SocketAddr, path::PathBuf};

use clap::Args;
use error_stack::{Result, ResultExt};

use crate::{error::IndexerError, store::Database};

#[derive(Args, Clone, Debug)]
pub struct DatabaseArgs {
    /// Path to the SQLite database.
    #[arg(
        long = "database.path",
        env = "BACKFILL_DATABASE_PATH",
        default_value = "backfill.db"
    )]
    pub database_path: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct StatusServerArgs {
    /// Address of the status server.
    #[arg(
        long = "status-server.address",
        env = "BACKFILL_STATUS_SERVER_ADDRESS",
        default_value = "0.0.0.0:8118"
    )]
    pub status_server_address: String,
}

impl DatabaseArgs {
    pub fn to_database(&self) -> Result<Database, IndexerError> {
        Database::open(&self.database_path)
            .change_context(IndexerError::Storage)
            .attach_printable("failed to open database")
    }
}

impl StatusServerArgs {
    pub fn to_socket_addr(&self) -> Result<SocketAddr, IndexerError> {
        self.status_server_address
            .parse::<SocketAddr>()
            .change_context(IndexerError::Configuration)
            .attach_printable("failed to parse status server address")
            .attach_printable_lazy(|| format!("address: {}", self.status_server_address))
    }
}
