use std::process::ExitCode;

use clap::Parser;
use comet_backfill::{
    cli::Cli,
    error::{IndexerError, ReportExt, Result},
};
use comet_backfill_observability::init_opentelemetry;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    run_with_args(args).await.to_exit_code()
}

async fn run_with_args(args: Cli) -> Result<()> {
    let telemetry = init_opentelemetry(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .change_context(IndexerError::Fatal)
        .attach_printable("failed to initialize opentelemetry")?;

    let result = run_until_cancelled(args).await;
    telemetry.shutdown();
    result
}

async fn run_until_cancelled(args: Cli) -> Result<()> {
    let ct = CancellationToken::new();

    ctrlc::set_handler({
        let ct = ct.clone();
        move || {
            info!("SIGINT received");
            ct.cancel();
        }
    })
    .change_context(IndexerError::Fatal)
    .attach_printable("failed to set SIGINT handler")?;

    args.run(ct).await
}
