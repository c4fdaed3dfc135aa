use clap::{Parser, Subcommand};
use sluice_observability::{MetricsExporter, init_observability};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ObservabilitySnafu, Result},
    run::RunArgs,
};

mod error;
mod flusher;
mod run;
mod wire;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Sluice CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Buffer JSON-lines messages from stdin and flush them to one file per stream
    Run {
        #[clap(flatten)]
        inner: RunArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let metrics = MetricsExporter::new();
    init_observability(env!("CARGO_PKG_NAME"), metrics.clone()).context(ObservabilitySnafu {})?;

    let ct = CancellationToken::new();

    let ct_clone = ct.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ct_clone.cancel();
    });

    match cli.command {
        Commands::Run { inner } => inner.run(ct, metrics).await,
    }
}
