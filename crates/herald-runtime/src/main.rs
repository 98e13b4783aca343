use anyhow::Result;
use clap::Parser;
use herald_runtime::{init_tracing, run_cli, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}
