//! Runtime wiring for the herald bot: CLI config, capability registry,
//! post-open bootstrap and graceful shutdown.

pub mod bootstrap_helpers;
pub mod bot_runtime;
pub mod capability_registry;
pub mod cli_args;

pub use bootstrap_helpers::{init_tracing, install_emergency_panic_hook};
pub use bot_runtime::*;
pub use capability_registry::*;
pub use cli_args::Cli;

use std::sync::Arc;

use anyhow::Result;
use herald_session::{CredentialStore, GatewayConnector};

/// Runs the bot against the configured gateway until SIGINT or SIGTERM.
pub async fn run_cli(cli: Cli) -> Result<()> {
    let config = cli.runtime_config()?;
    let session = config.session;
    let credentials = CredentialStore::new(config.credentials_dir.clone());
    let runtime = BotRuntime::new(config)?;
    install_emergency_panic_hook(Arc::clone(runtime.emergency()));

    let connector = Arc::new(GatewayConnector::new(cli.gateway_config()));
    let report = run_session(
        runtime,
        connector,
        session,
        credentials,
        bootstrap_helpers::wait_for_shutdown_signal(),
    )
    .await?;
    tracing::info!(
        drained = report.drained,
        abandoned = report.abandoned_items,
        "herald exited"
    );
    Ok(())
}
