use std::sync::Arc;

use herald_cache::{EmergencyCleanup, EmergencyOutcome};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Chains a panic hook that runs emergency cleanup for resource-exhaustion panics.
///
/// The previously installed hook still runs afterwards.
pub fn install_emergency_panic_hook(emergency: Arc<EmergencyCleanup>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let rendered = info.to_string();
        if let Some(outcome) = emergency.handle_error(&rendered) {
            match outcome {
                EmergencyOutcome::Completed(report) => tracing::error!(
                    entries_flushed = report.entries_flushed,
                    media_files_removed = report.media_files_removed,
                    "emergency cleanup ran after fatal resource exhaustion"
                ),
                EmergencyOutcome::AlreadyRunning => {
                    tracing::error!("fatal resource exhaustion during emergency cleanup")
                }
            }
        }
        previous(info);
    }));
}

pub(crate) async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to install SIGTERM handler");
            }
        }
    }
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
