use std::sync::Arc;

use clap::{CommandFactory, Parser};
use thiserror::Error;
use tracing::{debug, info, warn};
use videoroom_subscriber::app::{self, AppError};
use videoroom_subscriber::config::{Cli, ConfigError};
use videoroom_subscriber::relay::sink::SinkCatalog;
use videoroom_subscriber::supervisor::{ShutdownReason, ShutdownSignal};
use videoroom_subscriber::telemetry::logging as logctl;

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}\n\n{usage}", usage = Cli::command().render_usage())]
    Config(#[from] ConfigError),
    #[error("failed to initialize logging: {0}")]
    Logging(#[from] logctl::InitError),
    #[error(transparent)]
    App(#[from] AppError),
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    let config = cli.into_config()?;
    logctl::init(&log_config)?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let shutdown = ShutdownSignal::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    let sinks = Arc::new(SinkCatalog::new(config.output_dir.clone()));
    let summary = app::run(config, sinks, shutdown).await?;
    for report in &summary.reports {
        info!(
            track = %report.key,
            codec = %report.codec,
            packets = report.packets,
            bytes = report.bytes,
            dropped = report.dropped,
            "track summary"
        );
    }
    info!(reason = %summary.reason, "subscriber exited cleanly");
    Ok(())
}

/// First SIGINT/SIGTERM requests a graceful drain; a second one exits now.
async fn forward_signals(shutdown: ShutdownSignal) {
    loop {
        if !wait_for_signal().await {
            return;
        }
        if !shutdown.trigger(ShutdownReason::Interrupted) {
            warn!("second interrupt; exiting without draining");
            std::process::exit(130);
        }
        info!("interrupt received; draining");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            return tokio::signal::ctrl_c().await.is_ok();
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.is_ok(),
        received = terminate.recv() => received.is_some(),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    tokio::signal::ctrl_c().await.is_ok()
}
