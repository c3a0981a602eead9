use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_bridge::{load_config, run_bridge, setup_logging};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the environment and CLI still apply.
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };
    setup_logging(settings.log_dir.as_deref(), &settings.log_level)?;
    match &settings.config_source {
        Some(path) => log::info!("Loaded configuration from {}", path.display()),
        None => log::info!("No config file found. Using defaults and environment/CLI variables."),
    }
    log::info!(
        "Starting telemetry bridge in {} mode on port {}",
        settings.mode.as_str(),
        settings.port
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        log::warn!("Shutdown signal received. Closing bridge gracefully...");
        signal_token.cancel();
    });

    if let Err(e) = run_bridge(settings, shutdown).await {
        log::error!("Bridge stopped with error: {:#}", e);
        std::process::exit(1);
    }

    log::info!("Shutdown complete.");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
