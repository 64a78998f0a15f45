use clap::Parser;
use std::process;
use tokio::sync::watch;
use underpass::cli::{Cli, Commands};
use underpass::config::LoggingConfig;
use underpass::domain::UnderpassError;
use underpass::logging::init_logging;

// Exit code when the connection to the database or the planet server is
// unrecoverable.
const EXIT_FATAL: i32 = -1;
const EXIT_CONFIG: i32 = 1;

#[tokio::main]
async fn main() {
    // Load environment variables from a .env file if present; missing files
    // are silently ignored.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let log_level = cli.log_level.as_deref().unwrap_or("info");
    let logging_config = LoggingConfig {
        file_enabled: !cli.logstdout,
        ..Default::default()
    };
    let _guard = match init_logging(log_level, &logging_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Underpass replicator");

    // Shutdown channel flipped by SIGINT/SIGTERM; monitors check it between
    // files and drain in-flight work before exiting.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to create SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    let _ = shutdown_tx.send(true);
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    let _ = shutdown_tx.send(true);
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    let result = match &cli.command {
        Commands::Monitor(args) => args.execute(shutdown_rx).await,
        Commands::ValidateConfig(args) => args.execute().await,
        Commands::Status(args) => args.execute().await,
    };

    match result {
        Ok(()) => {}
        Err(UnderpassError::Configuration(e)) => {
            tracing::error!(error = %e, "configuration error");
            eprintln!("Configuration error: {e}");
            process::exit(EXIT_CONFIG);
        }
        Err(e) => {
            tracing::error!(error = %e, "unrecoverable failure");
            eprintln!("Error: {e}");
            process::exit(EXIT_FATAL);
        }
    }
}
