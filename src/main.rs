use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use herald_server::auth::TrustedTokenAuthenticator;
use herald_server::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use herald_server::{load_config, ServerDeps};
use herald_store::{Database, EventLog, SqliteDirectory};
use herald_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Real-time event fan-out and catch-up server.
#[derive(Debug, Parser)]
#[command(name = "herald", version)]
struct Cli {
    /// JSON config file, merged over the built-in defaults.
    #[arg(long, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and environment).
    #[arg(long)]
    port: Option<u16>,

    /// Event database path (overrides config and environment).
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("loading configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&config.log_level).unwrap_or(tracing::Level::INFO),
        log_db_path: config.log_database_path.clone(),
        ..Default::default()
    });

    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let directory = Arc::new(SqliteDirectory::new(db.clone()));

    let server = herald_server::start(
        &config,
        ServerDeps {
            log: EventLog::new(db),
            conversations: directory.clone(),
            messages: directory,
            authenticator: Arc::new(TrustedTokenAuthenticator),
        },
    )
    .await
    .with_context(|| format!("binding {}", config.bind_addr()))?;

    info!(port = server.port(), "ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    server.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
    Ok(())
}
