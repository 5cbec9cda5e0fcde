use std::io;
use std::sync::Arc;

use clap::Parser;
use pulse_bus::EventBus;
use pulse_cache::TimelineCache;
use pulse_db::{Database, DbError};
use pulse_server::task::fanout::FanoutWorker;
use pulse_server::{shutdown_signal, AppState, Config, ConfigError, Server, ServerError};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "pulse::cli";

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },
    #[snafu(display("Database error: {source}"))]
    Database { source: DbError },
    #[snafu(display("Server error: {source}"))]
    Server { source: ServerError },
    #[snafu(display("Task error: {source}"))]
    Join { source: JoinError },
    #[snafu(display("Logging initialization failed"))]
    Logging,
}

pub type CliResult<T> = std::result::Result<T, CliError>;

/// Pulse - social-feed backend with hybrid push/pull timelines
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    /// Address to serve the HTTP API on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Fan-out worker instances sharing the event queue
    #[arg(long, default_value = "1")]
    pub workers: usize,
}

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging()?;

    let opts = Opts::parse();
    let config = Config::from_env().context(ConfigSnafu)?;

    let db = Arc::new(
        Database::open(config.db_path.clone(), config.celebrity_threshold)
            .await
            .context(DatabaseSnafu)?,
    );
    let cache = Arc::new(TimelineCache::new(config.timeline_cap));
    let bus = Arc::new(EventBus::new(
        config.visibility_timeout,
        config.max_receives,
        config.bus_capacity,
    ));
    let state = AppState::new(config, db, cache, bus);

    let server = Server::init(&opts.listen, state.clone())
        .await
        .context(ServerSnafu)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = vec![];
    for _ in 0..opts.workers.max(1) {
        let worker = FanoutWorker::new(&state, shutdown_rx.clone());
        worker_handles.push(tokio::spawn(worker.run()));
    }

    let server_handle = tokio::spawn(server.run(shutdown_rx));

    shutdown_signal().await;
    info!(target: LOG_TARGET, "Shutdown signal received");
    let _ = shutdown_tx.send(true);

    server_handle
        .await
        .context(JoinSnafu)?
        .context(ServerSnafu)?;
    for handle in worker_handles {
        handle.await.context(JoinSnafu)?;
    }

    info!(target: LOG_TARGET, "Shutdown complete");
    Ok(())
}

fn init_logging() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| CliError::Logging)?;

    Ok(())
}
