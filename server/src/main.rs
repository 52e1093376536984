use anyhow::Context;
use chest_stats_server::{Api, Broadcaster, Config, FileStorage, Flusher, Stats};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Global chest stats and live drop feed", long_about = None)]
struct Args {
    /// YAML config file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding the persisted records.
    #[arg(short, long)]
    directory: Option<String>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("could not read config file {}", path.display()))?;
            serde_yaml::from_str::<Config>(&raw).context("could not parse config file")?
        }
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(directory) = args.directory {
        config.directory = directory;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    let config = config.validate().context("invalid config")?;

    // Create logger
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(config.log_level)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(config.log_level)
            .init();
    }

    // Restore state
    let storage = FileStorage::new(&config.directory);
    let stats = Stats::load(&storage)
        .await
        .with_context(|| format!("failed to restore state from {}", storage.directory().display()))?;

    // Start background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = Flusher::new(stats.clone(), storage, config.flush_interval)
        .start(shutdown_rx.clone());
    let broadcaster =
        Broadcaster::new(stats.clone(), config.broadcast_interval).start(shutdown_rx);

    let mut api = Api::new(stats.clone());
    if let Some(rate_limit) = config.rate_limit {
        api = api.with_rate_limit(rate_limit);
    }
    let app = api.router();

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    let signal = {
        let stats = stats.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(?e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            // Live streams would otherwise hold the server open
            let disconnected = stats.disconnect_all();
            info!(disconnected, "shutting down");
        }
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
    .context("axum server error")?;

    // Stop background tasks, persisting anything still dirty
    let _ = shutdown_tx.send(true);
    broadcaster.await.context("broadcaster panicked")?;
    flusher.await.context("flusher panicked")?;
    info!("stopped");

    Ok(())
}
