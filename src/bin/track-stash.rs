//! track-stash - Vessel track store and GeoJSON track API
//!
//! Usage:
//!   signalk-server-deltas | track-stash [--config <file>] [--listen <addr>]
//!
//! Reads Signal K deltas as newline-delimited JSON from stdin, stores the
//! vessel's track and forwards series to InfluxDB, and serves track queries
//! over HTTP until interrupted.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use tokio::io::BufReader;
use tokio::sync::Notify;
use track_stash::{
    build_router, DeltaIngester, InfluxClient, StashConfig, TimeSeriesStore, TrackService,
    TrackStore,
};

#[derive(Parser)]
#[command(name = "track-stash")]
#[command(about = "Store vessel tracks and serve them as GeoJSON", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// Do not read deltas from stdin
    #[arg(long)]
    no_stdin: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => StashConfig::load(path)?,
        None => StashConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let influx = Arc::new(InfluxClient::new(&config.influx)?);
    let source = influx.database().to_string();
    let series: Arc<dyn TimeSeriesStore> = influx;
    let tracks = Arc::new(TrackStore::open_or_degraded(
        &config.track_db_path,
        config.track_store_config(),
    ));

    let service = Arc::new(TrackService::new(
        tracks.clone(),
        series.clone(),
        source,
        config.query_timeout(),
    ));
    let ingester = Arc::new(DeltaIngester::new(&config, tracks, series));

    let shutdown = Arc::new(Notify::new());
    let reader = (!cli.no_stdin).then(|| {
        let ingester = ingester.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            ingester
                .consume(BufReader::new(tokio::io::stdin()), &shutdown)
                .await
        })
    });

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("[Main] Listening on {}", config.listen);
    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("[Main] Cannot listen for shutdown signal: {}", e);
            }
        })
        .await?;

    if let Some(reader) = reader {
        // The reader stops between deltas, never inside a write
        shutdown.notify_one();
        if let Err(e) = reader.await {
            warn!("[Main] Delta reader failed: {}", e);
        }
    }
    ingester.flush().await?;
    info!("[Main] Stopped");
    Ok(())
}
