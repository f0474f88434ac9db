//! Market observer service binary.
//!
//! Loads the YAML configuration, opens the store, wires sources through the
//! orchestrator to the broadcast hub, and runs until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use market_observer::config::Settings;
use market_observer::memory::{self, MemoryManager};
use market_observer::network::HttpFetcher;
use market_observer::server::{self, AppState, Hub};
use market_observer::source::{DataSource, MultiSourceManager, YahooSource};
use market_observer::storage;
use market_observer::Orchestrator;

use observer_common::logging::{init_logging, LogConfig};
use observer_common::UpdateMap;

const UPDATES_CHANNEL_CAPACITY: usize = 500;

#[derive(Parser, Debug)]
#[command(name = "market-observer", about = "Market data observer service")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "../../config/default.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading config '{}'", cli.config))?;

    init_logging(
        LogConfig::from_env().with_default_level(settings.log_level.to_lowercase()),
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    info!(name = %settings.name, "starting market observer");

    // Storage first: a broken store is fatal at startup.
    let db = storage::connect(&settings)
        .await
        .context("opening database")?;
    db.initialize().await.context("initializing database")?;

    let fetcher = Arc::new(HttpFetcher::new(&settings.network).context("building http fetcher")?);

    // Sources. Unknown provider names are warned and skipped.
    let mut sources: Vec<Arc<dyn DataSource>> = Vec::new();
    for source_cfg in &settings.data_source.sources {
        match source_cfg.name.as_str() {
            "yahoo" => {
                let source = YahooSource::new(
                    source_cfg,
                    &settings.network,
                    Arc::clone(&fetcher),
                    settings.data_source.data_retention_days,
                    settings.data_source.update_interval_seconds,
                );
                info!(
                    source = %source_cfg.name,
                    symbols = source_cfg.symbols.len(),
                    real_time = source.is_real_time(),
                    "added source"
                );
                sources.push(Arc::new(source));
            }
            other => warn!(source = %other, "unknown source type in config, skipping"),
        }
    }

    if sources.is_empty() {
        bail!("no valid data sources configured");
    }

    // All sources under one manager must agree on the delivery model.
    let realtime_ref = sources[0].is_real_time();
    for source in &sources {
        if source.is_real_time() != realtime_ref {
            bail!(
                "source '{}' disagrees on real-time delivery with the rest",
                source.name()
            );
        }
    }

    let multi_source = Arc::new(MultiSourceManager::new(sources));

    // Memory manager sized from retention and the machine's RAM.
    let max_points = memory::points_for_retention(settings.data_source.data_retention_days);
    let memory_limit = memory::recommended_memory_limit_mb();
    info!(limit_mb = memory_limit, max_points, "memory manager configured");
    let memory = Arc::new(MemoryManager::new(memory_limit, max_points));

    let windows = settings.windows().context("parsing aggregation windows")?;

    // Hub + HTTP server.
    let hub = Hub::new(settings.windows_aggregation.clone());
    let app_state = Arc::new(AppState {
        hub: Arc::clone(&hub),
    });
    let host = settings.host.clone();
    let port = settings.port;
    tokio::spawn(async move {
        if let Err(e) = server::serve(&host, port, app_state).await {
            tracing::error!(error = %e, "http server failed");
        }
    });

    // Bootstrap, then go live.
    let mut orchestrator = Orchestrator::new(db, Arc::clone(&memory), hub, windows);
    orchestrator.bootstrap(multi_source.as_ref()).await;

    let (updates_tx, updates_rx) = mpsc::channel::<UpdateMap>(UPDATES_CHANNEL_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let sources_handle = multi_source
        .start(updates_tx, shutdown_tx.subscribe())
        .await
        .context("starting data sources")?;

    orchestrator.run(updates_rx).await;

    info!("waiting for sources to stop");
    multi_source.stop().await.ok();
    let _ = shutdown_tx.send(());
    let _ = sources_handle.await;

    info!("shutdown complete");
    Ok(())
}
