//! The orchestrator binds sources, memory, analysis, storage and the hub.
//!
//! Bootstrap runs once against the full retention backfill; the steady-state
//! loop consumes update batches serially, so memory-manager writes,
//! persistence and hub state transitions for successive batches are totally
//! ordered. Save errors never abort the loop: the live broadcast stays up
//! and idempotent upserts make persistence eventually consistent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use observer_common::error::retry_with_backoff;
use observer_common::types::{
    AggregationsMap, IntermediateStats, LatestData, PayloadKind, ProcessingMetrics, Sample,
    UpdateMap,
};

use crate::analysis::{AggregationEngine, WindowStats};
use crate::config::Window;
use crate::memory::MemoryManager;
use crate::server::Hub;
use crate::source::DataSource;
use crate::storage::Database;

/// `symbol -> window -> stats`, kept in process memory after bootstrap.
type StatsMap = HashMap<String, HashMap<String, IntermediateStats>>;

/// Raw-sample bulk saves retry transient store errors a few times before
/// the batch is given up on.
const SAVE_RETRY_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct Orchestrator {
    db: Arc<dyn Database>,
    engine: AggregationEngine,
    memory: Arc<MemoryManager>,
    hub: Arc<Hub>,
    windows: Vec<Window>,
    stats: StatsMap,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        memory: Arc<MemoryManager>,
        hub: Arc<Hub>,
        windows: Vec<Window>,
    ) -> Self {
        Self {
            db,
            engine: AggregationEngine::new(&windows),
            memory,
            hub,
            windows,
            stats: StatsMap::new(),
        }
    }

    fn stats_for_window(&self, window: &str) -> WindowStats {
        let mut out = WindowStats::new();
        for (symbol, windows) in &self.stats {
            if let Some(s) = windows.get(window) {
                out.insert(symbol.clone(), s.clone());
            }
        }
        out
    }

    /// One-time initial load: backfill, baseline stats, historical
    /// aggregation, bulk persistence, and the INITIAL hub state.
    ///
    /// Partial failures are warnings; with zero symbols the system still
    /// starts and waits for live updates.
    pub async fn bootstrap(&mut self, source: &dyn DataSource) {
        info!("fetching initial data");
        let initial = match source.fetch_initial().await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "initial fetch failed, starting with empty state");
                UpdateMap::new()
            }
        };

        for (symbol, samples) in &initial {
            for sample in samples {
                self.memory.add_sample(symbol, sample);
            }
        }

        self.stats = self.engine.compute_initial_stats(&initial);

        let mut initial_aggs = AggregationsMap::new();

        for window in &self.windows {
            let stats_list: Vec<IntermediateStats> = self
                .stats
                .values()
                .filter_map(|windows| windows.get(&window.name).cloned())
                .collect();
            if !stats_list.is_empty() {
                if let Err(e) = self.db.save_intermediate_stats(&stats_list).await {
                    error!(window = %window.name, error = %e, "saving stats failed");
                }
            }

            let window_stats = self.stats_for_window(&window.name);
            let candles_by_symbol =
                self.engine
                    .aggregate_historical(&initial, &window.name, &window_stats);

            let mut save_map = AggregationsMap::new();
            for (symbol, candles) in &candles_by_symbol {
                save_map
                    .entry(symbol.clone())
                    .or_default()
                    .insert(window.name.clone(), candles.clone());

                // The newest candle per (symbol, window) seeds the hub state
                if let Some(latest) = candles.last() {
                    initial_aggs
                        .entry(symbol.clone())
                        .or_default()
                        .insert(window.name.clone(), vec![latest.clone()]);
                }
            }

            if let Err(e) = self.db.save_aggregations(&save_map).await {
                error!(window = %window.name, error = %e, "saving historical aggregations failed");
            }
        }

        let all_samples: Vec<Sample> = initial.values().flatten().cloned().collect();
        if let Err(e) = retry_with_backoff(
            || self.db.save_samples_bulk(&all_samples),
            SAVE_RETRY_ATTEMPTS,
            SAVE_RETRY_DELAY,
        )
        .await
        {
            error!(error = %e, "saving initial samples failed");
        }

        let raw_data: HashMap<String, Sample> = initial
            .iter()
            .filter_map(|(symbol, samples)| {
                samples.last().map(|s| (symbol.clone(), s.clone()))
            })
            .collect();

        let payload = LatestData {
            kind: PayloadKind::Initial,
            raw_data,
            aggregations: initial_aggs,
            timestamp: Utc::now().timestamp(),
            processing_metrics: ProcessingMetrics {
                aggregation_time_seconds: 0.0,
                valid_symbols: initial.len(),
                windows_processed: self.windows.len(),
            },
        };

        // Seed the hub state; nobody is connected yet, so no broadcast.
        self.hub.update_state(payload);
        info!(symbols = initial.len(), "initialization complete");
    }

    /// Steady-state loop: consume update batches until the channel closes
    /// or a termination signal arrives.
    pub async fn run(&mut self, mut updates_rx: mpsc::Receiver<UpdateMap>) {
        info!("starting data loop");

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                maybe_updates = updates_rx.recv() => {
                    match maybe_updates {
                        Some(updates) => self.process_update(updates).await,
                        None => {
                            info!("updates channel closed");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
    }

    /// Handle one update batch end to end.
    pub async fn process_update(&mut self, updates: UpdateMap) {
        let started = Instant::now();
        info!(symbols = updates.len(), "received update batch");

        let mut new_samples = Vec::new();
        for (symbol, samples) in &updates {
            for sample in samples {
                self.memory.add_sample(symbol, sample);
            }
            new_samples.extend(samples.iter().cloned());
        }

        if let Err(e) = retry_with_backoff(
            || self.db.save_samples_bulk(&new_samples),
            SAVE_RETRY_ATTEMPTS,
            SAVE_RETRY_DELAY,
        )
        .await
        {
            error!(error = %e, "saving samples failed");
        }

        // Realtime aggregation needs the previous window too, so it runs
        // against the full in-memory history of the updated symbols.
        let mut full_history = UpdateMap::new();
        for symbol in updates.keys() {
            if let Some(history) = self.memory.get_history(symbol) {
                full_history.insert(symbol.clone(), history);
            }
        }

        let mut broadcast_aggs = AggregationsMap::new();

        for window in &self.windows {
            let window_stats = self.stats_for_window(&window.name);
            let candles = self
                .engine
                .aggregate_realtime(&full_history, &window.name, &window_stats);

            let mut save_map = AggregationsMap::new();
            for (symbol, candle) in &candles {
                save_map
                    .entry(symbol.clone())
                    .or_default()
                    .insert(window.name.clone(), vec![candle.clone()]);
            }
            if let Err(e) = self.db.save_aggregations(&save_map).await {
                error!(window = %window.name, error = %e, "saving aggregations failed");
            }

            for (symbol, candle) in candles {
                broadcast_aggs
                    .entry(symbol)
                    .or_default()
                    .insert(window.name.clone(), vec![candle]);
            }
        }

        let raw_data: HashMap<String, Sample> = updates
            .iter()
            .filter_map(|(symbol, samples)| {
                samples
                    .iter()
                    .max_by_key(|s| s.timestamp)
                    .map(|s| (symbol.clone(), s.clone()))
            })
            .collect();

        let payload = LatestData {
            kind: PayloadKind::Update,
            raw_data,
            aggregations: broadcast_aggs,
            timestamp: Utc::now().timestamp(),
            processing_metrics: ProcessingMetrics {
                aggregation_time_seconds: started.elapsed().as_secs_f64(),
                valid_symbols: updates.len(),
                windows_processed: self.windows.len(),
            },
        };

        self.hub.update_state(payload.clone());
        self.hub.broadcast(payload).await;

        if let Err(e) = self.db.cleanup_old_data().await {
            error!(error = %e, "cleanup failed");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
