//! Provider adapters feeding the updates channel.
//!
//! A source fetches per-symbol sample series and pushes deduplicated deltas
//! onto a shared channel from its own polling task. Lifecycle is
//! NEW -> RUNNING -> STOPPED; cancellation arrives over broadcast shutdown
//! channels (one per source, plus the parent's).

pub mod multi;
pub mod yahoo;

pub use multi::MultiSourceManager;
pub use yahoo::YahooSource;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use observer_common::{DataSourceError, UpdateMap};

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Advisory: all sources under one manager must agree.
    fn is_real_time(&self) -> bool;

    /// Full backfill over the retention range.
    async fn fetch_initial(&self) -> Result<UpdateMap, DataSourceError>;

    /// Short-range fetch for the polling loop.
    async fn fetch_update(&self) -> Result<UpdateMap, DataSourceError>;

    /// Spawn the polling task. Fails when already running. The task exits
    /// on either shutdown signal or when the updates channel closes.
    async fn start(
        &self,
        out: mpsc::Sender<UpdateMap>,
        parent_shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, DataSourceError>;

    /// Signal the polling task to exit.
    async fn stop(&self) -> Result<(), DataSourceError>;

    /// Atomically replace the symbol set.
    fn update_symbols(&self, symbols: &[String]);
}

/// Per-source `symbol -> last admitted timestamp` filter.
///
/// Thread-confined inside the polling task for the hot path; the owner takes
/// a snapshot of the shared table at start and merges back on exit so a
/// restart resumes where the last run stopped.
#[derive(Debug, Default, Clone)]
pub struct DedupTable {
    last_seen: HashMap<String, i64>,
}

impl DedupTable {
    pub fn from_snapshot(snapshot: HashMap<String, i64>) -> Self {
        Self {
            last_seen: snapshot,
        }
    }

    /// Record an admitted timestamp (keeps the max).
    pub fn observe(&mut self, symbol: &str, timestamp: i64) {
        let entry = self.last_seen.entry(symbol.to_string()).or_insert(0);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    pub fn last_seen(&self, symbol: &str) -> i64 {
        self.last_seen.get(symbol).copied().unwrap_or(0)
    }

    /// Keep only samples strictly newer than the symbol's last admitted
    /// timestamp; advance the table for everything that survives. Symbols
    /// with nothing fresh disappear from the result entirely.
    pub fn filter(&mut self, data: UpdateMap) -> UpdateMap {
        let mut fresh = UpdateMap::new();

        for (symbol, samples) in data {
            let last = self.last_seen(&symbol);
            let new_samples: Vec<_> = samples
                .into_iter()
                .filter(|s| last == 0 || s.timestamp > last)
                .collect();

            if new_samples.is_empty() {
                continue;
            }

            if let Some(max_ts) = new_samples.iter().map(|s| s.timestamp).max() {
                self.observe(&symbol, max_ts);
            }
            fresh.insert(symbol, new_samples);
        }

        fresh
    }

    pub fn into_snapshot(self) -> HashMap<String, i64> {
        self.last_seen
    }
}
