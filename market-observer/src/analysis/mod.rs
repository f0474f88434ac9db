//! Windowed aggregation engine.
//!
//! Stateless over a `window name -> seconds` table: historical backfill mode
//! emits one candle per non-empty aligned bucket, realtime mode emits exactly
//! one candle for the window containing the newest sample. Buckets are
//! left-inclusive, right-exclusive; a sample at `t` belongs to the bucket
//! starting at `t - t % window_seconds`.

pub mod financial;
pub mod statistics;

use std::collections::{BTreeMap, HashMap};

use tracing::error;

use observer_common::types::{Candle, IntermediateStats, Sample, UpdateMap};

use crate::config::Window;
use financial::{anomaly_ratio, change_percent, ohlcv};
use statistics::{correlation, mean_std};

/// Aligned bucket boundaries for a timestamp.
pub fn window_bounds(timestamp: i64, window_seconds: i64) -> (i64, i64) {
    let start = timestamp - timestamp.rem_euclid(window_seconds);
    (start, start + window_seconds)
}

/// Per-symbol intermediate stats for a single window.
pub type WindowStats = HashMap<String, IntermediateStats>;

pub struct AggregationEngine {
    windows: BTreeMap<String, i64>,
}

impl AggregationEngine {
    pub fn new(windows: &[Window]) -> Self {
        Self {
            windows: windows
                .iter()
                .map(|w| (w.name.clone(), w.seconds))
                .collect(),
        }
    }

    pub fn window_seconds(&self, name: &str) -> Option<i64> {
        self.windows.get(name).copied()
    }

    pub fn window_names(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(|s| s.as_str())
    }

    /// Aggregate the current aligned window for each symbol.
    ///
    /// The current window is located from the **latest** sample; only the
    /// current and the immediately previous window matter. Percent changes
    /// are computed against the previous window's close and volume sum; with
    /// an empty previous window the price change falls back to close-vs-open
    /// of the current window and the volume change to 0. Symbols with no
    /// samples in the current window emit nothing.
    ///
    /// `data` must carry the full in-memory history for the symbols under
    /// update so that the previous window is visible.
    pub fn aggregate_realtime(
        &self,
        data: &UpdateMap,
        window_name: &str,
        stats: &WindowStats,
    ) -> HashMap<String, Candle> {
        let mut results = HashMap::new();

        let Some(window_seconds) = self.window_seconds(window_name) else {
            error!(window = window_name, "invalid window name");
            return results;
        };

        for (symbol, samples) in data {
            if samples.is_empty() {
                continue;
            }

            let mut samples = samples.clone();
            samples.sort_by_key(|s| s.timestamp);

            let last = &samples[samples.len() - 1];
            let (current_start, current_end) = window_bounds(last.timestamp, window_seconds);
            let prev_start = current_start - window_seconds;

            let mut current: Vec<&Sample> = Vec::new();
            let mut previous: Vec<&Sample> = Vec::new();
            for s in &samples {
                if s.timestamp >= current_start && s.timestamp < current_end {
                    current.push(s);
                } else if s.timestamp >= prev_start && s.timestamp < current_start {
                    previous.push(s);
                }
            }

            if current.is_empty() {
                continue;
            }

            let prices: Vec<f64> = current.iter().map(|s| s.price).collect();
            let volumes: Vec<f64> = current.iter().map(|s| s.volume).collect();

            let o = ohlcv(&prices, &volumes);
            let corr = correlation(&prices, &volumes);

            let avg_volume = stats
                .get(symbol)
                .map(|s| s.avg_volume_history)
                .unwrap_or(1.0);
            let anomaly = anomaly_ratio(o.volume, avg_volume);

            let (price_change, volume_change) = if previous.is_empty() {
                // Warm-up: no previous window in memory yet
                (change_percent(o.close, o.open), 0.0)
            } else {
                let prev_close = previous[previous.len() - 1].price;
                let prev_volume: f64 = previous.iter().map(|s| s.volume).sum();
                (
                    change_percent(o.close, prev_close),
                    change_percent(o.volume, prev_volume),
                )
            };

            results.insert(
                symbol.clone(),
                Candle {
                    symbol: symbol.clone(),
                    window_name: window_name.to_string(),
                    open: o.open,
                    high: o.high,
                    low: o.low,
                    close: o.close,
                    volume: o.volume,
                    avg_price: o.avg_price,
                    price_percent_change: price_change,
                    volume_percent_change: volume_change,
                    price_volume_correlation: corr,
                    volume_anomaly_ratio: anomaly,
                    start_time: current_start,
                    end_time: current_end,
                    data_points: current.len(),
                },
            );
        }

        results
    }

    /// Aggregate each symbol's entire history into time-ordered candles, one
    /// per non-empty bucket. The k-th candle's percent changes are computed
    /// against candle k-1; the first candle emits zeros.
    pub fn aggregate_historical(
        &self,
        data: &UpdateMap,
        window_name: &str,
        stats: &WindowStats,
    ) -> HashMap<String, Vec<Candle>> {
        let mut results = HashMap::new();

        let Some(window_seconds) = self.window_seconds(window_name) else {
            return results;
        };

        for (symbol, samples) in data {
            if samples.is_empty() {
                continue;
            }

            let mut samples = samples.clone();
            samples.sort_by_key(|s| s.timestamp);

            let mut buckets: BTreeMap<i64, Vec<&Sample>> = BTreeMap::new();
            for s in &samples {
                let (start, _) = window_bounds(s.timestamp, window_seconds);
                buckets.entry(start).or_default().push(s);
            }

            let avg_volume = stats
                .get(symbol)
                .map(|s| s.avg_volume_history)
                .unwrap_or(1.0);

            let mut candles = Vec::with_capacity(buckets.len());
            let mut prev: Option<(f64, f64)> = None; // (close, volume)

            for (start, subset) in buckets {
                let prices: Vec<f64> = subset.iter().map(|s| s.price).collect();
                let volumes: Vec<f64> = subset.iter().map(|s| s.volume).collect();

                let o = ohlcv(&prices, &volumes);
                let corr = correlation(&prices, &volumes);
                let anomaly = anomaly_ratio(o.volume, avg_volume);

                let (price_change, volume_change) = match prev {
                    Some((prev_close, prev_volume)) => (
                        change_percent(o.close, prev_close),
                        change_percent(o.volume, prev_volume),
                    ),
                    None => (0.0, 0.0),
                };

                candles.push(Candle {
                    symbol: symbol.clone(),
                    window_name: window_name.to_string(),
                    open: o.open,
                    high: o.high,
                    low: o.low,
                    close: o.close,
                    volume: o.volume,
                    avg_price: o.avg_price,
                    price_percent_change: price_change,
                    volume_percent_change: volume_change,
                    price_volume_correlation: corr,
                    volume_anomaly_ratio: anomaly,
                    start_time: start,
                    end_time: start + window_seconds,
                    data_points: subset.len(),
                });

                prev = Some((o.close, o.volume));
            }

            if !candles.is_empty() {
                results.insert(symbol.clone(), candles);
            }
        }

        results
    }

    /// Historical volume baseline per symbol and window: bucket the samples,
    /// sum volumes per bucket, then take mean and population sigma over the
    /// bucket series.
    pub fn compute_initial_stats(
        &self,
        data: &UpdateMap,
    ) -> HashMap<String, HashMap<String, IntermediateStats>> {
        let mut results: HashMap<String, HashMap<String, IntermediateStats>> = HashMap::new();

        for (symbol, samples) in data {
            if samples.is_empty() {
                continue;
            }

            let mut samples = samples.clone();
            samples.sort_by_key(|s| s.timestamp);
            let last_timestamp = samples[samples.len() - 1].timestamp;

            let mut symbol_stats = HashMap::new();

            for (window_name, &window_seconds) in &self.windows {
                let mut bucket_volumes: BTreeMap<i64, f64> = BTreeMap::new();
                for s in &samples {
                    let (start, _) = window_bounds(s.timestamp, window_seconds);
                    *bucket_volumes.entry(start).or_insert(0.0) += s.volume;
                }

                let volumes: Vec<f64> = bucket_volumes.values().copied().collect();
                if volumes.is_empty() {
                    continue;
                }

                let (mean, std) = mean_std(&volumes);

                symbol_stats.insert(
                    window_name.clone(),
                    IntermediateStats {
                        symbol: symbol.clone(),
                        window_name: window_name.clone(),
                        avg_volume_history: mean,
                        std_volume_history: std,
                        data_points_history: volumes.len(),
                        last_history_timestamp: last_timestamp,
                    },
                );
            }

            if !symbol_stats.is_empty() {
                results.insert(symbol.clone(), symbol_stats);
            }
        }

        results
    }
}
