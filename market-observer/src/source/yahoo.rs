//! Yahoo Finance chart-API polling adapter.
//!
//! Polls `/v8/finance/chart/{symbol}` at 5-minute granularity: the full
//! retention range once at bootstrap, a 1-day range on every tick. Fetches
//! fan out per symbol under a semaphore with a small launch spacing to stay
//! under the provider's rate limits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use observer_common::{DataSourceError, Sample, UpdateMap, ValidationError};

use crate::calendar::MarketScheduler;
use crate::config::{NetworkSettings, SourceSettings};
use crate::network::HttpFetcher;

use super::{DataSource, DedupTable};

const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const CHART_INTERVAL: &str = "5m";

/// Spacing between symbol-fetch launches inside a batch.
const LAUNCH_SPACING: Duration = Duration::from_millis(10);

/// How long to sleep when every tracked market is closed.
const MARKET_CLOSED_PAUSE: Duration = Duration::from_secs(60 * 60);

pub struct YahooSource {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    symbols: RwLock<Arc<Vec<String>>>,
    fetcher: Arc<HttpFetcher>,
    scheduler: MarketScheduler,
    /// Shared dedup state; the polling task owns a local copy while running
    /// and merges it back on exit.
    last_timestamps: Mutex<HashMap<String, i64>>,
    retention_days: i64,
    update_interval: Duration,
    concurrent_requests: usize,
    running: AtomicBool,
    /// Ticks that actually reached the provider (market open, fetch issued)
    fetch_ticks: AtomicUsize,
    shutdown_tx: broadcast::Sender<()>,
}

impl YahooSource {
    pub fn new(
        source_cfg: &SourceSettings,
        network_cfg: &NetworkSettings,
        fetcher: Arc<HttpFetcher>,
        retention_days: i64,
        update_interval_seconds: u64,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            inner: Arc::new(Inner {
                name: source_cfg.name.clone(),
                symbols: RwLock::new(Arc::new(source_cfg.symbols.clone())),
                fetcher,
                scheduler: MarketScheduler::new(&source_cfg.symbols),
                last_timestamps: Mutex::new(HashMap::new()),
                retention_days,
                update_interval: Duration::from_secs(update_interval_seconds),
                concurrent_requests: network_cfg.concurrent_requests,
                running: AtomicBool::new(false),
                fetch_ticks: AtomicUsize::new(0),
                shutdown_tx,
            }),
        }
    }
}

#[async_trait]
impl DataSource for YahooSource {
    fn name(&self) -> &str {
        &self.inner.name
    }

    /// Polling model, not a live stream.
    fn is_real_time(&self) -> bool {
        false
    }

    async fn fetch_initial(&self) -> Result<UpdateMap, DataSourceError> {
        let range = format!("{}d", self.inner.retention_days);
        let data = fetch_batch(&self.inner, &range).await?;

        // Seed the dedup table from the tail of each series.
        let mut table = self.inner.last_timestamps.lock().unwrap();
        for (symbol, samples) in &data {
            if let Some(last) = samples.last() {
                table.insert(symbol.clone(), last.timestamp);
            }
        }

        Ok(data)
    }

    async fn fetch_update(&self) -> Result<UpdateMap, DataSourceError> {
        fetch_batch(&self.inner, "1d").await
    }

    async fn start(
        &self,
        out: mpsc::Sender<UpdateMap>,
        parent_shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, DataSourceError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(DataSourceError::AlreadyRunning(self.inner.name.clone()));
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_loop(inner, out, parent_shutdown));

        info!(source = %self.inner.name, "started polling source");
        Ok(handle)
    }

    async fn stop(&self) -> Result<(), DataSourceError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(DataSourceError::NotRunning(self.inner.name.clone()));
        }

        let _ = self.inner.shutdown_tx.send(());
        info!(source = %self.inner.name, "stop requested");
        Ok(())
    }

    fn update_symbols(&self, symbols: &[String]) {
        *self.inner.symbols.write().unwrap() = Arc::new(symbols.to_vec());
        self.inner.scheduler.update_symbols(symbols);
        info!(source = %self.inner.name, count = symbols.len(), "updated symbol list");
    }
}

impl Inner {
    fn symbols(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.symbols.read().unwrap())
    }

    async fn fetch_symbol(
        &self,
        symbol: &str,
        range: &str,
    ) -> Result<Vec<Sample>, DataSourceError> {
        let url = format!("{}/{}", CHART_URL, symbol);
        let params = [
            ("interval", CHART_INTERVAL),
            ("range", range),
            ("includePrePost", "false"),
        ];

        let body = self
            .fetcher
            .get(&url, &params)
            .await
            .map_err(|e| DataSourceError::Fetch {
                symbol: symbol.to_string(),
                source: e,
            })?;

        parse_chart(symbol, &body, Utc::now().timestamp())
    }
}

/// Fetch every configured symbol concurrently, bounded by
/// `concurrent_requests`, with a 10 ms inter-launch spacing. Per-symbol
/// failures are logged and skipped; only a fully failed batch errors.
async fn fetch_batch(inner: &Arc<Inner>, range: &str) -> Result<UpdateMap, DataSourceError> {
    let symbols = inner.symbols();
    if symbols.is_empty() {
        return Ok(UpdateMap::new());
    }

    let semaphore = Arc::new(Semaphore::new(inner.concurrent_requests));
    let mut tasks = Vec::with_capacity(symbols.len());

    for symbol in symbols.iter().cloned() {
        let inner = Arc::clone(inner);
        let semaphore = Arc::clone(&semaphore);
        let range = range.to_string();

        tasks.push(tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (symbol, None),
            };
            sleep(LAUNCH_SPACING).await;

            match inner.fetch_symbol(&symbol, &range).await {
                Ok(series) => (symbol, Some(series)),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "symbol fetch failed");
                    (symbol, None)
                }
            }
        }));
    }

    let total = tasks.len();
    let mut results = UpdateMap::new();
    let mut failures = 0usize;

    for task in tasks {
        match task.await {
            Ok((symbol, Some(series))) => {
                results.insert(symbol, series);
            }
            _ => failures += 1,
        }
    }

    info!(
        source = %inner.name,
        fetched = results.len(),
        total,
        "batch fetch complete"
    );

    if results.is_empty() && failures > 0 {
        return Err(DataSourceError::AllFetchesFailed(failures));
    }
    Ok(results)
}

async fn run_loop(
    inner: Arc<Inner>,
    out: mpsc::Sender<UpdateMap>,
    mut parent_shutdown: broadcast::Receiver<()>,
) {
    let mut own_shutdown = inner.shutdown_tx.subscribe();

    // First fire after one full period, like a fresh ticker.
    let mut ticker = interval_at(
        Instant::now() + inner.update_interval,
        inner.update_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Local copy of the dedup table keeps the hot path lock-free.
    let mut dedup = DedupTable::from_snapshot(inner.last_timestamps.lock().unwrap().clone());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !inner.scheduler.any_market_open() {
                    info!(source = %inner.name, "all markets closed, pausing for 60 minutes");
                    tokio::select! {
                        _ = sleep(MARKET_CLOSED_PAUSE) => {}
                        _ = own_shutdown.recv() => break,
                        _ = parent_shutdown.recv() => break,
                    }
                    continue;
                }

                inner.fetch_ticks.fetch_add(1, Ordering::Relaxed);
                let data = match fetch_batch(&inner, "1d").await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(source = %inner.name, error = %e, "update fetch failed");
                        continue;
                    }
                };

                let fresh = dedup.filter(data);
                if fresh.is_empty() {
                    debug!(source = %inner.name, "no fresh samples this tick");
                    continue;
                }

                tokio::select! {
                    result = out.send(fresh) => {
                        if result.is_err() {
                            warn!(source = %inner.name, "updates channel closed, stopping");
                            break;
                        }
                    }
                    _ = own_shutdown.recv() => break,
                    _ = parent_shutdown.recv() => break,
                }
            }
            _ = own_shutdown.recv() => break,
            _ = parent_shutdown.recv() => break,
        }
    }

    // Merge the task-local dedup state back for a potential restart.
    {
        let mut shared = inner.last_timestamps.lock().unwrap();
        for (symbol, ts) in dedup.into_snapshot() {
            let entry = shared.entry(symbol).or_insert(0);
            if ts > *entry {
                *entry = ts;
            }
        }
    }

    inner.running.store(false, Ordering::SeqCst);
    info!(
        source = %inner.name,
        fetch_ticks = inner.fetch_ticks.load(Ordering::Relaxed),
        "polling loop stopped"
    );
}

// ---------------------------------------------------------------------------
// Chart response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartApiError>,
}

#[derive(Debug, Deserialize)]
struct ChartApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    #[serde(default)]
    indicators: ChartIndicators,
}

#[derive(Debug, Default, Deserialize)]
struct ChartMeta {
    #[serde(rename = "chartPreviousClose", default)]
    chart_previous_close: f64,
}

#[derive(Debug, Default, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

/// Quote arrays carry nulls for halted/missing bars.
#[derive(Debug, Default, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Decode a chart response into a sorted sample series with per-sample
/// percent changes.
///
/// Array alignment across timestamp/o/h/l/c/v is required. Points with a
/// null field, a non-positive close or a negative volume are dropped.
/// `price_percent_change` runs against the previous close, seeded from
/// `chartPreviousClose` when present; `volume_percent_change` runs against
/// the previous point's volume.
fn parse_chart(symbol: &str, body: &[u8], fetched_at: i64) -> Result<Vec<Sample>, DataSourceError> {
    let parse_err = |reason: String| DataSourceError::Parse {
        symbol: symbol.to_string(),
        reason,
    };

    let response: ChartResponse = serde_json::from_slice(body)
        .map_err(|e| parse_err(format!("json decode failed: {}", e)))?;

    if let Some(err) = response.chart.error {
        return Err(parse_err(format!("api error: {} - {}", err.code, err.description)));
    }

    let result = response
        .chart
        .result
        .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
        .ok_or_else(|| parse_err("no result in response".to_string()))?;

    if result.timestamp.is_empty() {
        return Err(parse_err("no timestamps in response".to_string()));
    }

    let quote = result
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| parse_err("no quote data in response".to_string()))?;

    let n = result.timestamp.len();
    if quote.open.len() != n
        || quote.high.len() != n
        || quote.low.len() != n
        || quote.close.len() != n
        || quote.volume.len() != n
    {
        let err = ValidationError::Misaligned {
            symbol: symbol.to_string(),
        };
        return Err(parse_err(err.to_string()));
    }

    let mut points: Vec<(i64, f64, f64)> = Vec::with_capacity(n); // (ts, close, volume)
    for i in 0..n {
        let (Some(_open), Some(_high), Some(_low), Some(close), Some(volume)) = (
            quote.open[i],
            quote.high[i],
            quote.low[i],
            quote.close[i],
            quote.volume[i],
        ) else {
            let err = ValidationError::InvalidPoint {
                symbol: symbol.to_string(),
                index: i,
                reason: "null field".to_string(),
            };
            debug!(%err, "dropping sample");
            continue;
        };

        if close <= 0.0 || volume < 0.0 {
            let err = ValidationError::InvalidPoint {
                symbol: symbol.to_string(),
                index: i,
                reason: format!("close={}, volume={}", close, volume),
            };
            debug!(%err, "dropping sample");
            continue;
        }

        points.push((result.timestamp[i], close, volume));
    }

    points.sort_by_key(|p| p.0);

    if points.is_empty() {
        return Err(parse_err("no valid data points".to_string()));
    }

    let mut prev_close = if result.meta.chart_previous_close > 0.0 {
        result.meta.chart_previous_close
    } else {
        points[0].1
    };
    let mut prev_volume = points[0].2;

    let mut series = Vec::with_capacity(points.len());
    for (ts, close, volume) in points {
        let price_pct = if prev_close > 0.0 {
            (close - prev_close) / prev_close
        } else {
            0.0
        };
        let volume_pct = if prev_volume > 0.0 {
            (volume - prev_volume) / prev_volume
        } else {
            0.0
        };

        series.push(Sample {
            symbol: symbol.to_string(),
            timestamp: ts,
            price: close,
            volume,
            price_percent_change: price_pct,
            volume_percent_change: volume_pct,
            fetched_at,
        });

        prev_close = close;
        prev_volume = volume;
    }

    debug!(
        symbol,
        points = series.len(),
        first = series[0].timestamp,
        last = series[series.len() - 1].timestamp,
        "parsed chart response"
    );

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart_json(
        previous_close: f64,
        timestamps: &[i64],
        closes: &[Option<f64>],
        volumes: &[Option<f64>],
    ) -> Vec<u8> {
        let to_array = |values: &[Option<f64>]| {
            values
                .iter()
                .map(|v| match v {
                    Some(x) => x.to_string(),
                    None => "null".to_string(),
                })
                .collect::<Vec<_>>()
                .join(",")
        };

        let closes_s = to_array(closes);
        let volumes_s = to_array(volumes);
        let ts_s = timestamps
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");

        format!(
            r#"{{"chart":{{"result":[{{"meta":{{"chartPreviousClose":{}}},"timestamp":[{}],
                "indicators":{{"quote":[{{"open":[{}],"high":[{}],"low":[{}],"close":[{}],"volume":[{}]}}]}}}}],
                "error":null}}}}"#,
            previous_close, ts_s, closes_s, closes_s, closes_s, closes_s, volumes_s
        )
        .into_bytes()
    }

    #[test]
    fn test_parse_basic_series() {
        let body = chart_json(
            10.0,
            &[100, 400, 700],
            &[Some(10.0), Some(11.0), Some(12.1)],
            &[Some(100.0), Some(200.0), Some(100.0)],
        );

        let series = parse_chart("AAPL", &body, 999).unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].symbol, "AAPL");
        assert_eq!(series[0].fetched_at, 999);

        // First pct vs chartPreviousClose 10.0 -> 0
        assert!((series[0].price_percent_change - 0.0).abs() < 1e-9);
        assert!((series[1].price_percent_change - 0.1).abs() < 1e-9);
        assert!((series[1].volume_percent_change - 1.0).abs() < 1e-9);
        assert!((series[2].volume_percent_change + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_seeds_from_previous_close() {
        let body = chart_json(8.0, &[100], &[Some(10.0)], &[Some(1.0)]);
        let series = parse_chart("X", &body, 0).unwrap();
        assert!((series[0].price_percent_change - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_parse_drops_null_points() {
        let body = chart_json(
            0.0,
            &[100, 400, 700],
            &[Some(10.0), None, Some(12.0)],
            &[Some(1.0), Some(2.0), Some(3.0)],
        );

        let series = parse_chart("X", &body, 0).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].timestamp, 700);
    }

    #[test]
    fn test_parse_drops_invalid_values() {
        let body = chart_json(
            0.0,
            &[100, 400, 700],
            &[Some(10.0), Some(-1.0), Some(12.0)],
            &[Some(1.0), Some(2.0), Some(-3.0)],
        );

        let series = parse_chart("X", &body, 0).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].timestamp, 100);
    }

    #[test]
    fn test_parse_sorts_by_timestamp() {
        let body = chart_json(
            0.0,
            &[700, 100, 400],
            &[Some(12.0), Some(10.0), Some(11.0)],
            &[Some(3.0), Some(1.0), Some(2.0)],
        );

        let series = parse_chart("X", &body, 0).unwrap();
        let timestamps: Vec<i64> = series.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![100, 400, 700]);
    }

    #[test]
    fn test_parse_rejects_misaligned_arrays() {
        let body = br#"{"chart":{"result":[{"meta":{},"timestamp":[1,2],
            "indicators":{"quote":[{"open":[1.0],"high":[1.0],"low":[1.0],"close":[1.0],"volume":[1.0]}]}}],
            "error":null}}"#;
        assert!(parse_chart("X", body, 0).is_err());
    }

    #[test]
    fn test_parse_rejects_api_error() {
        let body = br#"{"chart":{"result":null,
            "error":{"code":"Not Found","description":"No data found"}}}"#;
        let err = parse_chart("X", body, 0).unwrap_err();
        assert!(err.to_string().contains("Not Found"));
    }

    #[test]
    fn test_parse_rejects_all_invalid_points() {
        let body = chart_json(0.0, &[100], &[None], &[Some(1.0)]);
        assert!(parse_chart("X", &body, 0).is_err());
    }

    #[test]
    fn test_parse_rejects_empty_result() {
        let body = br#"{"chart":{"result":[],"error":null}}"#;
        assert!(parse_chart("X", body, 0).is_err());
    }

    fn polling_source(symbols: &[&str]) -> YahooSource {
        let source_cfg = SourceSettings {
            name: "yahoo".to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            api_key: String::new(),
        };
        let network_cfg = NetworkSettings::default();
        let fetcher = Arc::new(HttpFetcher::new(&network_cfg).unwrap());
        YahooSource::new(&source_cfg, &network_cfg, fetcher, 7, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_market_tick_skips_fetch() {
        // No tracked symbols: the scheduler reports every market closed, so
        // a ticker fire must park in the market-closed sleep instead of
        // reaching the provider.
        let source = polling_source(&[]);

        let (tx, mut rx) = mpsc::channel(8);
        let (parent_tx, _) = broadcast::channel(1);
        let handle = source.start(tx, parent_tx.subscribe()).await.unwrap();

        // Several virtual update intervals elapse; the first fire lands in
        // the 60-minute pause.
        sleep(Duration::from_secs(10)).await;

        source.stop().await.unwrap();
        handle.await.unwrap();

        assert_eq!(source.inner.fetch_ticks.load(Ordering::Relaxed), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_fails() {
        // Empty symbol set keeps the loop parked in the closed-market pause.
        let source = polling_source(&[]);

        let (tx, _rx) = mpsc::channel(8);
        let (parent_tx, _) = broadcast::channel(1);
        let handle = source
            .start(tx.clone(), parent_tx.subscribe())
            .await
            .unwrap();

        assert!(matches!(
            source.start(tx, parent_tx.subscribe()).await,
            Err(DataSourceError::AlreadyRunning(_))
        ));

        source.stop().await.unwrap();
        handle.await.unwrap();

        // Stopping again reports the stopped state
        assert!(matches!(
            source.stop().await,
            Err(DataSourceError::NotRunning(_))
        ));
    }
}
