//! Broadcast hub: client registry, merged latest state, fan-out.
//!
//! A single task owns the client set and consumes three channels. On every
//! broadcast it merges the payload into the shared state under the write
//! lock, then try-sends the merged snapshot to each client queue; a full
//! queue gets its client pruned on the spot, which bounds memory against
//! arbitrarily slow consumers. REST handlers and subscribe handlers only
//! ever take the read lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use observer_common::types::{
    AggregationsMap, LatestData, PayloadKind, ProcessingMetrics, SubscribeCommand,
};

/// Per-client outbound queue depth; overflow disconnects the client.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Broadcast queue depth between the orchestrator and the hub loop.
const BROADCAST_QUEUE_CAPACITY: usize = 256;

struct ClientHandle {
    id: u64,
    queue: mpsc::Sender<LatestData>,
}

pub struct Hub {
    state: RwLock<LatestData>,
    register_tx: mpsc::Sender<ClientHandle>,
    unregister_tx: mpsc::Sender<u64>,
    broadcast_tx: mpsc::Sender<LatestData>,
    reply_tx: mpsc::Sender<(u64, LatestData)>,
    connections: AtomicUsize,
    next_client_id: AtomicU64,
    timeframes: Vec<String>,
}

impl Hub {
    /// Create the hub and spawn its loop. Must run under a tokio runtime.
    pub fn new(timeframes: Vec<String>) -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::channel(64);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(64);

        let hub = Arc::new(Self {
            state: RwLock::new(LatestData::empty()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            reply_tx,
            connections: AtomicUsize::new(0),
            next_client_id: AtomicU64::new(1),
            timeframes,
        });

        tokio::spawn(run_hub(
            Arc::clone(&hub),
            register_rx,
            unregister_rx,
            broadcast_rx,
            reply_rx,
        ));

        hub
    }

    /// Add a client; the current state snapshot is enqueued on its queue
    /// immediately. The hub loop keeps the only sender, so pruning or
    /// unregistering closes the returned receiver.
    pub async fn register_client(&self) -> (u64, mpsc::Receiver<LatestData>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        if self
            .register_tx
            .send(ClientHandle { id, queue: tx })
            .await
            .is_err()
        {
            warn!(client = id, "hub loop gone, client never registered");
        }
        (id, rx)
    }

    pub async fn unregister_client(&self, id: u64) {
        if self.unregister_tx.send(id).await.is_err() {
            warn!(client = id, "hub loop gone, dropping unregister");
        }
    }

    /// Compute a filtered snapshot for a subscribe command and enqueue it on
    /// the client's queue through the hub loop, with the same drop-on-full
    /// policy as broadcasts.
    pub async fn subscribe(&self, client_id: u64, cmd: &SubscribeCommand) {
        let snapshot = self.filtered_snapshot(cmd);
        if self.reply_tx.send((client_id, snapshot)).await.is_err() {
            warn!(client = client_id, "hub loop gone, dropping subscribe reply");
        }
    }

    /// Merge a payload into the state without broadcasting (used for the
    /// bootstrap INITIAL payload).
    pub fn update_state(&self, payload: LatestData) {
        self.state.write().unwrap().merge(payload);
    }

    /// Queue a payload for merge-and-fan-out. Blocks only when the
    /// broadcast queue itself is full.
    pub async fn broadcast(&self, payload: LatestData) {
        if self.broadcast_tx.send(payload).await.is_err() {
            warn!("hub loop gone, dropping broadcast");
        }
    }

    /// Filtered snapshot for a subscribe command, computed under the read
    /// lock.
    ///
    /// Dashboard clients receive the full candle history the hub holds for
    /// the requested timeframe (broadcast updates carry only the newest
    /// candle per window; chart clients should treat this snapshot as the
    /// source of history and the updates as increments). Symbol-view
    /// clients receive only the requested symbols.
    pub fn filtered_snapshot(&self, cmd: &SubscribeCommand) -> LatestData {
        let state = self.state.read().unwrap();
        if cmd.client_type == "dashboard" {
            dashboard_snapshot(&state, &cmd.symbols, &cmd.timeframe)
        } else {
            symbol_view_snapshot(&state, &cmd.symbols, &cmd.timeframe)
        }
    }

    pub fn metrics(&self) -> ProcessingMetrics {
        self.state.read().unwrap().processing_metrics
    }

    pub fn latest_timestamp(&self) -> i64 {
        self.state.read().unwrap().timestamp
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn timeframes(&self) -> &[String] {
        &self.timeframes
    }
}

async fn run_hub(
    hub: Arc<Hub>,
    mut register_rx: mpsc::Receiver<ClientHandle>,
    mut unregister_rx: mpsc::Receiver<u64>,
    mut broadcast_rx: mpsc::Receiver<LatestData>,
    mut reply_rx: mpsc::Receiver<(u64, LatestData)>,
) {
    let mut clients: HashMap<u64, mpsc::Sender<LatestData>> = HashMap::new();

    loop {
        tokio::select! {
            handle = register_rx.recv() => {
                let Some(handle) = handle else { break };

                let snapshot = hub.state.read().unwrap().clone();
                let _ = handle.queue.try_send(snapshot);
                clients.insert(handle.id, handle.queue);
                hub.connections.store(clients.len(), Ordering::Relaxed);
                debug!(clients = clients.len(), "client registered");
            }

            id = unregister_rx.recv() => {
                let Some(id) = id else { break };

                clients.remove(&id);
                hub.connections.store(clients.len(), Ordering::Relaxed);
                debug!(clients = clients.len(), "client unregistered");
            }

            reply = reply_rx.recv() => {
                let Some((id, snapshot)) = reply else { break };

                // A client that cannot even take its own snapshot will be
                // pruned by the next broadcast anyway.
                if let Some(queue) = clients.get(&id) {
                    let _ = queue.try_send(snapshot);
                }
            }

            payload = broadcast_rx.recv() => {
                let Some(payload) = payload else { break };

                let merged = {
                    let mut state = hub.state.write().unwrap();
                    state.merge(payload);
                    state.clone()
                };

                clients.retain(|id, queue| match queue.try_send(merged.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(client = *id, "outbound queue full, pruning slow client");
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
                hub.connections.store(clients.len(), Ordering::Relaxed);
            }
        }
    }
}

/// Dashboard view: full raw map plus the requested symbols x timeframe
/// candle history; an empty timeframe yields empty aggregations.
fn dashboard_snapshot(state: &LatestData, symbols: &[String], timeframe: &str) -> LatestData {
    let mut filtered = AggregationsMap::new();

    if timeframe.is_empty() {
        return LatestData {
            kind: PayloadKind::Initial,
            raw_data: HashMap::new(),
            aggregations: filtered,
            timestamp: state.timestamp,
            processing_metrics: state.processing_metrics,
        };
    }

    if symbols.is_empty() {
        for (sym, windows) in &state.aggregations {
            if let Some(candles) = windows.get(timeframe) {
                filtered
                    .entry(sym.clone())
                    .or_default()
                    .insert(timeframe.to_string(), candles.clone());
            }
        }
    } else {
        for sym in symbols {
            if let Some(candles) = state.aggregations.get(sym).and_then(|w| w.get(timeframe)) {
                filtered
                    .entry(sym.clone())
                    .or_default()
                    .insert(timeframe.to_string(), candles.clone());
            }
        }
    }

    LatestData {
        kind: PayloadKind::Initial,
        raw_data: state.raw_data.clone(),
        aggregations: filtered,
        timestamp: state.timestamp,
        processing_metrics: state.processing_metrics,
    }
}

/// Symbol view: only the requested symbols' raw data and their
/// symbols x timeframe aggregations; an empty symbol list means all.
fn symbol_view_snapshot(state: &LatestData, symbols: &[String], timeframe: &str) -> LatestData {
    let raw_data = if symbols.is_empty() {
        state.raw_data.clone()
    } else {
        state
            .raw_data
            .iter()
            .filter(|(sym, _)| symbols.contains(sym))
            .map(|(sym, sample)| (sym.clone(), sample.clone()))
            .collect()
    };

    let mut filtered = AggregationsMap::new();
    let wanted: Vec<&String> = if symbols.is_empty() {
        state.aggregations.keys().collect()
    } else {
        symbols
            .iter()
            .filter(|s| state.aggregations.contains_key(*s))
            .collect()
    };

    for sym in wanted {
        let Some(windows) = state.aggregations.get(sym) else {
            continue;
        };
        if timeframe.is_empty() {
            filtered.insert(sym.clone(), windows.clone());
        } else if let Some(candles) = windows.get(timeframe) {
            filtered
                .entry(sym.clone())
                .or_default()
                .insert(timeframe.to_string(), candles.clone());
        }
    }

    LatestData {
        kind: PayloadKind::Initial,
        raw_data,
        aggregations: filtered,
        timestamp: state.timestamp,
        processing_metrics: state.processing_metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use observer_common::types::{Candle, Sample};
    use std::time::Duration;

    fn candle(symbol: &str, window: &str, start: i64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            window_name: window.to_string(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            avg_price: 1.25,
            price_percent_change: 0.0,
            volume_percent_change: 0.0,
            price_volume_correlation: 0.0,
            volume_anomaly_ratio: 1.0,
            start_time: start,
            end_time: start + 300,
            data_points: 4,
        }
    }

    fn update_payload(symbol: &str, ts: i64) -> LatestData {
        let mut payload = LatestData::empty();
        payload.kind = PayloadKind::Update;
        payload
            .raw_data
            .insert(symbol.to_string(), Sample::new(symbol, ts, 10.0, 1.0));
        payload
            .aggregations
            .entry(symbol.to_string())
            .or_default()
            .insert("5m".to_string(), vec![candle(symbol, "5m", ts)]);
        payload.timestamp = ts;
        payload
    }

    async fn settle() {
        // Let the hub loop drain its channels
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_register_receives_current_snapshot() {
        let hub = Hub::new(vec!["5m".to_string()]);
        hub.update_state(update_payload("AAPL", 100));

        let (_, mut rx) = hub.register_client().await;
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.raw_data["AAPL"].timestamp, 100);
    }

    #[tokio::test]
    async fn test_broadcast_merges_and_fans_out() {
        let hub = Hub::new(vec!["5m".to_string()]);
        let (_, mut rx) = hub.register_client().await;
        settle().await;
        let _ = rx.recv().await; // registration snapshot

        hub.broadcast(update_payload("AAPL", 100)).await;
        hub.broadcast(update_payload("MSFT", 200)).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.raw_data.len(), 1);

        // The second snapshot carries the merged state of both symbols
        let second = rx.recv().await.unwrap();
        assert_eq!(second.raw_data.len(), 2);
        assert_eq!(second.timestamp, 200);
        assert_eq!(hub.latest_timestamp(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_client_pruned_fast_client_keeps_order() {
        let hub = Hub::new(vec!["5m".to_string()]);

        // Client A never reads its queue
        let (_, mut a_rx) = hub.register_client().await;
        // Client B drains as fast as it can
        let (_, mut b_rx) = hub.register_client().await;
        settle().await;
        assert_eq!(hub.connection_count(), 2);

        let _ = b_rx.recv().await; // registration snapshot

        let drain = tokio::spawn(async move {
            let mut timestamps = Vec::new();
            while let Some(payload) = b_rx.recv().await {
                timestamps.push(payload.timestamp);
                if timestamps.len() == 257 {
                    break;
                }
            }
            timestamps
        });

        for i in 0..257 {
            hub.broadcast(update_payload("AAPL", i as i64 + 1)).await;
        }

        let timestamps = drain.await.unwrap();
        assert_eq!(timestamps.len(), 257);
        // In-order delivery, no gaps for the fast client
        let expected: Vec<i64> = (1..=257).collect();
        assert_eq!(timestamps, expected);

        settle().await;
        // The unread client overflowed its 256-slot queue and was pruned
        assert_eq!(hub.connection_count(), 1);

        // Pruning dropped the hub's sender, the only one alive: the queue
        // drains its buffered payloads and then closes.
        let mut buffered = 0;
        while a_rx.recv().await.is_some() {
            buffered += 1;
        }
        assert!(buffered <= CLIENT_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_unregister_removes_client_and_closes_queue() {
        let hub = Hub::new(vec![]);
        let (id, mut rx) = hub.register_client().await;
        settle().await;
        assert_eq!(hub.connection_count(), 1);

        hub.unregister_client(id).await;
        settle().await;
        assert_eq!(hub.connection_count(), 0);

        // Registration snapshot, then closure
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_reply_lands_on_client_queue() {
        let hub = Hub::new(vec!["5m".to_string()]);
        hub.update_state(update_payload("AAPL", 100));

        let (id, mut rx) = hub.register_client().await;
        settle().await;
        let _ = rx.recv().await; // registration snapshot

        hub.subscribe(
            id,
            &SubscribeCommand {
                command: "subscribe".to_string(),
                client_type: "symbolView".to_string(),
                symbols: vec!["AAPL".to_string()],
                timeframe: "5m".to_string(),
            },
        )
        .await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.kind, PayloadKind::Initial);
        assert_eq!(snapshot.raw_data["AAPL"].timestamp, 100);
        assert_eq!(snapshot.aggregations["AAPL"]["5m"].len(), 1);
    }

    #[test]
    fn test_dashboard_snapshot_empty_timeframe() {
        let mut state = LatestData::empty();
        state
            .raw_data
            .insert("AAPL".to_string(), Sample::new("AAPL", 1, 1.0, 1.0));
        state
            .aggregations
            .entry("AAPL".to_string())
            .or_default()
            .insert("5m".to_string(), vec![candle("AAPL", "5m", 0)]);

        let snapshot = dashboard_snapshot(&state, &[], "");
        assert!(snapshot.aggregations.is_empty());
        assert!(snapshot.raw_data.is_empty());
        assert_eq!(snapshot.kind, PayloadKind::Initial);
    }

    #[test]
    fn test_dashboard_snapshot_full_history_for_timeframe() {
        let mut state = LatestData::empty();
        state
            .raw_data
            .insert("AAPL".to_string(), Sample::new("AAPL", 1, 1.0, 1.0));
        let windows = state.aggregations.entry("AAPL".to_string()).or_default();
        windows.insert(
            "5m".to_string(),
            vec![candle("AAPL", "5m", 0), candle("AAPL", "5m", 300)],
        );
        windows.insert("1h".to_string(), vec![candle("AAPL", "1h", 0)]);

        let snapshot = dashboard_snapshot(&state, &[], "5m");
        assert_eq!(snapshot.aggregations["AAPL"]["5m"].len(), 2);
        assert!(!snapshot.aggregations["AAPL"].contains_key("1h"));
        // Dashboard always receives the full raw map
        assert_eq!(snapshot.raw_data.len(), 1);
    }

    #[test]
    fn test_symbol_view_filters_symbols() {
        let mut state = LatestData::empty();
        for sym in ["AAPL", "MSFT"] {
            state
                .raw_data
                .insert(sym.to_string(), Sample::new(sym, 1, 1.0, 1.0));
            state
                .aggregations
                .entry(sym.to_string())
                .or_default()
                .insert("5m".to_string(), vec![candle(sym, "5m", 0)]);
        }

        let snapshot = symbol_view_snapshot(&state, &["AAPL".to_string()], "5m");
        assert_eq!(snapshot.raw_data.len(), 1);
        assert!(snapshot.raw_data.contains_key("AAPL"));
        assert_eq!(snapshot.aggregations.len(), 1);

        // Empty symbol list means all
        let snapshot = symbol_view_snapshot(&state, &[], "");
        assert_eq!(snapshot.raw_data.len(), 2);
        assert_eq!(snapshot.aggregations.len(), 2);
    }
}
