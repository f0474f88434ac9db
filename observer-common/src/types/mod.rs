//! Market-data types shared across the pipeline and the wire.
//!
//! Field names mirror the JSON contract consumed by the dashboard clients
//! (`price_percent_change`, `clientType`, ...), so these structs serialize
//! without any mapping layer in between.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A raw per-symbol observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub symbol: String,
    /// Epoch seconds
    pub timestamp: i64,
    pub price: f64,
    pub volume: f64,
    #[serde(default)]
    pub price_percent_change: f64,
    #[serde(default)]
    pub volume_percent_change: f64,
    /// Epoch seconds of the fetch that produced this sample
    #[serde(default)]
    pub fetched_at: i64,
}

impl Sample {
    pub fn new(symbol: impl Into<String>, timestamp: i64, price: f64, volume: f64) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price,
            volume,
            price_percent_change: 0.0,
            volume_percent_change: 0.0,
            fetched_at: Utc::now().timestamp(),
        }
    }
}

/// An aggregated candle for one symbol in one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// Window label, e.g. "5m", "1h"
    pub window_name: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub avg_price: f64,
    pub price_percent_change: f64,
    pub volume_percent_change: f64,
    pub price_volume_correlation: f64,
    pub volume_anomaly_ratio: f64,
    /// Aligned bucket start, epoch seconds
    pub start_time: i64,
    /// `start_time + window_seconds`
    pub end_time: i64,
    pub data_points: usize,
}

/// Historical volume baseline for one symbol in one window. Computed once
/// from the initial backfill and used as the anomaly-ratio denominator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateStats {
    pub symbol: String,
    pub window_name: String,
    pub avg_volume_history: f64,
    pub std_volume_history: f64,
    pub data_points_history: usize,
    pub last_history_timestamp: i64,
}

/// Performance counters for one processing tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub aggregation_time_seconds: f64,
    pub valid_symbols: usize,
    pub windows_processed: usize,
}

/// Payload type discriminator on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    #[serde(rename = "INITIAL")]
    Initial,
    #[serde(rename = "UPDATE")]
    Update,
}

/// `symbol -> window -> candles`
pub type AggregationsMap = HashMap<String, HashMap<String, Vec<Candle>>>;

/// `symbol -> samples`, the unit flowing on the updates channel.
pub type UpdateMap = HashMap<String, Vec<Sample>>;

/// The hub's merged state and the broadcast payload. One type end to end so
/// the conversion cost sits at the orchestrator edge, not inside the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestData {
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub raw_data: HashMap<String, Sample>,
    pub aggregations: AggregationsMap,
    pub timestamp: i64,
    pub processing_metrics: ProcessingMetrics,
}

impl LatestData {
    pub fn empty() -> Self {
        Self {
            kind: PayloadKind::Initial,
            raw_data: HashMap::new(),
            aggregations: AggregationsMap::new(),
            timestamp: 0,
            processing_metrics: ProcessingMetrics::default(),
        }
    }

    /// Deep-merge another payload into this state: raw samples replaced per
    /// symbol, candle lists overwritten per `(symbol, window)`, metadata
    /// taken from the incoming payload.
    pub fn merge(&mut self, other: LatestData) {
        for (sym, sample) in other.raw_data {
            self.raw_data.insert(sym, sample);
        }
        for (sym, windows) in other.aggregations {
            let entry = self.aggregations.entry(sym).or_default();
            for (window, candles) in windows {
                entry.insert(window, candles);
            }
        }
        self.timestamp = other.timestamp;
        self.processing_metrics = other.processing_metrics;
        self.kind = PayloadKind::Update;
    }
}

/// Client subscribe command. `clientType` is camelCase on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeCommand {
    pub command: String,
    #[serde(rename = "clientType", default)]
    pub client_type: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub timeframe: String,
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_merge_replaces_per_symbol_and_window() {
        let mut state = LatestData::empty();
        state
            .raw_data
            .insert("AAPL".to_string(), Sample::new("AAPL", 100, 10.0, 1.0));
        state
            .aggregations
            .entry("AAPL".to_string())
            .or_default()
            .insert("5m".to_string(), vec![candle("AAPL", "5m", 0)]);

        let mut incoming = LatestData::empty();
        incoming.kind = PayloadKind::Update;
        incoming
            .raw_data
            .insert("AAPL".to_string(), Sample::new("AAPL", 400, 11.0, 2.0));
        incoming
            .aggregations
            .entry("AAPL".to_string())
            .or_default()
            .insert("5m".to_string(), vec![candle("AAPL", "5m", 300)]);
        incoming.timestamp = 42;

        state.merge(incoming);

        assert_eq!(state.kind, PayloadKind::Update);
        assert_eq!(state.raw_data["AAPL"].timestamp, 400);
        assert_eq!(state.aggregations["AAPL"]["5m"][0].start_time, 300);
        assert_eq!(state.timestamp, 42);
    }

    #[test]
    fn test_merge_keeps_untouched_windows() {
        let mut state = LatestData::empty();
        let aapl = state.aggregations.entry("AAPL".to_string()).or_default();
        aapl.insert("5m".to_string(), vec![candle("AAPL", "5m", 0)]);
        aapl.insert("1h".to_string(), vec![candle("AAPL", "1h", 0)]);

        let mut incoming = LatestData::empty();
        incoming
            .aggregations
            .entry("AAPL".to_string())
            .or_default()
            .insert("5m".to_string(), vec![candle("AAPL", "5m", 600)]);

        state.merge(incoming);

        assert_eq!(state.aggregations["AAPL"]["5m"][0].start_time, 600);
        assert_eq!(state.aggregations["AAPL"]["1h"][0].start_time, 0);
    }

    #[test]
    fn test_payload_kind_wire_format() {
        let json = serde_json::to_string(&PayloadKind::Initial).unwrap();
        assert_eq!(json, "\"INITIAL\"");

        let mut state = LatestData::empty();
        state.kind = PayloadKind::Update;
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"type\":\"UPDATE\""));
    }

    #[test]
    fn test_subscribe_command_wire_names() {
        let cmd: SubscribeCommand = serde_json::from_str(
            r#"{"command":"subscribe","clientType":"dashboard","symbols":["AAPL"],"timeframe":"5m"}"#,
        )
        .unwrap();
        assert_eq!(cmd.client_type, "dashboard");
        assert_eq!(cmd.symbols, vec!["AAPL".to_string()]);

        // Missing optionals default
        let cmd: SubscribeCommand =
            serde_json::from_str(r#"{"command":"subscribe"}"#).unwrap();
        assert!(cmd.client_type.is_empty());
        assert!(cmd.symbols.is_empty());
        assert!(cmd.timeframe.is_empty());
    }

    #[test]
    fn test_sample_wire_names() {
        let s = Sample::new("TSLA", 1700000000, 250.0, 1000.0);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("price_percent_change"));
        assert!(json.contains("volume_percent_change"));
    }
}
