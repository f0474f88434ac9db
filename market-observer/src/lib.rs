//! # Market Observer
//!
//! Continuously polls per-symbol price/volume samples from providers, keeps a
//! bounded in-memory history per symbol, computes multi-window OHLCV
//! aggregations with derived analytics, persists raw and aggregated data, and
//! broadcasts incremental updates to websocket subscribers.
//!
//! ## Pipeline
//!
//! Sources push deduplicated update batches onto a channel; the orchestrator
//! merges them into the memory manager, persists them, runs the realtime
//! aggregation per configured window against the full in-memory history, and
//! hands a single strongly-typed payload to the broadcast hub.

pub mod analysis;
pub mod calendar;
pub mod config;
pub mod memory;
pub mod network;
pub mod server;
pub mod service;
pub mod source;
pub mod storage;

pub use config::Settings;
pub use service::Orchestrator;
