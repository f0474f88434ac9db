//! Per-symbol ring buffers with a global memory ceiling.
//!
//! Safe for concurrent readers and a single orchestrator writer. Every 100th
//! element of a buffer triggers a process-memory sample; above the ceiling
//! every buffer's capacity is halved (floor 50) to shed history.

use std::collections::HashMap;
use std::sync::RwLock;

use sysinfo::{Pid, System};
use tracing::{info, warn};

use observer_common::types::Sample;

use super::ring_buffer::{RingBuffer, NUM_FEATURES};

/// Approximate samples per trading day at 5-minute granularity
/// (6.5 market hours, rounded up).
const POINTS_PER_DAY: usize = 400;

/// Buffers at or below this capacity are never shrunk further.
const SHRINK_FLOOR: usize = 50;

/// Ring capacity needed to hold `days` of history.
pub fn points_for_retention(days: i64) -> usize {
    (days.max(1) as usize) * POINTS_PER_DAY
}

/// Recommended memory ceiling: 75% of total RAM, at least 512 MB
/// (or everything on very small systems).
pub fn recommended_memory_limit_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();

    let total_mb = sys.total_memory() / (1024 * 1024);
    if total_mb == 0 {
        warn!("could not determine system memory, defaulting to 512MB");
        return 512;
    }

    let limit = (total_mb as f64 * 0.75) as u64;
    if limit < 512 {
        return total_mb.min(512);
    }
    limit
}

pub struct MemoryManager {
    streams: RwLock<HashMap<String, RingBuffer>>,
    max_memory_mb: u64,
    max_data_points: usize,
}

impl MemoryManager {
    pub fn new(max_memory_mb: u64, max_data_points: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            max_memory_mb,
            max_data_points,
        }
    }

    /// Append one sample to the symbol's buffer, creating it on first use.
    pub fn add_sample(&self, symbol: &str, sample: &Sample) {
        let should_check = {
            let mut streams = self.streams.write().unwrap();
            let buffer = streams
                .entry(symbol.to_string())
                .or_insert_with(|| RingBuffer::new(self.max_data_points));
            buffer.append(sample);
            buffer.len() % 100 == 0
        };

        if should_check {
            self.enforce_memory_limit();
        }
    }

    /// Full history for one symbol, oldest to newest. `None` when unknown
    /// or empty.
    pub fn get_history(&self, symbol: &str) -> Option<Vec<Sample>> {
        let streams = self.streams.read().unwrap();
        let buffer = streams.get(symbol)?;
        if buffer.is_empty() {
            return None;
        }

        let mut samples = buffer.all();
        for s in &mut samples {
            s.symbol = symbol.to_string();
        }
        Some(samples)
    }

    /// Newest sample for one symbol.
    pub fn get_latest(&self, symbol: &str) -> Option<Sample> {
        let streams = self.streams.read().unwrap();
        let buffer = streams.get(symbol)?;
        let mut latest = buffer.latest(1).pop()?;
        latest.symbol = symbol.to_string();
        Some(latest)
    }

    /// Full history for every symbol.
    pub fn all_history(&self) -> HashMap<String, Vec<Sample>> {
        let streams = self.streams.read().unwrap();
        streams
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(symbol, buffer)| {
                let mut samples = buffer.all();
                for s in &mut samples {
                    s.symbol = symbol.clone();
                }
                (symbol.clone(), samples)
            })
            .collect()
    }

    /// Newest sample per symbol.
    pub fn latest_snapshot(&self) -> HashMap<String, Sample> {
        let streams = self.streams.read().unwrap();
        streams
            .iter()
            .filter_map(|(symbol, buffer)| {
                let mut latest = buffer.latest(1).pop()?;
                latest.symbol = symbol.clone();
                Some((symbol.clone(), latest))
            })
            .collect()
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.streams.read().unwrap().contains_key(symbol)
    }

    pub fn symbol_count(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    pub fn buffer_capacity(&self, symbol: &str) -> Option<usize> {
        self.streams.read().unwrap().get(symbol).map(|b| b.capacity())
    }

    pub fn clear(&self) {
        self.streams.write().unwrap().clear();
    }

    /// Sample process memory; above the ceiling halve every buffer's
    /// capacity, dropping the oldest rows.
    fn enforce_memory_limit(&self) {
        let used_mb = match process_memory_mb() {
            Some(mb) => mb,
            None => self.estimated_memory_mb(),
        };

        if used_mb <= self.max_memory_mb as f64 {
            return;
        }

        info!(
            used_mb = used_mb as u64,
            limit_mb = self.max_memory_mb,
            "memory usage exceeds limit, halving buffer capacities"
        );

        let mut streams = self.streams.write().unwrap();
        for buffer in streams.values_mut() {
            if buffer.capacity() > 100 {
                let new_capacity = (buffer.capacity() / 2).max(SHRINK_FLOOR);
                buffer.resize(new_capacity);
            }
        }
    }

    /// Worst-case footprint of the buffers themselves, used when the
    /// platform refuses to report process memory.
    fn estimated_memory_mb(&self) -> f64 {
        let streams = self.streams.read().unwrap();
        let rows: usize = streams.values().map(|b| b.capacity()).sum();
        (rows * NUM_FEATURES * std::mem::size_of::<f64>()) as f64 / (1024.0 * 1024.0)
    }
}

/// Resident set size of this process in MB.
fn process_memory_mb() -> Option<f64> {
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return None;
    }
    sys.process(pid)
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
}
