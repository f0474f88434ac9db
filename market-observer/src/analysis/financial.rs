//! OHLCV and derived-ratio primitives.

/// Fold of one bucket's prices and volumes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Ohlcv {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub avg_price: f64,
}

/// OHLCV over a bucket: open/close from the first/last element, high/low the
/// extremes, volume the sum, avg_price the arithmetic mean.
pub fn ohlcv(prices: &[f64], volumes: &[f64]) -> Ohlcv {
    if prices.is_empty() {
        return Ohlcv::default();
    }

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut total_volume = 0.0;
    let mut sum_price = 0.0;

    for (i, &p) in prices.iter().enumerate() {
        if p > high {
            high = p;
        }
        if p < low {
            low = p;
        }
        sum_price += p;
        total_volume += volumes.get(i).copied().unwrap_or(0.0);
    }

    Ohlcv {
        open: prices[0],
        high,
        low,
        close: prices[prices.len() - 1],
        volume: total_volume,
        avg_price: sum_price / prices.len() as f64,
    }
}

/// `(current - previous) / previous`; 0 when `previous` is 0.
pub fn change_percent(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        return 0.0;
    }
    (current - previous) / previous
}

/// Volume anomaly against the historical average bucket volume.
///
/// With a non-positive baseline the ratio degrades to 1.0 for a zero
/// current volume and to the raw current volume otherwise.
pub fn anomaly_ratio(current_volume: f64, avg_volume: f64) -> f64 {
    if avg_volume <= 0.0 {
        if current_volume == 0.0 {
            return 1.0;
        }
        return current_volume;
    }
    current_volume / avg_volume
}
