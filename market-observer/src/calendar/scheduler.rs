//! Aggregates the calendars of the current symbol set and answers the one
//! question the polling loop asks: is any tracked market open right now?

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::TradingCalendar;

pub struct MarketScheduler {
    calendars: RwLock<HashMap<String, TradingCalendar>>,
}

impl MarketScheduler {
    pub fn new(symbols: &[String]) -> Self {
        let scheduler = Self {
            calendars: RwLock::new(HashMap::new()),
        };
        scheduler.update_symbols(symbols);
        scheduler
    }

    /// Rebuild the calendar set atomically for a new symbol list.
    pub fn update_symbols(&self, symbols: &[String]) {
        let mapped: HashMap<String, TradingCalendar> = symbols
            .iter()
            .map(|s| (s.clone(), TradingCalendar::for_symbol(s)))
            .collect();

        let markets: HashSet<&str> = mapped.values().map(|c| c.mic()).collect();
        debug!(
            symbols = mapped.len(),
            markets = markets.len(),
            "mapped symbols to calendars"
        );

        *self.calendars.write().unwrap() = mapped;
    }

    pub fn any_market_open(&self) -> bool {
        self.any_market_open_at(Utc::now())
    }

    /// Time-injectable variant; false when no symbols are tracked.
    pub fn any_market_open_at(&self, at: DateTime<Utc>) -> bool {
        let calendars = self.calendars.read().unwrap();

        let mut seen: HashSet<&str> = HashSet::new();
        for cal in calendars.values() {
            if seen.insert(cal.mic()) && cal.is_open_at(at) {
                return true;
            }
        }
        false
    }

    pub fn symbol_count(&self) -> usize {
        self.calendars.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_empty_symbol_set_is_closed() {
        let scheduler = MarketScheduler::new(&[]);
        assert!(!scheduler.any_market_open_at(utc(2025, 6, 4, 15, 0)));
    }

    #[test]
    fn test_any_open_across_markets() {
        let scheduler = MarketScheduler::new(&[
            "AAPL".to_string(),   // New York
            "7203.T".to_string(), // Tokyo
        ]);

        // 01:00 UTC Wednesday: Tokyo open, New York closed
        assert!(scheduler.any_market_open_at(utc(2025, 6, 4, 1, 0)));
        // 15:00 UTC Wednesday: New York open
        assert!(scheduler.any_market_open_at(utc(2025, 6, 4, 15, 0)));
        // Sunday: everything closed
        assert!(!scheduler.any_market_open_at(utc(2025, 6, 8, 15, 0)));
    }

    #[test]
    fn test_update_symbols_replaces_set() {
        let scheduler = MarketScheduler::new(&["AAPL".to_string()]);
        // 01:00 UTC: New York closed
        assert!(!scheduler.any_market_open_at(utc(2025, 6, 4, 1, 0)));

        scheduler.update_symbols(&["7203.T".to_string()]);
        assert_eq!(scheduler.symbol_count(), 1);
        // Tokyo is open at 01:00 UTC
        assert!(scheduler.any_market_open_at(utc(2025, 6, 4, 1, 0)));
    }
}
