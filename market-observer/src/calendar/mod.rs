//! Exchange calendars for polling gating.
//!
//! A symbol's suffix selects its exchange (ISO 10383 MIC); each calendar
//! carries the exchange timezone, regular session hours in local time, and an
//! embedded holiday table. Exchanges without holiday data degrade to the
//! plain weekday rule.

pub mod scheduler;

pub use scheduler::MarketScheduler;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

/// Full-day closures, (year, month, day) in exchange-local dates.
/// Major holidays for the covered exchanges; the weekday rule still applies
/// outside this table.
const XNYS_HOLIDAYS: &[(i32, u32, u32)] = &[
    (2025, 1, 1),
    (2025, 1, 20),
    (2025, 2, 17),
    (2025, 4, 18),
    (2025, 5, 26),
    (2025, 6, 19),
    (2025, 7, 4),
    (2025, 9, 1),
    (2025, 11, 27),
    (2025, 12, 25),
    (2026, 1, 1),
    (2026, 1, 19),
    (2026, 2, 16),
    (2026, 4, 3),
    (2026, 5, 25),
    (2026, 6, 19),
    (2026, 7, 3),
    (2026, 9, 7),
    (2026, 11, 26),
    (2026, 12, 25),
];

const XLON_HOLIDAYS: &[(i32, u32, u32)] = &[
    (2025, 1, 1),
    (2025, 4, 18),
    (2025, 4, 21),
    (2025, 5, 5),
    (2025, 5, 26),
    (2025, 8, 25),
    (2025, 12, 25),
    (2025, 12, 26),
    (2026, 1, 1),
    (2026, 4, 3),
    (2026, 4, 6),
    (2026, 5, 4),
    (2026, 5, 25),
    (2026, 8, 31),
    (2026, 12, 25),
    (2026, 12, 28),
];

const XPAR_HOLIDAYS: &[(i32, u32, u32)] = &[
    (2025, 1, 1),
    (2025, 4, 18),
    (2025, 4, 21),
    (2025, 5, 1),
    (2025, 12, 25),
    (2025, 12, 26),
    (2026, 1, 1),
    (2026, 4, 3),
    (2026, 4, 6),
    (2026, 5, 1),
    (2026, 12, 25),
];

const XTKS_HOLIDAYS: &[(i32, u32, u32)] = &[
    (2025, 1, 1),
    (2025, 1, 2),
    (2025, 1, 3),
    (2025, 1, 13),
    (2025, 2, 11),
    (2025, 2, 24),
    (2025, 4, 29),
    (2025, 5, 5),
    (2025, 5, 6),
    (2025, 7, 21),
    (2025, 9, 15),
    (2025, 9, 23),
    (2025, 10, 13),
    (2025, 11, 3),
    (2025, 11, 24),
    (2025, 12, 31),
    (2026, 1, 1),
    (2026, 1, 2),
    (2026, 1, 12),
    (2026, 2, 11),
    (2026, 2, 23),
    (2026, 4, 29),
    (2026, 5, 4),
    (2026, 5, 5),
    (2026, 5, 6),
];

const XHKG_HOLIDAYS: &[(i32, u32, u32)] = &[
    (2025, 1, 1),
    (2025, 1, 29),
    (2025, 1, 30),
    (2025, 1, 31),
    (2025, 4, 18),
    (2025, 4, 21),
    (2025, 5, 1),
    (2025, 7, 1),
    (2025, 10, 1),
    (2025, 12, 25),
    (2025, 12, 26),
    (2026, 1, 1),
    (2026, 2, 17),
    (2026, 2, 18),
    (2026, 2, 19),
    (2026, 4, 3),
    (2026, 4, 6),
    (2026, 5, 1),
    (2026, 7, 1),
    (2026, 10, 1),
    (2026, 12, 25),
];

/// Static description of one exchange's regular session.
struct MarketSpec {
    mic: &'static str,
    timezone: Tz,
    open: (u32, u32),
    close: (u32, u32),
    holidays: &'static [(i32, u32, u32)],
}

const XNYS: MarketSpec = MarketSpec {
    mic: "xnys",
    timezone: chrono_tz::America::New_York,
    open: (9, 30),
    close: (16, 0),
    holidays: XNYS_HOLIDAYS,
};

/// Suffix -> exchange session table. Exchanges sharing session parameters
/// reuse the closest spec; unknown suffixes fall back to NYSE.
fn spec_for_symbol(symbol: &str) -> &'static MarketSpec {
    const SPECS: &[(&str, MarketSpec)] = &[
        (
            ".L",
            MarketSpec {
                mic: "xlon",
                timezone: chrono_tz::Europe::London,
                open: (8, 0),
                close: (16, 30),
                holidays: XLON_HOLIDAYS,
            },
        ),
        (
            ".PA",
            MarketSpec {
                mic: "xpar",
                timezone: chrono_tz::Europe::Paris,
                open: (9, 0),
                close: (17, 30),
                holidays: XPAR_HOLIDAYS,
            },
        ),
        (
            ".DE",
            MarketSpec {
                mic: "xfra",
                timezone: chrono_tz::Europe::Berlin,
                open: (9, 0),
                close: (17, 30),
                holidays: &[],
            },
        ),
        (
            ".AS",
            MarketSpec {
                mic: "xams",
                timezone: chrono_tz::Europe::Amsterdam,
                open: (9, 0),
                close: (17, 30),
                holidays: XPAR_HOLIDAYS,
            },
        ),
        (
            ".MI",
            MarketSpec {
                mic: "xmil",
                timezone: chrono_tz::Europe::Rome,
                open: (9, 0),
                close: (17, 30),
                holidays: &[],
            },
        ),
        (
            ".MC",
            MarketSpec {
                mic: "xmad",
                timezone: chrono_tz::Europe::Madrid,
                open: (9, 0),
                close: (17, 30),
                holidays: &[],
            },
        ),
        (
            ".ST",
            MarketSpec {
                mic: "xsto",
                timezone: chrono_tz::Europe::Stockholm,
                open: (9, 0),
                close: (17, 30),
                holidays: &[],
            },
        ),
        (
            ".SW",
            MarketSpec {
                mic: "xswx",
                timezone: chrono_tz::Europe::Zurich,
                open: (9, 0),
                close: (17, 30),
                holidays: &[],
            },
        ),
        (
            ".TO",
            MarketSpec {
                mic: "xtse",
                timezone: chrono_tz::America::Toronto,
                open: (9, 30),
                close: (16, 0),
                holidays: &[],
            },
        ),
        (
            ".HK",
            MarketSpec {
                mic: "xhkg",
                timezone: chrono_tz::Asia::Hong_Kong,
                open: (9, 30),
                close: (16, 0),
                holidays: XHKG_HOLIDAYS,
            },
        ),
        (
            ".AX",
            MarketSpec {
                mic: "xasx",
                timezone: chrono_tz::Australia::Sydney,
                open: (10, 0),
                close: (16, 0),
                holidays: &[],
            },
        ),
        (
            ".KS",
            MarketSpec {
                mic: "xkrx",
                timezone: chrono_tz::Asia::Seoul,
                open: (9, 0),
                close: (15, 30),
                holidays: &[],
            },
        ),
        (
            ".SS",
            MarketSpec {
                mic: "xshg",
                timezone: chrono_tz::Asia::Shanghai,
                open: (9, 30),
                close: (15, 0),
                holidays: &[],
            },
        ),
        (
            ".SZ",
            MarketSpec {
                mic: "xshe",
                timezone: chrono_tz::Asia::Shanghai,
                open: (9, 30),
                close: (15, 0),
                holidays: &[],
            },
        ),
        (
            ".T",
            MarketSpec {
                mic: "xtks",
                timezone: chrono_tz::Asia::Tokyo,
                open: (9, 0),
                close: (15, 0),
                holidays: XTKS_HOLIDAYS,
            },
        ),
    ];

    // ".T" must not shadow ".TO": match the longest suffix first.
    let mut best: Option<&'static MarketSpec> = None;
    let mut best_len = 0;
    for (suffix, spec) in SPECS {
        if symbol.ends_with(suffix) && suffix.len() > best_len {
            best = Some(spec);
            best_len = suffix.len();
        }
    }
    best.unwrap_or(&XNYS)
}

/// Business-day/hour schedule for one exchange.
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    mic: &'static str,
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
    holidays: &'static [(i32, u32, u32)],
}

impl TradingCalendar {
    pub fn for_symbol(symbol: &str) -> Self {
        let spec = spec_for_symbol(symbol);
        Self {
            mic: spec.mic,
            timezone: spec.timezone,
            open: NaiveTime::from_hms_opt(spec.open.0, spec.open.1, 0)
                .unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(spec.close.0, spec.close.1, 0)
                .unwrap_or(NaiveTime::MIN),
            holidays: spec.holidays,
        }
    }

    pub fn mic(&self) -> &'static str {
        self.mic
    }

    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays
            .iter()
            .any(|&(y, m, d)| date.year() == y && date.month() == m && date.day() == d)
    }

    pub fn is_trading_day(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        let weekday = local.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            return false;
        }
        !self.is_holiday(local.date_naive())
    }

    /// Whether the regular session is open at the given instant.
    pub fn is_open_at(&self, at: DateTime<Utc>) -> bool {
        if !self.is_trading_day(at) {
            return false;
        }
        let time = at.with_timezone(&self.timezone).time();
        time >= self.open && time < self.close
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
    fn test_suffix_mapping() {
        assert_eq!(TradingCalendar::for_symbol("AAPL").mic(), "xnys");
        assert_eq!(TradingCalendar::for_symbol("VOD.L").mic(), "xlon");
        assert_eq!(TradingCalendar::for_symbol("AIR.PA").mic(), "xpar");
        assert_eq!(TradingCalendar::for_symbol("7203.T").mic(), "xtks");
        assert_eq!(TradingCalendar::for_symbol("0700.HK").mic(), "xhkg");
        // Longest suffix wins: ".TO" is Toronto, not Tokyo
        assert_eq!(TradingCalendar::for_symbol("SHOP.TO").mic(), "xtse");
        // Unknown suffix falls back to NYSE
        assert_eq!(TradingCalendar::for_symbol("FOO.XX").mic(), "xnys");
    }

    #[test]
    fn test_nyse_open_during_session() {
        let cal = TradingCalendar::for_symbol("AAPL");
        // Wednesday 2025-06-04 15:00 UTC = 11:00 New York (EDT)
        assert!(cal.is_open_at(utc(2025, 6, 4, 15, 0)));
        // 13:00 UTC = 09:00 New York, before the bell
        assert!(!cal.is_open_at(utc(2025, 6, 4, 13, 0)));
        // 20:30 UTC = 16:30 New York, after close
        assert!(!cal.is_open_at(utc(2025, 6, 4, 20, 30)));
    }

    #[test]
    fn test_weekend_closed() {
        let cal = TradingCalendar::for_symbol("AAPL");
        // Saturday 2025-06-07
        assert!(!cal.is_open_at(utc(2025, 6, 7, 15, 0)));
        assert!(!cal.is_trading_day(utc(2025, 6, 7, 15, 0)));
    }

    #[test]
    fn test_holiday_closed() {
        let cal = TradingCalendar::for_symbol("AAPL");
        // Independence Day 2025 falls on a Friday
        assert!(!cal.is_open_at(utc(2025, 7, 4, 15, 0)));
        assert!(!cal.is_trading_day(utc(2025, 7, 4, 15, 0)));
    }

    #[test]
    fn test_tokyo_session_in_local_time() {
        let cal = TradingCalendar::for_symbol("7203.T");
        // 01:00 UTC Wednesday = 10:00 Tokyo
        assert!(cal.is_open_at(utc(2025, 6, 4, 1, 0)));
        // 10:00 UTC = 19:00 Tokyo, closed
        assert!(!cal.is_open_at(utc(2025, 6, 4, 10, 0)));
    }

    #[test]
    fn test_boundary_minutes() {
        let cal = TradingCalendar::for_symbol("AAPL");
        // Open is inclusive, close is exclusive (local 09:30 / 16:00 EDT)
        assert!(cal.is_open_at(utc(2025, 6, 4, 13, 30)));
        assert!(!cal.is_open_at(utc(2025, 6, 4, 20, 0)));
    }
}
