//! Quote Store (component A, spec.md §4.1).
//!
//! Sharded in-memory map of per-symbol `{bid, ask, ts_ms}`, written only
//! by the market listener and read everywhere else. Grounded in the
//! teacher's sharded-map pattern in `data/mod.rs`; `dashmap` gives the
//! "reads never block writes" guarantee without hand-rolled sharding.

use crate::core::Quote;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A quote that is known but whose timestamp is older than the
/// configured staleness window (spec.md §4.1 `get`).
#[derive(Debug, Clone, Copy)]
pub enum QuoteLookup {
    Fresh(Quote),
    Stale(Quote),
    Unknown,
}

impl QuoteLookup {
    pub fn fresh(self) -> Option<Quote> {
        match self {
            QuoteLookup::Fresh(q) => Some(q),
            _ => None,
        }
    }
}

pub struct QuoteStore {
    quotes: DashMap<String, Quote>,
    staleness_ms: AtomicI64,
}

impl QuoteStore {
    pub fn new(staleness_ms: i64) -> Self {
        Self {
            quotes: DashMap::new(),
            staleness_ms: AtomicI64::new(staleness_ms),
        }
    }

    pub fn set_staleness_ms(&self, ms: i64) {
        self.staleness_ms.store(ms, Ordering::Relaxed);
    }

    /// `put_partial` — merges into existing record, preserving the
    /// untouched side (spec.md §4.1, P6/R2).
    pub fn put_partial(&self, symbol: &str, bid: Option<Decimal>, ask: Option<Decimal>, ts_ms: i64) {
        let symbol = symbol.to_uppercase();
        self.quotes
            .entry(symbol)
            .and_modify(|q| q.merge_partial(bid, ask, ts_ms))
            .or_insert_with(|| {
                let mut q = Quote::empty(ts_ms);
                q.merge_partial(bid, ask, ts_ms);
                q
            });
    }

    /// `get` — returns the quote plainly (staleness not evaluated); use
    /// [`QuoteStore::get_checked`] when staleness must be enforced.
    pub fn get(&self, symbol: &str) -> Option<Quote> {
        self.quotes.get(&symbol.to_uppercase()).map(|q| *q)
    }

    /// `get` with the staleness policy applied (spec.md §4.1: "stale"
    /// after `now - ts > staleness`, default 5s).
    pub fn get_checked(&self, symbol: &str, now_ms: i64) -> QuoteLookup {
        match self.quotes.get(&symbol.to_uppercase()) {
            None => QuoteLookup::Unknown,
            Some(q) => {
                let staleness = self.staleness_ms.load(Ordering::Relaxed);
                if now_ms - q.ts_ms > staleness {
                    QuoteLookup::Stale(*q)
                } else {
                    QuoteLookup::Fresh(*q)
                }
            }
        }
    }

    /// `mget` — batched; stale entries suppressed individually.
    pub fn mget(&self, symbols: &[&str], now_ms: i64) -> Vec<(String, Option<Quote>)> {
        symbols
            .iter()
            .map(|s| {
                let fresh = self.get_checked(s, now_ms).fresh();
                (s.to_uppercase(), fresh)
            })
            .collect()
    }

    /// `scan_all` — enumerate known symbols.
    pub fn scan_all(&self) -> Vec<String> {
        self.quotes.iter().map(|kv| kv.key().clone()).collect()
    }

    pub fn known_symbol_count(&self) -> usize {
        self.quotes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stale_after_window_r2() {
        let store = QuoteStore::new(5_000);
        store.put_partial("EURUSD", Some(dec!(1.1000)), Some(dec!(1.1002)), 1_000);
        match store.get_checked("EURUSD", 1_000 + 5_001) {
            QuoteLookup::Stale(_) => {}
            other => panic!("expected stale, got {:?}", other),
        }
    }

    #[test]
    fn partial_update_preserves_untouched_side() {
        let store = QuoteStore::new(5_000);
        store.put_partial("EURUSD", Some(dec!(1.1000)), Some(dec!(1.1002)), 1_000);
        store.put_partial("EURUSD", None, Some(dec!(1.1003)), 1_500);
        let q = store.get("EURUSD").unwrap();
        assert_eq!(q.bid, Some(dec!(1.1000)));
        assert_eq!(q.ask, Some(dec!(1.1003)));
        assert_eq!(q.ts_ms, 1_500);
    }

    #[test]
    fn mget_suppresses_stale_individually() {
        let store = QuoteStore::new(1_000);
        store.put_partial("EURUSD", Some(dec!(1.1)), Some(dec!(1.1002)), 0);
        store.put_partial("GBPUSD", Some(dec!(1.25)), Some(dec!(1.2502)), 5_000);
        let results = store.mget(&["EURUSD", "GBPUSD"], 5_000);
        assert!(results[0].1.is_none());
        assert!(results[1].1.is_some());
    }

    #[test]
    fn unknown_symbol_returns_unknown() {
        let store = QuoteStore::new(5_000);
        matches!(store.get_checked("XAUUSD", 0), QuoteLookup::Unknown);
    }
}
