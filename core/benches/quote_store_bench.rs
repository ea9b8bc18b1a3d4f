//! Quote Store Benchmarks
//!
//! Measures the cost of the hot path the market listener and every
//! reader (margin engine, portfolio calculator, trigger/pending monitors)
//! share: partial quote writes and staleness-checked reads (component A,
//! spec.md §4.1).
//!
//! ## Operations Tested
//!
//! 1. **put_partial** - single-side and both-side updates.
//! 2. **get_checked** - fresh vs. stale lookups.
//! 3. **mget** - batched lookups across a realistic symbol set.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use oms_core::quote_store::QuoteStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const SYMBOLS: &[&str] = &[
    "EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "USDCHF", "USDCAD", "NZDUSD", "XAUUSD",
];

fn seeded_store() -> QuoteStore {
    let store = QuoteStore::new(5_000);
    for (i, symbol) in SYMBOLS.iter().enumerate() {
        store.put_partial(
            symbol,
            Some(dec!(1.1) + dec!(0.0001) * Decimal::from(i as i64)),
            Some(dec!(1.1002)),
            0,
        );
    }
    store
}

fn bench_put_partial(c: &mut Criterion) {
    let store = QuoteStore::new(5_000);
    c.bench_function("quote_store/put_partial_both_sides", |b| {
        b.iter(|| store.put_partial(black_box("EURUSD"), Some(dec!(1.1000)), Some(dec!(1.1002)), 1))
    });

    store.put_partial("EURUSD", Some(dec!(1.1000)), Some(dec!(1.1002)), 0);
    c.bench_function("quote_store/put_partial_one_side", |b| {
        b.iter(|| store.put_partial(black_box("EURUSD"), None, Some(dec!(1.1003)), 2))
    });
}

fn bench_get_checked(c: &mut Criterion) {
    let store = seeded_store();
    c.bench_function("quote_store/get_checked_fresh", |b| {
        b.iter(|| store.get_checked(black_box("EURUSD"), 0))
    });
    c.bench_function("quote_store/get_checked_stale", |b| {
        b.iter(|| store.get_checked(black_box("EURUSD"), 10_000))
    });
}

fn bench_mget(c: &mut Criterion) {
    let store = seeded_store();
    c.bench_function("quote_store/mget_8_symbols", |b| {
        b.iter(|| store.mget(black_box(SYMBOLS), 0))
    });
}

criterion_group!(benches, bench_put_partial, bench_get_checked, bench_mget);
criterion_main!(benches);
