//! Margin Engine Benchmarks
//!
//! Measures the cost of the per-order and per-user margin math (component
//! E, spec.md §4.5) under the access patterns the portfolio calculator and
//! execution engine hit on every tick / placement.
//!
//! ## Operations Tested
//!
//! 1. **Single-order margin** - `single_order_margin_usd` for a
//!    USD-denominated and a cross-currency instrument.
//! 2. **Hedged user totals** - `user_total_margin` over a small and a
//!    larger multi-symbol open-order book.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use oms_core::core::{ExecutionStatus, InstrumentType, Order, OrderState, Side, UserType};
use oms_core::margin::{single_order_margin_usd, user_total_margin};
use oms_core::quote_store::QuoteStore;
use rust_decimal_macros::dec;

fn quotes_fixture() -> QuoteStore {
    let store = QuoteStore::new(5_000);
    store.put_partial("EURUSD", Some(dec!(1.10000)), Some(dec!(1.10002)), 0);
    store.put_partial("GBPUSD", Some(dec!(1.25000)), Some(dec!(1.25020)), 0);
    store
}

fn sample_order(symbol: &str, side: Side) -> Order {
    Order {
        order_id: format!("{symbol}-{side:?}"),
        user_id: "42".into(),
        user_type: UserType::Live,
        symbol: symbol.into(),
        side,
        order_quantity: dec!(0.1),
        order_price: dec!(1.1),
        status: OrderState::Open,
        execution_status: ExecutionStatus::Executed,
        raw_price: None,
        half_spread: dec!(0.00001),
        contract_value: dec!(11000),
        margin: Some(dec!(110)),
        reserved_margin: None,
        commission_entry: dec!(0),
        commission_exit: dec!(0),
        swap: dec!(0),
        profit_usd: None,
        net_profit: None,
        close_price: None,
        stop_loss: None,
        take_profit: None,
        close_id: None,
        cancel_id: None,
        modify_id: None,
        stoploss_id: None,
        takeprofit_id: None,
        stoploss_cancel_id: None,
        takeprofit_cancel_id: None,
        group: "Standard".into(),
        profit_currency: "USD".into(),
        contract_size: dec!(100000),
        instrument_type: InstrumentType::Fx,
        crypto_margin_factor: None,
        commission_rate: dec!(0),
        commission_value_type: "money".into(),
        group_margin: Some(dec!(1.0)),
        leverage: dec!(100),
        pending_local: false,
    }
}

fn bench_single_order_margin(c: &mut Criterion) {
    let quotes = quotes_fixture();
    c.bench_function("single_order_margin_usd/usd_denominated", |b| {
        b.iter(|| {
            single_order_margin_usd(
                black_box(dec!(100000)),
                black_box(dec!(0.1)),
                black_box(dec!(1.10003)),
                black_box("USD"),
                black_box(dec!(100)),
                InstrumentType::Fx,
                None,
                &quotes,
                true,
            )
            .unwrap()
        })
    });

    c.bench_function("single_order_margin_usd/cross_currency_conversion", |b| {
        b.iter(|| {
            single_order_margin_usd(
                black_box(dec!(100000)),
                black_box(dec!(0.1)),
                black_box(dec!(1.25010)),
                black_box("GBP"),
                black_box(dec!(100)),
                InstrumentType::Fx,
                None,
                &quotes,
                true,
            )
            .unwrap()
        })
    });
}

fn bench_user_total_margin(c: &mut Criterion) {
    let quotes = quotes_fixture();
    let mut group = c.benchmark_group("user_total_margin");

    for &n in &[2usize, 10, 50] {
        let orders: Vec<Order> = (0..n)
            .map(|i| {
                let symbol = if i % 2 == 0 { "EURUSD" } else { "GBPUSD" };
                let side = if i % 3 == 0 { Side::Sell } else { Side::Buy };
                sample_order(symbol, side)
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(n), &orders, |b, orders| {
            b.iter(|| user_total_margin(black_box(orders), &quotes, true, true).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_order_margin, bench_user_total_margin);
criterion_main!(benches);
