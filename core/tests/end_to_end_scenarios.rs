//! End-to-end numeric scenarios from spec.md §8, exercised across the
//! quote store, margin engine and commission module's public APIs without
//! a live Redis/AMQP backend (those are exercised by the in-crate unit
//! tests next to the Redis-backed code).

use oms_core::execution::commission::compute_commission;
use oms_core::margin::single_order_margin_usd;
use oms_core::prelude::*;
use oms_core::quote_store::QuoteStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn eurusd_standard_group() -> GroupConfig {
    GroupConfig {
        group: "Standard".into(),
        symbol: "EURUSD".into(),
        contract_size: dec!(100000),
        profit_currency: "USD".into(),
        instrument_type: InstrumentType::Fx,
        spread: dec!(2),
        spread_pip: dec!(0.00001),
        commission_rate: Decimal::ZERO,
        commission_type: "money".into(),
        commission_value_type: "money".into(),
        crypto_margin_factor: None,
        group_margin: None,
    }
}

/// Scenario 1: local BUY placement & close, non-crypto (spec.md §8).
#[test]
fn scenario_1_local_buy_placement_and_close() {
    let quotes = QuoteStore::new(5_000);
    quotes.put_partial("EURUSD", Some(dec!(1.10000)), Some(dec!(1.10002)), 1_000);

    let group = eurusd_standard_group();
    let half_spread = group.half_spread();
    assert_eq!(half_spread, dec!(0.00001));

    // exec_price = ask + half_spread on BUY.
    let raw_ask = quotes.get("EURUSD").unwrap().ask.unwrap();
    let exec_price = raw_ask + half_spread;
    assert_eq!(exec_price, dec!(1.10003));

    let margin = single_order_margin_usd(
        group.contract_size,
        dec!(0.1),
        exec_price,
        &group.profit_currency,
        dec!(100),
        group.instrument_type,
        group.crypto_margin_factor,
        &quotes,
        true,
    )
    .expect("margin computes with a fresh USD-denominated quote");
    assert_eq!(margin, dec!(110.003));

    let balance = dec!(10000);
    let free_margin = balance - Decimal::ZERO;
    assert!(free_margin >= margin, "placement must pass the free-margin pre-check");

    // Close at a higher market; close uses bid minus half-spread on BUY.
    quotes.put_partial("EURUSD", Some(dec!(1.10100)), Some(dec!(1.10120)), 2_000);
    let close_bid = quotes.get("EURUSD").unwrap().bid.unwrap();
    let close_price = close_bid - half_spread;
    assert_eq!(close_price, dec!(1.10099));

    let profit_usd = (close_price - exec_price) * dec!(0.1) * group.contract_size;
    let commission = compute_commission(
        group.commission_rate,
        &group.commission_value_type,
        dec!(0.1),
        exec_price,
        group.contract_size,
    );
    let net_profit = profit_usd - commission + Decimal::ZERO /* swap */;
    assert_eq!(net_profit, dec!(9.60));
}

/// R1: local BUY open at `entry` then close at `entry` with zero
/// commission, zero swap, USD profit currency yields zero net profit.
#[test]
fn r1_open_close_at_same_price_is_zero_pnl() {
    let group = eurusd_standard_group();
    let entry = dec!(1.10050);
    let qty = dec!(1);
    let profit_usd = (entry - entry) * qty * group.contract_size;
    let net_profit = profit_usd - Decimal::ZERO + Decimal::ZERO;
    assert_eq!(net_profit, Decimal::ZERO);
}

/// Scenario 4: insufficient margin rejection — the free-margin pre-check
/// must fail before anything is persisted.
#[test]
fn scenario_4_insufficient_margin_is_rejected_before_placement() {
    let quotes = QuoteStore::new(5_000);
    quotes.put_partial("EURUSD", Some(dec!(1.10000)), Some(dec!(1.10002)), 1_000);
    let group = eurusd_standard_group();

    let required_margin = single_order_margin_usd(
        group.contract_size,
        dec!(2),
        quotes.get("EURUSD").unwrap().ask.unwrap(),
        &group.profit_currency,
        dec!(100),
        group.instrument_type,
        group.crypto_margin_factor,
        &quotes,
        true,
    )
    .unwrap();
    assert_eq!(required_margin, dec!(2200.04));

    let balance = dec!(100);
    let used_margin_all = Decimal::ZERO;
    let free_margin = balance - used_margin_all;
    assert!(free_margin < required_margin, "100 available must not cover 2200.004 required");
}

/// Scenario 6: pending BUY_LIMIT triggers locally with the uniform
/// `exec_price = ask + half_spread` formula (spec.md §4.8, open question 1).
#[test]
fn scenario_6_pending_buy_limit_margin_preview() {
    let quotes = QuoteStore::new(5_000);
    quotes.put_partial("EURUSD", Some(dec!(1.09897)), Some(dec!(1.09898)), 1_000);
    let group = eurusd_standard_group();
    let half_spread = group.half_spread();

    let ask = quotes.get("EURUSD").unwrap().ask.unwrap();
    let exec_price = ask + half_spread;
    assert_eq!(exec_price, dec!(1.09899));

    let margin = single_order_margin_usd(
        group.contract_size,
        dec!(0.1),
        exec_price,
        &group.profit_currency,
        dec!(100),
        group.instrument_type,
        group.crypto_margin_factor,
        &quotes,
        true,
    )
    .unwrap();
    let balance = dec!(10000);
    assert!(balance - Decimal::ZERO >= margin, "pending margin preview must pass before dispatch");
}

/// Margin conversion falls back to the inverse `USD{CUR}` pair when only
/// that side has a fresh quote (spec.md §4.5).
#[test]
fn margin_conversion_uses_inverse_pair_when_direct_pair_missing() {
    let quotes = QuoteStore::new(5_000);
    // No GBPUSD quote; only USDGBP is fresh.
    quotes.put_partial("USDGBP", Some(dec!(0.79)), Some(dec!(0.80)), 1_000);

    let margin = single_order_margin_usd(
        dec!(100000),
        dec!(1),
        dec!(1.0),
        "GBP",
        dec!(100),
        InstrumentType::Fx,
        None,
        &quotes,
        true,
    )
    .expect("inverse pair should satisfy the conversion");
    // margin_native = 100000 * 1 * 1.0 / 100 = 1000 GBP; USD = 1000 / 0.80
    assert_eq!(margin, dec!(1250));
}

/// Strict mode surfaces an error instead of silently zeroing the margin
/// when neither conversion pair has a fresh quote.
#[test]
fn margin_conversion_strict_mode_errors_without_any_pair() {
    let quotes = QuoteStore::new(5_000);
    let result = single_order_margin_usd(
        dec!(100000),
        dec!(1),
        dec!(1.0),
        "GBP",
        dec!(100),
        InstrumentType::Fx,
        None,
        &quotes,
        true,
    );
    assert!(result.is_err());
}
