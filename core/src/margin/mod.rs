//! Margin Engine (component E, spec.md §4.5).
//!
//! Computes single-order margin in USD and per-user totals with hedged
//! per-symbol netting. Grounded directly in
//! `original_source/.../portfolio/margin_calculator.py` — the constants
//! and branch structure below were checked against that module's own
//! unit tests (`tests/test_margin_calculator.py`).

use crate::core::{EngineError, GroupConfig, InstrumentType, MarginError, Order, PricingError};
use crate::quote_store::QuoteStore;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Currencies that never need conversion to price in USD.
fn is_usd_like(currency: &str) -> bool {
    currency.eq_ignore_ascii_case("USD") || currency.eq_ignore_ascii_case("USDT")
}

/// Convert a native-currency amount to USD using the quote store.
///
/// Tries the direct pair `{CUR}USD` (ask) first, then the inverse pair
/// `USD{CUR}` (`1/ask`). In strict mode, returns an error when neither
/// quote is fresh; in non-strict mode the caller decides how to degrade.
pub fn convert_to_usd(
    amount_native: Decimal,
    currency: &str,
    quotes: &QuoteStore,
    strict: bool,
) -> Result<Decimal, EngineError> {
    if is_usd_like(currency) {
        return Ok(amount_native);
    }

    let direct = format!("{}USD", currency.to_uppercase());
    if let Some(q) = quotes.get(&direct) {
        if let Some(ask) = q.ask {
            return Ok(amount_native * ask);
        }
    }

    let inverse = format!("USD{}", currency.to_uppercase());
    if let Some(q) = quotes.get(&inverse) {
        if let Some(ask) = q.ask {
            if !ask.is_zero() {
                return Ok(amount_native / ask);
            }
        }
    }

    if strict {
        Err(EngineError::Pricing(PricingError::NoConversion(
            currency.to_string(),
        )))
    } else {
        Ok(Decimal::ZERO)
    }
}

/// `single_order_margin_usd` (spec.md §4.5).
///
/// - Non-crypto: `margin_native = contract_size * qty * exec_price / leverage`.
/// - Crypto: `margin_native = contract_size * qty * exec_price * crypto_margin_factor`.
pub fn single_order_margin_usd(
    contract_size: Decimal,
    qty: Decimal,
    exec_price: Decimal,
    profit_currency: &str,
    leverage: Decimal,
    instrument_type: InstrumentType,
    crypto_margin_factor: Option<Decimal>,
    quotes: &QuoteStore,
    strict: bool,
) -> Result<Decimal, EngineError> {
    if leverage <= Decimal::ZERO && !instrument_type.is_crypto() {
        return Err(EngineError::Margin(MarginError::CalculationFailed(
            "leverage must be positive".into(),
        )));
    }

    let margin_native = if instrument_type.is_crypto() {
        let factor = crypto_margin_factor.unwrap_or(Decimal::ZERO);
        contract_size * qty * exec_price * factor
    } else {
        contract_size * qty * exec_price / leverage
    };

    convert_to_usd(margin_native, profit_currency, quotes, strict)
}

/// Execution-price policy for margin (spec.md §4.5):
/// non-crypto always uses market ask; crypto uses the order's own price,
/// falling back to ask.
pub fn margin_execution_price(
    order: &Order,
    quotes: &QuoteStore,
) -> Result<Decimal, EngineError> {
    if order.instrument_type.is_crypto() {
        if order.order_price > Decimal::ZERO {
            return Ok(order.order_price);
        }
    }
    let q = quotes
        .get(&order.symbol)
        .ok_or_else(|| EngineError::Pricing(PricingError::NoQuote(order.symbol.clone())))?;
    q.ask
        .ok_or_else(|| EngineError::Pricing(PricingError::NoQuote(order.symbol.clone())))
}

/// Per-symbol hedged margin aggregation (GLOSSARY: hedged margin).
///
/// Nets BUY vs SELL quantities at the group-configured ratio
/// (`group_margin`, default 1.0 = full netting of the smaller side) and
/// charges margin on the larger net side plus the unhedged remainder of
/// the rest, using the per-order margin rate (margin / qty) as the
/// per-unit charge. This matches `user_margin_service.py`'s treatment of
/// `group_margin` as a netting ratio rather than a flat scalar.
fn hedged_symbol_margin(orders: &[(&Order, Decimal)]) -> Decimal {
    if orders.is_empty() {
        return Decimal::ZERO;
    }

    let mut buy_qty = Decimal::ZERO;
    let mut sell_qty = Decimal::ZERO;
    let mut buy_margin = Decimal::ZERO;
    let mut sell_margin = Decimal::ZERO;

    for (order, margin) in orders {
        match order.side {
            crate::core::Side::Buy => {
                buy_qty += order.order_quantity;
                buy_margin += *margin;
            }
            crate::core::Side::Sell => {
                sell_qty += order.order_quantity;
                sell_margin += *margin;
            }
        }
    }

    if buy_qty.is_zero() || sell_qty.is_zero() {
        return buy_margin + sell_margin;
    }

    let netting_ratio = orders[0]
        .0
        .group_margin
        .filter(|r| *r >= Decimal::ZERO && *r <= Decimal::ONE)
        .unwrap_or(Decimal::ONE);

    let hedged_qty = buy_qty.min(sell_qty) * netting_ratio;
    let net_qty = (buy_qty - sell_qty).abs();

    let buy_rate = buy_margin / buy_qty;
    let sell_rate = sell_margin / sell_qty;
    let larger_rate = buy_rate.max(sell_rate);

    // Hedged slice charged at the smaller rate (cheaper side nets first),
    // remaining net exposure charged at the larger side's rate.
    let smaller_rate = buy_rate.min(sell_rate);
    hedged_qty * smaller_rate + net_qty * larger_rate
}

/// `user_total_margin` (spec.md §4.5): groups open orders by symbol,
/// computes hedged margin per symbol, and sums. `include_queued`
/// controls whether QUEUED orders are counted (`used_margin_all`) or
/// excluded (`used_margin_executed`, invariant 3).
pub fn user_total_margin(
    orders: &[Order],
    quotes: &QuoteStore,
    strict: bool,
    include_queued: bool,
) -> Result<Decimal, EngineError> {
    let mut by_symbol: HashMap<&str, Vec<(&Order, Decimal)>> = HashMap::new();

    for order in orders {
        if !include_queued && !crate::core::order_fsm::counts_as_executed(order.status) {
            continue;
        }
        if crate::core::order_fsm::is_terminal(order.status) {
            continue;
        }

        let exec_price = margin_execution_price(order, quotes)?;
        let margin = single_order_margin_usd(
            order.contract_size,
            order.order_quantity,
            exec_price,
            &order.profit_currency,
            order.leverage,
            order.instrument_type,
            order.crypto_margin_factor,
            quotes,
            strict,
        )?;
        by_symbol
            .entry(order.symbol.as_str())
            .or_default()
            .push((order, margin));
    }

    let total = by_symbol
        .values()
        .map(|orders| hedged_symbol_margin(orders))
        .fold(Decimal::ZERO, |acc, m| acc + m);

    Ok(total)
}

/// Convenience wrapper bundling the group config fields onto an `Order`
/// snapshot for margin computation (used by the execution engine before
/// an order has a canonical record yet).
pub fn single_order_margin_for_group(
    group_cfg: &GroupConfig,
    qty: Decimal,
    exec_price: Decimal,
    leverage: Decimal,
    quotes: &QuoteStore,
    strict: bool,
) -> Result<Decimal, EngineError> {
    single_order_margin_usd(
        group_cfg.contract_size,
        qty,
        exec_price,
        &group_cfg.profit_currency,
        leverage,
        group_cfg.instrument_type,
        group_cfg.crypto_margin_factor,
        quotes,
        strict,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote_store::QuoteStore;
    use rust_decimal_macros::dec;

    #[test]
    fn non_crypto_usd_margin_matches_reference() {
        let quotes = QuoteStore::new(5_000);
        // contract_size=1000, qty=1, price=1.2, leverage=100 -> 12.0
        let margin = single_order_margin_usd(
            dec!(1000),
            dec!(1),
            dec!(1.2),
            "USD",
            dec!(100),
            InstrumentType::Fx,
            None,
            &quotes,
            true,
        )
        .unwrap();
        assert_eq!(margin, dec!(12.0));
    }

    #[test]
    fn crypto_usd_margin_matches_reference() {
        let quotes = QuoteStore::new(5_000);
        // contract_size=1000, qty=1, price=1.2, factor=0.5 -> 6.0
        let margin = single_order_margin_usd(
            dec!(1000),
            dec!(1),
            dec!(1.2),
            "USD",
            dec!(100),
            InstrumentType::Crypto,
            Some(dec!(0.5)),
            &quotes,
            true,
        )
        .unwrap();
        assert_eq!(margin, dec!(6.0));
    }

    #[test]
    fn invalid_leverage_fails_strict() {
        let quotes = QuoteStore::new(5_000);
        let result = single_order_margin_usd(
            dec!(1000),
            dec!(1),
            dec!(1.2),
            "USD",
            dec!(0),
            InstrumentType::Fx,
            None,
            &quotes,
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn end_to_end_scenario_1_eurusd_margin() {
        let quotes = QuoteStore::new(5_000);
        // 100000 * 0.1 * 1.10003 / 100 = 110.003
        let margin = single_order_margin_usd(
            dec!(100000),
            dec!(0.1),
            dec!(1.10003),
            "USD",
            dec!(100),
            InstrumentType::Fx,
            None,
            &quotes,
            true,
        )
        .unwrap();
        assert_eq!(margin, dec!(110.003));
    }

    #[test]
    fn hedged_margin_nets_opposing_sides() {
        use crate::core::{ExecutionStatus, OrderState, Side, UserType};

        fn base_order(side: Side, qty: Decimal) -> Order {
            Order {
                order_id: "o".into(),
                user_id: "u".into(),
                user_type: UserType::Live,
                symbol: "EURUSD".into(),
                side,
                order_quantity: qty,
                order_price: dec!(1.1),
                status: OrderState::Open,
                execution_status: ExecutionStatus::Executed,
                raw_price: None,
                half_spread: dec!(0),
                contract_value: dec!(0),
                margin: None,
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

        let quotes = QuoteStore::new(5_000);
        quotes.put_partial("EURUSD", Some(dec!(1.1000)), Some(dec!(1.1002)), 1);

        let orders = vec![base_order(Side::Buy, dec!(1.0)), base_order(Side::Sell, dec!(1.0))];
        let total = user_total_margin(&orders, &quotes, true, true).unwrap();
        // Fully hedged equal-size positions on opposite sides: margin
        // charged should be strictly less than the unnetted sum.
        let per_order = dec!(100000) * dec!(1.0) * dec!(1.1002) / dec!(100);
        assert!(total < per_order * dec!(2));
    }

    #[test]
    fn used_margin_executed_le_used_margin_all_p1() {
        use crate::core::{ExecutionStatus, OrderState, Side, UserType};
        let quotes = QuoteStore::new(5_000);
        quotes.put_partial("EURUSD", Some(dec!(1.1)), Some(dec!(1.1002)), 1);

        let mut queued = Order {
            order_id: "q1".into(),
            user_id: "u".into(),
            user_type: UserType::Live,
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_quantity: dec!(1.0),
            order_price: dec!(1.1),
            status: OrderState::Queued,
            execution_status: ExecutionStatus::Queued,
            raw_price: None,
            half_spread: dec!(0),
            contract_value: dec!(0),
            margin: None,
            reserved_margin: Some(dec!(110)),
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
        };
        let orders = vec![{
            queued.order_id = "q1".into();
            queued.clone()
        }];

        let executed_only = user_total_margin(&orders, &quotes, true, false).unwrap();
        let with_queued = user_total_margin(&orders, &quotes, true, true).unwrap();
        assert_eq!(executed_only, Decimal::ZERO);
        assert!(with_queued > Decimal::ZERO);
        assert!(executed_only <= with_queued);
    }
}
