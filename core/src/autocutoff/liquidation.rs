//! Liquidation Engine (spec.md §4.12 "Liquidation Engine").
//!
//! Closes a user's open orders in descending order of USD loss until
//! `margin_level >= 100` or there is nothing left to close, then cascades
//! to copy-trading followers when the liquidated account is a strategy
//! provider (spec.md §4.12 final bullet).

use crate::core::{EngineError, Order, Side, UserType};
use crate::db_update::{DbUpdateMessage, DbUpdatePublisher, DbUpdateType};
use crate::execution::{load_open_orders, CloseReason, OrderCloser};
use crate::margin;
use crate::monitoring::MetricsRegistry;
use crate::quote_store::QuoteStore;
use crate::redis_store::{keys, RedisStore};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Settlement wait after each close, giving the portfolio calculator time
/// to refresh `margin_level` before the engine re-reads it (spec.md §4.12:
/// "sleep ~300 ms for Portfolio Calculator to refresh").
const SETTLEMENT_WAIT: Duration = Duration::from_millis(300);

/// Liquidation stops once margin level reaches this target (spec.md §4.12:
/// "stop when >= 100").
const TARGET_MARGIN_LEVEL: i64 = 100;

pub struct LiquidationEngine {
    redis: RedisStore,
    quotes: Arc<QuoteStore>,
    closer: Arc<dyn OrderCloser>,
    db_update: Arc<dyn DbUpdatePublisher>,
    strict_conversion: bool,
    metrics: Arc<MetricsRegistry>,
}

impl LiquidationEngine {
    pub fn new(
        redis: RedisStore,
        quotes: Arc<QuoteStore>,
        closer: Arc<dyn OrderCloser>,
        db_update: Arc<dyn DbUpdatePublisher>,
        strict_conversion: bool,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            redis,
            quotes,
            closer,
            db_update,
            strict_conversion,
            metrics,
        }
    }

    /// Liquidates one user's book, then cascades to any active copy
    /// followers if `user_type` is a strategy provider.
    pub async fn liquidate(&self, user_type: UserType, user_id: &str) -> Result<(), EngineError> {
        self.liquidate_one(user_type, user_id).await?;

        if user_type == UserType::StrategyProvider {
            self.cascade_to_followers(user_id).await?;
        }

        Ok(())
    }

    async fn liquidate_one(&self, user_type: UserType, user_id: &str) -> Result<(), EngineError> {
        let orders = load_open_orders(&self.redis, user_type, user_id).await?;
        if orders.is_empty() {
            return Ok(());
        }

        let mut losses: Vec<(String, Decimal)> = Vec::with_capacity(orders.len());
        for order in &orders {
            match self.order_loss_usd(order) {
                Ok(loss) => losses.push((order.order_id.clone(), loss)),
                Err(e) => warn!(error = ?e, order_id = %order.order_id, "skipping loss calc for liquidation ranking"),
            }
        }
        losses.sort_by(|a, b| b.1.cmp(&a.1));

        info!(
            user_type = %user_type,
            user_id,
            candidates = losses.len(),
            "auto-cutoff liquidation starting"
        );

        for (order_id, loss) in losses {
            let level = self.current_margin_level(user_type, user_id).await?;
            if level >= Decimal::from(TARGET_MARGIN_LEVEL) {
                break;
            }

            match self.closer.close_order(&order_id, CloseReason::Autocutoff).await {
                Ok(resp) => {
                    info!(
                        order_id = %order_id,
                        loss_usd = %loss,
                        net_profit = %resp.net_profit,
                        "auto-cutoff liquidated order"
                    );
                    self.metrics
                        .portfolio()
                        .autocutoff_total
                        .with_label_values(&["margin_level"])
                        .inc();
                }
                Err(e) => {
                    warn!(error = ?e, order_id = %order_id, "auto-cutoff close failed, continuing to next candidate");
                }
            }

            tokio::time::sleep(SETTLEMENT_WAIT).await;
        }

        Ok(())
    }

    /// USD loss at current market (spec.md §4.12: BUY loss = entry - bid,
    /// SELL loss = ask - entry, times qty * contract_size, converted to USD).
    /// Orders currently in profit yield a negative "loss", which simply
    /// sorts to the bottom of the liquidation order.
    fn order_loss_usd(&self, order: &Order) -> Result<Decimal, EngineError> {
        let quote = self
            .quotes
            .get(&order.symbol)
            .ok_or_else(|| EngineError::Pricing(crate::core::PricingError::NoQuote(order.symbol.clone())))?;

        let market_price = match order.side {
            Side::Buy => quote.bid,
            Side::Sell => quote.ask,
        }
        .ok_or_else(|| EngineError::Pricing(crate::core::PricingError::NoQuote(order.symbol.clone())))?;

        let loss_native = match order.side {
            Side::Buy => order.order_price - market_price,
            Side::Sell => market_price - order.order_price,
        } * order.order_quantity
            * order.contract_size;

        margin::convert_to_usd(loss_native, &order.profit_currency, &self.quotes, self.strict_conversion)
    }

    async fn current_margin_level(&self, user_type: UserType, user_id: &str) -> Result<Decimal, EngineError> {
        let fields = self.redis.hgetall(&keys::user_portfolio(user_type, user_id)).await?;
        Ok(fields
            .get("margin_level")
            .and_then(|v| RedisStore::parse_decimal(v))
            .unwrap_or(Decimal::ZERO))
    }

    /// For strategy_provider accounts, enumerate active copy followers and
    /// trigger liquidation for each (spec.md §4.12: "cascade liquidation").
    async fn cascade_to_followers(&self, strategy_provider_id: &str) -> Result<(), EngineError> {
        let followers = self
            .redis
            .smembers(&keys::copy_master_followers_active(strategy_provider_id))
            .await?;

        if followers.is_empty() {
            return Ok(());
        }

        info!(
            strategy_provider_id,
            follower_count = followers.len(),
            "cascading auto-cutoff liquidation to copy followers"
        );

        for follower_id in &followers {
            if let Err(e) = self.liquidate_one(UserType::CopyFollower, follower_id).await {
                warn!(error = ?e, follower_id, "follower cascade liquidation failed, continuing");
            }
        }

        let audit = DbUpdateMessage::new(DbUpdateType::AutocutoffLiquidation, strategy_provider_id)
            .with("strategy_provider_id", strategy_provider_id.to_string())
            .with("followers", followers.clone())
            .with("cascade", true);
        self.db_update.publish(audit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy_order(symbol: &str, entry: Decimal, qty: Decimal, contract_size: Decimal) -> Order {
        Order {
            order_id: "o1".into(),
            user_id: "42".into(),
            user_type: UserType::Live,
            symbol: symbol.into(),
            side: Side::Buy,
            order_quantity: qty,
            order_price: entry,
            status: crate::core::OrderState::Open,
            execution_status: crate::core::ExecutionStatus::Executed,
            raw_price: Some(entry),
            half_spread: Decimal::ZERO,
            contract_value: entry * qty * contract_size,
            margin: Some(dec!(100)),
            reserved_margin: None,
            commission_entry: Decimal::ZERO,
            commission_exit: Decimal::ZERO,
            swap: Decimal::ZERO,
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
            contract_size,
            instrument_type: crate::core::InstrumentType::Fx,
            crypto_margin_factor: None,
            commission_rate: Decimal::ZERO,
            commission_value_type: "none".into(),
            group_margin: None,
            leverage: dec!(100),
            pending_local: false,
        }
    }

    #[test]
    fn buy_loss_formula_matches_spec() {
        // BUY loss = entry - bid, times qty * contract_size (spec.md §4.12).
        let order = buy_order("EURUSD", dec!(1.10000), dec!(1), dec!(100000));
        let entry = order.order_price;
        let bid = dec!(1.09000);
        let loss_native = (entry - bid) * order.order_quantity * order.contract_size;
        assert_eq!(loss_native, dec!(1000.00000));
    }

    #[test]
    fn losses_sort_descending() {
        let mut losses = vec![("a".to_string(), dec!(50)), ("b".to_string(), dec!(200)), ("c".to_string(), dec!(10))];
        losses.sort_by(|a, b| b.1.cmp(&a.1));
        assert_eq!(losses[0].0, "b");
        assert_eq!(losses[2].0, "c");
    }
}
