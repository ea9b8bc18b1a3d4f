//! Portfolio Calculator (component D, spec.md §4.6).
//!
//! Subscribes to the dirty-user bus, accumulates a per-user-type dirty
//! set in memory, and every 200 ms drains it with bounded concurrency
//! (a semaphore around ~50 concurrent users), recomputing PnL, margin
//! and margin level per user and writing the portfolio hash.

use crate::core::{order_fsm, CalcStatus, EngineError, Order, Side, UserType, MARGIN_LEVEL_SAFE_SENTINEL};
use crate::margin;
use crate::quote_store::QuoteStore;
use crate::redis_store::{keys, RedisStore};
use crate::stores::{GroupConfigStore, UserConfigStore};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, warn};

const DRAIN_TICK: Duration = Duration::from_millis(200);
const MAX_CONCURRENT_USERS: usize = 50;

pub struct PortfolioCalculator {
    redis: RedisStore,
    quotes: Arc<QuoteStore>,
    user_configs: Arc<dyn UserConfigStore>,
    group_configs: Arc<dyn GroupConfigStore>,
    strict_conversion: bool,
    dirty: Mutex<HashMap<UserType, HashSet<String>>>,
    semaphore: Arc<Semaphore>,
}

impl PortfolioCalculator {
    pub fn new(
        redis: RedisStore,
        quotes: Arc<QuoteStore>,
        user_configs: Arc<dyn UserConfigStore>,
        group_configs: Arc<dyn GroupConfigStore>,
        strict_conversion: bool,
    ) -> Self {
        Self {
            redis,
            quotes,
            user_configs,
            group_configs,
            strict_conversion,
            dirty: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_USERS)),
        }
    }

    pub async fn mark_dirty(&self, user_type: UserType, user_id: &str) {
        let mut dirty = self.dirty.lock().await;
        dirty.entry(user_type).or_default().insert(user_id.to_string());
    }

    /// Runs forever: listens for dirty-symbol batches and drains on a
    /// fixed 200ms tick.
    pub async fn run(
        self: Arc<Self>,
        mut market_updates: broadcast::Receiver<Vec<String>>,
        dirty_bus: Arc<crate::dirty_bus::DirtyUserBus>,
    ) {
        let mut tick = tokio::time::interval(DRAIN_TICK);
        loop {
            tokio::select! {
                recv = market_updates.recv() => {
                    match recv {
                        Ok(symbols) => {
                            let resolved = dirty_bus.resolve_dirty_users(&symbols).await;
                            let mut dirty = self.dirty.lock().await;
                            for (user_type, users) in resolved {
                                dirty.entry(user_type).or_default().extend(users);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "portfolio calculator lagged behind market updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = tick.tick() => {
                    self.drain_once(&dirty_bus).await;
                }
            }
        }
    }

    async fn drain_once(&self, dirty_bus: &crate::dirty_bus::DirtyUserBus) {
        let batch: Vec<(UserType, String)> = {
            let mut dirty = self.dirty.lock().await;
            let mut batch = Vec::new();
            for (user_type, users) in dirty.iter_mut() {
                for user_id in users.drain() {
                    batch.push((*user_type, user_id));
                }
            }
            dirty.retain(|_, users| !users.is_empty());
            batch
        };

        if batch.is_empty() {
            return;
        }

        let mut futures = Vec::with_capacity(batch.len());
        for (user_type, user_id) in batch {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // Over budget this tick: put it back for the next drain.
                    let mut dirty = self.dirty.lock().await;
                    dirty.entry(user_type).or_default().insert(user_id);
                    continue;
                }
            };
            futures.push(self.recompute_and_publish(user_type, user_id, dirty_bus, permit));
        }

        for result in futures_util::future::join_all(futures).await {
            if let Err(e) = result {
                warn!(error = ?e, "portfolio recompute failed");
            }
        }
    }

    async fn recompute_and_publish(
        &self,
        user_type: UserType,
        user_id: String,
        dirty_bus: &crate::dirty_bus::DirtyUserBus,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Result<(UserType, String), EngineError> {
        let snapshot = self.recompute(user_type, &user_id).await;
        let portfolio_key = keys::user_portfolio(user_type, &user_id);

        match snapshot {
            Ok(portfolio) => {
                let fields: Vec<(&str, String)> = vec![
                    ("balance", portfolio.balance.to_string()),
                    ("equity", portfolio.equity.to_string()),
                    ("open_pnl", portfolio.open_pnl.to_string()),
                    ("used_margin_executed", portfolio.used_margin_executed.to_string()),
                    ("used_margin_all", portfolio.used_margin_all.to_string()),
                    ("free_margin", portfolio.free_margin.to_string()),
                    ("margin_level", portfolio.margin_level.to_string()),
                    ("calc_status", format!("{:?}", portfolio.calc_status).to_lowercase()),
                    ("degraded_fields", portfolio.degraded_fields.join(",")),
                    ("error_codes", portfolio.error_codes.join(",")),
                    ("ts_ms", portfolio.ts_ms.to_string()),
                ];
                self.redis.hset_all(&portfolio_key, &fields).await?;
            }
            Err(e) => {
                warn!(error = ?e, user_id = %user_id, "portfolio calc_status=error");
                let fields: Vec<(&str, String)> = vec![
                    ("calc_status", "error".to_string()),
                    ("error_codes", e.reason_code()),
                    ("ts_ms", crate::quote_store::now_ms().to_string()),
                ];
                self.redis.hset_all(&portfolio_key, &fields).await?;
            }
        }

        dirty_bus.publish_portfolio_update(user_type, &user_id).await;
        Ok((user_type, user_id))
    }

    /// Core recompute for one user (spec.md §4.6 steps 1-8).
    async fn recompute(
        &self,
        user_type: UserType,
        user_id: &str,
    ) -> Result<crate::core::UserPortfolio, EngineError> {
        let user_cfg = self
            .user_configs
            .get(user_type, user_id)
            .await?
            .ok_or_else(|| {
                EngineError::Config(crate::core::ConfigError::UserConfigNotFound(user_id.to_string()))
            })?;

        let Some(balance) = user_cfg.wallet_balance else {
            return Err(EngineError::Validation(
                crate::core::ValidationError::MissingFields("wallet_balance".to_string()),
            ));
        };

        let orders = self.load_open_orders(user_type, user_id).await?;

        let mut degraded_fields: Vec<String> = Vec::new();
        let mut valid_orders: Vec<Order> = Vec::new();
        let mut has_queued = false;

        for order in orders {
            if order_fsm::is_terminal(order.status) {
                continue;
            }
            if !order_fsm::counts_as_executed(order.status) {
                has_queued = true;
            }
            match self.validate_order_context(&order).await {
                Ok(()) => valid_orders.push(order),
                Err(flag) => {
                    if !degraded_fields.contains(&flag) {
                        degraded_fields.push(flag);
                    }
                }
            }
        }

        let open_pnl = self.total_open_pnl(&valid_orders, user_type, user_id).await?;
        let equity = balance + open_pnl;

        let cached = self.read_cached_margins(user_type, user_id).await?;
        let (used_margin_executed, used_margin_all) = match cached {
            Some(pair) => pair,
            None => {
                let executed = margin::user_total_margin(
                    &valid_orders,
                    &self.quotes,
                    self.strict_conversion,
                    false,
                )?;
                let all = margin::user_total_margin(
                    &valid_orders,
                    &self.quotes,
                    self.strict_conversion,
                    true,
                )?;
                (executed, all)
            }
        };

        let used_margin_chosen = if has_queued {
            used_margin_all
        } else {
            used_margin_executed
        };

        let free_margin = equity - used_margin_chosen;
        let margin_level = if used_margin_chosen.is_zero() {
            Decimal::from(MARGIN_LEVEL_SAFE_SENTINEL)
        } else {
            equity / used_margin_chosen * Decimal::from(100)
        };

        let calc_status = if degraded_fields.is_empty() {
            CalcStatus::Ok
        } else {
            CalcStatus::Degraded
        };

        Ok(crate::core::UserPortfolio {
            balance,
            equity,
            open_pnl,
            used_margin_executed,
            used_margin_all,
            free_margin,
            margin_level,
            calc_status,
            degraded_fields,
            error_codes: Vec::new(),
            ts_ms: crate::quote_store::now_ms(),
        })
    }

    /// Returns `Err(flag)` with a degraded-field tag when the order's
    /// pricing context can't be resolved (spec.md §4.6 step 2). Flags use
    /// the spec's own vocabulary (§4.6/§7): `missing_group_data`,
    /// `missing_prices`, `missing_profit_currency`, `missing_conversion`.
    async fn validate_order_context(&self, order: &Order) -> Result<(), String> {
        if self.group_configs.get(&order.group, &order.symbol).await.is_err() {
            return Err("missing_group_data".to_string());
        }
        if self.quotes.get(&order.symbol).is_none() {
            return Err("missing_prices".to_string());
        }
        if order.profit_currency.is_empty() {
            return Err("missing_profit_currency".to_string());
        }
        if margin::convert_to_usd(Decimal::ONE, &order.profit_currency, &self.quotes, true).is_err() {
            return Err("missing_conversion".to_string());
        }
        Ok(())
    }

    async fn total_open_pnl(
        &self,
        orders: &[Order],
        _user_type: UserType,
        _user_id: &str,
    ) -> Result<Decimal, EngineError> {
        let mut total = Decimal::ZERO;
        for order in orders {
            if order.status != crate::core::OrderState::Open
                && order.status != crate::core::OrderState::Stoploss
                && order.status != crate::core::OrderState::Takeprofit
            {
                continue;
            }
            let Some(quote) = self.quotes.get(&order.symbol) else {
                continue;
            };
            let exit_price = match order.side {
                Side::Buy => quote.bid,
                Side::Sell => quote.ask,
            };
            let Some(exit_price) = exit_price else { continue };

            let diff = match order.side {
                Side::Buy => exit_price - order.order_price,
                Side::Sell => order.order_price - exit_price,
            };
            let pnl_native = diff * order.contract_size * order.order_quantity;
            let pnl_usd = margin::convert_to_usd(
                pnl_native,
                &order.profit_currency,
                &self.quotes,
                self.strict_conversion,
            )?;
            total += pnl_usd - order.commission_entry - order.commission_exit - order.swap;
        }
        Ok(total)
    }

    async fn read_cached_margins(
        &self,
        user_type: UserType,
        user_id: &str,
    ) -> Result<Option<(Decimal, Decimal)>, EngineError> {
        let key = keys::user_portfolio(user_type, user_id);
        let fields = self.redis.hgetall(&key).await?;
        let executed = fields.get("used_margin_executed").and_then(|v| RedisStore::parse_decimal(v));
        let all = fields.get("used_margin_all").and_then(|v| RedisStore::parse_decimal(v));
        match (executed, all) {
            (Some(e), Some(a)) => Ok(Some((e, a))),
            _ => Ok(None),
        }
    }

    async fn load_open_orders(&self, user_type: UserType, user_id: &str) -> Result<Vec<Order>, EngineError> {
        let index_key = keys::user_orders_index(user_type, user_id);
        let order_ids = self.redis.smembers(&index_key).await?;
        let mut orders = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            let key = keys::order_data(&order_id);
            let fields = self.redis.hgetall(&key).await?;
            if fields.is_empty() {
                continue;
            }
            match crate::redis_store::order_codec::from_hash(&fields) {
                Ok(order) => orders.push(order),
                Err(e) => debug!(error = ?e, order_id = %order_id, "skipping unparsable order record"),
            }
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn margin_level_sentinel_when_zero_margin() {
        let equity = dec!(1000);
        let used = Decimal::ZERO;
        let level = if used.is_zero() {
            Decimal::from(MARGIN_LEVEL_SAFE_SENTINEL)
        } else {
            equity / used * Decimal::from(100)
        };
        assert_eq!(level, Decimal::from(999));
    }

    #[test]
    fn margin_level_formula() {
        let equity = dec!(2000);
        let used = dec!(500);
        let level = equity / used * Decimal::from(100);
        assert_eq!(level, dec!(400));
    }
}
