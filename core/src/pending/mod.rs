//! Pending Monitor (component H, spec.md §4.8).
//!
//! Mirrors [`crate::triggers`]'s shape (same tick/lock/collaborator
//! pattern) but scans `pending_index:{symbol}:{order_type}` sorted sets
//! instead of SL/TP indexes. Grounded in
//! `original_source/.../pending_monitor.py`: ask-only comparisons for all
//! four pending types, and a uniform `exec_price = ask + half_spread`
//! (see DESIGN.md Open Question #1).

use crate::core::{EngineError, GroupConfig, PendingOrder, PendingOrderType, UserType};
use crate::db_update::{DbUpdateMessage, DbUpdatePublisher, DbUpdateType};
use crate::execution::{ExecuteInstantOrderRequest, ExecutionEngine};
use crate::margin;
use crate::quote_store::QuoteStore;
use crate::redis_store::{keys, RedisStore};
use crate::stores::{GroupConfigStore, UserConfigStore};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SCAN_TICK: Duration = Duration::from_millis(150);
const BATCH: isize = 100;
const LOCK_TTL_SECS: u64 = 5;

fn pending_type_str(t: PendingOrderType) -> &'static str {
    t.as_str()
}

pub struct PendingMonitor {
    redis: RedisStore,
    quotes: Arc<QuoteStore>,
    user_configs: Arc<dyn UserConfigStore>,
    group_configs: Arc<dyn GroupConfigStore>,
    execution: Arc<ExecutionEngine>,
    db_update: Arc<dyn DbUpdatePublisher>,
    strict_conversion: bool,
}

impl PendingMonitor {
    pub fn new(
        redis: RedisStore,
        quotes: Arc<QuoteStore>,
        user_configs: Arc<dyn UserConfigStore>,
        group_configs: Arc<dyn GroupConfigStore>,
        execution: Arc<ExecutionEngine>,
        db_update: Arc<dyn DbUpdatePublisher>,
        strict_conversion: bool,
    ) -> Self {
        Self {
            redis,
            quotes,
            user_configs,
            group_configs,
            execution,
            db_update,
            strict_conversion,
        }
    }

    /// Registers a newly-placed pending order in its symbol/type index
    /// (called by the placement API before this monitor ever sees it).
    pub async fn register(&self, pending: &PendingOrder) -> Result<(), EngineError> {
        let score = score_to_f64(pending.trigger_price);
        self.redis
            .zadd(&keys::pending_index(&pending.symbol, pending_type_str(pending.order_type)), &pending.order_id, score)
            .await?;
        let fields: Vec<(&str, String)> = vec![
            ("symbol", pending.symbol.clone()),
            ("order_type", pending_type_str(pending.order_type).to_string()),
            ("order_quantity", pending.order_quantity.to_string()),
            ("user_id", pending.user_id.clone()),
            ("user_type", pending.user_type.as_str().to_string()),
            ("group", pending.group.clone()),
            ("trigger_price", pending.trigger_price.to_string()),
        ];
        self.redis.hset_all(&keys::pending_orders(&pending.order_id), &fields).await?;
        self.redis.sadd(keys::PENDING_ACTIVE_SYMBOLS, &pending.symbol).await?;
        Ok(())
    }

    pub async fn deregister(&self, pending: &PendingOrder) -> Result<(), EngineError> {
        self.remove_pending(&pending.symbol, pending.order_type, &pending.order_id).await
    }

    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SCAN_TICK);
        loop {
            tick.tick().await;
            if let Err(e) = self.scan_once().await {
                warn!(error = ?e, "pending monitor scan failed");
            }
        }
    }

    async fn scan_once(&self) -> Result<(), EngineError> {
        let symbols = self.redis.smembers(keys::PENDING_ACTIVE_SYMBOLS).await?;
        for symbol in symbols {
            self.process_symbol(&symbol).await?;
        }
        Ok(())
    }

    /// BUY_STOP/SELL_LIMIT fire when `ask >= trigger_price`; BUY_LIMIT/
    /// SELL_STOP fire when `ask <= trigger_price` (spec.md §4.8 table).
    async fn process_symbol(&self, symbol: &str) -> Result<(), EngineError> {
        let Some(quote) = self.quotes.get(symbol) else { return Ok(()) };
        let Some(ask) = quote.ask else { return Ok(()) };
        if ask <= Decimal::ZERO {
            return Ok(());
        }
        let ask_f = score_to_f64(ask);

        for order_type in [PendingOrderType::BuyStop, PendingOrderType::SellLimit] {
            let key = keys::pending_index(symbol, pending_type_str(order_type));
            let ids = self.redis.zrangebyscore_max(&key, ask_f, BATCH).await?;
            self.handle_candidates(symbol, order_type, ids, ask).await;
        }
        for order_type in [PendingOrderType::BuyLimit, PendingOrderType::SellStop] {
            let key = keys::pending_index(symbol, pending_type_str(order_type));
            let ids = self.redis.zrangebyscore_min(&key, ask_f, BATCH).await?;
            self.handle_candidates(symbol, order_type, ids, ask).await;
        }
        Ok(())
    }

    async fn handle_candidates(&self, symbol: &str, order_type: PendingOrderType, ids: Vec<String>, ask: Decimal) {
        for order_id in ids {
            let lock_key = keys::lock_pending(&order_id);
            match self.redis.set_nx_ex(&lock_key, "1", LOCK_TTL_SECS).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(error = ?e, order_id, "failed acquiring lock_pending sentinel");
                    continue;
                }
            }

            if let Err(e) = self.fire_one(symbol, order_type, &order_id, ask).await {
                warn!(error = ?e, order_id, "pending fire failed");
            }
        }
    }

    async fn fire_one(
        &self,
        symbol: &str,
        order_type: PendingOrderType,
        order_id: &str,
        ask: Decimal,
    ) -> Result<(), EngineError> {
        let meta = self.redis.hgetall(&keys::pending_orders(order_id)).await?;
        if meta.is_empty() {
            // Stale index entry; an earlier replica already consumed it.
            self.remove_pending(symbol, order_type, order_id).await?;
            return Ok(());
        }

        let user_type = meta
            .get("user_type")
            .map(|s| user_type_from_str(s))
            .unwrap_or(UserType::Live);
        let user_id = meta.get("user_id").cloned().unwrap_or_default();
        let group = meta.get("group").cloned().unwrap_or_else(|| "Standard".to_string());
        let qty = meta
            .get("order_quantity")
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::ZERO);

        match self.validate_margin(user_type, &user_id, &group, symbol, qty, ask).await {
            Ok(Some(())) => {}
            Ok(None) => {
                self.remove_pending(symbol, order_type, order_id).await?;
                self.reject(order_id, user_type, &user_id, "insufficient_margin_pretrigger").await;
                return Ok(());
            }
            Err(e) => {
                warn!(error = ?e, order_id, "pending margin validation errored");
                return Ok(());
            }
        }

        let half_spread = self.half_spread(&group, symbol).await.unwrap_or(Decimal::ZERO);
        let exec_price = ask + half_spread;

        let req = ExecuteInstantOrderRequest {
            symbol: symbol.to_string(),
            side: order_type.resolved_side(),
            order_price: exec_price,
            order_quantity: qty,
            user_id: user_id.clone(),
            user_type,
            idempotency_key: None,
            order_id: Some(order_id.to_string()),
            order_status: crate::core::OrderState::Open,
            pending_local: true,
            stop_loss: None,
            take_profit: None,
        };

        match self.execution.execute_instant_order(req).await {
            Ok(resp) => {
                self.remove_pending(symbol, order_type, order_id).await?;
                debug!(order_id, exec_price = %resp.exec_price, "pending order triggered");
            }
            Err(e) => {
                warn!(error = ?e, order_id, "pending trigger dispatch failed");
            }
        }
        Ok(())
    }

    /// Mirrors `_validate_margin` in `pending_monitor.py`. `Ok(Some(()))`
    /// means sufficient margin; `Ok(None)` means reject.
    async fn validate_margin(
        &self,
        user_type: UserType,
        user_id: &str,
        group: &str,
        symbol: &str,
        qty: Decimal,
        ask: Decimal,
    ) -> Result<Option<()>, EngineError> {
        let user_cfg = match self.user_configs.get(user_type, user_id).await? {
            Some(cfg) => cfg,
            None => return Ok(None),
        };
        if user_cfg.leverage <= Decimal::ZERO {
            return Ok(None);
        }
        let group_cfg: GroupConfig = match self.group_configs.get(group, symbol).await? {
            Some(cfg) => cfg,
            None => return Ok(None),
        };
        let half_spread = group_cfg.half_spread();
        let exec_price = ask + half_spread;

        let single_margin = margin::single_order_margin_for_group(
            &group_cfg,
            qty,
            exec_price,
            user_cfg.leverage,
            &self.quotes,
            self.strict_conversion,
        )?;

        let balance = user_cfg.wallet_balance.unwrap_or(Decimal::ZERO);
        let used_margin_all = self.cached_used_margin_all(user_type, user_id).await?;
        let free = balance - used_margin_all;

        if free >= single_margin {
            Ok(Some(()))
        } else {
            Ok(None)
        }
    }

    async fn half_spread(&self, group: &str, symbol: &str) -> Result<Decimal, EngineError> {
        let cfg = self
            .group_configs
            .get(group, symbol)
            .await?
            .ok_or_else(|| EngineError::Config(crate::core::ConfigError::MissingGroupData {
                group: group.to_string(),
                symbol: symbol.to_string(),
            }))?;
        Ok(cfg.half_spread())
    }

    async fn cached_used_margin_all(&self, user_type: UserType, user_id: &str) -> Result<Decimal, EngineError> {
        let key = keys::user_portfolio(user_type, user_id);
        match self.redis.hget(&key, "used_margin_all").await? {
            Some(raw) => Ok(RedisStore::parse_decimal(&raw).unwrap_or(Decimal::ZERO)),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn remove_pending(&self, symbol: &str, order_type: PendingOrderType, order_id: &str) -> Result<(), EngineError> {
        self.redis.zrem(&keys::pending_index(symbol, pending_type_str(order_type)), order_id).await?;
        self.redis.del(&keys::pending_orders(order_id)).await?;
        Ok(())
    }

    async fn reject(&self, order_id: &str, user_type: UserType, user_id: &str, reason: &str) {
        let msg = DbUpdateMessage::new(DbUpdateType::OrderRejected, order_id.to_string())
            .with("user_id", user_id.to_string())
            .with("user_type", user_type.as_str())
            .with("order_status", "REJECTED")
            .with("reason", reason);
        if let Err(e) = self.db_update.publish(msg).await {
            warn!(error = ?e, order_id, "pending reject db_update publish failed");
        }
    }
}

fn score_to_f64(d: Decimal) -> f64 {
    d.to_string().parse().unwrap_or(0.0)
}

fn user_type_from_str(s: &str) -> UserType {
    match s {
        "demo" => UserType::Demo,
        "strategy_provider" => UserType::StrategyProvider,
        "copy_follower" => UserType::CopyFollower,
        _ => UserType::Live,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_stop_fires_on_ask_ge_trigger() {
        // BUY_STOP: fire when ask >= trigger -> query (-inf, ask]
        let trigger = dec!(1.1000);
        let ask = dec!(1.1005);
        assert!(ask >= trigger);
    }

    #[test]
    fn buy_limit_fires_on_ask_le_trigger() {
        // BUY_LIMIT: fire when ask <= trigger -> query [ask, +inf)
        let trigger = dec!(1.1000);
        let ask = dec!(1.0995);
        assert!(ask <= trigger);
    }
}
