//! Order Execution Engine (component F, spec.md §4.3) and Order Closer
//! (§4.4).
//!
//! `ExecutionEngine` owns the per-user process-local mutex table the
//! design notes call for (§5 concurrency model: "a per-user mutex guards
//! the read-compute-write margin sequence"), and is the only writer of
//! `order_data` during placement and close.

pub mod commission;
pub mod types;

pub use types::{
    CloseOrderRequest, CloseOrderResponse, CloseReason, ExecuteInstantOrderRequest,
    ExecuteInstantOrderResponse, ExecutionFlow, ProviderSendPayload,
};

use crate::core::{
    order_fsm, ConfigError, EngineError, ExecutionStatus, MarginError, Order, OrderEvent,
    OrderState, PricingError, Side, StateError, UserConfig, UserType, ValidationError,
};
use crate::db_update::{DbUpdateMessage, DbUpdatePublisher, DbUpdateType};
use crate::margin;
use crate::quote_store::{now_ms, QuoteLookup, QuoteStore};
use crate::redis_store::{keys, order_codec, RedisStore};
use crate::stores::{GroupConfigStore, UserConfigStore};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of waiting on a provider acknowledgement for a given
/// lifecycle id (spec.md §4.4 cancel/close waits).
#[derive(Debug, Clone)]
pub enum ProviderOutcome {
    Executed { avgpx: Decimal },
    Rejected,
    Cancelled,
}

/// Abstraction over the Provider Connection (component I), so the
/// execution engine can be exercised without a live socket. The real
/// implementation lives in [`crate::provider`].
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    async fn send_order(&self, payload: ProviderSendPayload) -> Result<(), EngineError>;
    async fn send_cancel(&self, cancel_id: &str, target_lifecycle_id: &str) -> Result<(), EngineError>;
    async fn send_close(&self, close_id: &str, order_id: &str) -> Result<(), EngineError>;
    async fn await_outcome(
        &self,
        lifecycle_id: &str,
        deadline: Duration,
    ) -> Result<ProviderOutcome, EngineError>;
}

/// Collaborator seam every monitor (triggers, pending, auto-cutoff)
/// dispatches closes through, so none of them depend on the full
/// execution engine type.
#[async_trait]
pub trait OrderCloser: Send + Sync {
    async fn close_order(&self, order_id: &str, reason: CloseReason) -> Result<CloseOrderResponse, EngineError>;
}

/// Loads every non-terminal order for a user (spec.md §4.3 step 8's
/// "recompute user totals"). Shared between placement/close here and
/// the provider workers (open/close/reject all recompute totals the
/// same way after mutating one order).
pub(crate) async fn load_open_orders(
    redis: &RedisStore,
    user_type: UserType,
    user_id: &str,
) -> Result<Vec<Order>, EngineError> {
    let index_key = keys::user_orders_index(user_type, user_id);
    let order_ids = redis.smembers(&index_key).await?;
    let mut orders = Vec::with_capacity(order_ids.len());
    for order_id in order_ids {
        let fields = redis.hgetall(&keys::order_data(&order_id)).await?;
        if fields.is_empty() {
            continue;
        }
        if let Ok(order) = order_codec::from_hash(&fields) {
            if !order_fsm::is_terminal(order.status) {
                orders.push(order);
            }
        }
    }
    Ok(orders)
}

/// Recomputes `used_margin_executed`/`used_margin_all` from the current
/// open-order set and writes them onto `user_portfolio:{...}`. Callers
/// pass `orders` already reflecting whatever mutation they just made
/// (an order added, removed, or re-priced).
pub(crate) async fn recompute_user_margin_totals(
    redis: &RedisStore,
    quotes: &QuoteStore,
    strict_conversion: bool,
    user_type: UserType,
    user_id: &str,
    orders: &[Order],
) -> Result<(Decimal, Decimal), EngineError> {
    let used_margin_executed = margin::user_total_margin(orders, quotes, strict_conversion, false)?;
    let used_margin_all = margin::user_total_margin(orders, quotes, strict_conversion, true)?;
    redis
        .hset_all(
            &keys::user_portfolio(user_type, user_id),
            &[
                ("used_margin_executed", used_margin_executed.to_string()),
                ("used_margin_all", used_margin_all.to_string()),
            ],
        )
        .await?;
    Ok((used_margin_executed, used_margin_all))
}

pub(crate) async fn persist_order(redis: &RedisStore, order: &Order) -> Result<(), EngineError> {
    let fields = order_codec::to_fields(order)?;
    redis.hset_all(&keys::order_data(&order.order_id), &fields).await
}

/// See [`ExecutionEngine::register_lifecycle_id`] for why every
/// post-placement lifecycle id needs this.
pub(crate) async fn register_lifecycle_id(
    redis: &RedisStore,
    lifecycle_id: &str,
    canonical_order_id: &str,
) -> Result<(), EngineError> {
    redis
        .hset_all(&keys::global_order_lookup(lifecycle_id), &[("order_id", canonical_order_id.to_string())])
        .await
}

pub struct ExecutionEngine {
    redis: RedisStore,
    quotes: Arc<QuoteStore>,
    user_configs: Arc<dyn UserConfigStore>,
    group_configs: Arc<dyn GroupConfigStore>,
    provider: Arc<dyn ProviderGateway>,
    db_update: Arc<dyn DbUpdatePublisher>,
    strict_conversion: bool,
    quote_staleness_ms: i64,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis: RedisStore,
        quotes: Arc<QuoteStore>,
        user_configs: Arc<dyn UserConfigStore>,
        group_configs: Arc<dyn GroupConfigStore>,
        provider: Arc<dyn ProviderGateway>,
        db_update: Arc<dyn DbUpdatePublisher>,
        strict_conversion: bool,
        quote_staleness_ms: i64,
    ) -> Self {
        Self {
            redis,
            quotes,
            user_configs,
            group_configs,
            provider,
            db_update,
            strict_conversion,
            quote_staleness_ms,
            user_locks: DashMap::new(),
        }
    }

    fn user_lock(&self, user_type: UserType, user_id: &str) -> Arc<Mutex<()>> {
        let key = format!("{}:{}", user_type, user_id);
        self.user_locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// `execute_instant_order` (spec.md §4.3).
    pub async fn execute_instant_order(
        &self,
        req: ExecuteInstantOrderRequest,
    ) -> Result<ExecuteInstantOrderResponse, EngineError> {
        self.validate_shape(&req)?;

        let user_cfg = self
            .user_configs
            .get(req.user_type, &req.user_id)
            .await?
            .ok_or_else(|| EngineError::Config(ConfigError::UserConfigNotFound(req.user_id.clone())))?;
        if !user_cfg.is_verified() {
            return Err(EngineError::Validation(ValidationError::UserNotVerified));
        }
        if user_cfg.leverage <= Decimal::ZERO {
            return Err(EngineError::Validation(ValidationError::InvalidLeverage(
                user_cfg.leverage.to_string(),
            )));
        }

        if let Some(key) = &req.idempotency_key {
            if let Some(replay) = self.check_idempotency(req.user_type, &req.user_id, key).await? {
                return Ok(replay);
            }
        }

        let group_cfg = self
            .group_configs
            .get(&user_cfg.group, &req.symbol)
            .await?
            .ok_or_else(|| EngineError::Config(ConfigError::MissingGroupData {
                group: user_cfg.group.clone(),
                symbol: req.symbol.clone(),
            }))?;

        let flow = self.resolve_flow(&user_cfg);

        let exec_price = self.determine_exec_price(&req, &flow)?;
        let half_spread = group_cfg.half_spread();
        let contract_value = req.order_quantity * group_cfg.contract_size * exec_price;

        let single_margin = margin::single_order_margin_for_group(
            &group_cfg,
            req.order_quantity,
            exec_price,
            user_cfg.leverage,
            &self.quotes,
            self.strict_conversion,
        )?;

        let balance = user_cfg
            .wallet_balance
            .ok_or_else(|| EngineError::Validation(ValidationError::MissingFields("wallet_balance".to_string())))?;
        let used_margin_all_cached = self.cached_used_margin_all(req.user_type, &req.user_id).await?;
        let free_margin = balance - used_margin_all_cached;
        if free_margin < single_margin {
            return Err(EngineError::Margin(MarginError::InsufficientMargin {
                required: single_margin.to_string(),
                available: free_margin.to_string(),
            }));
        }

        let order_id = req.order_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let (status, execution_status) = match flow {
            ExecutionFlow::Local => (OrderState::Open, ExecutionStatus::Executed),
            ExecutionFlow::Provider => (OrderState::Queued, ExecutionStatus::Queued),
        };

        let commission_entry = if matches!(flow, ExecutionFlow::Local) {
            commission::compute_commission(
                group_cfg.commission_rate,
                &group_cfg.commission_value_type,
                req.order_quantity,
                exec_price,
                group_cfg.contract_size,
            )
        } else {
            Decimal::ZERO
        };

        let order = Order {
            order_id: order_id.clone(),
            user_id: req.user_id.clone(),
            user_type: req.user_type,
            symbol: req.symbol.clone(),
            side: req.side,
            order_quantity: req.order_quantity,
            order_price: exec_price,
            status,
            execution_status,
            raw_price: Some(req.order_price),
            half_spread,
            contract_value,
            margin: if matches!(flow, ExecutionFlow::Local) { Some(single_margin) } else { None },
            reserved_margin: if matches!(flow, ExecutionFlow::Provider) { Some(single_margin) } else { None },
            commission_entry,
            commission_exit: Decimal::ZERO,
            swap: Decimal::ZERO,
            profit_usd: None,
            net_profit: None,
            close_price: None,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            close_id: None,
            cancel_id: None,
            modify_id: None,
            stoploss_id: None,
            takeprofit_id: None,
            stoploss_cancel_id: None,
            takeprofit_cancel_id: None,
            group: user_cfg.group.clone(),
            profit_currency: group_cfg.profit_currency.clone(),
            contract_size: group_cfg.contract_size,
            instrument_type: group_cfg.instrument_type,
            crypto_margin_factor: group_cfg.crypto_margin_factor,
            commission_rate: group_cfg.commission_rate,
            commission_value_type: group_cfg.commission_value_type.clone(),
            group_margin: group_cfg.group_margin,
            leverage: user_cfg.leverage,
            pending_local: req.pending_local,
        };

        self.place_order_locked(&user_cfg, order.clone()).await?;

        if matches!(flow, ExecutionFlow::Local) {
            let msg_type = if req.pending_local {
                DbUpdateType::OrderPendingTriggered
            } else {
                DbUpdateType::OrderOpenConfirmed
            };
            let msg = DbUpdateMessage::new(msg_type, order_id.clone())
                .with("user_id", order.user_id.clone())
                .with("user_type", order.user_type.as_str())
                .with("order_status", "OPEN")
                .with("order_price", exec_price.to_string());
            if let Err(e) = self.db_update.publish(msg).await {
                warn!(error = ?e, order_id = %order_id, "db_update publish failed");
            }
        }

        let provider_send_payload = match flow {
            ExecutionFlow::Provider => Some(ProviderSendPayload {
                order_id: order_id.clone(),
                symbol: req.symbol.clone(),
                order_type: req.side.to_string(),
                order_price: exec_price,
                contract_value,
                status: "OPEN".to_string(),
            }),
            ExecutionFlow::Local => None,
        };

        let response = ExecuteInstantOrderResponse {
            order_id: order_id.clone(),
            status,
            exec_price,
            margin: order.margin,
            reserved_margin: order.reserved_margin,
            provider_send_payload,
        };

        if let Some(key) = &req.idempotency_key {
            self.store_idempotency_result(req.user_type, &req.user_id, key, &response).await?;
        }

        Ok(response)
    }

    fn validate_shape(&self, req: &ExecuteInstantOrderRequest) -> Result<(), EngineError> {
        if req.order_price <= Decimal::ZERO {
            return Err(EngineError::Validation(ValidationError::InvalidNumericFields {
                field: "order_price".to_string(),
                reason: "must be positive".to_string(),
            }));
        }
        if req.order_quantity <= Decimal::ZERO {
            return Err(EngineError::Validation(ValidationError::InvalidNumericFields {
                field: "order_quantity".to_string(),
                reason: "must be positive".to_string(),
            }));
        }
        if req.order_status != OrderState::Open {
            return Err(EngineError::Validation(ValidationError::InvalidOrderType(
                "order_status must be OPEN".to_string(),
            )));
        }
        Ok(())
    }

    fn resolve_flow(&self, user_cfg: &UserConfig) -> ExecutionFlow {
        if user_cfg.uses_local_flow() {
            ExecutionFlow::Local
        } else {
            ExecutionFlow::Provider
        }
    }

    fn determine_exec_price(
        &self,
        req: &ExecuteInstantOrderRequest,
        flow: &ExecutionFlow,
    ) -> Result<Decimal, EngineError> {
        if req.pending_local {
            // Already priced by the Pending Monitor at ask + half_spread.
            return Ok(req.order_price);
        }
        match flow {
            ExecutionFlow::Provider => Ok(req.order_price),
            ExecutionFlow::Local => {
                let quote = match self.quotes.get_checked(&req.symbol, now_ms()) {
                    QuoteLookup::Fresh(q) => q,
                    QuoteLookup::Stale(_) => {
                        return Err(EngineError::Pricing(PricingError::StaleQuote {
                            symbol: req.symbol.clone(),
                            age_ms: self.quote_staleness_ms as u64,
                        }))
                    }
                    QuoteLookup::Unknown => {
                        return Err(EngineError::Pricing(PricingError::NoQuote(req.symbol.clone())))
                    }
                };
                let raw = match req.side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                }
                .ok_or_else(|| EngineError::Pricing(PricingError::NoQuote(req.symbol.clone())))?;
                Ok(raw)
            }
        }
    }

    async fn cached_used_margin_all(&self, user_type: UserType, user_id: &str) -> Result<Decimal, EngineError> {
        let key = keys::user_portfolio(user_type, user_id);
        match self.redis.hget(&key, "used_margin_all").await? {
            Some(raw) => Ok(RedisStore::parse_decimal(&raw).unwrap_or(Decimal::ZERO)),
            None => Ok(Decimal::ZERO),
        }
    }

    /// Step 8: per-user mutex, recompute totals, atomic placement,
    /// index bookkeeping.
    async fn place_order_locked(&self, user_cfg: &UserConfig, order: Order) -> Result<(), EngineError> {
        let lock = self.user_lock(order.user_type, &order.user_id);
        let _guard = lock.lock().await;

        let mut existing = self.load_open_orders(order.user_type, &order.user_id).await?;
        existing.push(order.clone());

        let (used_margin_executed, used_margin_all) = (
            margin::user_total_margin(&existing, &self.quotes, self.strict_conversion, false)?,
            margin::user_total_margin(&existing, &self.quotes, self.strict_conversion, true)?,
        );

        let order_key = keys::order_data(&order.order_id);
        let portfolio_key = keys::user_portfolio(order.user_type, &order.user_id);
        let fields = order_codec::to_fields(&order)?;

        let placed = self
            .redis
            .place_order_atomic(&order_key, &fields, &portfolio_key, used_margin_executed, used_margin_all)
            .await;

        match placed {
            Ok(true) => {}
            Ok(false) => return Err(EngineError::State(StateError::OrderExists(order.order_id.clone()))),
            Err(e) => {
                warn!(error = ?e, order_id = %order.order_id, "atomic placement failed, falling back to non-atomic sequence");
                self.redis.hset_all(&order_key, &fields).await?;
                self.redis
                    .hset_all(
                        &portfolio_key,
                        &[
                            ("used_margin_executed", used_margin_executed.to_string()),
                            ("used_margin_all", used_margin_all.to_string()),
                        ],
                    )
                    .await?;
            }
        }

        let index_key = keys::user_orders_index(order.user_type, &order.user_id);
        self.redis.sadd(&index_key, &order.order_id).await?;
        let holders_key = keys::symbol_holders(&order.symbol, order.user_type);
        self.redis
            .sadd(&holders_key, &format!("{}:{}", order.user_type, order.user_id))
            .await?;
        self.redis
            .hset_all(&keys::global_order_lookup(&order.order_id), &[("order_id", order.order_id.clone())])
            .await?;

        let _ = user_cfg;
        info!(order_id = %order.order_id, status = %order.status, "order placed");
        Ok(())
    }

    async fn load_open_orders(&self, user_type: UserType, user_id: &str) -> Result<Vec<Order>, EngineError> {
        load_open_orders(&self.redis, user_type, user_id).await
    }

    async fn check_idempotency(
        &self,
        user_type: UserType,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ExecuteInstantOrderResponse>, EngineError> {
        let idem_key = keys::idempotency(user_type, user_id, key);
        if self.redis.set_nx_ex(&idem_key, "processing", 60).await? {
            return Ok(None);
        }
        match self.redis.get(&idem_key).await? {
            Some(raw) if raw == "processing" => {
                Err(EngineError::State(StateError::IdempotencyInProgress))
            }
            Some(raw) => {
                let mut replay: ExecuteInstantOrderResponse = serde_json::from_str(&raw)
                    .map_err(|e| EngineError::Infra(crate::core::InfraError::Redis(e.to_string())))?;
                // Sanitized per spec.md §4.3 step 10: a replay must never re-trigger a provider send.
                replay.provider_send_payload = None;
                Ok(Some(replay))
            }
            None => Ok(None),
        }
    }

    async fn store_idempotency_result(
        &self,
        user_type: UserType,
        user_id: &str,
        key: &str,
        response: &ExecuteInstantOrderResponse,
    ) -> Result<(), EngineError> {
        let idem_key = keys::idempotency(user_type, user_id, key);
        let json = serde_json::to_string(response)
            .map_err(|e| EngineError::Infra(crate::core::InfraError::Redis(e.to_string())))?;
        self.redis.set_ex(&idem_key, &json, 300).await
    }

    /// `close_order` (spec.md §4.4).
    pub async fn close_order_impl(
        &self,
        order_id: &str,
        reason: CloseReason,
    ) -> Result<CloseOrderResponse, EngineError> {
        let fields = self.redis.hgetall(&keys::order_data(order_id)).await?;
        if fields.is_empty() {
            return Err(EngineError::State(StateError::UserNotFound(order_id.to_string())));
        }
        let mut order = order_codec::from_hash(&fields)?;

        if order.status == OrderState::Closed {
            return Err(EngineError::State(StateError::InvalidCloseStatus(
                order_id.to_string(),
                "already closed".to_string(),
            )));
        }

        let user_cfg = self
            .user_configs
            .get(order.user_type, &order.user_id)
            .await?
            .ok_or_else(|| EngineError::Config(ConfigError::UserConfigNotFound(order.user_id.clone())))?;
        let local = user_cfg.uses_local_flow();

        if local {
            self.close_local(&mut order, reason).await
        } else {
            self.close_provider(&mut order, reason).await
        }
    }

    async fn close_local(&self, order: &mut Order, reason: CloseReason) -> Result<CloseOrderResponse, EngineError> {
        let quote = self
            .quotes
            .get(&order.symbol)
            .ok_or_else(|| EngineError::Pricing(PricingError::NoQuote(order.symbol.clone())))?;
        let raw = match order.side {
            Side::Buy => quote.bid,
            Side::Sell => quote.ask,
        }
        .ok_or_else(|| EngineError::Pricing(PricingError::NoQuote(order.symbol.clone())))?;

        // Half-spread applied in the opposite direction of open.
        let close_price = match order.side {
            Side::Buy => raw - order.half_spread,
            Side::Sell => raw + order.half_spread,
        };

        let commission_exit = commission::compute_commission(
            order.commission_rate,
            &order.commission_value_type,
            order.order_quantity,
            close_price,
            order.contract_size,
        );

        let diff = match order.side {
            Side::Buy => close_price - order.order_price,
            Side::Sell => order.order_price - close_price,
        };
        let pnl_native = diff * order.order_quantity * order.contract_size;
        let profit_usd = margin::convert_to_usd(
            pnl_native,
            &order.profit_currency,
            &self.quotes,
            self.strict_conversion,
        )?;
        let net_profit = profit_usd - order.commission_entry - commission_exit + order.swap;

        order.close_price = Some(close_price);
        order.commission_exit = commission_exit;
        order.profit_usd = Some(profit_usd);
        order.net_profit = Some(net_profit);
        order.status = order_fsm::transition(order.status, OrderEvent::CloseConfirmed)
            .unwrap_or(OrderState::Closed);

        self.finalize_close_records(order).await?;
        self.publish_close_confirmed(order, reason).await;

        Ok(CloseOrderResponse {
            order_id: order.order_id.clone(),
            close_price,
            net_profit,
            close_message: reason.as_str(),
        })
    }

    async fn close_provider(&self, order: &mut Order, reason: CloseReason) -> Result<CloseOrderResponse, EngineError> {
        let had_attachments = order.stoploss_id.is_some() || order.takeprofit_id.is_some();

        if let Some(sl_id) = order.stoploss_id.clone() {
            let cancel_id = Uuid::new_v4().to_string();
            self.register_lifecycle_id(&cancel_id, &order.order_id).await?;
            self.provider.send_cancel(&cancel_id, &sl_id).await?;
            match self.provider.await_outcome(&sl_id, Duration::from_secs(5)).await {
                Ok(ProviderOutcome::Rejected) => {
                    return Err(EngineError::External(crate::core::ExternalError::CancelAckTimeout))
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
            order.stoploss_cancel_id = Some(cancel_id);
        }
        if let Some(tp_id) = order.takeprofit_id.clone() {
            let cancel_id = Uuid::new_v4().to_string();
            self.register_lifecycle_id(&cancel_id, &order.order_id).await?;
            self.provider.send_cancel(&cancel_id, &tp_id).await?;
            match self.provider.await_outcome(&tp_id, Duration::from_secs(5)).await {
                Ok(ProviderOutcome::Rejected) => {
                    return Err(EngineError::External(crate::core::ExternalError::CancelAckTimeout))
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
            order.takeprofit_cancel_id = Some(cancel_id);
        }

        let close_id = Uuid::new_v4().to_string();
        order.close_id = Some(close_id.clone());
        self.register_lifecycle_id(&close_id, &order.order_id).await?;
        order.status = OrderState::Closed; // pre-emptive, steers dispatcher routing
        self.persist_order(order).await?;
        self.provider.send_close(&close_id, &order.order_id).await?;

        if !had_attachments {
            return Ok(CloseOrderResponse {
                order_id: order.order_id.clone(),
                close_price: order.close_price.unwrap_or(order.order_price),
                net_profit: order.net_profit.unwrap_or(Decimal::ZERO),
                close_message: reason.as_str(),
            });
        }

        match self.provider.await_outcome(&close_id, Duration::from_secs(8)).await {
            Ok(ProviderOutcome::Executed { avgpx }) => self.finalize_close(order, avgpx, reason).await,
            Ok(ProviderOutcome::Rejected) => {
                Err(EngineError::External(crate::core::ExternalError::CloseAckTimeout))
            }
            Ok(ProviderOutcome::Cancelled) => {
                Err(EngineError::State(StateError::InvalidCloseStatus(
                    order.order_id.clone(),
                    "cancelled".to_string(),
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// `finalize_close`, invoked either synchronously (closer waited)
    /// or by `worker_close` on a later provider `EXECUTED` ack.
    pub async fn finalize_close(
        &self,
        order: &mut Order,
        avgpx: Decimal,
        reason: CloseReason,
    ) -> Result<CloseOrderResponse, EngineError> {
        let commission_exit = commission::compute_commission(
            order.commission_rate,
            &order.commission_value_type,
            order.order_quantity,
            avgpx,
            order.contract_size,
        );
        let diff = match order.side {
            Side::Buy => avgpx - order.order_price,
            Side::Sell => order.order_price - avgpx,
        };
        let pnl_native = diff * order.order_quantity * order.contract_size;
        let profit_usd = margin::convert_to_usd(
            pnl_native,
            &order.profit_currency,
            &self.quotes,
            self.strict_conversion,
        )?;
        let net_profit = profit_usd - order.commission_entry - commission_exit + order.swap;

        order.close_price = Some(avgpx);
        order.commission_exit = commission_exit;
        order.profit_usd = Some(profit_usd);
        order.net_profit = Some(net_profit);
        order.status = OrderState::Closed;

        self.finalize_close_records(order).await?;
        self.publish_close_confirmed(order, reason).await;

        Ok(CloseOrderResponse {
            order_id: order.order_id.clone(),
            close_price: avgpx,
            net_profit,
            close_message: reason.as_str(),
        })
    }

    async fn publish_close_confirmed(&self, order: &Order, reason: CloseReason) {
        let msg = DbUpdateMessage::new(DbUpdateType::OrderCloseConfirmed, order.order_id.clone())
            .with("user_id", order.user_id.clone())
            .with("user_type", order.user_type.as_str())
            .with("order_status", "CLOSED")
            .with("close_price", order.close_price.unwrap_or_default().to_string())
            .with("net_profit", order.net_profit.unwrap_or_default().to_string())
            .with("commission_entry", order.commission_entry.to_string())
            .with("commission_exit", order.commission_exit.to_string())
            .with("profit_usd", order.profit_usd.unwrap_or_default().to_string())
            .with("swap", order.swap.to_string())
            .with("close_message", reason.as_str());
        if let Err(e) = self.db_update.publish(msg).await {
            warn!(error = ?e, order_id = %order.order_id, "db_update publish failed");
        }
    }

    async fn persist_order(&self, order: &Order) -> Result<(), EngineError> {
        persist_order(&self.redis, order).await
    }

    /// Every lifecycle id minted after the initial placement (close,
    /// cancel, stoploss/takeprofit set) must resolve back to the
    /// canonical order through `global_order_lookup` (spec.md §4.10 step
    /// 2), since the dispatcher only ever sees the provider's echo of
    /// that id, never the canonical order id itself.
    async fn register_lifecycle_id(&self, lifecycle_id: &str, canonical_order_id: &str) -> Result<(), EngineError> {
        register_lifecycle_id(&self.redis, lifecycle_id, canonical_order_id).await
    }

    /// Removes the closed order from the live indexes and recomputes
    /// margin totals for the remaining open orders.
    async fn finalize_close_records(&self, order: &Order) -> Result<(), EngineError> {
        self.persist_order(order).await?;

        let index_key = keys::user_orders_index(order.user_type, &order.user_id);
        let remaining: Vec<Order> = self
            .load_open_orders(order.user_type, &order.user_id)
            .await?
            .into_iter()
            .filter(|o| o.order_id != order.order_id)
            .collect();

        recompute_user_margin_totals(
            &self.redis,
            &self.quotes,
            self.strict_conversion,
            order.user_type,
            &order.user_id,
            &remaining,
        )
        .await?;

        // Order stays removed from the active index only once truly
        // closed; still-open holders of the symbol are recomputed by
        // the next symbol_holders scan rather than here.
        if remaining.iter().all(|o| o.order_id != order.order_id) {
            self.redis.srem(&index_key, &order.order_id).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl OrderCloser for ExecutionEngine {
    async fn close_order(&self, order_id: &str, reason: CloseReason) -> Result<CloseOrderResponse, EngineError> {
        self.close_order_impl(order_id, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn commission_uses_stored_rate_and_value_type() {
        let mut order = test_order();
        order.commission_rate = dec!(7);
        order.commission_value_type = "money".into();
        let c = commission::compute_commission(
            order.commission_rate,
            &order.commission_value_type,
            dec!(2),
            order.order_price,
            order.contract_size,
        );
        assert_eq!(c, dec!(14));
    }

    fn test_order() -> Order {
        Order {
            order_id: "o1".into(),
            user_id: "u1".into(),
            user_type: UserType::Live,
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_quantity: dec!(1),
            order_price: dec!(1.1),
            status: OrderState::Open,
            execution_status: ExecutionStatus::Executed,
            raw_price: None,
            half_spread: dec!(0.0001),
            contract_value: dec!(100000),
            margin: Some(dec!(100)),
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
            instrument_type: crate::core::InstrumentType::Fx,
            crypto_margin_factor: None,
            commission_rate: dec!(0),
            commission_value_type: "money".into(),
            group_margin: Some(dec!(1.0)),
            leverage: dec!(100),
            pending_local: false,
        }
    }
}
