//! Provider Workers (component K, spec.md §4.11).
//!
//! Seven queues, one consumer each, fed by the [`super::dispatcher::Dispatcher`].
//! Every handler dedups on the provider idempotency token before touching
//! Redis, and holds `lock:user_margin:{user_type}:{user_id}` for the
//! duration of its mutation — the same discipline `ExecutionEngine` uses
//! for placement and close (§5: "a short-TTL Redis lock ... for
//! cross-process safety").

use super::types::WorkerPayload;
use crate::amqp::{self, AmqpClient};
use crate::config::{MonitorConfig, QueueConfig};
use crate::core::order_fsm::OrderState;
use crate::core::{EngineError, Order, Side, Trigger, UserType};
use crate::db_update::{DbUpdateMessage, DbUpdatePublisher, DbUpdateType};
use crate::execution::{self, CloseReason, ExecutionEngine, ProviderGateway};
use crate::margin;
use crate::quote_store::QuoteStore;
use crate::redis_store::{keys, order_codec, RedisStore};
use crate::triggers::TriggerMonitor;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 7-day dedup window for provider acks (spec.md §4.11).
const PROVIDER_IDEM_TTL_SECS: u64 = 7 * 24 * 3600;

fn user_lock_ttl() -> u64 {
    crate::config::constants::USER_MARGIN_LOCK_TTL.as_secs()
}

/// Distinguishes the three kinds of cancel ack by the lifecycle id's
/// prefix, falling back to the order's own engine status (spec.md §4.11
/// "cancel" worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelKind {
    StoplossCancel,
    TakeprofitCancel,
    PendingCancel,
}

fn classify_cancel(lifecycle_id: &str, engine_status: OrderState) -> CancelKind {
    if lifecycle_id.starts_with("SLC") {
        CancelKind::StoplossCancel
    } else if lifecycle_id.starts_with("TPC") {
        CancelKind::TakeprofitCancel
    } else if lifecycle_id.starts_with("PC") {
        CancelKind::PendingCancel
    } else {
        match engine_status {
            OrderState::StoplossCancel => CancelKind::StoplossCancel,
            OrderState::TakeprofitCancel => CancelKind::TakeprofitCancel,
            _ => CancelKind::PendingCancel,
        }
    }
}

/// Categorizes a rejection by its lifecycle-id prefix (spec.md §4.11
/// "reject" worker). Only `OrderPlacement` mutates Redis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejectKind {
    PendingModify,
    TriggerAdd,
    TriggerRemove,
    PendingCancel,
    OrderClose,
    OrderPlacement,
}

fn classify_reject(lifecycle_id: &str) -> RejectKind {
    if lifecycle_id.starts_with("MOD") {
        RejectKind::PendingModify
    } else if lifecycle_id.starts_with("SLC") || lifecycle_id.starts_with("TPC") {
        RejectKind::TriggerRemove
    } else if lifecycle_id.starts_with("SL") || lifecycle_id.starts_with("TP") {
        RejectKind::TriggerAdd
    } else if lifecycle_id.starts_with("CNL") {
        RejectKind::PendingCancel
    } else if lifecycle_id.starts_with("CLS") {
        RejectKind::OrderClose
    } else {
        RejectKind::OrderPlacement
    }
}

pub struct ProviderWorkers {
    redis: RedisStore,
    amqp: AmqpClient,
    quotes: Arc<QuoteStore>,
    queues: QueueConfig,
    strict_conversion: bool,
    execution: Arc<ExecutionEngine>,
    triggers: Arc<TriggerMonitor>,
    db_update: Arc<dyn DbUpdatePublisher>,
    pending_margin: Arc<PendingMarginMonitor>,
}

impl ProviderWorkers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis: RedisStore,
        amqp: AmqpClient,
        quotes: Arc<QuoteStore>,
        queues: QueueConfig,
        strict_conversion: bool,
        execution: Arc<ExecutionEngine>,
        triggers: Arc<TriggerMonitor>,
        db_update: Arc<dyn DbUpdatePublisher>,
        pending_margin: Arc<PendingMarginMonitor>,
    ) -> Self {
        Self {
            redis,
            amqp,
            quotes,
            queues,
            strict_conversion,
            execution,
            triggers,
            db_update,
            pending_margin,
        }
    }

    /// Spawns all seven consumer loops. Each runs until its channel
    /// drops (connection loss); the caller's supervisor restarts.
    pub async fn run_all(self: Arc<Self>) -> Result<(), EngineError> {
        let specs: [(&str, u16); 7] = [
            (&self.queues.worker_open_queue, 64),
            (&self.queues.worker_close_queue, 64),
            (&self.queues.worker_cancel_queue, 256),
            (&self.queues.worker_pending_queue, 64),
            (&self.queues.worker_reject_queue, 1),
            (&self.queues.worker_stoploss_queue, 128),
            (&self.queues.worker_takeprofit_queue, 128),
        ];

        let mut handles = Vec::with_capacity(specs.len());
        for (queue, prefetch) in specs {
            let this = self.clone();
            let queue = queue.to_string();
            handles.push(tokio::spawn(async move {
                if let Err(e) = this.run_one(&queue, prefetch).await {
                    warn!(error = ?e, queue, "provider worker consumer exited");
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        Ok(())
    }

    async fn run_one(&self, queue: &str, prefetch: u16) -> Result<(), EngineError> {
        let channel = self.amqp.channel().await?;
        self.amqp.declare_durable(&channel, queue).await?;
        let consumer = self.amqp.consume(&channel, queue, queue, prefetch).await?;

        let queue_owned = queue.to_string();
        amqp::run_consumer(consumer, |delivery| {
            let queue = queue_owned.clone();
            async move {
                let payload: Result<WorkerPayload, _> = serde_json::from_slice(&delivery.data);
                match payload {
                    Ok(payload) => {
                        if let Err(e) = self.dispatch(&queue, payload).await {
                            warn!(error = ?e, queue, "provider worker handler failed");
                        }
                    }
                    Err(e) => warn!(error = ?e, queue, "unparseable worker payload"),
                }
                let _ = amqp::ack(&delivery).await;
            }
        })
        .await;
        Ok(())
    }

    async fn dispatch(&self, queue: &str, payload: WorkerPayload) -> Result<(), EngineError> {
        if !self.claim_idempotency(&payload).await? {
            debug!(token = %payload.idempotency_token(), "duplicate provider ack, skipped");
            return Ok(());
        }

        if queue == self.queues.worker_open_queue {
            self.handle_open(payload).await
        } else if queue == self.queues.worker_close_queue {
            self.handle_close(payload).await
        } else if queue == self.queues.worker_cancel_queue {
            self.handle_cancel(payload).await
        } else if queue == self.queues.worker_pending_queue {
            self.handle_pending(payload).await
        } else if queue == self.queues.worker_reject_queue {
            self.handle_reject(payload).await
        } else if queue == self.queues.worker_stoploss_queue {
            self.handle_stoploss(payload).await
        } else if queue == self.queues.worker_takeprofit_queue {
            self.handle_takeprofit(payload).await
        } else {
            warn!(queue, "provider worker payload routed to unknown queue");
            Ok(())
        }
    }

    async fn claim_idempotency(&self, payload: &WorkerPayload) -> Result<bool, EngineError> {
        self.redis
            .set_nx_ex(&keys::provider_idem(payload.idempotency_token()), "1", PROVIDER_IDEM_TTL_SECS)
            .await
    }

    async fn with_user_lock<F, Fut>(&self, user_type: UserType, user_id: &str, f: F) -> Result<(), EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), EngineError>>,
    {
        let lock_key = keys::lock_user_margin(user_type, user_id);
        if !self.redis.set_nx_ex(&lock_key, "1", user_lock_ttl()).await? {
            // Another worker/replica holds the lock; this ack will be
            // retried on nack or a future duplicate send from the provider.
            return Ok(());
        }
        let result = f().await;
        let _ = self.redis.del(&lock_key).await;
        result
    }

    async fn load_order(&self, order_id: &str) -> Result<Option<Order>, EngineError> {
        let fields = self.redis.hgetall(&keys::order_data(order_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(order_codec::from_hash(&fields)?))
    }

    async fn publish_db(&self, msg: DbUpdateMessage) {
        if let Err(e) = self.db_update.publish(msg).await {
            warn!(error = ?e, "db_update publish failed");
        }
    }

    /// **open**: mark OPEN/EXECUTED, persist provider fields, recompute
    /// single-order margin at the executed price and user totals.
    async fn handle_open(&self, payload: WorkerPayload) -> Result<(), EngineError> {
        let Some(mut order) = self.load_order(&payload.order_id).await? else { return Ok(()) };
        let avgpx = payload.avgpx.unwrap_or(order.order_price);

        self.with_user_lock(order.user_type, &order.user_id, || async {
            order.order_price = avgpx;
            order.status = OrderState::Open;
            order.execution_status = crate::core::ExecutionStatus::Executed;

            let single_margin = margin::single_order_margin_usd(
                order.contract_size,
                order.order_quantity,
                avgpx,
                &order.profit_currency,
                order.leverage,
                order.instrument_type,
                order.crypto_margin_factor,
                &self.quotes,
                self.strict_conversion,
            )?;
            order.margin = Some(single_margin);
            order.reserved_margin = None;

            execution::persist_order(&self.redis, &order).await?;
            let open_orders = execution::load_open_orders(&self.redis, order.user_type, &order.user_id).await?;
            execution::recompute_user_margin_totals(
                &self.redis,
                &self.quotes,
                self.strict_conversion,
                order.user_type,
                &order.user_id,
                &open_orders,
            )
            .await?;

            let msg_type = if payload.pending_executed {
                DbUpdateType::OrderPendingTriggered
            } else {
                DbUpdateType::OrderOpenConfirmed
            };
            self.publish_db(
                DbUpdateMessage::new(msg_type, order.order_id.clone())
                    .with("user_id", order.user_id.clone())
                    .with("user_type", order.user_type.as_str())
                    .with("order_status", "OPEN")
                    .with("order_price", avgpx.to_string()),
            )
            .await;
            info!(order_id = %order.order_id, "provider open confirmed");
            Ok(())
        })
        .await
    }

    /// **close**: run `finalize_close`, bounded retries on transient failure.
    async fn handle_close(&self, payload: WorkerPayload) -> Result<(), EngineError> {
        let Some(mut order) = self.load_order(&payload.order_id).await? else { return Ok(()) };
        let avgpx = payload.avgpx.unwrap_or(order.order_price);

        let reason = if order.stoploss_id.is_some() && order.stoploss_cancel_id.is_none() {
            CloseReason::Stoploss
        } else if order.takeprofit_id.is_some() && order.takeprofit_cancel_id.is_none() {
            CloseReason::Takeprofit
        } else {
            CloseReason::Closed
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execution.finalize_close(&mut order, avgpx, reason).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < 3 => {
                    warn!(error = ?e, order_id = %order.order_id, attempt, "finalize_close retrying");
                }
                Err(e) => {
                    warn!(error = ?e, order_id = %order.order_id, "finalize_close failed after retries, dropping ack");
                    return Ok(());
                }
            }
        }
    }

    /// **cancel**: SL/TP cancel clears the trigger and reopens the order;
    /// pending cancel deletes the resting order.
    async fn handle_cancel(&self, payload: WorkerPayload) -> Result<(), EngineError> {
        let Some(mut order) = self.load_order(&payload.order_id).await? else { return Ok(()) };
        let kind = classify_cancel(&payload.lifecycle_id, order.status);

        self.with_user_lock(order.user_type, &order.user_id, || async {
            match kind {
                CancelKind::StoplossCancel => {
                    self.triggers.deregister(&order.order_id, &order.symbol, order.side).await?;
                    order.stop_loss = None;
                    order.stoploss_id = None;
                    order.status = OrderState::Open;
                    execution::persist_order(&self.redis, &order).await?;
                    self.publish_db(
                        DbUpdateMessage::new(DbUpdateType::OrderStoplossCancel, order.order_id.clone())
                            .with("user_id", order.user_id.clone()),
                    )
                    .await;
                }
                CancelKind::TakeprofitCancel => {
                    self.triggers.deregister(&order.order_id, &order.symbol, order.side).await?;
                    order.take_profit = None;
                    order.takeprofit_id = None;
                    order.status = OrderState::Open;
                    execution::persist_order(&self.redis, &order).await?;
                    self.publish_db(
                        DbUpdateMessage::new(DbUpdateType::OrderTakeprofitCancel, order.order_id.clone())
                            .with("user_id", order.user_id.clone()),
                    )
                    .await;
                }
                CancelKind::PendingCancel => {
                    self.redis.srem(&keys::user_orders_index(order.user_type, &order.user_id), &order.order_id).await?;
                    self.redis.del(&keys::order_data(&order.order_id)).await?;
                    self.redis.del(&keys::user_holdings(order.user_type, &order.user_id, &order.order_id)).await?;
                    self.pending_margin.deregister(&order.order_id);
                    self.publish_db(
                        DbUpdateMessage::new(DbUpdateType::OrderPendingCancel, order.order_id.clone())
                            .with("user_id", order.user_id.clone()),
                    )
                    .await;
                }
            }
            Ok(())
        })
        .await
    }

    /// **pending**: mark PENDING/PENDING, apply staged modify price,
    /// register with the Provider-Pending margin monitor.
    async fn handle_pending(&self, payload: WorkerPayload) -> Result<(), EngineError> {
        let Some(mut order) = self.load_order(&payload.order_id).await? else { return Ok(()) };

        self.with_user_lock(order.user_type, &order.user_id, || async {
            order.status = OrderState::Pending;
            order.execution_status = crate::core::ExecutionStatus::Pending;

            if let Some(staged) = self.redis.hget(&keys::order_data(&order.order_id), "pending_modify_price_user").await? {
                if let Some(price) = RedisStore::parse_decimal(&staged) {
                    order.order_price = price;
                }
                self.redis.hdel(&keys::order_data(&order.order_id), "pending_modify_price_user").await?;
            }

            execution::persist_order(&self.redis, &order).await?;
            self.pending_margin.register(PendingMarginEntry {
                order_id: order.order_id.clone(),
                user_id: order.user_id.clone(),
                user_type: order.user_type,
                symbol: order.symbol.clone(),
                side: order.side,
                half_spread: order.half_spread,
                order_quantity: order.order_quantity,
                contract_size: order.contract_size,
                profit_currency: order.profit_currency.clone(),
                leverage: order.leverage,
                instrument_type: order.instrument_type,
                crypto_margin_factor: order.crypto_margin_factor,
            });

            self.publish_db(
                DbUpdateMessage::new(DbUpdateType::OrderPendingConfirmed, order.order_id.clone())
                    .with("user_id", order.user_id.clone())
                    .with("order_price", order.order_price.to_string()),
            )
            .await;
            Ok(())
        })
        .await
    }

    /// **reject**: only `OrderPlacement` rejections mutate Redis.
    async fn handle_reject(&self, payload: WorkerPayload) -> Result<(), EngineError> {
        let kind = classify_reject(&payload.lifecycle_id);

        self.publish_db(
            DbUpdateMessage::new(DbUpdateType::OrderRejectionRecord, payload.order_id.clone())
                .with("user_id", payload.user_id.clone())
                .with("lifecycle_id", payload.lifecycle_id.clone())
                .with("kind", format!("{kind:?}")),
        )
        .await;

        if kind != RejectKind::OrderPlacement {
            return Ok(());
        }

        let Some(mut order) = self.load_order(&payload.order_id).await? else { return Ok(()) };
        self.with_user_lock(order.user_type, &order.user_id, || async {
            order.status = OrderState::Rejected;
            order.execution_status = crate::core::ExecutionStatus::Rejected;
            order.reserved_margin = None;
            execution::persist_order(&self.redis, &order).await?;

            self.redis.srem(&keys::user_orders_index(order.user_type, &order.user_id), &order.order_id).await?;
            let open_orders = execution::load_open_orders(&self.redis, order.user_type, &order.user_id).await?;
            execution::recompute_user_margin_totals(
                &self.redis,
                &self.quotes,
                self.strict_conversion,
                order.user_type,
                &order.user_id,
                &open_orders,
            )
            .await?;

            let holders_key = keys::symbol_holders(&order.symbol, order.user_type);
            let still_holding = open_orders.iter().any(|o| o.symbol == order.symbol);
            if !still_holding {
                self.redis.srem(&holders_key, &format!("{}:{}", order.user_type, order.user_id)).await?;
            }

            self.publish_db(
                DbUpdateMessage::new(DbUpdateType::OrderRejected, order.order_id.clone())
                    .with("user_id", order.user_id.clone()),
            )
            .await;
            Ok(())
        })
        .await
    }

    /// **stoploss**/**takeprofit**: convert the provider's `avgpx` back to
    /// a user-facing price (spec.md §4.11: subtract half-spread direction,
    /// add for SELL, subtract for BUY).
    async fn handle_stoploss(&self, payload: WorkerPayload) -> Result<(), EngineError> {
        self.handle_trigger_ack(payload, true).await
    }

    async fn handle_takeprofit(&self, payload: WorkerPayload) -> Result<(), EngineError> {
        self.handle_trigger_ack(payload, false).await
    }

    async fn handle_trigger_ack(&self, payload: WorkerPayload, is_stoploss: bool) -> Result<(), EngineError> {
        let Some(mut order) = self.load_order(&payload.order_id).await? else { return Ok(()) };
        let avgpx = payload.avgpx.unwrap_or(order.order_price);
        let user_price = match order.side {
            Side::Sell => avgpx + order.half_spread,
            Side::Buy => avgpx - order.half_spread,
        };

        self.with_user_lock(order.user_type, &order.user_id, || async {
            if is_stoploss {
                order.stop_loss = Some(user_price);
                order.status = OrderState::Stoploss;
            } else {
                order.take_profit = Some(user_price);
                order.status = OrderState::Takeprofit;
            }
            execution::persist_order(&self.redis, &order).await?;

            self.triggers
                .register(&Trigger {
                    order_id: order.order_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    user_type: order.user_type,
                    user_id: order.user_id.clone(),
                    stop_loss: order.stop_loss,
                    take_profit: order.take_profit,
                    score_sl: order.stop_loss,
                    score_tp: order.take_profit,
                })
                .await?;

            let msg_type = if is_stoploss { DbUpdateType::OrderStoplossAcked } else { DbUpdateType::OrderTakeprofitAcked };
            self.publish_db(
                DbUpdateMessage::new(msg_type, order.order_id.clone())
                    .with("user_id", order.user_id.clone())
                    .with("price", user_price.to_string()),
            )
            .await;
            Ok(())
        })
        .await
    }
}

/// One resting provider-routed pending order tracked by
/// [`PendingMarginMonitor`].
#[derive(Debug, Clone)]
struct PendingMarginEntry {
    order_id: String,
    user_id: String,
    user_type: UserType,
    symbol: String,
    side: Side,
    half_spread: Decimal,
    order_quantity: Decimal,
    contract_size: Decimal,
    profit_currency: String,
    leverage: Decimal,
    instrument_type: crate::core::InstrumentType,
    crypto_margin_factor: Option<Decimal>,
}

/// Provider-Pending margin monitor (spec.md §4.11 closing paragraph):
/// every 500 ms, recomputes a margin preview for each registered pending
/// order and cancels it with the provider if the preview now exceeds the
/// user's free margin.
pub struct PendingMarginMonitor {
    redis: RedisStore,
    quotes: Arc<QuoteStore>,
    provider: Arc<dyn ProviderGateway>,
    strict_conversion: bool,
    tick: Duration,
    entries: DashMap<String, PendingMarginEntry>,
}

impl PendingMarginMonitor {
    pub fn new(
        redis: RedisStore,
        quotes: Arc<QuoteStore>,
        provider: Arc<dyn ProviderGateway>,
        strict_conversion: bool,
        monitors: &MonitorConfig,
    ) -> Self {
        Self {
            redis,
            quotes,
            provider,
            strict_conversion,
            tick: Duration::from_millis(monitors.provider_pending_tick_ms),
            entries: DashMap::new(),
        }
    }

    fn register(&self, entry: PendingMarginEntry) {
        self.entries.insert(entry.order_id.clone(), entry);
    }

    fn deregister(&self, order_id: &str) {
        self.entries.remove(order_id);
    }

    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.tick);
        loop {
            tick.tick().await;
            let snapshot: Vec<PendingMarginEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
            for entry in snapshot {
                if let Err(e) = self.check_entry(&entry).await {
                    warn!(error = ?e, order_id = %entry.order_id, "provider-pending margin check failed");
                }
            }
        }
    }

    async fn check_entry(&self, entry: &PendingMarginEntry) -> Result<(), EngineError> {
        let Some(quote) = self.quotes.get(&entry.symbol) else { return Ok(()) };
        let Some(ask) = quote.ask else { return Ok(()) };
        let preview_price = ask + entry.half_spread;

        let preview_margin = margin::single_order_margin_usd(
            entry.contract_size,
            entry.order_quantity,
            preview_price,
            &entry.profit_currency,
            entry.leverage,
            entry.instrument_type,
            entry.crypto_margin_factor,
            &self.quotes,
            self.strict_conversion,
        )?;

        let free_margin = self
            .redis
            .hget(&keys::user_portfolio(entry.user_type, &entry.user_id), "free_margin")
            .await?
            .and_then(|v| RedisStore::parse_decimal(&v))
            .unwrap_or(Decimal::ZERO);

        if preview_margin <= free_margin {
            return Ok(());
        }

        let sentinel = keys::provider_ack(&format!("pending_cancel_sent:{}", entry.order_id));
        if !self.redis.set_nx_ex(&sentinel, "1", self.tick.as_secs().max(1) * 10).await? {
            return Ok(()); // cancel already sent, awaiting the provider's ack
        }

        let cancel_id = format!("PC{}", Uuid::new_v4());
        self.provider.send_cancel(&cancel_id, &entry.order_id).await?;
        info!(order_id = %entry.order_id, cancel_id, "provider-pending margin insufficient, cancel sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_cancel_by_lifecycle_prefix() {
        assert_eq!(classify_cancel("SLC-abc", OrderState::Open), CancelKind::StoplossCancel);
        assert_eq!(classify_cancel("TPC-abc", OrderState::Open), CancelKind::TakeprofitCancel);
        assert_eq!(classify_cancel("PC-abc", OrderState::Open), CancelKind::PendingCancel);
    }

    #[test]
    fn falls_back_to_engine_status_without_recognized_prefix() {
        assert_eq!(classify_cancel("xyz", OrderState::StoplossCancel), CancelKind::StoplossCancel);
        assert_eq!(classify_cancel("xyz", OrderState::Open), CancelKind::PendingCancel);
    }

    #[test]
    fn classifies_reject_by_lifecycle_prefix() {
        assert_eq!(classify_reject("MOD-1"), RejectKind::PendingModify);
        assert_eq!(classify_reject("SLC-1"), RejectKind::TriggerRemove);
        assert_eq!(classify_reject("SL-1"), RejectKind::TriggerAdd);
        assert_eq!(classify_reject("CNL-1"), RejectKind::PendingCancel);
        assert_eq!(classify_reject("CLS-1"), RejectKind::OrderClose);
        assert_eq!(classify_reject("abc"), RejectKind::OrderPlacement);
    }
}
