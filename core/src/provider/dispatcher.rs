//! Dispatcher (component J, spec.md §4.10).
//!
//! Consumes `confirmation_queue`, the canonicalized execution reports the
//! Provider Connection publishes off the wire. Every report is routed to
//! exactly one provider worker queue by crossing the canonical order's
//! `order_data.status` against the report's `ord_status`; anything the
//! table doesn't recognize, or whose order record is gone, goes to
//! `confirmation_dlq` instead of being dropped silently.

use crate::amqp::{self, AmqpClient};
use crate::config::QueueConfig;
use crate::core::order_fsm::OrderState;
use crate::core::{EngineError, Order};
use crate::monitoring::metrics::MetricsRegistry;
use crate::redis_store::{keys, order_codec, RedisStore};
use super::types::{ExecutionReport, WorkerPayload};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which worker queue a routed report lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Open,
    Close,
    Cancel,
    Pending,
    Reject,
    Stoploss,
    Takeprofit,
}

/// Routing table (spec.md §4.10). `QUEUED` is folded into the `OPEN` row:
/// the state diagram has a provider-flow instant order sitting in
/// `QUEUED` until its first ack, and the table has no separate row for
/// it, so the initial-placement ack is routed exactly like an already-
/// open order's would be.
fn route(engine_status: OrderState, ord_status: &str) -> Option<(Target, bool)> {
    use OrderState::*;
    let pending_group = matches!(engine_status, Pending | PendingQueued | Modify);
    let sl_tp_group = matches!(engine_status, Stoploss | Takeprofit | StoplossCancel | TakeprofitCancel);

    match (engine_status, ord_status) {
        (Open | Queued, "EXECUTED") => Some((Target::Open, false)),
        (Open | Queued, "REJECTED") => Some((Target::Reject, false)),
        _ if pending_group && ord_status == "EXECUTED" => Some((Target::Open, true)),
        _ if pending_group && matches!(ord_status, "PENDING" | "MODIFY") => Some((Target::Pending, false)),
        _ if pending_group && ord_status == "REJECTED" => Some((Target::Reject, false)),
        (PendingCancel, "CANCELLED" | "CANCELED" | "PENDING" | "MODIFY") => Some((Target::Cancel, false)),
        (PendingCancel, "EXECUTED") => Some((Target::Open, false)), // race: treat as executed
        (Closed, "EXECUTED") => Some((Target::Close, false)),
        (Closed, "REJECTED") => Some((Target::Reject, false)),
        (Stoploss, "PENDING") => Some((Target::Stoploss, false)),
        (Takeprofit, "PENDING") => Some((Target::Takeprofit, false)),
        _ if sl_tp_group && ord_status == "EXECUTED" => Some((Target::Close, false)),
        (StoplossCancel | TakeprofitCancel, "CANCELLED" | "CANCELED") => Some((Target::Cancel, false)),
        _ => None,
    }
}

pub struct Dispatcher {
    redis: RedisStore,
    amqp: AmqpClient,
    queues: QueueConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Dispatcher {
    pub fn new(redis: RedisStore, amqp: AmqpClient, queues: QueueConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self { redis, amqp, queues, metrics }
    }

    /// Runs the consumer loop forever (prefetch 100, spec.md §5).
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        let channel = self.amqp.channel().await?;
        self.amqp.declare_durable(&channel, &self.queues.confirmation_queue).await?;
        self.amqp.declare_durable(&channel, &self.queues.confirmation_dlq).await?;
        let consumer = self
            .amqp
            .consume(&channel, &self.queues.confirmation_queue, "dispatcher", 100)
            .await?;

        amqp::run_consumer(consumer, |delivery| {
            let this = self.clone();
            async move {
                this.handle(&delivery).await;
                let _ = amqp::ack(&delivery).await;
            }
        })
        .await;
        Ok(())
    }

    async fn handle(&self, delivery: &lapin::message::Delivery) {
        let report: ExecutionReport = match serde_json::from_slice(&delivery.data) {
            Ok(r) => r,
            Err(_) => return, // step 1: not an execution report, ignore.
        };

        let Some(raw_id) = report.lifecycle_id() else {
            self.dlq(&report, None, "missing_lifecycle_id").await;
            return;
        };

        let canonical_id = match self.redis.hget(&keys::global_order_lookup(raw_id), "order_id").await {
            Ok(Some(id)) => id,
            Ok(None) => raw_id.to_string(),
            Err(e) => {
                warn!(error = ?e, lifecycle_id = raw_id, "global_order_lookup read failed");
                raw_id.to_string()
            }
        };

        let order = match self.load_order(&canonical_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                self.dlq(&report, Some(&canonical_id), "missing_order_data").await;
                return;
            }
            Err(e) => {
                warn!(error = ?e, order_id = %canonical_id, "failed loading canonical order for dispatch");
                self.dlq(&report, Some(&canonical_id), "missing_order_data").await;
                return;
            }
        };

        let Some((target, pending_executed)) = route(order.status, &report.ord_status) else {
            self.dlq(&report, Some(&canonical_id), "unmapped_routing_state").await;
            return;
        };

        let payload = WorkerPayload {
            order_id: canonical_id.clone(),
            lifecycle_id: raw_id.to_string(),
            ord_status: report.ord_status.clone(),
            avgpx: report.avgpx,
            cumqty: report.cumqty,
            ts: report.ts,
            user_id: order.user_id.clone(),
            user_type: order.user_type,
            group: order.group.clone(),
            leverage: order.leverage,
            contract_size: order.contract_size,
            profit_currency: order.profit_currency.clone(),
            half_spread: order.half_spread,
            side: order.side.to_string(),
            order_price: order.order_price,
            order_quantity: order.order_quantity,
            pending_executed,
        };

        let queue = self.queue_name(target);
        self.metrics.provider().provider_acked_total.with_label_values(&[&report.ord_status]).inc();
        if let Err(e) = self.publish(&queue, &payload).await {
            warn!(error = ?e, order_id = %canonical_id, queue, "failed publishing to provider worker queue");
        } else {
            debug!(order_id = %canonical_id, queue, "routed execution report");
        }
    }

    async fn load_order(&self, order_id: &str) -> Result<Option<Order>, EngineError> {
        let fields = self.redis.hgetall(&keys::order_data(order_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(order_codec::from_hash(&fields)?))
    }

    fn queue_name(&self, target: Target) -> String {
        match target {
            Target::Open => self.queues.worker_open_queue.clone(),
            Target::Close => self.queues.worker_close_queue.clone(),
            Target::Cancel => self.queues.worker_cancel_queue.clone(),
            Target::Pending => self.queues.worker_pending_queue.clone(),
            Target::Reject => self.queues.worker_reject_queue.clone(),
            Target::Stoploss => self.queues.worker_stoploss_queue.clone(),
            Target::Takeprofit => self.queues.worker_takeprofit_queue.clone(),
        }
    }

    async fn publish<T: Serialize>(&self, queue: &str, payload: &T) -> Result<(), EngineError> {
        let channel = self.amqp.channel().await?;
        self.amqp.declare_durable(&channel, queue).await?;
        self.amqp.publish_json(&channel, queue, payload).await
    }

    async fn dlq(&self, report: &ExecutionReport, order_id: Option<&str>, reason: &str) {
        self.metrics.provider().provider_dlq_total.with_label_values(&[reason]).inc();
        let body = json!({
            "reason": reason,
            "order_id": order_id,
            "report": report,
        });
        if let Err(e) = self.publish(&self.queues.confirmation_dlq.clone(), &body).await {
            warn!(error = ?e, reason, "failed publishing to confirmation_dlq");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderState::*;

    #[test]
    fn queued_executed_routes_like_open() {
        assert_eq!(route(Queued, "EXECUTED"), Some((Target::Open, false)));
        assert_eq!(route(Open, "EXECUTED"), Some((Target::Open, false)));
    }

    #[test]
    fn pending_executed_sets_pending_executed_flag() {
        assert_eq!(route(Pending, "EXECUTED"), Some((Target::Open, true)));
        assert_eq!(route(PendingQueued, "PENDING"), Some((Target::Pending, false)));
    }

    #[test]
    fn sl_tp_cancel_groups_route_to_close_on_executed() {
        assert_eq!(route(StoplossCancel, "EXECUTED"), Some((Target::Close, false)));
        assert_eq!(route(TakeprofitCancel, "CANCELLED"), Some((Target::Cancel, false)));
    }

    #[test]
    fn unmapped_combination_has_no_route() {
        assert_eq!(route(Closed, "PENDING"), None);
    }
}
