//! Outbound `order_db_update_queue` messages (spec.md §4.3/§4.4/§4.8/§4.11).
//!
//! The persistent SQL store is an external collaborator (§1 non-goal: "no
//! SQL client lives in this crate"); every state change that the UI/DB
//! needs to know about is instead queued here, the way
//! `pending_monitor.py`/`dispatcher.py`/`liquidation.py` all publish to
//! `ORDER_DB_UPDATE_QUEUE` rather than writing SQL directly.

use crate::core::EngineError;
use crate::amqp::AmqpClient;
use async_trait::async_trait;
use lapin::Channel;
use serde::Serialize;
use serde_json::{Map, Value};

/// The message `type` discriminants named across the db-update producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbUpdateType {
    OrderOpenConfirmed,
    OrderPendingTriggered,
    OrderPendingAcked,
    OrderCloseConfirmed,
    OrderCloseIdUpdate,
    OrderCancelConfirmed,
    OrderRejected,
    OrderRejectionRecord,
    OrderPendingConfirmed,
    OrderPendingCancel,
    OrderStoplossSet,
    OrderStoplossAcked,
    OrderStoplossConfirmed,
    OrderStoplossCancel,
    OrderTakeprofitSet,
    OrderTakeprofitAcked,
    OrderTakeprofitConfirmed,
    OrderTakeprofitCancel,
    AutocutoffLiquidation,
}

impl DbUpdateType {
    pub fn as_str(self) -> &'static str {
        match self {
            DbUpdateType::OrderOpenConfirmed => "ORDER_OPEN_CONFIRMED",
            DbUpdateType::OrderPendingTriggered => "ORDER_PENDING_TRIGGERED",
            DbUpdateType::OrderPendingAcked => "ORDER_PENDING_ACKED",
            DbUpdateType::OrderCloseConfirmed => "ORDER_CLOSE_CONFIRMED",
            DbUpdateType::OrderCloseIdUpdate => "ORDER_CLOSE_ID_UPDATE",
            DbUpdateType::OrderCancelConfirmed => "ORDER_CANCEL_CONFIRMED",
            DbUpdateType::OrderRejected => "ORDER_REJECTED",
            DbUpdateType::OrderRejectionRecord => "ORDER_REJECTION_RECORD",
            DbUpdateType::OrderPendingConfirmed => "ORDER_PENDING_CONFIRMED",
            DbUpdateType::OrderPendingCancel => "ORDER_PENDING_CANCEL",
            DbUpdateType::OrderStoplossSet => "ORDER_STOPLOSS_SET",
            DbUpdateType::OrderStoplossAcked => "ORDER_STOPLOSS_ACKED",
            DbUpdateType::OrderStoplossConfirmed => "ORDER_STOPLOSS_CONFIRMED",
            DbUpdateType::OrderStoplossCancel => "ORDER_STOPLOSS_CANCEL",
            DbUpdateType::OrderTakeprofitSet => "ORDER_TAKEPROFIT_SET",
            DbUpdateType::OrderTakeprofitAcked => "ORDER_TAKEPROFIT_ACKED",
            DbUpdateType::OrderTakeprofitConfirmed => "ORDER_TAKEPROFIT_CONFIRMED",
            DbUpdateType::OrderTakeprofitCancel => "ORDER_TAKEPROFIT_CANCEL",
            DbUpdateType::AutocutoffLiquidation => "AUTOCUTOFF_LIQUIDATION",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DbUpdateMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub order_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DbUpdateMessage {
    pub fn new(message_type: DbUpdateType, order_id: impl Into<String>) -> Self {
        Self {
            message_type: message_type.as_str(),
            order_id: order_id.into(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait DbUpdatePublisher: Send + Sync {
    async fn publish(&self, msg: DbUpdateMessage) -> Result<(), EngineError>;
}

/// Publishes to the durable `order_db_update_queue` (spec.md §6).
pub struct AmqpDbUpdatePublisher {
    amqp: AmqpClient,
    channel: Channel,
    queue: String,
}

impl AmqpDbUpdatePublisher {
    pub async fn new(amqp: AmqpClient, queue: &str) -> Result<Self, EngineError> {
        let channel = amqp.channel().await?;
        amqp.declare_durable(&channel, queue).await?;
        Ok(Self { amqp, channel, queue: queue.to_string() })
    }
}

#[async_trait]
impl DbUpdatePublisher for AmqpDbUpdatePublisher {
    async fn publish(&self, msg: DbUpdateMessage) -> Result<(), EngineError> {
        self.amqp.publish_json(&self.channel, &self.queue, &msg).await
    }
}

/// In-memory sink for tests and `oms-admin` dry-runs.
#[derive(Default)]
pub struct RecordingDbUpdatePublisher {
    pub sent: tokio::sync::Mutex<Vec<DbUpdateMessage>>,
}

#[async_trait]
impl DbUpdatePublisher for RecordingDbUpdatePublisher {
    async fn publish(&self, msg: DbUpdateMessage) -> Result<(), EngineError> {
        self.sent.lock().await.push(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serializes_flattened_fields() {
        let msg = DbUpdateMessage::new(DbUpdateType::OrderCloseConfirmed, "o1")
            .with("close_price", "1.2345")
            .with("net_profit", "10.50");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ORDER_CLOSE_CONFIRMED");
        assert_eq!(json["order_id"], "o1");
        assert_eq!(json["close_price"], "1.2345");
    }
}
