//! Wire types shared by the Provider Connection, the Dispatcher, and the
//! provider worker queues (spec.md §4.9/§4.10/§4.11).
//!
//! The framed socket itself only ever carries [`OutboundMessage`]
//! (engine → provider) and a parsed [`ExecutionReport`] (provider →
//! engine, already normalized out of either the provider's native
//! `execution_report` envelope or a FIX-style numeric-tag field map).
//! [`WorkerPayload`] is the dispatcher's enriched fan-out message, one
//! per provider worker queue.

use crate::core::UserType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Engine → provider frame bodies (spec.md §4.9: "`type=order` plus a
/// millisecond `ts`"). `Cancel`/`Close` mirror the same envelope shape
/// for the provider's benefit even though the engine never re-sends
/// them after the initial request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "order")]
    Order {
        order_id: String,
        symbol: String,
        order_type: String,
        order_price: Decimal,
        contract_value: Decimal,
        status: String,
        ts: i64,
    },
    #[serde(rename = "cancel")]
    Cancel {
        cancel_id: String,
        target_lifecycle_id: String,
        ts: i64,
    },
    #[serde(rename = "close")]
    Close {
        close_id: String,
        order_id: String,
        ts: i64,
    },
}

impl OutboundMessage {
    /// The lifecycle id this send should be correlated with when a
    /// reply comes back (the id the provider is expected to echo).
    pub fn lifecycle_id(&self) -> &str {
        match self {
            OutboundMessage::Order { order_id, .. } => order_id,
            OutboundMessage::Cancel { cancel_id, .. } => cancel_id,
            OutboundMessage::Close { close_id, .. } => close_id,
        }
    }
}

/// Canonical execution report, whether it arrived as the provider's own
/// `execution_report` envelope or was translated out of a FIX-style
/// numeric-tag field map (spec.md §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub exec_id: Option<String>,
    pub ord_status: String,
    #[serde(default)]
    pub avgpx: Option<Decimal>,
    #[serde(default)]
    pub cumqty: Option<Decimal>,
    pub ts: i64,
    pub raw: serde_json::Value,
}

impl ExecutionReport {
    /// Lifecycle id to correlate against `global_order_lookup` (spec.md
    /// §4.10 step 2): prefer `order_id`, fall back to `exec_id`.
    pub fn lifecycle_id(&self) -> Option<&str> {
        self.order_id.as_deref().or(self.exec_id.as_deref())
    }

    /// Builds a canonical report out of a FIX-style numeric-tag map:
    /// 37=OrderID, 17=ExecID, 39=OrdStatus, 6=AvgPx, 14=CumQty,
    /// 60=TransactTime. `ord_status` single-letter FIX codes are mapped
    /// to the engine's own vocabulary (`EXECUTED`/`PENDING`/`CANCELLED`/
    /// `REJECTED`); unrecognized codes pass through uppercased so the
    /// dispatcher's DLQ path still has something diagnostic to log.
    pub fn from_fix_map(map: &serde_json::Value, ts: i64) -> Self {
        let get = |tag: &str| map.get(tag).and_then(|v| v.as_str()).map(|s| s.to_string());
        let raw_status = get("39").unwrap_or_default();
        let ord_status = match raw_status.as_str() {
            "0" | "1" => "PENDING",
            "2" => "EXECUTED",
            "4" => "CANCELLED",
            "5" => "MODIFY",
            "8" | "C" => "REJECTED",
            other if !other.is_empty() => return Self {
                order_id: get("37"),
                exec_id: get("17"),
                ord_status: other.to_uppercase(),
                avgpx: get("6").and_then(|s| s.parse().ok()),
                cumqty: get("14").and_then(|s| s.parse().ok()),
                ts,
                raw: map.clone(),
            },
            _ => "PENDING",
        };
        Self {
            order_id: get("37"),
            exec_id: get("17"),
            ord_status: ord_status.to_string(),
            avgpx: get("6").and_then(|s| s.parse().ok()),
            cumqty: get("14").and_then(|s| s.parse().ok()),
            ts,
            raw: map.clone(),
        }
    }

    /// True when the frame is a FIX-style field map (`"35": "8"`) rather
    /// than the provider's native `{"type": "execution_report", ...}`.
    pub fn looks_like_fix_map(value: &serde_json::Value) -> bool {
        value.get("35").and_then(|v| v.as_str()) == Some("8")
    }
}

/// The dispatcher's enriched, per-worker-queue fan-out message (spec.md
/// §4.10 "compose" step). Each provider worker deserializes the same
/// shape regardless of which queue it consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPayload {
    pub order_id: String,
    pub lifecycle_id: String,
    pub ord_status: String,
    #[serde(default)]
    pub avgpx: Option<Decimal>,
    #[serde(default)]
    pub cumqty: Option<Decimal>,
    pub ts: i64,

    pub user_id: String,
    pub user_type: UserType,
    pub group: String,
    pub leverage: Decimal,
    pub contract_size: Decimal,
    pub profit_currency: String,
    /// Already-combined `spread * spread_pip / 2` carried straight off
    /// the order record (`Order::half_spread`), not re-derived from the
    /// group config.
    pub half_spread: Decimal,
    pub side: String,
    pub order_price: Decimal,
    pub order_quantity: Decimal,

    /// True when a PENDING/PENDING-QUEUED/MODIFY order was routed to
    /// the open queue because the provider executed it directly
    /// (spec.md §4.10 routing table, "pending_executed=true").
    #[serde(default)]
    pub pending_executed: bool,
}

impl WorkerPayload {
    /// Idempotency token every worker dedups on (`provider_idem:{tok}`,
    /// spec.md §4.11).
    pub fn idempotency_token(&self) -> &str {
        &self.lifecycle_id
    }
}
