//! Request/response types for the Order Execution Engine (spec.md §4.3/§4.4).

use crate::core::{OrderState, Side, UserType};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteInstantOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_price: Decimal,
    pub order_quantity: Decimal,
    pub user_id: String,
    pub user_type: UserType,
    pub idempotency_key: Option<String>,
    pub order_id: Option<String>,
    pub order_status: OrderState,
    /// Set by the Pending Monitor: the open worker must not re-apply the
    /// half-spread to `order_price` (spec.md §4.8 step 3).
    pub pending_local: bool,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteInstantOrderResponse {
    pub order_id: String,
    pub status: OrderState,
    pub exec_price: Decimal,
    pub margin: Option<Decimal>,
    pub reserved_margin: Option<Decimal>,
    /// Present only for the provider flow: the API layer must hand this
    /// to the Provider Connection *after* returning this response.
    pub provider_send_payload: Option<ProviderSendPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSendPayload {
    pub order_id: String,
    pub symbol: String,
    pub order_type: String,
    pub order_price: Decimal,
    pub contract_value: Decimal,
    pub status: String,
}

#[derive(Debug, Clone)]
pub enum ExecutionFlow {
    Local,
    Provider,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseOrderRequest {
    pub order_id: String,
    pub close_reason: CloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Closed,
    Stoploss,
    Takeprofit,
    Autocutoff,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Closed => "Closed",
            CloseReason::Stoploss => "Stoploss",
            CloseReason::Takeprofit => "Takeprofit",
            CloseReason::Autocutoff => "Autocutoff",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseOrderResponse {
    pub order_id: String,
    pub close_price: Decimal,
    pub net_profit: Decimal,
    pub close_message: &'static str,
}

