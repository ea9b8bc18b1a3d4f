//! Order status state machine (spec.md §4.3).
//!
//! `OrderState` is the canonical engine state written into
//! `order_data.status`. Unlike the teacher's typestate-per-state encoding
//! (appropriate for a single in-process fill pipeline), this state lives
//! in a Redis hash and crosses process boundaries via the dispatcher, so
//! it is modeled as a plain enum with an explicit, testable transition
//! function rather than a type per state.
//!
//! ```text
//!           ┌──────────── instant provider ────────────┐
//!           │                                          ▼
//!  (new) ──► OPEN ──► CLOSED                       QUEUED (pre-ack)
//!           │  ▲                                       │
//!           │  │                                       ▼
//!           │  └── SL/TP cancel ack ── STOPLOSS-CANCEL or TAKEPROFIT-CANCEL
//!           │                                          │
//!           │                                          ▼
//!           ├── SL-set ack ──► STOPLOSS ──► CLOSED (trigger)
//!           ├── TP-set ack ──► TAKEPROFIT ──► CLOSED (trigger)
//!           ▼
//!  PENDING ── price hit ──► OPEN
//!     │
//!     ├── MODIFY ack ──► PENDING
//!     └── PENDING-CANCEL ack ──► (deleted)
//!     │
//!     └── REJECTED (terminal)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Queued,
    Pending,
    PendingQueued,
    Modify,
    PendingCancel,
    Open,
    Closed,
    Stoploss,
    Takeprofit,
    StoplossCancel,
    TakeprofitCancel,
    Rejected,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::Queued => "QUEUED",
            OrderState::Pending => "PENDING",
            OrderState::PendingQueued => "PENDING-QUEUED",
            OrderState::Modify => "MODIFY",
            OrderState::PendingCancel => "PENDING-CANCEL",
            OrderState::Open => "OPEN",
            OrderState::Closed => "CLOSED",
            OrderState::Stoploss => "STOPLOSS",
            OrderState::Takeprofit => "TAKEPROFIT",
            OrderState::StoplossCancel => "STOPLOSS-CANCEL",
            OrderState::TakeprofitCancel => "TAKEPROFIT-CANCEL",
            OrderState::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OrderState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "QUEUED" => OrderState::Queued,
            "PENDING" => OrderState::Pending,
            "PENDING-QUEUED" => OrderState::PendingQueued,
            "MODIFY" => OrderState::Modify,
            "PENDING-CANCEL" => OrderState::PendingCancel,
            "OPEN" => OrderState::Open,
            "CLOSED" => OrderState::Closed,
            "STOPLOSS" => OrderState::Stoploss,
            "TAKEPROFIT" => OrderState::Takeprofit,
            "STOPLOSS-CANCEL" => OrderState::StoplossCancel,
            "TAKEPROFIT-CANCEL" => OrderState::TakeprofitCancel,
            "REJECTED" => OrderState::Rejected,
            other => return Err(format!("unknown order state: {other}")),
        })
    }
}

/// Events that drive a transition (named after the ack/trigger that causes
/// them, matching the arrows in the diagram above).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    ProviderAckExecuted,
    ProviderAckRejected,
    LocalOpenImmediate,
    CloseRequested,
    CloseConfirmed,
    StoplossSetAck,
    TakeprofitSetAck,
    StoplossCancelAck,
    TakeprofitCancelAck,
    TriggerFired,
    PendingPriceHit,
    ModifyAck,
    PendingCancelAck,
}

/// Returns the next state for `(current, event)`, or `None` if the
/// transition is illegal (invariant 5: no backward transition except the
/// SL/TP-cancel-to-OPEN arrow).
pub fn transition(current: OrderState, event: OrderEvent) -> Option<OrderState> {
    use OrderEvent::*;
    use OrderState::*;
    match (current, event) {
        // New instant order, local flow: opens immediately.
        (Queued, LocalOpenImmediate) => Some(Open),
        // New instant order, provider flow: queued pre-ack, opens on ack.
        (Queued, ProviderAckExecuted) => Some(Open),
        (Queued, ProviderAckRejected) => Some(Rejected),

        // Pending order lifecycle.
        (Pending, PendingPriceHit) => Some(Open),
        (Pending, ModifyAck) => Some(Pending),
        (Pending, PendingCancelAck) => Some(Pending), // deletion handled by caller
        (Pending, ProviderAckRejected) => Some(Rejected),
        (PendingQueued, ProviderAckExecuted) => Some(Open),
        (PendingQueued, ProviderAckRejected) => Some(Rejected),
        (Modify, ProviderAckExecuted) => Some(Open),
        (Modify, ModifyAck) => Some(Pending),

        // Open order lifecycle.
        (Open, CloseRequested) => Some(Closed),
        (Open, CloseConfirmed) => Some(Closed),
        (Open, StoplossSetAck) => Some(Stoploss),
        (Open, TakeprofitSetAck) => Some(Takeprofit),

        // SL/TP attached states.
        (Stoploss, TriggerFired) => Some(Closed),
        (Stoploss, CloseConfirmed) => Some(Closed),
        (Stoploss, StoplossCancelAck) => Some(StoplossCancel),
        (Takeprofit, TriggerFired) => Some(Closed),
        (Takeprofit, CloseConfirmed) => Some(Closed),
        (Takeprofit, TakeprofitCancelAck) => Some(TakeprofitCancel),

        // Cancel acks on SL/TP return to OPEN (the one permitted "backward" arrow).
        (StoplossCancel, ProviderAckExecuted) => Some(Open),
        (TakeprofitCancel, ProviderAckExecuted) => Some(Open),

        // Pending cancel acknowledgement: caller deletes the order record.
        (PendingCancel, ProviderAckExecuted) => Some(PendingCancel),

        _ => None,
    }
}

/// True if `state` is terminal for the purposes of margin accounting
/// (no further mutation expected without an external trigger).
pub fn is_terminal(state: OrderState) -> bool {
    matches!(state, OrderState::Closed | OrderState::Rejected)
}

/// True if an order in this state counts toward `used_margin_executed`
/// (invariant 3: QUEUED counts toward `used_margin_all` only).
pub fn counts_as_executed(state: OrderState) -> bool {
    !matches!(
        state,
        OrderState::Queued | OrderState::PendingQueued | OrderState::Rejected
    )
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn local_instant_order_opens_immediately() {
        assert_eq!(
            transition(OrderState::Queued, OrderEvent::LocalOpenImmediate),
            Some(OrderState::Open)
        );
    }

    #[test]
    fn stoploss_trigger_closes_order() {
        assert_eq!(
            transition(OrderState::Stoploss, OrderEvent::TriggerFired),
            Some(OrderState::Closed)
        );
    }

    #[test]
    fn stoploss_cancel_returns_to_open_not_forward() {
        let cancelled = transition(OrderState::Stoploss, OrderEvent::StoplossCancelAck).unwrap();
        assert_eq!(cancelled, OrderState::StoplossCancel);
        let reopened = transition(cancelled, OrderEvent::ProviderAckExecuted).unwrap();
        assert_eq!(reopened, OrderState::Open);
    }

    #[test]
    fn illegal_transition_rejected() {
        assert_eq!(transition(OrderState::Closed, OrderEvent::TriggerFired), None);
        assert_eq!(transition(OrderState::Rejected, OrderEvent::PendingPriceHit), None);
    }

    #[test]
    fn queued_does_not_count_toward_executed_margin() {
        assert!(!counts_as_executed(OrderState::Queued));
        assert!(counts_as_executed(OrderState::Open));
    }

    #[test]
    fn terminal_states() {
        assert!(is_terminal(OrderState::Closed));
        assert!(is_terminal(OrderState::Rejected));
        assert!(!is_terminal(OrderState::Open));
    }

    #[test]
    fn display_parse_round_trip() {
        for state in [
            OrderState::Queued,
            OrderState::Pending,
            OrderState::Open,
            OrderState::Closed,
            OrderState::Stoploss,
            OrderState::StoplossCancel,
            OrderState::Rejected,
        ] {
            let parsed = OrderState::from_str(&state.to_string()).unwrap();
            assert_eq!(parsed, state);
        }
    }
}
