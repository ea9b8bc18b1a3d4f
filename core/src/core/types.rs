//! Domain model for the order lifecycle engine (spec.md §3).
//!
//! Types here are the semantic containers the rest of the crate operates
//! on: quotes, orders, user/group configuration, the derived portfolio
//! snapshot, and the trigger/pending index entries. Money and price
//! fields use [`Decimal`] throughout — this is an accounting system, not
//! a fixed-point HFT tick path, so exactness beats raw speed.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A symbol such as `EURUSD`. Always stored upper-case.
pub type Symbol = String;

/// Side of an instant order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl Side {
    /// The opposite side, used when quoting the exit price of a position.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Pending order variants (spec.md §3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingOrderType {
    BuyLimit,
    BuyStop,
    SellLimit,
    SellStop,
}

impl PendingOrderType {
    /// The side the order becomes once triggered.
    pub fn resolved_side(self) -> Side {
        match self {
            PendingOrderType::BuyLimit | PendingOrderType::BuyStop => Side::Buy,
            PendingOrderType::SellLimit | PendingOrderType::SellStop => Side::Sell,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PendingOrderType::BuyLimit => "BUY_LIMIT",
            PendingOrderType::BuyStop => "BUY_STOP",
            PendingOrderType::SellLimit => "SELL_LIMIT",
            PendingOrderType::SellStop => "SELL_STOP",
        }
    }
}

impl fmt::Display for PendingOrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User account classification (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserType {
    Live,
    Demo,
    StrategyProvider,
    CopyFollower,
}

impl UserType {
    pub fn as_str(self) -> &'static str {
        match self {
            UserType::Live => "live",
            UserType::Demo => "demo",
            UserType::StrategyProvider => "strategy_provider",
            UserType::CopyFollower => "copy_follower",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an account's orders are routed (`UserConfig.sending_orders`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendingOrders {
    Rock,
    Barclays,
    None,
}

impl From<&str> for SendingOrders {
    fn from(s: &str) -> Self {
        match s {
            "rock" => SendingOrders::Rock,
            "barclays" => SendingOrders::Barclays,
            _ => SendingOrders::None,
        }
    }
}

/// Execution status of an order (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Queued,
    Executed,
    Pending,
    Rejected,
}

/// Instrument type, drives margin and conversion rules (§3 GroupConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentType {
    Fx = 1,
    Metal = 2,
    Index = 3,
    Crypto = 4,
}

impl InstrumentType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(InstrumentType::Fx),
            2 => Some(InstrumentType::Metal),
            3 => Some(InstrumentType::Index),
            4 => Some(InstrumentType::Crypto),
            _ => None,
        }
    }

    pub fn is_crypto(self) -> bool {
        matches!(self, InstrumentType::Crypto)
    }
}

/// A single-symbol quote record (component A).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub ts_ms: i64,
}

impl Quote {
    pub fn empty(ts_ms: i64) -> Self {
        Self {
            bid: None,
            ask: None,
            ts_ms,
        }
    }

    /// Merge a partial update, preserving the untouched side (P6 / R2).
    pub fn merge_partial(&mut self, bid: Option<Decimal>, ask: Option<Decimal>, ts_ms: i64) {
        if let Some(b) = bid {
            self.bid = Some(b);
        }
        if let Some(a) = ask {
            self.ask = Some(a);
        }
        self.ts_ms = ts_ms;
    }

    pub fn is_complete(&self) -> bool {
        self.bid.is_some() && self.ask.is_some()
    }
}

/// Account configuration, read-only to the core engine (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: String,
    pub user_type: UserType,
    pub wallet_balance: Option<Decimal>,
    pub leverage: Decimal,
    pub group: String,
    pub sending_orders: SendingOrders,
    pub status: String,
    #[serde(default = "default_auto_cutoff_level")]
    pub auto_cutoff_level: Decimal,
    #[serde(default = "default_auto_liquidation_level")]
    pub auto_liquidation_level: Decimal,
}

fn default_auto_cutoff_level() -> Decimal {
    Decimal::from(50)
}

fn default_auto_liquidation_level() -> Decimal {
    Decimal::from(10)
}

impl UserConfig {
    pub fn is_verified(&self) -> bool {
        self.status == "verified"
    }

    /// Routing decision per spec.md §4.3: local vs. provider flow.
    pub fn uses_local_flow(&self) -> bool {
        match self.user_type {
            UserType::Demo => true,
            UserType::Live | UserType::StrategyProvider | UserType::CopyFollower => {
                matches!(self.sending_orders, SendingOrders::Rock)
            }
        }
    }
}

/// Per group × symbol pricing/commission configuration (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group: String,
    pub symbol: Symbol,
    pub contract_size: Decimal,
    pub profit_currency: String,
    pub instrument_type: InstrumentType,
    pub spread: Decimal,
    pub spread_pip: Decimal,
    pub commission_rate: Decimal,
    pub commission_type: String,
    pub commission_value_type: String,
    pub crypto_margin_factor: Option<Decimal>,
    pub group_margin: Option<Decimal>,
}

impl GroupConfig {
    /// `half_spread = spread * spread_pip / 2` (GLOSSARY).
    pub fn half_spread(&self) -> Decimal {
        self.spread * self.spread_pip / Decimal::from(2)
    }
}

/// Canonical order record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub user_type: UserType,

    pub symbol: Symbol,
    pub side: Side,
    pub order_quantity: Decimal,
    pub order_price: Decimal,

    pub status: crate::core::order_fsm::OrderState,
    pub execution_status: ExecutionStatus,

    pub raw_price: Option<Decimal>,
    pub half_spread: Decimal,
    pub contract_value: Decimal,

    pub margin: Option<Decimal>,
    pub reserved_margin: Option<Decimal>,
    pub commission_entry: Decimal,
    pub commission_exit: Decimal,
    pub swap: Decimal,
    pub profit_usd: Option<Decimal>,
    pub net_profit: Option<Decimal>,
    pub close_price: Option<Decimal>,

    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub close_id: Option<String>,
    pub cancel_id: Option<String>,
    pub modify_id: Option<String>,
    pub stoploss_id: Option<String>,
    pub takeprofit_id: Option<String>,
    pub stoploss_cancel_id: Option<String>,
    pub takeprofit_cancel_id: Option<String>,

    pub group: String,
    pub profit_currency: String,
    pub contract_size: Decimal,
    pub instrument_type: InstrumentType,
    pub crypto_margin_factor: Option<Decimal>,
    pub commission_rate: Decimal,
    pub commission_value_type: String,

    pub group_margin: Option<Decimal>,
    pub leverage: Decimal,

    pub pending_local: bool,
}

impl Order {
    /// Invariant 1: exactly one of `margin`/`reserved_margin` set for open
    /// orders, and `margin` is set iff executed.
    pub fn margin_invariant_holds(&self) -> bool {
        match self.execution_status {
            ExecutionStatus::Executed => self.margin.is_some() && self.reserved_margin.is_none(),
            ExecutionStatus::Queued | ExecutionStatus::Pending => {
                self.margin.is_none() && self.reserved_margin.is_some()
            }
            ExecutionStatus::Rejected => true,
        }
    }

    /// All lifecycle ids this order may ever emit (GLOSSARY: lifecycle id).
    pub fn lifecycle_ids(&self) -> Vec<&str> {
        [
            self.close_id.as_deref(),
            self.cancel_id.as_deref(),
            self.modify_id.as_deref(),
            self.stoploss_id.as_deref(),
            self.takeprofit_id.as_deref(),
            self.stoploss_cancel_id.as_deref(),
            self.takeprofit_cancel_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Derived per-user metrics (component D output, spec.md §3/§4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPortfolio {
    pub balance: Decimal,
    pub equity: Decimal,
    pub open_pnl: Decimal,
    pub used_margin_executed: Decimal,
    pub used_margin_all: Decimal,
    pub free_margin: Decimal,
    pub margin_level: Decimal,
    pub calc_status: CalcStatus,
    pub degraded_fields: Vec<String>,
    pub error_codes: Vec<String>,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalcStatus {
    Ok,
    Degraded,
    Error,
}

impl Default for CalcStatus {
    fn default() -> Self {
        CalcStatus::Ok
    }
}

/// Sentinel margin-level value representing "effectively infinite"
/// (`used_margin == 0`), exposed to watchers as 999% (spec.md §4.6/§4.12).
pub const MARGIN_LEVEL_SAFE_SENTINEL: i64 = 999;

/// A trigger attachment on an open order (component G, spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub user_type: UserType,
    pub user_id: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub score_sl: Option<Decimal>,
    pub score_tp: Option<Decimal>,
}

/// A resting pending order (component H, spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: String,
    pub symbol: Symbol,
    pub order_type: PendingOrderType,
    pub order_quantity: Decimal,
    pub user_id: String,
    pub user_type: UserType,
    pub group: String,
    pub trigger_price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quote_partial_merge_preserves_other_side() {
        let mut q = Quote {
            bid: Some(dec!(1.1000)),
            ask: Some(dec!(1.1002)),
            ts_ms: 1,
        };
        q.merge_partial(None, Some(dec!(1.1003)), 2);
        assert_eq!(q.bid, Some(dec!(1.1000)));
        assert_eq!(q.ask, Some(dec!(1.1003)));
        assert_eq!(q.ts_ms, 2);
    }

    #[test]
    fn user_config_routing_local_for_demo() {
        let cfg = UserConfig {
            user_id: "1".into(),
            user_type: UserType::Demo,
            wallet_balance: Some(dec!(1000)),
            leverage: dec!(100),
            group: "Standard".into(),
            sending_orders: SendingOrders::None,
            status: "verified".into(),
            auto_cutoff_level: dec!(50),
            auto_liquidation_level: dec!(10),
        };
        assert!(cfg.uses_local_flow());
    }

    #[test]
    fn user_config_routing_provider_for_live_barclays() {
        let cfg = UserConfig {
            user_id: "1".into(),
            user_type: UserType::Live,
            wallet_balance: Some(dec!(1000)),
            leverage: dec!(100),
            group: "Standard".into(),
            sending_orders: SendingOrders::Barclays,
            status: "verified".into(),
            auto_cutoff_level: dec!(50),
            auto_liquidation_level: dec!(10),
        };
        assert!(!cfg.uses_local_flow());
    }

    #[test]
    fn half_spread_matches_glossary_formula() {
        let gc = GroupConfig {
            group: "Standard".into(),
            symbol: "EURUSD".into(),
            contract_size: dec!(100000),
            profit_currency: "USD".into(),
            instrument_type: InstrumentType::Fx,
            spread: dec!(2),
            spread_pip: dec!(0.00001),
            commission_rate: dec!(0),
            commission_type: "none".into(),
            commission_value_type: "none".into(),
            crypto_margin_factor: None,
            group_margin: None,
        };
        assert_eq!(gc.half_spread(), dec!(0.00001));
    }
}
