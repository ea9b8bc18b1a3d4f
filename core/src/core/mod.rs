//! Core domain types shared across every subsystem: the order state
//! machine, the domain model (quotes/orders/configs/portfolio), and the
//! composed engine error type.

pub mod errors;
pub mod order_fsm;
pub mod types;

pub use errors::{
    ConfigError, EngineError, ExternalError, InfraError, MarginError, PricingError, StateError,
    ValidationError,
};
pub use order_fsm::{transition, OrderEvent, OrderState};
pub use types::{
    CalcStatus, ExecutionStatus, GroupConfig, InstrumentType, Order, PendingOrder,
    PendingOrderType, Quote, SendingOrders, Side, Symbol, Trigger, UserConfig, UserPortfolio,
    UserType, MARGIN_LEVEL_SAFE_SENTINEL,
};
