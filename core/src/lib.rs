//! oms-core: the order-lifecycle engine for a real-time FX/CFD trading
//! backend.
//!
//! Twelve cooperating subsystems share three external systems (Redis,
//! RabbitMQ, and a liquidity provider's framed socket) through the types
//! and stores in this crate:
//!
//! - [`quote_store`] — component A, the in-memory sharded quote cache.
//! - [`market_listener`] — component B, the upstream market feed consumer.
//! - [`dirty_bus`] — component C, symbol/user dirty-set fan-out.
//! - [`portfolio`] — component D, per-user PnL/margin/margin-level calc.
//! - [`margin`] — component E, single-order and hedged margin math.
//! - [`execution`] — component F, order placement and close engine.
//! - [`triggers`] — component G, the stop-loss/take-profit trigger monitor.
//! - [`pending`] — component H, the pending-order (limit/stop) trigger monitor.
//! - [`provider::connection`] — component I, the liquidity provider's framed
//!   socket.
//! - [`provider::dispatcher`] — component J, confirmation-report routing.
//! - [`provider::workers`] — component K, the per-outcome provider workers
//!   and the provider-pending margin monitor.
//! - [`autocutoff`] — component L, the margin-level watcher and liquidation
//!   engine.
//! - [`db_update`] — outbound `order_db_update_queue` messages consumed by
//!   the external SQL writer.
//! - [`stores`] — read-only user/group config lookups backing D and F.

pub mod amqp;
pub mod autocutoff;
pub mod config;
pub mod core;
pub mod db_update;
pub mod dirty_bus;
pub mod execution;
pub mod margin;
pub mod market_listener;
pub mod monitoring;
pub mod pending;
pub mod portfolio;
pub mod provider;
pub mod quote_store;
pub mod redis_store;
pub mod resilience;
pub mod stores;
pub mod triggers;

pub use crate::core::{EngineError, Order, OrderState, Quote, UserConfig, UserPortfolio, UserType};

/// Prelude for convenient imports across binaries.
pub mod prelude {
    pub use crate::core::{
        EngineError, GroupConfig, InstrumentType, Order, OrderEvent, OrderState, Quote, Side,
        UserConfig, UserPortfolio, UserType,
    };
    pub use crate::redis_store::RedisStore;
}
