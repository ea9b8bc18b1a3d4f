//! Liquidity provider integration: the framed socket (component I), the
//! confirmation-routing Dispatcher (component J), and the per-queue
//! Provider Workers (component K). See spec.md §4.9-§4.11.

pub mod connection;
pub mod dispatcher;
pub mod types;
pub mod workers;

pub use connection::ProviderConnection;
pub use dispatcher::Dispatcher;
pub use types::{ExecutionReport, OutboundMessage, WorkerPayload};
pub use workers::{PendingMarginMonitor, ProviderWorkers};
