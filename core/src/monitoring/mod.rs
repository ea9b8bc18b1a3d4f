//! Monitoring and observability module
//!
//! Provides Prometheus metrics export and an HTTP server for scraping.
//! Alerting on at-risk-of-liquidation users is handled by
//! [`crate::autocutoff::notifier`] rather than a generic rule engine, since
//! the one alert this system sends has a single, well-defined trigger.

pub mod metrics;
pub mod server;

pub use metrics::{MetricsRegistry, OrderMetrics, PortfolioMetrics, ProviderMetrics, SystemMetrics};
pub use server::{MetricsServer, MetricsServerConfig};
