//! Prometheus metrics for the order-lifecycle engine
//!
//! Mirrors the production metric families across every component: order
//! placement and closing (execution), margin/portfolio health, trigger and
//! pending-order firing, provider round-trips, and auto-cutoff liquidations.

use prometheus::{
    Counter, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use tracing::info;

/// Central registry for all Prometheus metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    orders: Arc<OrderMetrics>,
    portfolio: Arc<PortfolioMetrics>,
    provider: Arc<ProviderMetrics>,
    system: Arc<SystemMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let orders = Arc::new(OrderMetrics::new(&registry)?);
        let portfolio = Arc::new(PortfolioMetrics::new(&registry)?);
        let provider = Arc::new(ProviderMetrics::new(&registry)?);
        let system = Arc::new(SystemMetrics::new(&registry)?);

        info!("prometheus metrics registry initialized");

        Ok(Self {
            registry,
            orders,
            portfolio,
            provider,
            system,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn orders(&self) -> &OrderMetrics {
        &self.orders
    }

    pub fn portfolio(&self) -> &PortfolioMetrics {
        &self.portfolio
    }

    pub fn provider(&self) -> &ProviderMetrics {
        &self.provider
    }

    pub fn system(&self) -> &SystemMetrics {
        &self.system
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            tracing::error!("FATAL: failed to create metrics registry: {}", e);
            panic!("cannot create metrics registry")
        })
    }
}

/// Order placement, closing, and trigger metrics (components F, G, H).
pub struct OrderMetrics {
    pub orders_placed_total: IntCounterVec,
    pub orders_closed_total: IntCounterVec,
    pub orders_rejected_total: IntCounterVec,
    pub order_placement_latency_ms: HistogramVec,
    pub trigger_fired_total: IntCounterVec,
    pub pending_triggered_total: IntCounterVec,
}

impl OrderMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let orders_placed_total = IntCounterVec::new(
            Opts::new("oms_orders_placed_total", "Total orders placed")
                .namespace("oms"),
            &["symbol", "side", "route"],
        )?;
        registry.register(Box::new(orders_placed_total.clone()))?;

        let orders_closed_total = IntCounterVec::new(
            Opts::new("oms_orders_closed_total", "Total orders closed").namespace("oms"),
            &["symbol", "reason"],
        )?;
        registry.register(Box::new(orders_closed_total.clone()))?;

        let orders_rejected_total = IntCounterVec::new(
            Opts::new("oms_orders_rejected_total", "Total orders rejected").namespace("oms"),
            &["reason_code"],
        )?;
        registry.register(Box::new(orders_rejected_total.clone()))?;

        let order_placement_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "oms_order_placement_latency_ms",
                "Time from order request to engine decision, in milliseconds",
            )
            .namespace("oms")
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
            &["route"],
        )?;
        registry.register(Box::new(order_placement_latency_ms.clone()))?;

        let trigger_fired_total = IntCounterVec::new(
            Opts::new("oms_trigger_fired_total", "Total stop-loss/take-profit triggers fired")
                .namespace("oms"),
            &["kind"],
        )?;
        registry.register(Box::new(trigger_fired_total.clone()))?;

        let pending_triggered_total = IntCounterVec::new(
            Opts::new(
                "oms_pending_triggered_total",
                "Total pending limit/stop orders triggered",
            )
            .namespace("oms"),
            &["order_type"],
        )?;
        registry.register(Box::new(pending_triggered_total.clone()))?;

        Ok(Self {
            orders_placed_total,
            orders_closed_total,
            orders_rejected_total,
            order_placement_latency_ms,
            trigger_fired_total,
            pending_triggered_total,
        })
    }
}

/// Portfolio/margin health metrics (components D, E, L).
pub struct PortfolioMetrics {
    pub margin_level: Gauge,
    pub used_margin_usd: Gauge,
    pub equity_usd: Gauge,
    pub calc_errors_total: IntCounterVec,
    pub autocutoff_total: IntCounterVec,
    pub autocutoff_alerts_sent_total: IntCounter,
    pub drain_tick_latency_ms: Histogram,
}

impl PortfolioMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let margin_level = Gauge::new(
            "oms_margin_level",
            "Most recently computed margin level for the last-drained user (percent)",
        )?;
        registry.register(Box::new(margin_level.clone()))?;

        let used_margin_usd =
            Gauge::new("oms_used_margin_usd", "Most recently computed used margin in USD")?;
        registry.register(Box::new(used_margin_usd.clone()))?;

        let equity_usd = Gauge::new("oms_equity_usd", "Most recently computed equity in USD")?;
        registry.register(Box::new(equity_usd.clone()))?;

        let calc_errors_total = IntCounterVec::new(
            Opts::new("oms_portfolio_calc_errors_total", "Portfolio calc failures/degradations")
                .namespace("oms"),
            &["status"],
        )?;
        registry.register(Box::new(calc_errors_total.clone()))?;

        let autocutoff_total = IntCounterVec::new(
            Opts::new("oms_autocutoff_total", "Total auto-cutoff liquidations performed")
                .namespace("oms"),
            &["trigger"],
        )?;
        registry.register(Box::new(autocutoff_total.clone()))?;

        let autocutoff_alerts_sent_total = IntCounter::new(
            "oms_autocutoff_alerts_sent_total",
            "Total at-risk-of-liquidation email alerts sent",
        )?;
        registry.register(Box::new(autocutoff_alerts_sent_total.clone()))?;

        let drain_tick_latency_ms = Histogram::with_opts(
            HistogramOpts::new(
                "oms_portfolio_drain_tick_latency_ms",
                "Time to drain one dirty-user batch, in milliseconds",
            )
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 200.0, 500.0]),
        )?;
        registry.register(Box::new(drain_tick_latency_ms.clone()))?;

        Ok(Self {
            margin_level,
            used_margin_usd,
            equity_usd,
            calc_errors_total,
            autocutoff_total,
            autocutoff_alerts_sent_total,
            drain_tick_latency_ms,
        })
    }
}

/// Liquidity provider connection and dispatch metrics (components I, J, K).
pub struct ProviderMetrics {
    pub provider_connected: IntGauge,
    pub provider_sent_total: IntCounterVec,
    pub provider_acked_total: IntCounterVec,
    pub provider_dlq_total: IntCounterVec,
    pub provider_round_trip_ms: Histogram,
    pub provider_reconnects_total: IntCounter,
}

impl ProviderMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let provider_connected = IntGauge::new(
            "oms_provider_connected",
            "Liquidity provider socket connection status (1 = connected, 0 = disconnected)",
        )?;
        registry.register(Box::new(provider_connected.clone()))?;

        let provider_sent_total = IntCounterVec::new(
            Opts::new("oms_provider_sent_total", "Total messages sent to the provider")
                .namespace("oms"),
            &["kind"],
        )?;
        registry.register(Box::new(provider_sent_total.clone()))?;

        let provider_acked_total = IntCounterVec::new(
            Opts::new("oms_provider_acked_total", "Total execution reports received")
                .namespace("oms"),
            &["ord_status"],
        )?;
        registry.register(Box::new(provider_acked_total.clone()))?;

        let provider_dlq_total = IntCounterVec::new(
            Opts::new("oms_provider_dlq_total", "Total confirmations routed to the dead letter queue")
                .namespace("oms"),
            &["reason"],
        )?;
        registry.register(Box::new(provider_dlq_total.clone()))?;

        let provider_round_trip_ms = Histogram::with_opts(
            HistogramOpts::new(
                "oms_provider_round_trip_ms",
                "Time from provider send to matching execution report, in milliseconds",
            )
            .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
        )?;
        registry.register(Box::new(provider_round_trip_ms.clone()))?;

        let provider_reconnects_total = IntCounter::new(
            "oms_provider_reconnects_total",
            "Total provider socket reconnect attempts",
        )?;
        registry.register(Box::new(provider_reconnects_total.clone()))?;

        Ok(Self {
            provider_connected,
            provider_sent_total,
            provider_acked_total,
            provider_dlq_total,
            provider_round_trip_ms,
            provider_reconnects_total,
        })
    }
}

/// Cross-cutting process health metrics.
pub struct SystemMetrics {
    pub redis_up: IntGauge,
    pub amqp_up: IntGauge,
    pub market_listener_connected: IntGauge,
    pub market_updates_total: IntCounter,
    pub errors_total: IntCounterVec,
    pub uptime_seconds: IntGauge,
}

impl SystemMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let redis_up = IntGauge::new("oms_redis_up", "Redis connectivity (1 = up, 0 = down)")?;
        registry.register(Box::new(redis_up.clone()))?;

        let amqp_up = IntGauge::new("oms_amqp_up", "RabbitMQ connectivity (1 = up, 0 = down)")?;
        registry.register(Box::new(amqp_up.clone()))?;

        let market_listener_connected = IntGauge::new(
            "oms_market_listener_connected",
            "Market data feed connection status (1 = connected, 0 = disconnected)",
        )?;
        registry.register(Box::new(market_listener_connected.clone()))?;

        let market_updates_total = IntCounter::new(
            "oms_market_updates_total",
            "Total market update frames processed",
        )?;
        registry.register(Box::new(market_updates_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("oms_errors_total", "Total errors by component and kind").namespace("oms"),
            &["component", "kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let uptime_seconds = IntGauge::new("oms_uptime_seconds", "Process uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            redis_up,
            amqp_up,
            market_listener_connected,
            market_updates_total,
            errors_total,
            uptime_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creation_registers_all_families() {
        let registry = MetricsRegistry::new().unwrap();
        assert!(!registry.registry().gather().is_empty());
    }

    #[test]
    fn order_metrics_record() {
        let registry = MetricsRegistry::new().unwrap();
        registry
            .orders()
            .orders_placed_total
            .with_label_values(&["EURUSD", "buy", "local"])
            .inc();
        registry
            .orders()
            .trigger_fired_total
            .with_label_values(&["stop_loss"])
            .inc();
        assert!(!registry.registry().gather().is_empty());
    }

    #[test]
    fn portfolio_metrics_record() {
        let registry = MetricsRegistry::new().unwrap();
        registry.portfolio().margin_level.set(250.0);
        registry
            .portfolio()
            .autocutoff_total
            .with_label_values(&["margin_level"])
            .inc();
        assert!(!registry.registry().gather().is_empty());
    }

    #[test]
    fn provider_metrics_record() {
        let registry = MetricsRegistry::new().unwrap();
        registry.provider().provider_connected.set(1);
        registry
            .provider()
            .provider_dlq_total
            .with_label_values(&["unmapped_routing_state"])
            .inc();
        assert!(!registry.registry().gather().is_empty());
    }

    #[test]
    fn system_metrics_record() {
        let registry = MetricsRegistry::new().unwrap();
        registry.system().redis_up.set(1);
        registry.system().market_updates_total.inc();
        assert!(!registry.registry().gather().is_empty());
    }
}
