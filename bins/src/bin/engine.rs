//! `oms-engine`: the long-running order-lifecycle process.
//!
//! Wires every component named in spec.md §5 to the three external
//! systems (Redis, RabbitMQ, the provider socket) and spawns one task
//! per long-running loop. `Ctrl-C` triggers a best-effort graceful
//! shutdown: in-flight loops are not interrupted mid-operation, the
//! process simply stops accepting new work and exits once the runtime
//! drains.

use anyhow::{Context, Result};
use clap::Parser;
use oms_bins::common::{init_logging, redis_url, CommonArgs};
use oms_core::amqp::AmqpClient;
use oms_core::autocutoff::{AutoCutoffWatcher, LettreAlertNotifier, LiquidationEngine};
use oms_core::config::Config;
use oms_core::db_update::AmqpDbUpdatePublisher;
use oms_core::dirty_bus::DirtyUserBus;
use oms_core::execution::{ExecutionEngine, ProviderGateway};
use oms_core::market_listener::MarketListener;
use oms_core::monitoring::{MetricsRegistry, MetricsServer, MetricsServerConfig};
use oms_core::pending::PendingMonitor;
use oms_core::portfolio::PortfolioCalculator;
use oms_core::provider::workers::PendingMarginMonitor;
use oms_core::provider::{Dispatcher, ProviderConnection, ProviderWorkers};
use oms_core::quote_store::QuoteStore;
use oms_core::redis_store::RedisStore;
use oms_core::resilience::install_panic_handler;
use oms_core::stores::{GroupConfigStore, NoDbFallback, RedisGroupConfigStore, RedisUserConfigStore, UserConfigStore};
use oms_core::triggers::TriggerMonitor;
use std::sync::Arc;
use tracing::info;

/// Default staleness window for the quote store (spec.md §4.1 `get`: "stale
/// after `now - ts > staleness`, default 5s").
const QUOTE_STALENESS_MS: i64 = 5_000;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = CommonArgs::parse();
    init_logging(&args.log_level, args.json_logs)?;
    install_panic_handler();

    let config = Config::load(args.profile.as_deref()).context("loading configuration")?;
    info!(profile = ?args.profile, "oms-engine starting");

    let redis = RedisStore::connect(&redis_url(&config.redis)?)
        .await
        .context("connecting to redis")?;
    let amqp = AmqpClient::connect(&config.amqp.url)
        .await
        .context("connecting to rabbitmq")?;

    let quotes = Arc::new(QuoteStore::new(QUOTE_STALENESS_MS));
    let dirty_bus = Arc::new(DirtyUserBus::new(redis.clone()));
    let metrics = Arc::new(MetricsRegistry::new().context("building metrics registry")?);

    let user_configs: Arc<dyn UserConfigStore> = Arc::new(RedisUserConfigStore::new(redis.clone()));
    let group_configs: Arc<dyn GroupConfigStore> =
        Arc::new(RedisGroupConfigStore::new(redis.clone(), Arc::new(NoDbFallback)));

    let db_update = Arc::new(
        AmqpDbUpdatePublisher::new(amqp.clone(), &config.queues.order_db_update_queue)
            .await
            .context("declaring order_db_update_queue")?,
    );

    // `ProviderConnection` is cheap to clone (wraps one `Arc<Shared>`
    // internally), so it does not itself need an outer `Arc`; `run`
    // consumes an owned clone while `provider_gateway` holds the trait
    // object shared by everything that only needs to send/await.
    let provider_connection = ProviderConnection::new(
        config.provider.clone(),
        amqp.clone(),
        config.queues.confirmation_queue.clone(),
    );
    let provider_gateway: Arc<dyn ProviderGateway> = Arc::new(provider_connection.clone());

    let execution = Arc::new(ExecutionEngine::new(
        redis.clone(),
        quotes.clone(),
        user_configs.clone(),
        group_configs.clone(),
        provider_gateway.clone(),
        db_update.clone(),
        config.portfolio.strict_mode,
        QUOTE_STALENESS_MS,
    ));

    let triggers = Arc::new(TriggerMonitor::new(redis.clone(), quotes.clone(), execution.clone()));
    let pending = Arc::new(PendingMonitor::new(
        redis.clone(),
        quotes.clone(),
        user_configs.clone(),
        group_configs.clone(),
        execution.clone(),
        db_update.clone(),
        config.portfolio.strict_mode,
    ));
    let pending_margin = Arc::new(PendingMarginMonitor::new(
        redis.clone(),
        quotes.clone(),
        provider_gateway.clone(),
        config.portfolio.strict_mode,
        &config.monitors,
    ));

    let provider_workers = Arc::new(ProviderWorkers::new(
        redis.clone(),
        amqp.clone(),
        quotes.clone(),
        config.queues.clone(),
        config.portfolio.strict_mode,
        execution.clone(),
        triggers.clone(),
        db_update.clone(),
        pending_margin.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(redis.clone(), amqp.clone(), config.queues.clone(), metrics.clone()));

    let portfolio = Arc::new(PortfolioCalculator::new(
        redis.clone(),
        quotes.clone(),
        user_configs.clone(),
        group_configs.clone(),
        config.portfolio.strict_mode,
    ));

    let liquidation = Arc::new(LiquidationEngine::new(
        redis.clone(),
        quotes.clone(),
        execution.clone(),
        db_update.clone(),
        config.portfolio.strict_mode,
        metrics.clone(),
    ));
    let alert_notifier = Arc::new(LettreAlertNotifier::new(&config.email).context("building SMTP alert notifier")?);
    let autocutoff = Arc::new(AutoCutoffWatcher::new(
        redis.clone(),
        user_configs.clone(),
        liquidation.clone(),
        alert_notifier,
        metrics.clone(),
    ));

    let market_listener = Arc::new(MarketListener::new(
        config.market_feed.ws_url.clone(),
        quotes.clone(),
        redis.clone(),
        dirty_bus.clone(),
    ));

    let mut handles = Vec::new();

    handles.push(tokio::spawn({
        let market_listener = market_listener.clone();
        async move { market_listener.run().await }
    }));
    handles.push(tokio::spawn({
        let portfolio = portfolio.clone();
        let dirty_bus = dirty_bus.clone();
        let market_updates = dirty_bus.subscribe_market_updates();
        async move { portfolio.run(market_updates, dirty_bus).await }
    }));
    handles.push(tokio::spawn({
        let autocutoff = autocutoff.clone();
        let portfolio_updates = dirty_bus.subscribe_portfolio_updates();
        async move { autocutoff.run(portfolio_updates).await }
    }));
    handles.push(tokio::spawn({
        let triggers = triggers.clone();
        async move { triggers.run().await }
    }));
    handles.push(tokio::spawn({
        let pending = pending.clone();
        async move { pending.run().await }
    }));
    handles.push(tokio::spawn({
        let pending_margin = pending_margin.clone();
        async move { pending_margin.run().await }
    }));
    handles.push(tokio::spawn({
        let provider_connection = provider_connection.clone();
        async move { provider_connection.run().await }
    }));
    handles.push(tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            if let Err(e) = dispatcher.run().await {
                tracing::error!(error = ?e, "dispatcher exited");
            }
        }
    }));
    handles.push(tokio::spawn({
        let provider_workers = provider_workers.clone();
        async move {
            if let Err(e) = provider_workers.run_all().await {
                tracing::error!(error = ?e, "provider workers exited");
            }
        }
    }));

    if config.monitoring.enable_prometheus {
        let listen_addr = config
            .monitoring
            .metrics_addr
            .parse()
            .context("parsing monitoring.metrics_addr")?;
        let server = MetricsServer::new(
            MetricsServerConfig {
                listen_addr,
                metrics_path: "/metrics".to_string(),
            },
            metrics.clone(),
        );
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                tracing::error!(error = ?e, "metrics server exited");
            }
        }));
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
    let mut shutdown_tx = Some(shutdown_tx);
    ctrlc::set_handler(move || {
        if let Some(tx) = shutdown_tx.take() {
            let _ = tx.send(());
        }
    })
    .context("installing Ctrl-C handler")?;

    tokio::select! {
        _ = &mut shutdown_rx => {
            info!("shutdown signal received, stopping oms-engine");
        }
        _ = async { for h in handles { let _ = h.await; } } => {
            tracing::error!("all engine tasks exited unexpectedly");
        }
    }

    Ok(())
}
