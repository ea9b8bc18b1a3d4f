use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the order-lifecycle engine.
///
/// Every field has a profile default (see [`super::profiles::ConfigProfile`])
/// and can be overridden by an environment variable at process start; see
/// [`Config::apply_env_overrides`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub redis: RedisConfig,
    pub amqp: AmqpConfig,
    pub market_feed: MarketFeedConfig,
    pub provider: ProviderConfig,
    pub queues: QueueConfig,
    pub monitors: MonitorConfig,
    pub portfolio: PortfolioConfig,
    pub email: EmailConfig,
    pub metrics: MetricsConfig,
    pub monitoring: MonitoringConfig,
}

/// Redis connection settings. `hosts` holds one or more `host:port` pairs;
/// only the first is dialed today but the field is plural so a future
/// cluster/sentinel client can read the same config without a schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_redis_db")]
    pub db: i64,
}

fn default_redis_db() -> i64 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpConfig {
    pub url: String,
}

/// Upstream market feed (component B, spec.md §4.2 ingress): "WebSocket
/// URL carrying binary frames".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketFeedConfig {
    pub ws_url: String,
}

/// Liquidity provider socket configuration. Exactly one of `uds_path` or
/// (`tcp_host`, `tcp_port`) is used depending on which is set; UDS takes
/// precedence when both are present (matches a colocated provider gateway).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub uds_path: Option<PathBuf>,
    #[serde(default)]
    pub tcp_host: Option<String>,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_send_wait_secs")]
    pub send_wait_secs: u64,
    #[serde(default = "default_idem_ttl_secs")]
    pub idempotency_ttl_secs: u64,
}

fn default_tcp_port() -> u16 {
    9443
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_send_wait_secs() -> u64 {
    2
}
fn default_idem_ttl_secs() -> u64 {
    7 * 24 * 3600
}

/// Names of the AMQP queues the engine declares and consumes from. Kept as
/// config (rather than constants) so an operator can run two engines against
/// disjoint queue sets in the same broker for a staged rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_confirmation_queue")]
    pub confirmation_queue: String,
    #[serde(default = "default_confirmation_dlq")]
    pub confirmation_dlq: String,
    #[serde(default = "default_db_update_queue")]
    pub order_db_update_queue: String,
    #[serde(default = "default_worker_open_queue")]
    pub worker_open_queue: String,
    #[serde(default = "default_worker_close_queue")]
    pub worker_close_queue: String,
    #[serde(default = "default_worker_cancel_queue")]
    pub worker_cancel_queue: String,
    #[serde(default = "default_worker_pending_queue")]
    pub worker_pending_queue: String,
    #[serde(default = "default_worker_reject_queue")]
    pub worker_reject_queue: String,
    #[serde(default = "default_worker_stoploss_queue")]
    pub worker_stoploss_queue: String,
    #[serde(default = "default_worker_takeprofit_queue")]
    pub worker_takeprofit_queue: String,
}

fn default_confirmation_queue() -> String {
    "confirmation_queue".to_string()
}
fn default_confirmation_dlq() -> String {
    "confirmation_dlq".to_string()
}
fn default_db_update_queue() -> String {
    "order_db_update_queue".to_string()
}
fn default_worker_open_queue() -> String {
    "order_worker_open_queue".to_string()
}
fn default_worker_close_queue() -> String {
    "order_worker_close_queue".to_string()
}
fn default_worker_cancel_queue() -> String {
    "order_worker_cancel_queue".to_string()
}
fn default_worker_pending_queue() -> String {
    "order_worker_pending_queue".to_string()
}
fn default_worker_reject_queue() -> String {
    "order_worker_reject_queue".to_string()
}
fn default_worker_stoploss_queue() -> String {
    "order_worker_stoploss_queue".to_string()
}
fn default_worker_takeprofit_queue() -> String {
    "order_worker_takeprofit_queue".to_string()
}

/// Tick/batch sizing for the trigger and pending-order scan loops
/// (components G and H) and the provider-pending margin monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_trigger_tick_ms")]
    pub trigger_tick_ms: u64,
    #[serde(default = "default_trigger_batch")]
    pub trigger_batch: usize,
    #[serde(default = "default_pending_tick_ms")]
    pub pending_tick_ms: u64,
    #[serde(default = "default_provider_pending_tick_ms")]
    pub provider_pending_tick_ms: u64,
}

fn default_trigger_tick_ms() -> u64 {
    150
}
fn default_trigger_batch() -> usize {
    200
}
fn default_pending_tick_ms() -> u64 {
    150
}
fn default_provider_pending_tick_ms() -> u64 {
    500
}

/// Portfolio calculator (component D) tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    #[serde(default = "default_portfolio_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_portfolio_concurrency")]
    pub max_concurrent_users: usize,
    /// When true, a missing USD conversion quote is a hard calc error.
    /// When false, the portfolio is marked degraded and the stale/last-known
    /// value is used instead.
    #[serde(default)]
    pub strict_mode: bool,
}

fn default_portfolio_tick_ms() -> u64 {
    200
}
fn default_portfolio_concurrency() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    #[serde(default)]
    pub alert_recipients: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}
fn default_from_address() -> String {
    "oms-engine@localhost".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enable_prometheus: bool,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_prometheus: true,
            metrics_addr: default_metrics_addr(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}
