//! Runtime configuration for the order-lifecycle engine.
//!
//! A [`Config`] is built from a [`profiles::ConfigProfile`] default and then
//! layered with environment variable overrides (`Config::apply_env_overrides`),
//! the same precedence the teacher's config system documents: compiled
//! default first, then environment, later wins.
//!
//! ## Environment variables
//!
//! | Variable | Overrides |
//! |---|---|
//! | `REDIS_HOSTS` | `redis.hosts` (comma separated) |
//! | `REDIS_PASSWORD` | `redis.password` |
//! | `RABBITMQ_URL` | `amqp.url` |
//! | `MARKET_FEED_WS_URL` | `market_feed.ws_url` |
//! | `EXEC_UDS_PATH` | `provider.uds_path` |
//! | `EXEC_TCP_HOST` | `provider.tcp_host` |
//! | `EXEC_TCP_PORT` | `provider.tcp_port` |
//! | `EXEC_CONNECT_TIMEOUT` | `provider.connect_timeout_secs` |
//! | `PROVIDER_SEND_WAIT_SEC` | `provider.send_wait_secs` |
//! | `CONFIRMATION_QUEUE` | `queues.confirmation_queue` |
//! | `CONFIRMATION_DLQ` | `queues.confirmation_dlq` |
//! | `ORDER_DB_UPDATE_QUEUE` | `queues.order_db_update_queue` |
//! | `ORDER_WORKER_OPEN_QUEUE` | `queues.worker_open_queue` |
//! | `ORDER_WORKER_CLOSE_QUEUE` | `queues.worker_close_queue` |
//! | `ORDER_WORKER_CANCEL_QUEUE` | `queues.worker_cancel_queue` |
//! | `ORDER_WORKER_PENDING_QUEUE` | `queues.worker_pending_queue` |
//! | `ORDER_WORKER_REJECT_QUEUE` | `queues.worker_reject_queue` |
//! | `ORDER_WORKER_STOPLOSS_QUEUE` | `queues.worker_stoploss_queue` |
//! | `ORDER_WORKER_TAKEPROFIT_QUEUE` | `queues.worker_takeprofit_queue` |
//! | `TRIGGER_MONITOR_TICK_MS` | `monitors.trigger_tick_ms` |
//! | `TRIGGER_MONITOR_BATCH` | `monitors.trigger_batch` |
//! | `PENDING_MONITOR_TICK_MS` | `monitors.pending_tick_ms` |
//! | `PROVIDER_PENDING_TICK_MS` | `monitors.provider_pending_tick_ms` |
//! | `PORTFOLIO_STRICT_MODE` | `portfolio.strict_mode` (`1`/`true`) |
//! | `EMAIL_SMTP_HOST` / `EMAIL_SMTP_PORT` / `EMAIL_SMTP_USER` / `EMAIL_SMTP_PASSWORD` | `email.*` |
//! | `EMAIL_FROM` | `email.from_address` |
//! | `EMAIL_ALERT_RECIPIENTS` | `email.alert_recipients` (comma separated) |
//! | `LOG_LEVEL` | `metrics.log_level` |
//! | `JSON_LOGS` | `metrics.json_logs` (`1`/`true`) |

pub mod constants;
pub mod profiles;
pub mod types;

pub use constants::*;
pub use profiles::{ConfigProfile, ProfileName};
pub use types::*;

use anyhow::{Context, Result};
use std::env;
use std::path::Path;

impl Config {
    /// Load a profile by name and apply environment variable overrides.
    /// `profile` defaults to `"development"` when unset or unrecognized.
    pub fn load(profile: Option<&str>) -> Result<Self> {
        let name = profile
            .and_then(ProfileName::from_str)
            .unwrap_or(ProfileName::Development);
        let mut cfg = match name {
            ProfileName::Development => ConfigProfile::development(),
            ProfileName::Testing => ConfigProfile::testing(),
            ProfileName::Production => ConfigProfile::production(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `$OMS_PROFILE`, defaulting to the development profile.
    pub fn load_default() -> Result<Self> {
        let profile = env::var("OMS_PROFILE").ok();
        Self::load(profile.as_deref())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("REDIS_HOSTS") {
            self.redis.hosts = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("REDIS_PASSWORD") {
            self.redis.password = Some(v);
        }
        if let Ok(v) = env::var("RABBITMQ_URL") {
            self.amqp.url = v;
        }
        if let Ok(v) = env::var("MARKET_FEED_WS_URL") {
            self.market_feed.ws_url = v;
        }
        if let Ok(v) = env::var("EXEC_UDS_PATH") {
            self.provider.uds_path = Some(Path::new(&v).to_path_buf());
        }
        if let Ok(v) = env::var("EXEC_TCP_HOST") {
            self.provider.tcp_host = Some(v);
        }
        if let Ok(v) = env::var("EXEC_TCP_PORT") {
            self.provider.tcp_port = v.parse().context("EXEC_TCP_PORT must be a u16")?;
        }
        if let Ok(v) = env::var("EXEC_CONNECT_TIMEOUT") {
            self.provider.connect_timeout_secs =
                v.parse().context("EXEC_CONNECT_TIMEOUT must be a u64")?;
        }
        if let Ok(v) = env::var("PROVIDER_SEND_WAIT_SEC") {
            self.provider.send_wait_secs =
                v.parse().context("PROVIDER_SEND_WAIT_SEC must be a u64")?;
        }
        if let Ok(v) = env::var("CONFIRMATION_QUEUE") {
            self.queues.confirmation_queue = v;
        }
        if let Ok(v) = env::var("CONFIRMATION_DLQ") {
            self.queues.confirmation_dlq = v;
        }
        if let Ok(v) = env::var("ORDER_DB_UPDATE_QUEUE") {
            self.queues.order_db_update_queue = v;
        }
        if let Ok(v) = env::var("ORDER_WORKER_OPEN_QUEUE") {
            self.queues.worker_open_queue = v;
        }
        if let Ok(v) = env::var("ORDER_WORKER_CLOSE_QUEUE") {
            self.queues.worker_close_queue = v;
        }
        if let Ok(v) = env::var("ORDER_WORKER_CANCEL_QUEUE") {
            self.queues.worker_cancel_queue = v;
        }
        if let Ok(v) = env::var("ORDER_WORKER_PENDING_QUEUE") {
            self.queues.worker_pending_queue = v;
        }
        if let Ok(v) = env::var("ORDER_WORKER_REJECT_QUEUE") {
            self.queues.worker_reject_queue = v;
        }
        if let Ok(v) = env::var("ORDER_WORKER_STOPLOSS_QUEUE") {
            self.queues.worker_stoploss_queue = v;
        }
        if let Ok(v) = env::var("ORDER_WORKER_TAKEPROFIT_QUEUE") {
            self.queues.worker_takeprofit_queue = v;
        }
        if let Ok(v) = env::var("TRIGGER_MONITOR_TICK_MS") {
            self.monitors.trigger_tick_ms =
                v.parse().context("TRIGGER_MONITOR_TICK_MS must be a u64")?;
        }
        if let Ok(v) = env::var("TRIGGER_MONITOR_BATCH") {
            self.monitors.trigger_batch =
                v.parse().context("TRIGGER_MONITOR_BATCH must be a usize")?;
        }
        if let Ok(v) = env::var("PENDING_MONITOR_TICK_MS") {
            self.monitors.pending_tick_ms =
                v.parse().context("PENDING_MONITOR_TICK_MS must be a u64")?;
        }
        if let Ok(v) = env::var("PROVIDER_PENDING_TICK_MS") {
            self.monitors.provider_pending_tick_ms = v
                .parse()
                .context("PROVIDER_PENDING_TICK_MS must be a u64")?;
        }
        if let Ok(v) = env::var("PORTFOLIO_STRICT_MODE") {
            self.portfolio.strict_mode = is_truthy(&v);
        }
        if let Ok(v) = env::var("EMAIL_SMTP_HOST") {
            self.email.smtp_host = Some(v);
        }
        if let Ok(v) = env::var("EMAIL_SMTP_PORT") {
            self.email.smtp_port = v.parse().context("EMAIL_SMTP_PORT must be a u16")?;
        }
        if let Ok(v) = env::var("EMAIL_SMTP_USER") {
            self.email.smtp_user = Some(v);
        }
        if let Ok(v) = env::var("EMAIL_SMTP_PASSWORD") {
            self.email.smtp_password = Some(v);
        }
        if let Ok(v) = env::var("EMAIL_FROM") {
            self.email.from_address = v;
        }
        if let Ok(v) = env::var("EMAIL_ALERT_RECIPIENTS") {
            self.email.alert_recipients = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            self.metrics.log_level = v;
        }
        if let Ok(v) = env::var("JSON_LOGS") {
            self.metrics.json_logs = is_truthy(&v);
        }
        Ok(())
    }

    /// Validate configuration values that can't be expressed in the type
    /// system (cross-field invariants, "must be one of" checks).
    pub fn validate(&self) -> Result<()> {
        if self.redis.hosts.is_empty() {
            anyhow::bail!("redis.hosts must not be empty");
        }

        if self.provider.uds_path.is_none() && self.provider.tcp_host.is_none() {
            anyhow::bail!("provider must configure either uds_path or tcp_host");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.metrics.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of: {:?}",
                self.metrics.log_level,
                valid_log_levels
            );
        }

        if self.portfolio.max_concurrent_users == 0 {
            anyhow::bail!("portfolio.max_concurrent_users must be positive");
        }

        Ok(())
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_profile_validates() {
        assert!(ConfigProfile::development().validate().is_ok());
    }

    #[test]
    fn testing_profile_validates_and_differs_from_development() {
        let testing = ConfigProfile::testing();
        assert!(testing.validate().is_ok());
        assert_eq!(testing.monitors.trigger_tick_ms, 20);
        assert_ne!(
            testing.monitors.trigger_tick_ms,
            ConfigProfile::development().monitors.trigger_tick_ms
        );
    }

    #[test]
    fn production_profile_requires_strict_mode_and_uds() {
        let prod = ConfigProfile::production();
        assert!(prod.validate().is_ok());
        assert!(prod.portfolio.strict_mode);
        assert!(prod.provider.uds_path.is_some());
    }

    #[test]
    fn missing_provider_transport_fails_validation() {
        let mut cfg = ConfigProfile::development();
        cfg.provider.uds_path = None;
        cfg.provider.tcp_host = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_override_changes_redis_hosts() {
        env::set_var("REDIS_HOSTS", "10.0.0.1:6379,10.0.0.2:6379");
        let mut cfg = ConfigProfile::development();
        cfg.apply_env_overrides().unwrap();
        assert_eq!(
            cfg.redis.hosts,
            vec!["10.0.0.1:6379".to_string(), "10.0.0.2:6379".to_string()]
        );
        env::remove_var("REDIS_HOSTS");
    }

    #[test]
    fn truthy_parses_common_spellings() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["0", "false", "no", ""] {
            assert!(!is_truthy(v), "{v} should not be truthy");
        }
    }
}
