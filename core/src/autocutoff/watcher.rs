//! Auto-Cutoff Watcher (component L, spec.md §4.12 steps 1-5).
//!
//! Subscribes to the dirty-user bus's `portfolio_updates` channel and,
//! for each user event, classifies the account into one of three margin
//! zones and reacts: safe (clear sentinels), alert (rate-limited email),
//! or liquidation (hand off to [`super::liquidation::LiquidationEngine`]).

use crate::autocutoff::{AlertNotifier, LiquidationEngine};
use crate::core::{EngineError, UserType};
use crate::monitoring::MetricsRegistry;
use crate::redis_store::{keys, RedisStore};
use crate::stores::UserConfigStore;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Alert sentinel TTL: at most one email per user per window (spec.md
/// §4.12 step 4: `SET NX EX 3h`).
const ALERT_SENTINEL_TTL_SECS: u64 = 3 * 3600;
/// Safety-valve TTL on the liquidation-in-progress sentinel, in case a
/// crash leaves it stuck — the watcher always deletes it explicitly when
/// the liquidation run completes, this TTL only bounds the worst case.
const LIQUIDATING_SENTINEL_TTL_SECS: u64 = 180;

pub struct AutoCutoffWatcher {
    redis: RedisStore,
    user_configs: Arc<dyn UserConfigStore>,
    liquidation: Arc<LiquidationEngine>,
    notifier: Arc<dyn AlertNotifier>,
    metrics: Arc<MetricsRegistry>,
}

impl AutoCutoffWatcher {
    pub fn new(
        redis: RedisStore,
        user_configs: Arc<dyn UserConfigStore>,
        liquidation: Arc<LiquidationEngine>,
        notifier: Arc<dyn AlertNotifier>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            redis,
            user_configs,
            liquidation,
            notifier,
            metrics,
        }
    }

    /// Runs forever, processing one `portfolio_updates` event at a time.
    pub async fn run(self: Arc<Self>, mut portfolio_updates: broadcast::Receiver<(UserType, String)>) {
        loop {
            match portfolio_updates.recv().await {
                Ok((user_type, user_id)) => {
                    if let Err(e) = self.handle_event(user_type, &user_id).await {
                        warn!(error = ?e, user_id, "auto-cutoff watcher failed processing portfolio update");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "auto-cutoff watcher lagged behind portfolio updates");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn handle_event(&self, user_type: UserType, user_id: &str) -> Result<(), EngineError> {
        let portfolio = self.redis.hgetall(&keys::user_portfolio(user_type, user_id)).await?;

        let used_margin = portfolio
            .get("used_margin_all")
            .and_then(|v| RedisStore::parse_decimal(v))
            .unwrap_or(Decimal::ZERO);

        // spec.md §4.12 step 2: used_margin == 0 is unconditionally safe.
        if used_margin.is_zero() {
            self.clear_liquidating_sentinel(user_type, user_id).await?;
            return Ok(());
        }

        let margin_level = portfolio
            .get("margin_level")
            .and_then(|v| RedisStore::parse_decimal(v))
            .unwrap_or_else(|| Decimal::from(crate::core::MARGIN_LEVEL_SAFE_SENTINEL));

        let user_cfg = self
            .user_configs
            .get(user_type, user_id)
            .await?
            .ok_or_else(|| EngineError::Config(crate::core::ConfigError::UserConfigNotFound(user_id.to_string())))?;

        let cutoff = user_cfg.auto_cutoff_level;
        let liquidation_level = user_cfg.auto_liquidation_level;

        if margin_level > cutoff {
            self.clear_liquidating_sentinel(user_type, user_id).await?;
        } else if margin_level > liquidation_level {
            self.handle_alert_zone(user_type, user_id, margin_level).await?;
        } else {
            self.handle_liquidation_zone(user_type, user_id).await?;
        }

        Ok(())
    }

    async fn clear_liquidating_sentinel(&self, user_type: UserType, user_id: &str) -> Result<(), EngineError> {
        self.redis.del(&keys::autocutoff_liquidating(user_type, user_id)).await
    }

    async fn handle_alert_zone(
        &self,
        user_type: UserType,
        user_id: &str,
        margin_level: Decimal,
    ) -> Result<(), EngineError> {
        let sentinel = keys::autocutoff_alert_sent(user_type, user_id);
        let acquired = self.redis.set_nx_ex(&sentinel, "1", ALERT_SENTINEL_TTL_SECS).await?;
        if !acquired {
            return Ok(());
        }

        match self.notifier.send_alert(user_type, user_id, margin_level).await {
            Ok(()) => {
                self.metrics.portfolio().autocutoff_alerts_sent_total.inc();
                info!(user_type = %user_type, user_id, %margin_level, "auto-cutoff alert sent");
            }
            Err(e) => {
                // spec.md §4.12 step 4: "if the email fails, delete the
                // sentinel so retry can happen" on the next event.
                warn!(error = ?e, user_id, "auto-cutoff alert failed, clearing sentinel for retry");
                self.redis.del(&sentinel).await?;
            }
        }
        Ok(())
    }

    async fn handle_liquidation_zone(&self, user_type: UserType, user_id: &str) -> Result<(), EngineError> {
        let sentinel = keys::autocutoff_liquidating(user_type, user_id);
        let acquired = self.redis.set_nx_ex(&sentinel, "1", LIQUIDATING_SENTINEL_TTL_SECS).await?;
        if !acquired {
            debug!(user_id, "auto-cutoff liquidation already in progress, skipping");
            return Ok(());
        }

        let result = self.liquidation.liquidate(user_type, user_id).await;
        // Always release so the next under-margin event can re-trigger if
        // the account is still unhealthy (spec.md §4.12 step 5: "release
        // the sentinel when done").
        self.redis.del(&sentinel).await?;

        if let Err(e) = &result {
            warn!(error = ?e, user_id, "auto-cutoff liquidation run failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn zone_classification_matches_spec_ordering() {
        let cutoff = dec!(50);
        let liquidation_level = dec!(10);

        let safe = dec!(80) > cutoff;
        let alert = dec!(30) <= cutoff && dec!(30) > liquidation_level;
        let liquidate = dec!(5) <= liquidation_level;

        assert!(safe);
        assert!(alert);
        assert!(liquidate);
    }
}
