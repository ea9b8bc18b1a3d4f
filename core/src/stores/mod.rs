//! Read-only configuration stores (spec.md §1 non-goals: "User/group
//! onboarding; group config and user config are read-only inputs").
//!
//! `UserConfigStore`/`GroupConfigStore` read from Redis, the hot path for
//! every request. `GroupConfigDbFallback` models the "fall back to a DB
//! lookup via the external collaborator" step in spec.md §4.3 step 4 as
//! a narrow trait — no SQL client lives in this crate (§1 non-goal: the
//! persistent SQL writer is an external collaborator).

use crate::core::{ConfigError, EngineError, GroupConfig, InstrumentType, UserConfig, UserType};
use crate::redis_store::{keys, RedisStore};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;

#[async_trait]
pub trait UserConfigStore: Send + Sync {
    async fn get(&self, user_type: UserType, user_id: &str) -> Result<Option<UserConfig>, EngineError>;
}

#[async_trait]
pub trait GroupConfigStore: Send + Sync {
    async fn get(&self, group: &str, symbol: &str) -> Result<Option<GroupConfig>, EngineError>;
}

/// External DB fallback for incomplete group config (spec.md §4.3 step 4).
/// No default implementation talks to a real database: operators inject
/// one backed by their SQL service's read endpoint. Credentials come
/// from `Config` only (see DESIGN.md Open Question #3) — never a
/// hard-coded default.
#[async_trait]
pub trait GroupConfigDbFallback: Send + Sync {
    async fn fetch(&self, group: &str, symbol: &str) -> Result<Option<GroupConfig>, EngineError>;
}

/// No-op fallback used when no DB collaborator is configured; any
/// incomplete group config simply fails with `missing_group_data`.
pub struct NoDbFallback;

#[async_trait]
impl GroupConfigDbFallback for NoDbFallback {
    async fn fetch(&self, _group: &str, _symbol: &str) -> Result<Option<GroupConfig>, EngineError> {
        Ok(None)
    }
}

pub struct RedisUserConfigStore {
    redis: RedisStore,
}

impl RedisUserConfigStore {
    pub fn new(redis: RedisStore) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl UserConfigStore for RedisUserConfigStore {
    async fn get(&self, user_type: UserType, user_id: &str) -> Result<Option<UserConfig>, EngineError> {
        let key = keys::user_config(user_type, user_id);
        let fields = self.redis.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let wallet_balance = fields.get("wallet_balance").and_then(|v| Decimal::from_str(v).ok());
        let leverage = fields
            .get("leverage")
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::ZERO);
        let group = fields.get("group").cloned().unwrap_or_default();
        let sending_orders = fields
            .get("sending_orders")
            .map(|s| crate::core::SendingOrders::from(s.as_str()))
            .unwrap_or(crate::core::SendingOrders::None);
        let status = fields.get("status").cloned().unwrap_or_default();
        let auto_cutoff_level = fields
            .get("auto_cutoff_level")
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::from(50));
        let auto_liquidation_level = fields
            .get("auto_liquidation_level")
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::from(10));

        Ok(Some(UserConfig {
            user_id: user_id.to_string(),
            user_type,
            wallet_balance,
            leverage,
            group,
            sending_orders,
            status,
            auto_cutoff_level,
            auto_liquidation_level,
        }))
    }
}

pub struct RedisGroupConfigStore {
    redis: RedisStore,
    db_fallback: std::sync::Arc<dyn GroupConfigDbFallback>,
}

impl RedisGroupConfigStore {
    pub fn new(redis: RedisStore, db_fallback: std::sync::Arc<dyn GroupConfigDbFallback>) -> Self {
        Self { redis, db_fallback }
    }

    fn parse(group: &str, symbol: &str, fields: &std::collections::HashMap<String, String>) -> Option<GroupConfig> {
        let contract_size = fields.get("contract_size").and_then(|v| Decimal::from_str(v).ok())?;
        let profit_currency = fields.get("profit_currency").cloned()?;
        let instrument_type = fields
            .get("type")
            .and_then(|v| v.parse::<u8>().ok())
            .and_then(InstrumentType::from_code)?;
        let spread = fields
            .get("spread")
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::ZERO);
        let spread_pip = fields
            .get("spread_pip")
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::ZERO);
        let commission_rate = fields
            .get("commission_rate")
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::ZERO);
        let commission_type = fields.get("commission_type").cloned().unwrap_or_default();
        let commission_value_type = fields.get("commission_value_type").cloned().unwrap_or_default();
        let crypto_margin_factor = fields.get("crypto_margin_factor").and_then(|v| Decimal::from_str(v).ok());
        let group_margin = fields.get("group_margin").and_then(|v| Decimal::from_str(v).ok());

        Some(GroupConfig {
            group: group.to_string(),
            symbol: symbol.to_string(),
            contract_size,
            profit_currency,
            instrument_type,
            spread,
            spread_pip,
            commission_rate,
            commission_type,
            commission_value_type,
            crypto_margin_factor,
            group_margin,
        })
    }
}

#[async_trait]
impl GroupConfigStore for RedisGroupConfigStore {
    async fn get(&self, group: &str, symbol: &str) -> Result<Option<GroupConfig>, EngineError> {
        let key = keys::group_config(group, symbol);
        let fields = self.redis.hgetall(&key).await?;

        if let Some(cfg) = Self::parse(group, symbol, &fields) {
            return Ok(Some(cfg));
        }

        // Incomplete: fall back to the DB collaborator and merge (spec.md §4.3 step 4).
        match self.db_fallback.fetch(group, symbol).await? {
            Some(fallback) => Ok(Some(fallback)),
            None => Err(EngineError::Config(ConfigError::MissingGroupData {
                group: group.to_string(),
                symbol: symbol.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_incomplete_fields() {
        let mut fields = std::collections::HashMap::new();
        fields.insert("contract_size".to_string(), "100000".to_string());
        // missing profit_currency and type
        assert!(RedisGroupConfigStore::parse("Standard", "EURUSD", &fields).is_none());
    }

    #[test]
    fn parse_accepts_complete_fields() {
        let mut fields = std::collections::HashMap::new();
        fields.insert("contract_size".to_string(), "100000".to_string());
        fields.insert("profit_currency".to_string(), "USD".to_string());
        fields.insert("type".to_string(), "1".to_string());
        let cfg = RedisGroupConfigStore::parse("Standard", "EURUSD", &fields).unwrap();
        assert_eq!(cfg.contract_size, Decimal::from(100000));
    }
}
