//! Redis key namespace (spec.md §6). Centralizing key construction here
//! means the hash-tag discipline ("every user-owned key hash-tagged on
//! `{user_type:user_id}` so user-scoped pipelines are single-slot") is
//! enforced in one place instead of at every call site.

use crate::core::UserType;

fn user_tag(user_type: UserType, user_id: &str) -> String {
    format!("{{{}:{}}}", user_type.as_str(), user_id)
}

pub fn market(symbol: &str) -> String {
    format!("market:{{{}}}", symbol.to_uppercase())
}

pub fn user_config(user_type: UserType, user_id: &str) -> String {
    format!("user:{}:config", user_tag(user_type, user_id))
}

pub fn user_portfolio(user_type: UserType, user_id: &str) -> String {
    format!("user_portfolio:{}", user_tag(user_type, user_id))
}

pub fn user_orders_index(user_type: UserType, user_id: &str) -> String {
    format!("user_orders_index:{}", user_tag(user_type, user_id))
}

pub fn user_holdings(user_type: UserType, user_id: &str, order_id: &str) -> String {
    format!("user_holdings:{}:{}", user_tag(user_type, user_id), order_id)
}

pub fn order_data(order_id: &str) -> String {
    format!("order_data:{}", order_id)
}

pub fn global_order_lookup(lifecycle_id: &str) -> String {
    format!("global_order_lookup:{}", lifecycle_id)
}

pub fn symbol_holders(symbol: &str, user_type: UserType) -> String {
    format!("symbol_holders:{{{}}}:{}", symbol.to_uppercase(), user_type.as_str())
}

pub fn group_config(group: &str, symbol: &str) -> String {
    format!("groups:{{{}}}:{}", group, symbol.to_uppercase())
}

pub fn sl_index(symbol: &str, side: &str) -> String {
    format!("sl_index:{{{}}}:{}", symbol.to_uppercase(), side)
}

pub fn tp_index(symbol: &str, side: &str) -> String {
    format!("tp_index:{{{}}}:{}", symbol.to_uppercase(), side)
}

pub fn pending_index(symbol: &str, order_type: &str) -> String {
    format!("pending_index:{{{}}}:{}", symbol.to_uppercase(), order_type)
}

pub fn pending_orders(order_id: &str) -> String {
    format!("pending_orders:{}", order_id)
}

pub const TRIGGER_ACTIVE_SYMBOLS: &str = "trigger_active_symbols";
pub const PENDING_ACTIVE_SYMBOLS: &str = "pending_active_symbols";
pub const PROVIDER_PENDING_ACTIVE: &str = "provider_pending_active";

pub fn provider_ack(any_id: &str) -> String {
    format!("provider:ack:{}", any_id)
}

pub fn provider_idem(token: &str) -> String {
    format!("provider_idem:{}", token)
}

pub fn autocutoff_alert_sent(user_type: UserType, user_id: &str) -> String {
    format!("autocutoff:alert_sent:{}", user_tag(user_type, user_id))
}

pub fn autocutoff_liquidating(user_type: UserType, user_id: &str) -> String {
    format!("autocutoff:liquidating:{}", user_tag(user_type, user_id))
}

pub fn lock_user_margin(user_type: UserType, user_id: &str) -> String {
    format!("lock:user_margin:{}", user_tag(user_type, user_id))
}

pub fn lock_pending(order_id: &str) -> String {
    format!("lock:pending:{}", order_id)
}

pub fn close_processing(order_id: &str) -> String {
    format!("close_processing:{}", order_id)
}

pub fn idempotency(user_type: UserType, user_id: &str, key: &str) -> String {
    format!("idempotency:{}:{}", user_tag(user_type, user_id), key)
}

pub fn copy_master_followers_active(strategy_provider_id: &str) -> String {
    format!("copy_master_followers:{}:active", strategy_provider_id)
}

pub const CHANNEL_MARKET_PRICE_UPDATES: &str = "market_price_updates";
pub const CHANNEL_PORTFOLIO_UPDATES: &str = "portfolio_updates";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_scoped_keys_share_a_hash_tag() {
        let cfg = user_config(UserType::Live, "42");
        let portfolio = user_portfolio(UserType::Live, "42");
        let idx = user_orders_index(UserType::Live, "42");
        assert!(cfg.contains("{live:42}"));
        assert!(portfolio.contains("{live:42}"));
        assert!(idx.contains("{live:42}"));
    }

    #[test]
    fn symbol_holders_key_tagged_by_symbol() {
        let key = symbol_holders("eurusd", UserType::Live);
        assert_eq!(key, "symbol_holders:{EURUSD}:live");
    }
}
