//! Explicit codec between [`Order`] and a Redis hash (design notes §9:
//! "Dynamic dicts / partial records ... replace with tagged variants ...
//! codecs into/out of Redis string maps are explicit").
//!
//! The full order is serialized as one `data` JSON field (keeping the
//! codec a single round-trippable blob rather than ~30 ad hoc scalar
//! fields), plus a handful of top-level scalar fields
//! (`status`, `symbol`, `user_id`, `user_type`) that are hot enough to be
//! worth reading with a single `HGET` without a full deserialize — the
//! dispatcher's routing table (§4.10) only needs `status`.

use crate::core::{EngineError, InfraError, Order};

pub fn to_fields(order: &Order) -> Result<Vec<(&'static str, String)>, EngineError> {
    let json = serde_json::to_string(order)
        .map_err(|e| EngineError::Infra(InfraError::Redis(e.to_string())))?;
    Ok(vec![
        ("data", json),
        ("status", order.status.to_string()),
        ("symbol", order.symbol.clone()),
        ("user_id", order.user_id.clone()),
        ("user_type", order.user_type.to_string()),
    ])
}

pub fn from_json(raw: &str) -> Result<Order, EngineError> {
    serde_json::from_str(raw).map_err(|e| EngineError::Infra(InfraError::Redis(e.to_string())))
}

pub fn from_hash(
    fields: &std::collections::HashMap<String, String>,
) -> Result<Order, EngineError> {
    let raw = fields
        .get("data")
        .ok_or_else(|| EngineError::Infra(InfraError::Redis("missing data field".into())))?;
    from_json(raw)
}
