//! Domain-specific error kinds for the order lifecycle engine.
//!
//! Each variant group corresponds to one of the error "kinds" named in the
//! specification's error handling design: validation, pricing, config,
//! margin, state, external and infrastructure. They compose into one
//! [`EngineError`] so callers at the API boundary can map a single type to
//! a response code without matching on strings.

use thiserror::Error;

/// Shape/numeric/state validation failures (spec.md error taxonomy).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingFields(String),
    #[error("invalid order type: {0}")]
    InvalidOrderType(String),
    #[error("invalid numeric field {field}: {reason}")]
    InvalidNumericFields { field: String, reason: String },
    #[error("user is not verified")]
    UserNotVerified,
    #[error("invalid leverage: {0}")]
    InvalidLeverage(String),
}

/// Quote staleness / missing-quote failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("no quote available for symbol {0}")]
    NoQuote(String),
    #[error("quote for symbol {symbol} is stale (age_ms={age_ms})")]
    StaleQuote { symbol: String, age_ms: u64 },
    #[error("no conversion pair available for currency {0}")]
    NoConversion(String),
}

/// Missing/incomplete group or user configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing group data for group={group} symbol={symbol}")]
    MissingGroupData { group: String, symbol: String },
    #[error("missing contract_size for group={group} symbol={symbol}")]
    MissingContractSize { group: String, symbol: String },
    #[error("missing profit_currency for group={group} symbol={symbol}")]
    MissingProfitCurrency { group: String, symbol: String },
    #[error("user config not found for {0}")]
    UserConfigNotFound(String),
}

/// Margin computation / sufficiency failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarginError {
    #[error("margin calculation failed: {0}")]
    CalculationFailed(String),
    #[error("insufficient margin: required={required} available={available}")]
    InsufficientMargin { required: String, available: String },
    #[error("overall margin recomputation failed for user {0}")]
    OverallMarginFailed(String),
}

/// Illegal state transitions / conflicting writes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("order already exists: {0}")]
    OrderExists(String),
    #[error("inconsistent hash tags for order {0}")]
    InconsistentHashTags(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("invalid close status for order {0}: {1}")]
    InvalidCloseStatus(String, String),
    #[error("unsupported flow for sending_orders={0}")]
    UnsupportedFlow(String),
    #[error("idempotency key already in progress")]
    IdempotencyInProgress,
}

/// Failures talking to the liquidity provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalError {
    #[error("provider connection unreachable")]
    ProviderUnreachable,
    #[error("provider send failed: {0}")]
    ProviderSendFailed(String),
    #[error("timed out waiting for provider send ack")]
    ProviderSendTimeout,
    #[error("timed out waiting for cancel ack")]
    CancelAckTimeout,
    #[error("timed out waiting for close ack")]
    CloseAckTimeout,
}

/// Transient infrastructure failures (Redis/AMQP), normally retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InfraError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("amqp error: {0}")]
    Amqp(String),
    #[error("email error: {0}")]
    Email(String),
}

/// Top-level engine error, composing every kind above.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Margin(#[from] MarginError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    External(#[from] ExternalError),
    #[error(transparent)]
    Infra(#[from] InfraError),
}

impl EngineError {
    /// Stable reason code returned to API callers (spec.md §4.3 error taxonomy).
    pub fn reason_code(&self) -> String {
        match self {
            EngineError::Validation(ValidationError::MissingFields(_)) => {
                "missing_fields".to_string()
            }
            EngineError::Validation(ValidationError::InvalidOrderType(_)) => {
                "invalid_order_type".to_string()
            }
            EngineError::Validation(ValidationError::InvalidNumericFields { .. }) => {
                "invalid_numeric_fields".to_string()
            }
            EngineError::Validation(ValidationError::UserNotVerified) => {
                "user_not_verified".to_string()
            }
            EngineError::Validation(ValidationError::InvalidLeverage(_)) => {
                "invalid_leverage".to_string()
            }
            EngineError::Config(ConfigError::MissingGroupData { .. })
            | EngineError::Config(ConfigError::MissingContractSize { .. })
            | EngineError::Config(ConfigError::MissingProfitCurrency { .. }) => {
                "missing_group_data".to_string()
            }
            EngineError::Config(ConfigError::UserConfigNotFound(_)) => {
                "user_not_found".to_string()
            }
            EngineError::Pricing(_) => "pricing_failed".to_string(),
            EngineError::Margin(MarginError::CalculationFailed(_)) => {
                "margin_calculation_failed".to_string()
            }
            EngineError::Margin(MarginError::InsufficientMargin { .. }) => {
                "insufficient_margin".to_string()
            }
            EngineError::Margin(MarginError::OverallMarginFailed(_)) => {
                "overall_margin_failed".to_string()
            }
            EngineError::State(StateError::OrderExists(_)) => {
                "place_order_failed:order_exists".to_string()
            }
            EngineError::State(StateError::InconsistentHashTags(_)) => {
                "place_order_failed:inconsistent_hash_tags".to_string()
            }
            EngineError::State(StateError::UserNotFound(_)) => {
                "place_order_failed:user_not_found".to_string()
            }
            EngineError::State(StateError::InvalidCloseStatus(_, _)) => {
                "invalid_close_status".to_string()
            }
            EngineError::State(StateError::UnsupportedFlow(_)) => {
                "unsupported_flow".to_string()
            }
            EngineError::State(StateError::IdempotencyInProgress) => {
                "idempotency_in_progress".to_string()
            }
            EngineError::External(ExternalError::ProviderUnreachable) => {
                "provider_unreachable".to_string()
            }
            EngineError::External(ExternalError::ProviderSendFailed(_)) => {
                "provider_send_failed".to_string()
            }
            EngineError::External(ExternalError::ProviderSendTimeout) => {
                "provider_send_timeout".to_string()
            }
            EngineError::External(ExternalError::CancelAckTimeout) => {
                "cancel_ack_timeout".to_string()
            }
            EngineError::External(ExternalError::CloseAckTimeout) => {
                "close_ack_timeout".to_string()
            }
            EngineError::Infra(InfraError::Redis(_)) => "infra_redis".to_string(),
            EngineError::Infra(InfraError::Amqp(_)) => "infra_amqp".to_string(),
            EngineError::Infra(InfraError::Email(_)) => "infra_email".to_string(),
        }
    }

    /// Whether this error is recoverable via retry (infra kind) vs. terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Infra(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_code_stable_for_insufficient_margin() {
        let err = EngineError::Margin(MarginError::InsufficientMargin {
            required: "200".into(),
            available: "100".into(),
        });
        assert_eq!(err.reason_code(), "insufficient_margin");
    }

    #[test]
    fn infra_errors_are_retryable() {
        let err = EngineError::Infra(InfraError::Redis("timeout".into()));
        assert!(err.is_retryable());
        let err = EngineError::State(StateError::OrderExists("o1".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn place_order_failed_carries_cause() {
        let err = EngineError::State(StateError::OrderExists("o1".into()));
        assert_eq!(err.reason_code(), "place_order_failed:order_exists");
    }
}
