//! Crate-wide constants shared by components that don't carry their own
//! [`super::types::Config`] handle (state machine code, Redis key TTLs that
//! never vary by environment).

use std::time::Duration;

/// TTL for the single-fire `close_processing:{order_id}` sentinel the
/// trigger monitor sets before handing an order to the closer.
pub const TRIGGER_CLOSE_LOCK_TTL: Duration = Duration::from_secs(15);

/// TTL for the single-fire `lock:pending:{order_id}` sentinel the pending
/// monitor sets before triggering a resting limit/stop order.
pub const PENDING_TRIGGER_LOCK_TTL: Duration = Duration::from_secs(5);

/// TTL for the `lock:user_margin:{user_type}:{user_id}` mutual-exclusion
/// lock taken around any margin-affecting mutation.
pub const USER_MARGIN_LOCK_TTL: Duration = Duration::from_secs(5);

/// TTL for the `autocutoff:alert_sent:{user_id}` sentinel, bounding how
/// often an at-risk-of-liquidation email can repeat for one user.
pub const AUTOCUTOFF_ALERT_TTL: Duration = Duration::from_secs(3 * 3600);

/// Delay between successive forced closes during liquidation, giving the
/// provider/portfolio loop time to settle before re-reading margin level.
pub const AUTOCUTOFF_SETTLE_WAIT: Duration = Duration::from_millis(300);

/// TTL for the `order:processing:{idempotency_key}` placeholder an inbound
/// request handler sets before a duplicate submit is recognized as a replay.
pub const IDEMPOTENCY_PROCESSING_TTL: Duration = Duration::from_secs(60);

/// TTL for the sanitized replay result cached after the processing
/// placeholder above resolves.
pub const IDEMPOTENCY_RESULT_TTL: Duration = Duration::from_secs(300);

/// Epsilon below which two quote sides are considered unchanged (matches
/// the market listener's dedup threshold).
pub const QUOTE_EPSILON: f64 = 1e-5;
