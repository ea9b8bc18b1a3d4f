//! Resilience patterns for production deployment
//!
//! Provides robust error handling and recovery mechanisms:
//! - Exponential backoff for retries
//! - Circuit breaker pattern
//! - Panic hook for graceful shutdown logging

pub mod backoff;
pub mod circuit_breaker;
pub mod panic;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use panic::install_panic_handler;
