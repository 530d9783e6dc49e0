// Failure isolation shared by the subscription registry and the generation workflow.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use rate_limiter::{RateDecision, RateLimiter};
pub use retry::{BackoffStrategy, Classify, ErrorCategory, RetryError, RetryPolicy};
