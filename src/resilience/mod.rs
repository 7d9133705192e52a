mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState,
};
pub use retry::{retry_with_backoff, RetryPolicy};
