//! Resilience primitives composed around adapter query paths.

pub mod cache;
pub mod circuit_breaker;
pub mod resilient;

pub use cache::{CacheLookup, CacheStatistics, TtlCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use resilient::ResilientDataSource;
