//! Fault-isolation primitives shared by every component that talks to an
//! unreliable dependency.
//!
//! - `circuit_breaker` - generic breaker with half-open probing and retry support
//! - `retry` - exponential backoff policy with pluggable jitter
//! - `guard` - counted slot guard released on drop (also on cancellation)

pub mod circuit_breaker;
pub mod guard;
pub mod retry;

pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use guard::SlotGuard;
pub use retry::{RetryPolicy, no_jitter, proportional_jitter};
