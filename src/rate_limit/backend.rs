//! Rate-limit backend trait and shared types.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::quota::TierQuota;

/// Outcome of a token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        limit: u32,
        remaining: u32,
        /// Time until the bucket is full again.
        reset: Duration,
    },
    Throttled {
        limit: u32,
        /// Time until enough tokens are available for this request.
        retry_after: Duration,
        reset: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn limit(&self) -> u32 {
        match self {
            Decision::Allowed { limit, .. } | Decision::Throttled { limit, .. } => *limit,
        }
    }

    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allowed { remaining, .. } => *remaining,
            Decision::Throttled { .. } => 0,
        }
    }

    pub fn reset(&self) -> Duration {
        match self {
            Decision::Allowed { reset, .. } | Decision::Throttled { reset, .. } => *reset,
        }
    }
}

/// Backend failures. The limiter answers these by failing over to the local backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("rate-limit backend unavailable: {0}")]
    Unavailable(String),

    #[error("rate-limit backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate-limit backend returned an invalid response: {0}")]
    Protocol(String),
}

/// Storage for token buckets.
///
/// # Implementations
///
/// - [`super::LocalBackend`] - in-process, per-instance buckets
/// - [`super::RedisBackend`] - shared buckets in Redis
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Take `cost` tokens from the bucket for `(key, tier)`.
    async fn try_acquire(
        &self,
        key: &str,
        tier: &str,
        quota: &TierQuota,
        cost: u32,
    ) -> Result<Decision, BackendError>;

    /// Health probe used to decide when to switch back to this backend.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Drop idle buckets. Backends whose storage expires on its own do nothing.
    fn evict_idle(&self) {}
}
