//! Token-bucket rate limiting with backend failover.
//!
//! # Backends
//!
//! - [`RedisBackend`]: buckets shared across gateway instances
//! - [`LocalBackend`]: per-instance Governor buckets
//!
//! The [`RateLimiter`] asks the primary (Redis, when configured) and falls back
//! to the local backend when the primary errors or exceeds `backend_timeout`.
//! The request that observed the failure is decided locally, so callers never
//! see which backend answered. While degraded, the primary is skipped until a
//! background probe succeeds.
//!
//! # Buckets
//!
//! A bucket is keyed by `(client key, tier)`. A fresh bucket holds
//! `capacity + burst` tokens and refills at `capacity / window`.

pub mod backend;
pub mod local;
pub mod quota;
pub mod redis;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::metrics;

pub use backend::{BackendError, Decision, RateLimitBackend};
pub use local::LocalBackend;
pub use quota::{DEFAULT_TIER, RouteClasses, TierQuota, TierTable, secs_ceil};
pub use redis::RedisBackend;

/// Default round-trip budget for the primary backend.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Default interval between primary probes while degraded.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(300);

/// Default interval between local idle-bucket sweeps.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    pub tiers: TierTable,
    pub route_classes: RouteClasses,
    pub backend_timeout: Duration,
    pub reconnect_interval: Duration,
    pub eviction_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: TierTable::default(),
            route_classes: RouteClasses::default(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
        }
    }
}

/// Limiter status for the readiness endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub enabled: bool,
    pub active_backend: &'static str,
    pub primary_backend: Option<&'static str>,
    pub degraded: bool,
    pub failovers: u64,
    pub local_buckets: usize,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    primary: Option<Arc<dyn RateLimitBackend>>,
    local: Arc<LocalBackend>,
    degraded: AtomicBool,
    failovers: AtomicU64,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.config.enabled)
            .field("primary", &self.primary.as_ref().map(|p| p.name()))
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl RateLimiter {
    /// Limiter with only the local backend.
    pub fn new(config: RateLimiterConfig) -> Self {
        let local = Arc::new(LocalBackend::new(&config.tiers));
        Self {
            config,
            primary: None,
            local,
            degraded: AtomicBool::new(false),
            failovers: AtomicU64::new(0),
        }
    }

    /// Limiter that prefers `primary` and fails over to the local backend.
    pub fn with_primary(config: RateLimiterConfig, primary: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            primary: Some(primary),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Tier for a request path, from the route-class table.
    pub fn tier_for(&self, path: &str) -> &str {
        self.config.route_classes.tier_for(path)
    }

    /// Take `cost` tokens for `key` in `tier`.
    ///
    /// Unknown tiers use the `default` quota. Never fails: backend problems
    /// are absorbed by the local fallback.
    pub async fn try_acquire(&self, key: &str, tier: &str, cost: u32) -> Decision {
        let (tier, quota) = self.config.tiers.resolve(tier);

        let decision = match self.active_primary() {
            Some(primary) => match self.call_primary(primary.as_ref(), key, tier, &quota, cost).await {
                Ok(decision) => decision,
                Err(e) => {
                    self.enter_degraded(primary.name(), &e);
                    self.local_decision(key, tier, &quota, cost).await
                }
            },
            None => self.local_decision(key, tier, &quota, cost).await,
        };

        let outcome = if decision.is_allowed() {
            "allowed"
        } else {
            "throttled"
        };
        metrics::record_rate_limit_decision(tier, outcome);
        decision
    }

    fn active_primary(&self) -> Option<&Arc<dyn RateLimitBackend>> {
        self.primary.as_ref().filter(|_| !self.is_degraded())
    }

    async fn call_primary(
        &self,
        primary: &dyn RateLimitBackend,
        key: &str,
        tier: &str,
        quota: &TierQuota,
        cost: u32,
    ) -> Result<Decision, BackendError> {
        let budget = self.config.backend_timeout;
        match tokio::time::timeout(budget, primary.try_acquire(key, tier, quota, cost)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(budget)),
        }
    }

    async fn local_decision(&self, key: &str, tier: &str, quota: &TierQuota, cost: u32) -> Decision {
        match self.local.try_acquire(key, tier, quota, cost).await {
            Ok(decision) => decision,
            Err(e) => {
                // Only reachable with a table that has no usable default tier.
                warn!(error = %e, tier, "Local rate limiter has no bucket for tier, allowing");
                Decision::Allowed {
                    limit: quota.capacity,
                    remaining: quota.capacity,
                    reset: Duration::ZERO,
                }
            }
        }
    }

    fn enter_degraded(&self, backend: &'static str, error: &BackendError) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
        metrics::record_rate_limit_failover();
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                backend,
                error = %error,
                "Rate-limit backend failed, switching to local limiting"
            );
            metrics::set_rate_limit_degraded(true);
        }
    }

    /// Probe the primary while degraded and switch back on success.
    ///
    /// Returns `true` when the primary is in use after the probe.
    pub async fn probe_primary(&self) -> bool {
        let Some(primary) = self.primary.as_ref() else {
            return false;
        };
        if !self.is_degraded() {
            return true;
        }

        let budget = self.config.backend_timeout;
        let result = match tokio::time::timeout(budget, primary.ping()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(budget)),
        };

        match result {
            Ok(()) => {
                self.degraded.store(false, Ordering::Release);
                metrics::set_rate_limit_degraded(false);
                info!(backend = primary.name(), "Rate-limit backend recovered, leaving degraded mode");
                true
            }
            Err(e) => {
                debug!(backend = primary.name(), error = %e, "Rate-limit backend still unavailable");
                false
            }
        }
    }

    /// Drop idle local buckets.
    pub fn evict_idle(&self) {
        self.local.evict_idle();
        if let Some(primary) = &self.primary {
            primary.evict_idle();
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let primary_backend = self.primary.as_ref().map(|p| p.name());
        let degraded = self.is_degraded();
        RateLimiterSnapshot {
            enabled: self.config.enabled,
            active_backend: match primary_backend {
                Some(name) if !degraded => name,
                _ => "local",
            },
            primary_backend,
            degraded,
            failovers: self.failovers.load(Ordering::Relaxed),
            local_buckets: self.local.bucket_count(),
        }
    }
}
