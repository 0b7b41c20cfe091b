//! Shared application state for Axum handlers and middleware.
//!
//! Every gateway component is an explicit instance built once here and
//! handed to the tower layers that use it:
//!
//! - **Resolver**: token validation, backed by the JWKS cache and its breaker
//! - **Rate limiter**: Redis primary (when configured) with local failover
//! - **WAF filter**: compiled rules plus the exemption table
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! Background tasks (JWKS warm-up, rate-limit primary probe, local bucket
//! eviction) are managed with `tokio_util::task::TaskTracker` and a
//! `CancellationToken`. Call `shutdown()` to stop them before exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthClaimsResolver, JwksCache};
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::rate_limit::{RateLimiter, RedisBackend};
use crate::waf::WafFilter;

/// Shared application state.
///
/// Cloned for each request; all components are behind `Arc`.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;  // Wait for background tasks to complete
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Token validator (holds the JWKS cache, if any)
    pub resolver: Arc<AuthClaimsResolver>,
    pub rate_limiter: Arc<RateLimiter>,
    pub waf: Arc<WafFilter>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build every gateway component from configuration and start the
    /// background tasks.
    ///
    /// Nothing here touches the network: the JWKS endpoint and Redis are
    /// contacted lazily (or by the warm-up task), so an unavailable
    /// dependency at startup degrades instead of aborting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> GatewayResult<Self> {
        let jwks = config
            .jwks_config()
            .map(|jwks_config| {
                JwksCache::new(jwks_config)
                    .map(Arc::new)
                    .map_err(|e| GatewayError::ConfigError(format!("JWKS client: {e}")))
            })
            .transpose()?;
        let resolver = Arc::new(AuthClaimsResolver::new(jwks, config.resolver_config()));

        let limiter_config = config.rate_limiter_config();
        let rate_limiter = match &config.rate_limit_redis_url {
            Some(url) => {
                let backend = RedisBackend::new(url)
                    .map_err(|e| GatewayError::ConfigError(format!("RATE_LIMIT_REDIS_URL: {e}")))?;
                RateLimiter::with_primary(limiter_config, Arc::new(backend))
            }
            None => RateLimiter::new(limiter_config),
        };

        let waf = WafFilter::new(config.waf_config())
            .map_err(|e| GatewayError::ConfigError(format!("WAF rules: {e}")))?;

        let state = Self {
            config: Arc::new(config),
            resolver,
            rate_limiter: Arc::new(rate_limiter),
            waf: Arc::new(waf),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_jwks_warmup_task();
        state.spawn_primary_probe_task();
        state.spawn_eviction_task();

        Ok(state)
    }

    /// Fetch the signing keys once at startup so the first request does not
    /// pay for it.
    fn spawn_jwks_warmup_task(&self) {
        let Some(jwks) = self.resolver.jwks().cloned() else {
            return;
        };
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("JWKS warm-up cancelled");
                }
                result = jwks.prefetch() => {
                    match result {
                        Ok(keys) => info!(keys, "JWKS key set loaded"),
                        Err(e) => warn!(error = %e, "JWKS warm-up failed, keys will be fetched on demand"),
                    }
                }
            }
        });
    }

    /// Periodically probe the distributed backend while the limiter is
    /// degraded, switching back once it answers.
    fn spawn_primary_probe_task(&self) {
        if !self.rate_limiter.has_primary() {
            return;
        }
        let limiter = self.rate_limiter.clone();
        let period = limiter.config().reconnect_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Rate-limit probe task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if limiter.is_degraded() {
                            limiter.probe_primary().await;
                        } else {
                            trace!("Rate-limit primary healthy, skipping probe");
                        }
                    }
                }
            }

            debug!("Rate-limit probe task shutting down");
        });
    }

    /// Periodically drop idle local buckets.
    fn spawn_eviction_task(&self) {
        let limiter = self.rate_limiter.clone();
        let period = limiter.config().eviction_interval.max(Duration::from_secs(1));
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Bucket eviction task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => limiter.evict_idle(),
                }
            }

            debug!("Bucket eviction task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            jwt_shared_secret: Some("test-secret-test-secret-test-secret!".to_string()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_state_without_jwks_or_redis() {
        let state = AppState::new(config()).unwrap();

        assert!(state.resolver.jwks().is_none());
        assert!(!state.rate_limiter.has_primary());
        assert_eq!(state.uptime_seconds(), 0);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_state_with_unreachable_redis_starts() {
        let state = AppState::new(Config {
            rate_limit_redis_url: Some("redis://127.0.0.1:9".to_string()),
            ..config()
        })
        .unwrap();

        assert!(state.rate_limiter.has_primary());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_redis_url_is_config_error() {
        let result = AppState::new(Config {
            rate_limit_redis_url: Some("not a url".to_string()),
            ..config()
        });
        assert!(matches!(result, Err(GatewayError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let state = AppState::new(config()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), state.shutdown())
            .await
            .expect("shutdown should complete promptly");
    }
}
