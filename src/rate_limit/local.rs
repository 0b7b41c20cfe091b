//! In-process rate-limit backend.
//!
//! Uses the Governor crate's keyed GCRA limiter, one per tier. GCRA with a
//! burst of `capacity + burst` and an emission interval of `window / capacity`
//! behaves like a token bucket of that size refilled at `capacity / window`.
//!
//! A bucket alone admits a full burst and then keeps refilling, so each key
//! also carries an admission log: no rolling `window` ever holds more than
//! `capacity + burst` admitted tokens.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tracing::{debug, warn};

use super::backend::{BackendError, Decision, RateLimitBackend};
use super::quota::{DEFAULT_TIER, TierQuota, TierTable};

/// Per-key limiter that reports remaining capacity on success.
type KeyedLimiter =
    RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock, StateInformationMiddleware>;

/// Governor quota equivalent to a tier's token bucket.
fn governor_quota(quota: &TierQuota) -> Option<Quota> {
    let burst = NonZeroU32::new(quota.max_tokens())?;
    Quota::with_period(quota.refill_interval()).map(|q| q.allow_burst(burst))
}

/// Admissions of one key inside the current rolling window.
#[derive(Debug, Default)]
struct WindowLog {
    entries: VecDeque<(Instant, u32)>,
    used: u32,
}

impl WindowLog {
    /// Forget admissions that left the window ending at `now`.
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, cost)) = self.entries.front() {
            if now.saturating_duration_since(at) < window {
                break;
            }
            self.entries.pop_front();
            self.used = self.used.saturating_sub(cost);
        }
    }

    fn fits(&self, cost: u32, limit: u32) -> bool {
        self.used.saturating_add(cost) <= limit
    }

    fn record(&mut self, now: Instant, cost: u32) {
        self.entries.push_back((now, cost));
        self.used = self.used.saturating_add(cost);
    }

    /// Time until `cost` more tokens fit under `limit`.
    fn wait_for(&self, now: Instant, window: Duration, cost: u32, limit: u32) -> Duration {
        let mut used = self.used;
        for &(at, entry_cost) in &self.entries {
            if used.saturating_add(cost) <= limit {
                break;
            }
            used = used.saturating_sub(entry_cost);
            if used.saturating_add(cost) <= limit {
                return at
                    .checked_add(window)
                    .map_or(window, |end| end.saturating_duration_since(now));
            }
        }
        if used.saturating_add(cost) <= limit {
            Duration::ZERO
        } else {
            window
        }
    }
}

struct TierLimiter {
    limiter: KeyedLimiter,
    quota: TierQuota,
    windows: Mutex<HashMap<String, WindowLog>>,
}

/// Per-instance token buckets.
pub struct LocalBackend {
    tiers: HashMap<String, Arc<TierLimiter>>,
}

impl LocalBackend {
    pub fn new(tiers: &TierTable) -> Self {
        let tiers = tiers
            .iter()
            .filter_map(|(name, quota)| match governor_quota(quota) {
                Some(q) => Some((
                    name.to_string(),
                    Arc::new(TierLimiter {
                        limiter: RateLimiter::keyed(q)
                            .with_middleware::<StateInformationMiddleware>(),
                        quota: *quota,
                        windows: Mutex::new(HashMap::new()),
                    }),
                )),
                None => {
                    warn!(tier = name, "Tier quota cannot be expressed locally, skipping");
                    None
                }
            })
            .collect();
        Self { tiers }
    }

    fn tier(&self, tier: &str) -> Option<&Arc<TierLimiter>> {
        self.tiers.get(tier).or_else(|| self.tiers.get(DEFAULT_TIER))
    }

    /// Number of tracked buckets across all tiers.
    pub fn bucket_count(&self) -> usize {
        self.tiers.values().map(|t| t.limiter.len()).sum()
    }
}

#[async_trait]
impl RateLimitBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn try_acquire(
        &self,
        key: &str,
        tier: &str,
        _quota: &TierQuota,
        cost: u32,
    ) -> Result<Decision, BackendError> {
        let tier_limiter = self
            .tier(tier)
            .ok_or_else(|| BackendError::Unavailable(format!("no local limiter for tier '{tier}'")))?;
        let quota = tier_limiter.quota;
        let limiter = &tier_limiter.limiter;
        let interval = quota.refill_interval();
        let full_reset = interval.saturating_mul(quota.max_tokens());
        let cost = NonZeroU32::new(cost).unwrap_or(NonZeroU32::MIN);

        let max_tokens = quota.max_tokens();
        let now = Instant::now();

        // Held across the bucket check so the log and the bucket agree
        let mut windows = tier_limiter
            .windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let log = windows.entry(key.to_string()).or_default();
        log.prune(now, quota.window);

        if !log.fits(cost.get(), max_tokens) {
            let retry_after = if cost.get() > max_tokens {
                full_reset.max(Duration::from_secs(1))
            } else {
                log.wait_for(now, quota.window, cost.get(), max_tokens)
            };
            debug!(key, tier, used = log.used, "Rolling window full");
            return Ok(Decision::Throttled {
                limit: quota.capacity,
                retry_after,
                reset: full_reset,
            });
        }

        let decision = match limiter.check_key_n(&key.to_string(), cost) {
            Ok(Ok(snapshot)) => {
                log.record(now, cost.get());
                let remaining = snapshot
                    .remaining_burst_capacity()
                    .min(max_tokens.saturating_sub(log.used));
                Decision::Allowed {
                    limit: quota.capacity,
                    remaining,
                    reset: interval.saturating_mul(max_tokens.saturating_sub(remaining)),
                }
            }
            Ok(Err(not_until)) => Decision::Throttled {
                limit: quota.capacity,
                retry_after: not_until.wait_time_from(limiter.clock().now()),
                reset: full_reset,
            },
            Err(_insufficient) => {
                debug!(key, tier, cost = cost.get(), "Cost exceeds bucket size");
                Decision::Throttled {
                    limit: quota.capacity,
                    retry_after: full_reset.max(Duration::from_secs(1)),
                    reset: full_reset,
                }
            }
        };
        Ok(decision)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn evict_idle(&self) {
        let now = Instant::now();
        for tier in self.tiers.values() {
            tier.limiter.retain_recent();
            tier.limiter.shrink_to_fit();

            let mut windows = tier.windows.lock().unwrap_or_else(PoisonError::into_inner);
            windows.retain(|_, log| {
                log.prune(now, tier.quota.window);
                !log.entries.is_empty()
            });
            windows.shrink_to_fit();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn backend(tiers: &str) -> (LocalBackend, TierTable) {
        let table: TierTable = tiers.parse().unwrap();
        (LocalBackend::new(&table), table)
    }

    #[tokio::test]
    async fn test_fresh_bucket_allows_capacity_plus_burst() {
        let (backend, table) = backend("default=5/60+2");
        let (_, quota) = table.resolve(DEFAULT_TIER);

        let mut allowed = 0;
        for _ in 0..20 {
            if backend
                .try_acquire("10.0.0.1", DEFAULT_TIER, &quota, 1)
                .await
                .unwrap()
                .is_allowed()
            {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 7);
    }

    #[tokio::test]
    async fn test_rolling_window_never_exceeds_capacity_plus_burst() {
        let (backend, table) = backend("default=3/1+1");
        let (_, quota) = table.resolve(DEFAULT_TIER);

        let started = Instant::now();
        let mut admitted = Vec::new();
        while started.elapsed() < Duration::from_millis(1500) {
            let decision = backend.try_acquire("k", DEFAULT_TIER, &quota, 1).await.unwrap();
            if decision.is_allowed() {
                admitted.push(Instant::now());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(admitted.len() >= 4);
        // Slightly shorter than the window to absorb timer skew
        let span = Duration::from_millis(980);
        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&at| at.duration_since(start) < span)
                .count();
            assert!(in_window <= 4, "{in_window} admitted within one window");
        }
    }

    #[tokio::test]
    async fn test_window_throttle_waits_for_oldest_admission() {
        let (backend, table) = backend("default=2/60+0");
        let (_, quota) = table.resolve(DEFAULT_TIER);

        backend.try_acquire("k", DEFAULT_TIER, &quota, 1).await.unwrap();
        backend.try_acquire("k", DEFAULT_TIER, &quota, 1).await.unwrap();
        let third = backend.try_acquire("k", DEFAULT_TIER, &quota, 1).await.unwrap();

        match third {
            Decision::Throttled { retry_after, .. } => {
                assert!(retry_after > Duration::from_secs(29));
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected throttle, got {other:?}"),
        }
    }

    #[test]
    fn test_window_log_prunes_and_waits() {
        let window = Duration::from_secs(10);
        let t0 = Instant::now();
        let mut log = WindowLog::default();
        log.record(t0, 2);
        log.record(t0 + Duration::from_secs(4), 1);

        let now = t0 + Duration::from_secs(5);
        assert!(!log.fits(1, 3));
        assert_eq!(log.wait_for(now, window, 1, 3), Duration::from_secs(5));
        assert_eq!(log.wait_for(now, window, 3, 3), Duration::from_secs(9));

        log.prune(t0 + Duration::from_secs(10), window);
        assert_eq!(log.used, 1);
        assert!(log.fits(2, 3));
    }

    #[tokio::test]
    async fn test_throttled_decision_has_retry_after() {
        let (backend, table) = backend("default=1/60+0");
        let (_, quota) = table.resolve(DEFAULT_TIER);

        let first = backend.try_acquire("k", DEFAULT_TIER, &quota, 1).await.unwrap();
        assert_eq!(first.remaining(), 0);

        match backend.try_acquire("k", DEFAULT_TIER, &quota, 1).await.unwrap() {
            Decision::Throttled {
                limit, retry_after, ..
            } => {
                assert_eq!(limit, 1);
                assert!(retry_after > Duration::from_secs(50));
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected throttle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (backend, table) = backend("default=1/60+0");
        let (_, quota) = table.resolve(DEFAULT_TIER);

        assert!(backend.try_acquire("a", DEFAULT_TIER, &quota, 1).await.unwrap().is_allowed());
        assert!(backend.try_acquire("b", DEFAULT_TIER, &quota, 1).await.unwrap().is_allowed());
        assert!(!backend.try_acquire("a", DEFAULT_TIER, &quota, 1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_unknown_tier_uses_default_limiter() {
        let (backend, table) = backend("default=1/60+0,auth=100/60+0");
        let (_, quota) = table.resolve(DEFAULT_TIER);

        assert!(backend.try_acquire("a", "missing", &quota, 1).await.unwrap().is_allowed());
        assert!(!backend.try_acquire("a", DEFAULT_TIER, &quota, 1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_cost_above_bucket_size_is_throttled() {
        let (backend, table) = backend("default=2/60+1");
        let (_, quota) = table.resolve(DEFAULT_TIER);
        let decision = backend.try_acquire("a", DEFAULT_TIER, &quota, 10).await.unwrap();
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_backend_usable() {
        let (backend, table) = backend("default=10/1+0");
        let (_, quota) = table.resolve(DEFAULT_TIER);
        backend.try_acquire("a", DEFAULT_TIER, &quota, 1).await.unwrap();
        assert_eq!(backend.bucket_count(), 1);

        backend.evict_idle();
        assert!(backend.try_acquire("a", DEFAULT_TIER, &quota, 1).await.unwrap().is_allowed());
    }
}
