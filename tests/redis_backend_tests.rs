//! Redis token buckets against a real Redis started with testcontainers.
//!
//! Requires Docker. Run with:
//! `cargo test --test redis_backend_tests -- --ignored`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

use scholarship_gateway::rate_limit::{
    RateLimitBackend, RateLimiter, RateLimiterConfig, RedisBackend, TierQuota,
};

const REDIS_PORT: u16 = 6379;

/// Start Redis and return the container with its connection URL.
async fn start_redis() -> (ContainerAsync<GenericImage>, String) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(REDIS_PORT.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("Failed to start Redis container");

    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get Redis port");

    (container, format!("redis://127.0.0.1:{port}"))
}

fn quota(capacity: u32, burst: u32) -> TierQuota {
    TierQuota::new(capacity, Duration::from_secs(60), burst)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_bucket_allows_capacity_plus_burst() {
    let (_redis, url) = start_redis().await;
    let backend = RedisBackend::new(&url).unwrap();
    backend.ping().await.unwrap();

    let quota = quota(3, 1);
    for expected_remaining in [3, 2, 1, 0] {
        let decision = backend
            .try_acquire("203.0.113.7", "default", &quota, 1)
            .await
            .unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.limit(), 3);
        assert_eq!(decision.remaining(), expected_remaining);
    }

    let throttled = backend
        .try_acquire("203.0.113.7", "default", &quota, 1)
        .await
        .unwrap();
    assert!(!throttled.is_allowed());
    match throttled {
        scholarship_gateway::rate_limit::Decision::Throttled { retry_after, .. } => {
            // The first admission leaves the window after about 60s
            assert!(retry_after > Duration::from_secs(50));
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected throttled, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_buckets_are_shared_between_instances() {
    let (_redis, url) = start_redis().await;
    let config = RateLimiterConfig {
        tiers: "default=2/60+0".parse().unwrap(),
        backend_timeout: Duration::from_secs(2),
        ..RateLimiterConfig::default()
    };
    let first = RateLimiter::with_primary(config.clone(), Arc::new(RedisBackend::new(&url).unwrap()));
    let second = RateLimiter::with_primary(config, Arc::new(RedisBackend::new(&url).unwrap()));

    assert!(first.try_acquire("203.0.113.8", "default", 1).await.is_allowed());
    assert!(second.try_acquire("203.0.113.8", "default", 1).await.is_allowed());
    assert!(!first.try_acquire("203.0.113.8", "default", 1).await.is_allowed());

    assert!(!first.is_degraded());
    assert!(!second.is_degraded());
    assert_eq!(first.snapshot().active_backend, "redis");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_tiers_and_keys_use_separate_buckets() {
    let (_redis, url) = start_redis().await;
    let backend = RedisBackend::new(&url).unwrap();
    let quota = quota(1, 0);

    assert!(backend.try_acquire("a", "auth", &quota, 1).await.unwrap().is_allowed());
    assert!(!backend.try_acquire("a", "auth", &quota, 1).await.unwrap().is_allowed());
    assert!(backend.try_acquire("a", "write", &quota, 1).await.unwrap().is_allowed());
    assert!(backend.try_acquire("b", "auth", &quota, 1).await.unwrap().is_allowed());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_refill_never_exceeds_rolling_window_cap() {
    let (_redis, url) = start_redis().await;
    let backend = RedisBackend::new(&url).unwrap();
    let quota = TierQuota::new(3, Duration::from_secs(1), 1);

    let started = std::time::Instant::now();
    let mut admitted = Vec::new();
    while started.elapsed() < Duration::from_millis(1500) {
        if backend
            .try_acquire("203.0.113.9", "default", &quota, 1)
            .await
            .unwrap()
            .is_allowed()
        {
            admitted.push(std::time::Instant::now());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(admitted.len() >= 4);
    let span = Duration::from_millis(950);
    for (i, &start) in admitted.iter().enumerate() {
        let in_window = admitted[i..]
            .iter()
            .take_while(|&&at| at.duration_since(start) < span)
            .count();
        assert!(in_window <= 4, "{in_window} admitted within one window");
    }
}
