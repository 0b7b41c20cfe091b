//! Rate limiting middleware.
//!
//! Runs before authentication, so the bucket key is the client IP (see
//! [`client_ip`](super::ip::client_ip)) and the tier comes from the route-class
//! table. The decision itself is made by the [`RateLimiter`], which hides
//! backend failover.
//!
//! # Response Headers
//!
//! Every limited response carries:
//! - `X-RateLimit-Limit`: tier capacity per window
//! - `X-RateLimit-Remaining`: tokens left in the bucket
//! - `X-RateLimit-Reset`: seconds until the bucket is full again
//!
//! Throttled requests get `429` plus `Retry-After` in seconds.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::error::GatewayError;
use crate::rate_limit::{Decision, RateLimiter, secs_ceil};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Whole seconds, rounded up. Zero stays zero.
fn reset_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: Duration) {
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(reset_secs(reset)));
}

/// Rate limiting layer for Tower middleware stack.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>, trusted_proxies: TrustedProxyConfig) -> Self {
        Self {
            limiter,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.limiter.is_enabled() {
            return Box::pin(inner.call(req));
        }

        let limiter = self.limiter.clone();
        let client_ip = client_ip(&req, &self.trusted_proxies).into_owned();
        let tier = limiter.tier_for(req.uri().path()).to_string();

        Box::pin(async move {
            match limiter.try_acquire(&client_ip, &tier, 1).await {
                Decision::Allowed {
                    limit,
                    remaining,
                    reset,
                } => {
                    debug!(client_ip = %client_ip, tier = %tier, remaining, "Rate limit check passed");
                    let mut response = inner.call(req).await?;
                    insert_rate_limit_headers(response.headers_mut(), limit, remaining, reset);
                    Ok(response)
                }
                Decision::Throttled {
                    limit,
                    retry_after,
                    reset,
                } => {
                    let retry_after_secs = secs_ceil(retry_after);
                    warn!(
                        client_ip = %client_ip,
                        tier = %tier,
                        path = %req.uri().path(),
                        retry_after_secs,
                        "Rate limit exceeded"
                    );
                    Ok(GatewayError::RateLimitExceeded {
                        tier,
                        limit,
                        retry_after_secs,
                        reset_secs: reset_secs(reset),
                    }
                    .into_response())
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimiterConfig;
    use axum::Router;
    use axum::http::{StatusCode, header};
    use axum::routing::get;
    use tower::ServiceExt;

    fn app(tiers: &str, routes: &str, enabled: bool) -> Router {
        let limiter = RateLimiter::new(RateLimiterConfig {
            enabled,
            tiers: tiers.parse().unwrap(),
            route_classes: routes.parse().unwrap(),
            ..RateLimiterConfig::default()
        });
        Router::new()
            .route("/scholarships", get(|| async { "ok" }))
            .route("/auth/session", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(
                Arc::new(limiter),
                TrustedProxyConfig::default(),
            ))
    }

    fn request(path: &str, ip: &str) -> Request<Body> {
        Request::get(path)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_reset_secs_rounds_up() {
        assert_eq!(reset_secs(Duration::ZERO), 0);
        assert_eq!(reset_secs(Duration::from_millis(1)), 1);
        assert_eq!(reset_secs(Duration::from_secs(12)), 12);
    }

    #[tokio::test]
    async fn test_headers_on_allowed_response() {
        let app = app("default=5/60+0", "", true);
        let response = app.oneshot(request("/scholarships", "1.1.1.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get(RATE_LIMIT_LIMIT_HEADER).unwrap(), "5");
        assert_eq!(headers.get(RATE_LIMIT_REMAINING_HEADER).unwrap(), "4");
        assert!(headers.get(RATE_LIMIT_RESET_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_throttled_request_gets_429() {
        let app = app("default=1/60+0", "", true);
        let first = app.clone().oneshot(request("/scholarships", "2.2.2.2")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(request("/scholarships", "2.2.2.2")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = second
            .headers()
            .get(header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
        assert_eq!(second.headers().get(RATE_LIMIT_REMAINING_HEADER).unwrap(), "0");
    }

    #[tokio::test]
    async fn test_route_class_selects_tier() {
        let app = app("default=100/60+0,auth=2/60+0", "/auth=auth", true);
        let response = app.oneshot(request("/auth/session", "3.3.3.3")).await.unwrap();
        assert_eq!(response.headers().get(RATE_LIMIT_LIMIT_HEADER).unwrap(), "2");
    }

    #[tokio::test]
    async fn test_clients_have_separate_buckets() {
        let app = app("default=1/60+0", "", true);
        app.clone().oneshot(request("/scholarships", "4.4.4.4")).await.unwrap();
        let other = app.oneshot(request("/scholarships", "5.5.5.5")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_disabled_limiter_passes_through() {
        let app = app("default=1/60+0", "", false);
        for _ in 0..3 {
            let response = app.clone().oneshot(request("/scholarships", "6.6.6.6")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(RATE_LIMIT_LIMIT_HEADER).is_none());
        }
    }
}
