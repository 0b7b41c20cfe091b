//! Global request deadline.
//!
//! Every request outside the exclusion list runs under a deadline (default
//! 5s). When it passes, the inner future is dropped and a `504` envelope is
//! returned. Requests that finish in time but use at least 80% of their budget
//! are logged as near misses.
//!
//! Clients may shorten their own deadline with `X-Request-Timeout`:
//!
//! ```text
//! X-Request-Timeout: 1500  # milliseconds
//! ```
//!
//! Values below [`MIN_REQUEST_TIMEOUT`] or above the global deadline are
//! ignored, so a client can never extend it.
//!
//! The effective deadline is stored as a [`Deadline`] extension for handlers
//! that want to bound their own downstream calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::context::Deadline;
use crate::error::GatewayError;
use crate::metrics;

/// Header name for client-specified request timeout.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Shortest deadline a client may ask for.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Share of the budget after which a completed request counts as a near miss.
pub const DEFAULT_NEAR_MISS_RATIO: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub global: Duration,
    pub excluded_paths: Vec<String>,
    pub near_miss_ratio: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            global: DEFAULT_REQUEST_TIMEOUT,
            excluded_paths: vec![
                "/health".to_string(),
                "/ready".to_string(),
                "/metrics".to_string(),
            ],
            near_miss_ratio: DEFAULT_NEAR_MISS_RATIO,
        }
    }
}

impl TimeoutConfig {
    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|p| p == path)
    }

    /// Deadline budget for a request: the global value, or a shorter
    /// client-requested one.
    pub fn budget_for<B>(&self, req: &Request<B>) -> Duration {
        let Some(value) = req.headers().get(REQUEST_TIMEOUT_HEADER) else {
            return self.global;
        };

        match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(ms) => {
                let requested = Duration::from_millis(ms);
                if (MIN_REQUEST_TIMEOUT..=self.global).contains(&requested) {
                    debug!(timeout_ms = ms, "Client shortened request deadline");
                    requested
                } else {
                    debug!(
                        timeout_ms = ms,
                        min_ms = MIN_REQUEST_TIMEOUT.as_millis() as u64,
                        max_ms = self.global.as_millis() as u64,
                        "Client timeout outside allowed range, ignoring"
                    );
                    self.global
                }
            }
            None => {
                debug!("Invalid X-Request-Timeout header value, ignoring");
                self.global
            }
        }
    }
}

/// Deadline layer for Tower middleware stack.
#[derive(Clone)]
pub struct RequestTimeoutLayer {
    config: Arc<TimeoutConfig>,
    near_misses: Arc<AtomicU64>,
}

impl RequestTimeoutLayer {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config: Arc::new(config),
            near_misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Requests served through this layer that finished close to their deadline.
    pub fn near_misses(&self) -> u64 {
        self.near_misses.load(Ordering::Relaxed)
    }
}

impl<S> Layer<S> for RequestTimeoutLayer {
    type Service = RequestTimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestTimeoutService {
            inner,
            config: self.config.clone(),
            near_misses: self.near_misses.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestTimeoutService<S> {
    inner: S,
    config: Arc<TimeoutConfig>,
    near_misses: Arc<AtomicU64>,
}

impl<S> Service<Request<Body>> for RequestTimeoutService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if self.config.is_excluded(req.uri().path()) {
            return Box::pin(inner.call(req));
        }

        let budget = self.config.budget_for(&req);
        let near_miss_ratio = self.config.near_miss_ratio;
        let near_misses = self.near_misses.clone();
        let started = Instant::now();
        req.extensions_mut().insert(Deadline(started + budget));

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            match tokio::time::timeout(budget, inner.call(req)).await {
                Ok(result) => {
                    let elapsed = started.elapsed();
                    if elapsed.as_secs_f64() >= budget.as_secs_f64() * near_miss_ratio {
                        warn!(
                            method = %method,
                            path = %path,
                            elapsed_ms = elapsed.as_millis() as u64,
                            budget_ms = budget.as_millis() as u64,
                            "Request finished close to its deadline"
                        );
                        near_misses.fetch_add(1, Ordering::Relaxed);
                        metrics::record_request_near_miss();
                    }
                    if let Ok(response) = &result {
                        metrics::record_request_duration(
                            method.as_str(),
                            response.status().as_u16(),
                            elapsed.as_secs_f64(),
                        );
                    }
                    result
                }
                Err(_) => {
                    warn!(
                        method = %method,
                        path = %path,
                        budget_ms = budget.as_millis() as u64,
                        "Request deadline exceeded, cancelling"
                    );
                    metrics::record_request_timeout();
                    let response = GatewayError::Timeout(budget).into_response();
                    metrics::record_request_duration(
                        method.as_str(),
                        response.status().as_u16(),
                        started.elapsed().as_secs_f64(),
                    );
                    Ok(response)
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Extension;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    fn config(global_ms: u64) -> TimeoutConfig {
        TimeoutConfig {
            global: Duration::from_millis(global_ms),
            ..TimeoutConfig::default()
        }
    }

    fn request(path: &str, header: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(h) = header {
            builder = builder.header(REQUEST_TIMEOUT_HEADER, h);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_budget_defaults_to_global() {
        let config = config(5000);
        assert_eq!(config.budget_for(&request("/", None)), Duration::from_secs(5));
    }

    #[test]
    fn test_client_may_shorten_deadline() {
        let config = config(5000);
        assert_eq!(
            config.budget_for(&request("/", Some("1500"))),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_client_cannot_extend_or_go_below_floor() {
        let config = config(5000);
        assert_eq!(config.budget_for(&request("/", Some("60000"))), Duration::from_secs(5));
        assert_eq!(config.budget_for(&request("/", Some("10"))), Duration::from_secs(5));
        assert_eq!(config.budget_for(&request("/", Some("soon"))), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out_with_504() {
        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    "done"
                }),
            )
            .layer(RequestTimeoutLayer::new(config(150)));

        let response = app.oneshot(request("/slow", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    fn sleeping_app(sleep_ms: u64, layer: RequestTimeoutLayer) -> Router {
        Router::new()
            .route(
                "/work",
                get(move || async move {
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    "done"
                }),
            )
            .layer(layer)
    }

    #[tokio::test]
    async fn test_request_close_to_deadline_counts_as_near_miss() {
        let layer = RequestTimeoutLayer::new(config(200));
        let app = sleeping_app(170, layer.clone());

        let response = app.oneshot(request("/work", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(layer.near_misses(), 1);
    }

    #[tokio::test]
    async fn test_request_well_within_deadline_is_not_a_near_miss() {
        let layer = RequestTimeoutLayer::new(config(200));
        let app = sleeping_app(100, layer.clone());

        let response = app.oneshot(request("/work", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(layer.near_misses(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_request_is_not_a_near_miss() {
        let layer = RequestTimeoutLayer::new(config(150));
        let app = sleeping_app(1000, layer.clone());

        let response = app.oneshot(request("/work", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(layer.near_misses(), 0);
    }

    #[tokio::test]
    async fn test_excluded_path_has_no_deadline() {
        let app = Router::new()
            .route(
                "/health",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    "ok"
                }),
            )
            .layer(RequestTimeoutLayer::new(config(150)));

        let response = app.oneshot(request("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deadline_extension_attached() {
        let app = Router::new()
            .route(
                "/",
                get(|Extension(deadline): Extension<Deadline>| async move {
                    let remaining = deadline.remaining();
                    assert!(remaining <= Duration::from_millis(1000));
                    assert!(remaining > Duration::from_millis(500));
                    "ok"
                }),
            )
            .layer(RequestTimeoutLayer::new(config(5000)));

        let response = app.oneshot(request("/", Some("1000"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
