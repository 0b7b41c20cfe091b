//! Application routing configuration with the gateway middleware chain.
//!
//! # Middleware Stack (outer → inner)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id accepted or generated, echoed
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Tracing + CORS  │ ← request span (with request_id), cross-origin headers
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Deadline      │ ← 504 when the budget runs out
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │       WAF        │ ← 403 waf_blocked
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded, X-RateLimit-* otherwise
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Authentication  │ ← 401/503 (bypassed for public paths)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Route scope     │ ← 403 when the route's scope is not granted
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health & monitoring (auth bypassed by default)
//! - `/auth/login`, `/auth/session` - Identity echo (any valid token)
//! - `/scholarships`, `/applications` - Scope-protected boundary handlers

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::body::Body;
use axum::http::{HeaderName, Request};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span};

use crate::handlers;
use crate::middleware::{
    BearerAuthLayer, REQUEST_ID_HEADER, RateLimitLayer, RequestIdLayer, RequestTimeoutLayer,
    RequireScope, TrustedProxyConfig, WafLayer,
};
use crate::state::AppState;

pub const SCOPE_SCHOLARSHIPS_READ: &str = "scholarships:read";
pub const SCOPE_SCHOLARSHIPS_WRITE: &str = "scholarships:write";
pub const SCOPE_APPLICATIONS_WRITE: &str = "applications:write";

/// Build the application router with all routes and middleware configured.
///
/// - **WAF**: Enabled unless `WAF_ENABLED=false`
/// - **Rate Limiting**: Always layered; a disabled limiter passes through
/// - **Authentication**: Always on; public paths from `AUTH_PUBLIC_PATHS`
/// - **CORS**: Configured from `cors_allowed_origins`
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/auth/login", post(handlers::login))
        .route("/auth/session", get(handlers::session))
        .route(
            "/scholarships",
            get(handlers::list_scholarships)
                .route_layer(RequireScope::new(SCOPE_SCHOLARSHIPS_READ)),
        )
        .route(
            "/scholarships",
            post(handlers::create_scholarship)
                .route_layer(RequireScope::new(SCOPE_SCHOLARSHIPS_WRITE)),
        )
        .route(
            "/applications",
            post(handlers::submit_application)
                .route_layer(RequireScope::new(SCOPE_APPLICATIONS_WRITE)),
        )
        .fallback(handlers::not_found);

    // =========================================================================
    // Gateway chain (applied inner to outer)
    // =========================================================================

    router = router.layer(BearerAuthLayer::new(
        state.resolver.clone(),
        config.auth_public_paths.clone(),
    ));

    if state.rate_limiter.is_enabled() {
        info!(
            tiers = config.rate_limit_tiers.len(),
            distributed = state.rate_limiter.has_primary(),
            trusted_proxies = config.trusted_proxies.len(),
            "Rate limiting enabled"
        );
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_ENABLED=false)");
    }
    router = router.layer(RateLimitLayer::new(
        state.rate_limiter.clone(),
        TrustedProxyConfig::new(&config.trusted_proxies),
    ));

    if config.waf_enabled {
        info!(
            exemptions = config.waf_exemptions.entries().len(),
            max_body_bytes = config.waf_max_body_bytes,
            "WAF enabled"
        );
        router = router.layer(WafLayer::new(state.waf.clone()));
    } else {
        info!("WAF disabled (WAF_ENABLED=false)");
    }

    router = router.layer(RequestTimeoutLayer::new(config.timeout_config()));

    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    router = router.layer(build_cors_layer(&config.cors_allowed_origins));

    router = router.layer(TraceLayer::new_for_http().make_span_with(request_span::<Body>));

    router = router.layer(RequestIdLayer::new());

    router.with_state(state)
}

/// Span for one HTTP request, tagged with the id the request id layer assigned.
fn request_span<B>(req: &Request<B>) -> Span {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    info_span!(
        "http_request",
        method = %req.method(),
        uri = %req.uri(),
        request_id,
    )
}

/// Build CORS layer from configuration.
///
/// `*` allows any origin. Convenient for development, avoid in production.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
    }
}
