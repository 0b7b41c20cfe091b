//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness; always 200 while the process serves requests
//! - `GET /ready` - Readiness probe with signing-key and rate-limiter status
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if dependencies are degraded
//! - **Readiness** (`/ready`): Returns 503 when tokens cannot be verified
//!
//! A degraded rate limiter (running on the local backend) is reported but
//! does not fail readiness, since requests are still limited.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::models::{HealthResponse, ReadinessResponse};
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "timestamp": "2026-01-15T10:30:00Z",
///   "uptime_seconds": 3600
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// Not ready while the JWKS cache holds no usable key set (never fetched, or
/// stale beyond the grace bound). A stale-but-usable set with an open breaker
/// is still ready.
///
/// ```yaml
/// readinessProbe:
///   httpGet:
///     path: /ready
///     port: 3000
///   periodSeconds: 10
/// ```
#[instrument(skip(state))]
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let jwks = match state.resolver.jwks() {
        Some(cache) => Some(cache.snapshot().await),
        None => None,
    };
    let ready = jwks.as_ref().is_none_or(|snapshot| snapshot.usable);

    if !ready {
        warn!("Readiness check failed: no usable signing keys");
    }

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            jwks,
            rate_limiter: state.rate_limiter.snapshot(),
            waf_enabled: state.config.waf_enabled,
            timestamp: Utc::now(),
        }),
    )
}
