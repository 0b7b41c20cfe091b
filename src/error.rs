use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::context::current_correlation_id;

/// Gateway-wide error types with their HTTP mapping.
///
/// Components (breaker, JWKS cache, resolver, rate limiter, WAF) return their
/// own typed errors; the middleware chain converts them into this enum, and
/// this enum is the only place that decides status codes and the envelope.
///
/// # Fail-open vs fail-closed
///
/// - `Unauthorized`, `Forbidden`, `WafBlocked` always deny.
/// - `CircuitOpen` / `ServiceUnavailable` are only produced once the stale
///   JWKS grace bound has been exhausted.
/// - Rate-limit backend failures never reach this type; they degrade to the
///   local backend instead.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: missing required scope '{required_scope}'")]
    Forbidden { required_scope: String },

    #[error("Rate limit exceeded for tier '{tier}', retry after {retry_after_secs}s")]
    RateLimitExceeded {
        tier: String,
        limit: u32,
        retry_after_secs: u64,
        reset_secs: u64,
    },

    #[error("Request blocked by WAF rule {rule_id} ({category})")]
    WafBlocked {
        rule_id: String,
        category: &'static str,
    },

    #[error("Circuit breaker '{breaker}' is open")]
    CircuitOpen { breaker: String },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Standard error envelope returned by every error response.
///
/// ```json
/// {
///   "code": "rate_limit_exceeded",
///   "message": "Too many requests. Retry after 12 seconds.",
///   "correlation_id": "5b0c7d4e-...",
///   "status": 429,
///   "timestamp": "2026-01-15T10:30:00Z",
///   "details": { "retry_after": 12 }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
    pub correlation_id: String,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GatewayError {
    /// HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } | GatewayError::WafBlocked { .. } => {
                StatusCode::FORBIDDEN
            }
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } | GatewayError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::SerializationError(_) | GatewayError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) | GatewayError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden { .. } => "forbidden",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::WafBlocked { .. } => "waf_blocked",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::ServiceUnavailable(_) => "service_unavailable",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::SerializationError(_) => "serialization_error",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Internal(_) => "internal_error",
            GatewayError::ConfigError(_) => "config_error",
        }
    }

    /// Build the client-facing envelope.
    ///
    /// Server errors get a fixed message and never carry `details`; the full
    /// error is only written to the log.
    pub fn envelope(&self, correlation_id: String) -> ErrorEnvelope {
        let status = self.status();

        let (message, details) = match self {
            GatewayError::Unauthorized(reason) => (reason.clone(), None),
            GatewayError::Forbidden { required_scope } => (
                "Insufficient scope for this resource.".to_string(),
                Some(serde_json::json!({ "required_scope": required_scope })),
            ),
            GatewayError::RateLimitExceeded {
                retry_after_secs, ..
            } => (
                format!("Too many requests. Retry after {retry_after_secs} seconds."),
                Some(serde_json::json!({ "retry_after": retry_after_secs })),
            ),
            GatewayError::WafBlocked { .. } => (
                "Request rejected by security policy.".to_string(),
                None,
            ),
            GatewayError::SerializationError(e) => (sanitize_serde_error(e), None),
            GatewayError::BadRequest(msg) | GatewayError::NotFound(msg) => (msg.clone(), None),
            GatewayError::CircuitOpen { .. } | GatewayError::ServiceUnavailable(_) => (
                "A required dependency is temporarily unavailable. Please try again later."
                    .to_string(),
                None,
            ),
            GatewayError::Timeout(_) => (
                "The request did not complete in time. Please try again.".to_string(),
                None,
            ),
            GatewayError::Internal(_) | GatewayError::ConfigError(_) => (
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string(),
                None,
            ),
        };

        ErrorEnvelope {
            code: self.code(),
            message,
            correlation_id,
            status: status.as_u16(),
            timestamp: Utc::now(),
            details: if status.is_server_error() {
                None
            } else {
                details
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let envelope = self.envelope(current_correlation_id());
        let mut response = (status, axum::Json(envelope)).into_response();
        let headers = response.headers_mut();

        match &self {
            GatewayError::Unauthorized(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer"),
                );
            }
            GatewayError::RateLimitExceeded {
                limit,
                retry_after_secs,
                reset_secs,
                ..
            } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
                headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
                headers.insert("x-ratelimit-reset", HeaderValue::from(*reset_secs));
            }
            _ => {}
        }

        response
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Missing required field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;
