//! Per-request context shared between the middleware chain and handlers.
//!
//! Each stage of the chain stores what it learned in request extensions:
//!
//! - request id layer → [`CorrelationId`] (and the task-local used by error envelopes)
//! - timeout guard → [`Deadline`]
//! - auth layer → `Arc<AuthClaims>`
//! - route scope check → [`RequiredScope`]
//!
//! Handlers read them back through the [`RequestContext`] or [`Authenticated`]
//! extractors.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tokio::task::futures::TaskLocalFuture;

use crate::auth::AuthClaims;
use crate::error::GatewayError;

/// Fallback correlation id when none is in scope (e.g. errors raised outside a request).
pub const UNKNOWN_CORRELATION_ID: &str = "unknown";

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Run `future` with `id` as the current correlation id.
pub fn scope_correlation_id<F: Future>(id: String, future: F) -> TaskLocalFuture<String, F> {
    CORRELATION_ID.scope(id, future)
}

/// The correlation id of the request currently being processed on this task.
pub fn current_correlation_id() -> String {
    CORRELATION_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| UNKNOWN_CORRELATION_ID.to_string())
}

/// Correlation id assigned by the request id layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

/// Absolute deadline assigned by the timeout guard.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(pub Instant);

impl Deadline {
    /// Time left before the deadline (zero once passed).
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }
}

/// Scope a route declared as required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredScope(pub String);

/// Everything the gateway decided about the current request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub deadline: Option<Instant>,
    pub claims: Option<Arc<AuthClaims>>,
    pub required_scope: Option<String>,
}

impl RequestContext {
    fn from_parts(parts: &Parts) -> Self {
        Self {
            correlation_id: parts
                .extensions
                .get::<CorrelationId>()
                .map(|c| c.0.clone())
                .unwrap_or_else(current_correlation_id),
            deadline: parts.extensions.get::<Deadline>().map(|d| d.0),
            claims: parts.extensions.get::<Arc<AuthClaims>>().cloned(),
            required_scope: parts.extensions.get::<RequiredScope>().map(|s| s.0.clone()),
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

/// Extractor for handlers that must only run for an authenticated caller.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Arc<AuthClaims>);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<AuthClaims>>()
            .cloned()
            .map(Authenticated)
            .ok_or_else(|| GatewayError::Unauthorized("authentication required".to_string()))
    }
}
