//! Catch-all for paths no route matches.

use axum::http::{Method, Uri};
use tracing::debug;

use crate::error::GatewayError;

/// Answer unknown paths with the standard `404` envelope.
pub async fn not_found(method: Method, uri: Uri) -> GatewayError {
    debug!(method = %method, path = %uri.path(), "No route for request");
    GatewayError::NotFound(format!("No route for {method} {}", uri.path()))
}
